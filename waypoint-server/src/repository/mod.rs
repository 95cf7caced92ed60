//! Storage seam for projects and the analysis audit trail.
//!
//! Writers never replace a whole project document: they send a list of
//! [`ProjectUpdate`]s which the backend applies atomically to the stored
//! copy. Two backends exist, [`InMemoryRepository`] and [`SqliteRepository`].

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use waypoint_core::{
    CommitSha, CommitVerdict, Milestone, PipelineError, Project, ProjectId, RepositoryConnection,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {what} in storage")]
    Corruption { what: String },

    #[error("Project {0}")]
    ProjectNotFound(ProjectId),

    #[error("Milestone #{index} of project {project}")]
    MilestoneNotFound { project: ProjectId, index: usize },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

impl From<RepositoryError> for PipelineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::ProjectNotFound(_) | RepositoryError::MilestoneNotFound { .. } => {
                PipelineError::NotFound(err.to_string())
            }
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

/// A targeted change to one part of a stored project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectUpdate {
    /// Replace the milestone at `index`.
    Milestone { index: usize, milestone: Milestone },
    /// Set or clear the repository connection.
    Connection(Option<RepositoryConnection>),
    ProjectContext(Option<String>),
    /// Merge generated review contexts into the milestone at `index`,
    /// leaving its progress fields alone.
    MilestoneContexts {
        index: usize,
        context: Option<String>,
        goal_contexts: BTreeMap<String, String>,
    },
}

impl ProjectUpdate {
    pub fn apply(&self, project: &mut Project) -> Result<(), RepositoryError> {
        match self {
            Self::Milestone { index, milestone } => {
                let slot = project.milestones.get_mut(*index).ok_or_else(|| {
                    RepositoryError::MilestoneNotFound {
                        project: project.id.clone(),
                        index: *index,
                    }
                })?;
                *slot = milestone.clone();
            }
            Self::Connection(connection) => project.connection = connection.clone(),
            Self::ProjectContext(context) => project.context = context.clone(),
            Self::MilestoneContexts {
                index,
                context,
                goal_contexts,
            } => {
                let milestone = project.milestones.get_mut(*index).ok_or_else(|| {
                    RepositoryError::MilestoneNotFound {
                        project: project.id.clone(),
                        index: *index,
                    }
                })?;
                if let Some(context) = context {
                    milestone.context = Some(context.clone());
                }
                milestone
                    .goal_contexts
                    .extend(goal_contexts.iter().map(|(g, c)| (g.clone(), c.clone())));
            }
        }
        Ok(())
    }
}

/// Apply every update to a copy of `project`; the original is untouched if
/// any update fails.
pub fn apply_all(project: &Project, updates: &[ProjectUpdate]) -> Result<Project, RepositoryError> {
    let mut next = project.clone();
    for update in updates {
        update.apply(&mut next)?;
    }
    Ok(next)
}

/// Append-only audit entry written for every commit analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub project_id: ProjectId,
    pub milestone_title: String,
    pub commit_sha: CommitSha,
    pub verdict: CommitVerdict,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get(&self, id: &ProjectId) -> Result<Option<Project>, RepositoryError>;

    /// Store a project (upsert semantics).
    async fn put(&self, project: Project) -> Result<(), RepositoryError>;

    /// Apply `updates` atomically and return the stored result.
    async fn update(
        &self,
        id: &ProjectId,
        updates: Vec<ProjectUpdate>,
    ) -> Result<Project, RepositoryError>;

    /// Append `record` and apply `updates` to its project as one atomic
    /// write. With no updates only the record is written.
    async fn record_analysis(
        &self,
        record: AnalysisRecord,
        updates: Vec<ProjectUpdate>,
    ) -> Result<(), RepositoryError>;

    /// Audit records for a project, oldest first.
    async fn analyses(&self, id: &ProjectId) -> Result<Vec<AnalysisRecord>, RepositoryError>;
}
