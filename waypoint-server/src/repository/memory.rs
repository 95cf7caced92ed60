//! In-memory implementation of `ProjectRepository`.
//!
//! All state is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use waypoint_core::{Project, ProjectId};

use super::{apply_all, AnalysisRecord, ProjectRepository, ProjectUpdate, RepositoryError};

pub struct InMemoryRepository {
    projects: RwLock<HashMap<ProjectId, Project>>,
    analyses: RwLock<Vec<AnalysisRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            analyses: RwLock::new(Vec::new()),
        }
    }

    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        Self {
            projects: RwLock::new(projects.into_iter().map(|p| (p.id.clone(), p)).collect()),
            analyses: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectRepository for InMemoryRepository {
    async fn get(&self, id: &ProjectId) -> Result<Option<Project>, RepositoryError> {
        let projects = self.projects.read().await;
        Ok(projects.get(id).cloned())
    }

    async fn put(&self, project: Project) -> Result<(), RepositoryError> {
        let mut projects = self.projects.write().await;
        projects.insert(project.id.clone(), project);
        Ok(())
    }

    async fn update(
        &self,
        id: &ProjectId,
        updates: Vec<ProjectUpdate>,
    ) -> Result<Project, RepositoryError> {
        let mut projects = self.projects.write().await;
        let current = projects
            .get(id)
            .ok_or_else(|| RepositoryError::ProjectNotFound(id.clone()))?;
        let next = apply_all(current, &updates)?;
        projects.insert(id.clone(), next.clone());
        Ok(next)
    }

    async fn record_analysis(
        &self,
        record: AnalysisRecord,
        updates: Vec<ProjectUpdate>,
    ) -> Result<(), RepositoryError> {
        // Lock order: projects, then analyses.
        let mut projects = self.projects.write().await;
        let mut analyses = self.analyses.write().await;

        if !updates.is_empty() {
            let current = projects
                .get(&record.project_id)
                .ok_or_else(|| RepositoryError::ProjectNotFound(record.project_id.clone()))?;
            let next = apply_all(current, &updates)?;
            projects.insert(record.project_id.clone(), next);
        }
        analyses.push(record);
        Ok(())
    }

    async fn analyses(&self, id: &ProjectId) -> Result<Vec<AnalysisRecord>, RepositoryError> {
        let analyses = self.analyses.read().await;
        Ok(analyses
            .iter()
            .filter(|r| &r.project_id == id)
            .cloned()
            .collect())
    }
}
