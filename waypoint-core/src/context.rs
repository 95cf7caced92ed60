//! Review-context synthesis for projects, milestones and goals.
//!
//! Requests arrive as a loose [`ContextPayload`] and are validated into a
//! typed [`ContextRequest`] before anything is sent to the generator. Whole
//! projects are processed through a [`ContextPlan`], an iterator that yields
//! one job at a time together with the pause to take before it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backoff::DEFAULT_MAX_ATTEMPTS;
use crate::error::PipelineError;
use crate::generator::{ContentGenerator, GenerationError};
use crate::model::{Milestone, Project};
use crate::prompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Project,
    Milestone,
    Goal,
}

impl ContextKind {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw.trim() {
            "project" => Ok(Self::Project),
            "milestone" => Ok(Self::Milestone),
            "goal" => Ok(Self::Goal),
            _ => Err(PipelineError::validation(
                "Invalid type: type must be \"project\", \"milestone\", or \"goal\"",
            )),
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Milestone => write!(f, "milestone"),
            Self::Goal => write!(f, "goal"),
        }
    }
}

/// Context generation request as it arrives on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub project_title: Option<String>,
    #[serde(default)]
    pub project_description: Option<String>,
    #[serde(default)]
    pub repository_name: Option<String>,
    #[serde(default)]
    pub milestone_title: Option<String>,
    #[serde(default)]
    pub milestone_commit_title: Option<String>,
    #[serde(default)]
    pub milestone_description: Option<String>,
    #[serde(default)]
    pub milestone_files: Option<Vec<String>>,
    #[serde(default)]
    pub goal: Option<String>,
}

/// A validated context request. Every required field is non-blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextRequest {
    Project {
        title: String,
        description: Option<String>,
        repository: Option<String>,
    },
    Milestone {
        project_title: String,
        milestone_title: String,
        commit_title: Option<String>,
        description: Option<String>,
        files: Vec<String>,
    },
    Goal {
        project_title: String,
        milestone_title: Option<String>,
        goal: String,
    },
}

/// Blank strings count as absent.
fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl TryFrom<ContextPayload> for ContextRequest {
    type Error = PipelineError;

    fn try_from(payload: ContextPayload) -> Result<Self, Self::Error> {
        let kind = present(payload.kind.as_deref());
        let project_title = present(payload.project_title.as_deref());

        let (Some(kind), Some(project_title)) = (kind, project_title) else {
            return Err(PipelineError::validation(
                "Missing required fields: type and projectTitle are required",
            ));
        };

        match ContextKind::parse(&kind)? {
            ContextKind::Project => Ok(Self::Project {
                title: project_title,
                description: present(payload.project_description.as_deref()),
                repository: present(payload.repository_name.as_deref()),
            }),
            ContextKind::Milestone => {
                let milestone_title = present(payload.milestone_title.as_deref()).ok_or_else(|| {
                    PipelineError::validation(
                        "Missing required field: milestoneTitle is required for milestone context",
                    )
                })?;
                Ok(Self::Milestone {
                    project_title,
                    milestone_title,
                    commit_title: present(payload.milestone_commit_title.as_deref()),
                    description: present(payload.milestone_description.as_deref()),
                    files: payload
                        .milestone_files
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|f| !f.trim().is_empty())
                        .collect(),
                })
            }
            ContextKind::Goal => {
                let goal = present(payload.goal.as_deref()).ok_or_else(|| {
                    PipelineError::validation(
                        "Missing required field: goal is required for goal context",
                    )
                })?;
                Ok(Self::Goal {
                    project_title,
                    milestone_title: present(payload.milestone_title.as_deref()),
                    goal,
                })
            }
        }
    }
}

impl ContextRequest {
    pub fn kind(&self) -> ContextKind {
        match self {
            Self::Project { .. } => ContextKind::Project,
            Self::Milestone { .. } => ContextKind::Milestone,
            Self::Goal { .. } => ContextKind::Goal,
        }
    }

    pub fn prompt(&self) -> String {
        match self {
            Self::Project {
                title,
                description,
                repository,
            } => prompts::project_context_prompt(
                title,
                description.as_deref(),
                repository.as_deref(),
            ),
            Self::Milestone {
                project_title,
                milestone_title,
                commit_title,
                description,
                files,
            } => prompts::milestone_context_prompt(
                project_title,
                milestone_title,
                commit_title.as_deref(),
                description.as_deref(),
                files,
            ),
            Self::Goal {
                project_title,
                milestone_title,
                goal,
            } => prompts::goal_context_prompt(project_title, milestone_title.as_deref(), goal),
        }
    }

    fn for_project(project: &Project, repository: Option<&str>) -> Self {
        Self::Project {
            title: project.title.trim().to_string(),
            description: present(Some(&project.description)),
            repository: present(repository),
        }
    }

    fn for_milestone(project: &Project, milestone: &Milestone) -> Self {
        Self::Milestone {
            project_title: project.title.trim().to_string(),
            milestone_title: milestone.title.trim().to_string(),
            commit_title: present(Some(&milestone.commit_title)),
            description: present(milestone.description.as_deref()),
            files: milestone.expected_files.clone(),
        }
    }

    fn for_goal(project: &Project, milestone: &Milestone, goal: &str) -> Self {
        Self::Goal {
            project_title: project.title.trim().to_string(),
            milestone_title: present(Some(&milestone.title)),
            goal: goal.trim().to_string(),
        }
    }
}

/// Pauses inserted between batch items to stay under the backend's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDelays {
    pub before_milestone: Duration,
    pub before_goal: Duration,
}

impl Default for BatchDelays {
    fn default() -> Self {
        Self {
            before_milestone: Duration::from_millis(1500),
            before_goal: Duration::from_millis(1000),
        }
    }
}

impl BatchDelays {
    pub fn none() -> Self {
        Self {
            before_milestone: Duration::ZERO,
            before_goal: Duration::ZERO,
        }
    }
}

/// Where the text produced by a job belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum ContextTarget {
    Project,
    #[serde(rename_all = "camelCase")]
    Milestone { milestone_index: usize },
    #[serde(rename_all = "camelCase")]
    Goal { milestone_index: usize, goal: String },
}

impl fmt::Display for ContextTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Milestone { milestone_index } => write!(f, "milestone #{}", milestone_index),
            Self::Goal {
                milestone_index,
                goal,
            } => write!(f, "goal '{}' of milestone #{}", goal, milestone_index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextJob {
    pub target: ContextTarget,
    pub request: ContextRequest,
    pub delay_before: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Project,
    Milestone(usize),
    Goal(usize, usize),
    Done,
}

/// Lazily enumerates the context jobs for a project: the project itself,
/// then each milestone followed by its goals. Milestones with a blank title
/// and blank goals are skipped.
pub struct ContextPlan<'a> {
    project: &'a Project,
    repository: Option<String>,
    delays: BatchDelays,
    cursor: Cursor,
}

impl<'a> ContextPlan<'a> {
    pub fn for_project(project: &'a Project, repository: Option<&str>, delays: BatchDelays) -> Self {
        Self {
            project,
            repository: repository.map(str::to_string),
            delays,
            cursor: Cursor::Project,
        }
    }

    fn milestone_usable(&self, index: usize) -> bool {
        !self.project.milestones[index].title.trim().is_empty()
    }

    /// First usable milestone at or after `index`.
    fn next_milestone(&self, index: usize) -> Cursor {
        (index..self.project.milestones.len())
            .find(|&i| self.milestone_usable(i))
            .map(Cursor::Milestone)
            .unwrap_or(Cursor::Done)
    }

    /// First non-blank goal of milestone `m` at or after `g`, else the next
    /// milestone.
    fn next_goal(&self, m: usize, g: usize) -> Cursor {
        let goals = &self.project.milestones[m].goals;
        (g..goals.len())
            .find(|&i| !goals[i].trim().is_empty())
            .map(|i| Cursor::Goal(m, i))
            .unwrap_or_else(|| self.next_milestone(m + 1))
    }
}

impl Iterator for ContextPlan<'_> {
    type Item = ContextJob;

    fn next(&mut self) -> Option<ContextJob> {
        let project = self.project;
        match self.cursor {
            Cursor::Done => None,
            Cursor::Project => {
                self.cursor = self.next_milestone(0);
                Some(ContextJob {
                    target: ContextTarget::Project,
                    request: ContextRequest::for_project(project, self.repository.as_deref()),
                    delay_before: Duration::ZERO,
                })
            }
            Cursor::Milestone(m) => {
                self.cursor = self.next_goal(m, 0);
                let milestone = &project.milestones[m];
                Some(ContextJob {
                    target: ContextTarget::Milestone { milestone_index: m },
                    request: ContextRequest::for_milestone(project, milestone),
                    delay_before: self.delays.before_milestone,
                })
            }
            Cursor::Goal(m, g) => {
                self.cursor = self.next_goal(m, g + 1);
                let milestone = &project.milestones[m];
                let goal = &milestone.goals[g];
                Some(ContextJob {
                    target: ContextTarget::Goal {
                        milestone_index: m,
                        goal: goal.clone(),
                    },
                    request: ContextRequest::for_goal(project, milestone, goal),
                    delay_before: self.delays.before_goal,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFailure {
    #[serde(flatten)]
    pub target: ContextTarget,
    pub error: String,
}

/// Outcome of a batch run. Partial coverage is a normal result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextReport {
    pub project_context: Option<String>,
    /// Milestone index → generated context.
    pub milestone_contexts: BTreeMap<usize, String>,
    /// Milestone index → (goal → generated context).
    pub goal_contexts: BTreeMap<usize, BTreeMap<String, String>>,
    pub failures: Vec<ContextFailure>,
}

impl ContextReport {
    pub fn generated(&self) -> usize {
        usize::from(self.project_context.is_some())
            + self.milestone_contexts.len()
            + self.goal_contexts.values().map(BTreeMap::len).sum::<usize>()
    }

    fn record(&mut self, target: ContextTarget, text: String) {
        match target {
            ContextTarget::Project => self.project_context = Some(text),
            ContextTarget::Milestone { milestone_index } => {
                self.milestone_contexts.insert(milestone_index, text);
            }
            ContextTarget::Goal {
                milestone_index,
                goal,
            } => {
                self.goal_contexts
                    .entry(milestone_index)
                    .or_default()
                    .insert(goal, text);
            }
        }
    }

    /// Indices of milestones that received any generated text.
    pub fn touched_milestones(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .milestone_contexts
            .keys()
            .chain(self.goal_contexts.keys())
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Write every generated context into `project`. Entries for milestone
    /// indices that no longer exist are ignored.
    pub fn apply_to(&self, project: &mut Project) {
        if let Some(context) = &self.project_context {
            project.context = Some(context.clone());
        }
        for (&index, context) in &self.milestone_contexts {
            if let Some(milestone) = project.milestones.get_mut(index) {
                milestone.context = Some(context.clone());
            }
        }
        for (&index, goals) in &self.goal_contexts {
            if let Some(milestone) = project.milestones.get_mut(index) {
                for (goal, context) in goals {
                    milestone.goal_contexts.insert(goal.clone(), context.clone());
                }
            }
        }
    }
}

pub struct ContextSynthesizer {
    generator: Arc<ContentGenerator>,
    max_attempts: u32,
}

impl ContextSynthesizer {
    pub fn new(generator: Arc<ContentGenerator>) -> Self {
        Self {
            generator,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub async fn generate(
        &self,
        correlation_id: Option<&str>,
        request: &ContextRequest,
    ) -> Result<String, GenerationError> {
        info!("Generating {} context", request.kind());
        let text = self
            .generator
            .generate(correlation_id, &request.prompt(), self.max_attempts)
            .await?;
        info!("Generated {} context ({} bytes)", request.kind(), text.len());
        Ok(text)
    }

    /// Validate a wire payload and generate its context.
    pub async fn generate_payload(
        &self,
        correlation_id: Option<&str>,
        payload: ContextPayload,
    ) -> Result<(ContextKind, String), PipelineError> {
        let request = ContextRequest::try_from(payload)?;
        let text = self.generate(correlation_id, &request).await?;
        Ok((request.kind(), text))
    }

    /// Run every job of the project's plan in order, one at a time.
    ///
    /// A failed item is recorded and the batch moves on; the returned report
    /// holds whatever was produced.
    pub async fn run_batch(
        &self,
        correlation_id: Option<&str>,
        project: &Project,
        repository: Option<&str>,
        delays: BatchDelays,
    ) -> ContextReport {
        let mut report = ContextReport::default();

        for job in ContextPlan::for_project(project, repository, delays) {
            if !job.delay_before.is_zero() {
                tokio::time::sleep(job.delay_before).await;
            }

            match self.generate(correlation_id, &job.request).await {
                Ok(text) => {
                    info!("Generated context for {}", job.target);
                    report.record(job.target, text);
                }
                Err(e) => {
                    warn!("Failed to generate context for {}: {}", job.target, e);
                    report.failures.push(ContextFailure {
                        target: job.target,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Context batch for project {} finished: {} generated, {} failed",
            project.id,
            report.generated(),
            report.failures.len()
        );
        report
    }
}
