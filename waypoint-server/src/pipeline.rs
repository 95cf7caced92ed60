//! Inbound pipeline operations.
//!
//! Each operation validates its input, performs every external call, and
//! only then writes targeted updates to the repository. A failure before the
//! write leaves stored state unchanged.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use waypoint_core::backoff::DEFAULT_MAX_ATTEMPTS;
use waypoint_core::context::{BatchDelays, ContextKind, ContextPayload, ContextReport};
use waypoint_core::matcher::{verification_target, MatchOutcome, DEFAULT_COMMIT_WINDOW};
use waypoint_core::milestone::{self, MilestoneEvent};
use waypoint_core::prompts::PatchLimits;
use waypoint_core::{
    ChatReply, CommitAnalyzer, CommitMatcher, CommitSha, CommitSummary, CommitVerdict,
    ContentGenerator, ContextSynthesizer, GuidancePayload, HostingService, Mentor, PipelineError,
    Project, ProjectId, RepoCoordinates, RepositoryConnection,
};

use crate::repository::{AnalysisRecord, ProjectRepository, ProjectUpdate};

const PING_PROMPT: &str = "Respond with 'API key is working correctly' if this request succeeds.";
const PING_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub commit_window: usize,
    pub batch_delays: BatchDelays,
    pub default_owner: Option<String>,
    pub patch_limits: PatchLimits,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            commit_window: DEFAULT_COMMIT_WINDOW,
            batch_delays: BatchDelays::default(),
            default_owner: None,
            patch_limits: PatchLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCommitRequest {
    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub expected_commit_title: String,
    #[serde(default)]
    pub milestone_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCommitResponse {
    pub matched: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<CommitSha>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_commit_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAnalysisRequest {
    #[serde(default)]
    pub milestone_title: String,
    #[serde(default)]
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAnalysisResponse {
    pub analysis: CommitVerdict,
    pub applied: bool,
    pub commit_details: CommitSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextResponse {
    pub context: String,
    #[serde(rename = "type")]
    pub kind: ContextKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuidanceResponse {
    pub response: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectChatRequest {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingResponse {
    pub status: String,
    pub message: String,
    pub response: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalToggleRequest {
    #[serde(default)]
    pub milestone_title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRepoRequest {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub success: bool,
    pub milestones_reset: usize,
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, PipelineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PipelineError::validation(format!(
            "Missing required field: {}",
            field
        )));
    }
    Ok(value)
}

/// Split `"owner/name"`; a bare name yields no owner.
fn split_repo_name(raw: &str) -> (Option<&str>, &str) {
    match raw.trim().split_once('/') {
        Some((owner, name)) if !owner.trim().is_empty() => (Some(owner.trim()), name.trim()),
        _ => (None, raw.trim().trim_start_matches('/')),
    }
}

pub struct Pipeline {
    repository: Arc<dyn ProjectRepository>,
    hosting: Arc<dyn HostingService>,
    generator: Arc<ContentGenerator>,
    matcher: CommitMatcher,
    analyzer: CommitAnalyzer,
    synthesizer: ContextSynthesizer,
    mentor: Mentor,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        repository: Arc<dyn ProjectRepository>,
        hosting: Arc<dyn HostingService>,
        generator: Arc<ContentGenerator>,
        settings: PipelineSettings,
    ) -> Self {
        let matcher = CommitMatcher::new(hosting.clone()).with_window(settings.commit_window);
        let analyzer = CommitAnalyzer::new(hosting.clone(), generator.clone())
            .with_max_attempts(settings.max_attempts)
            .with_patch_limits(settings.patch_limits);
        let synthesizer =
            ContextSynthesizer::new(generator.clone()).with_max_attempts(settings.max_attempts);
        let mentor =
            Mentor::new(hosting.clone(), generator.clone()).with_max_attempts(settings.max_attempts);

        Self {
            repository,
            hosting,
            generator,
            matcher,
            analyzer,
            synthesizer,
            mentor,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ProjectRepository> {
        &self.repository
    }

    async fn load(&self, id: &ProjectId) -> Result<Project, PipelineError> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("Project {}", id)))
    }

    /// Repository a request refers to. An explicit name wins over the
    /// connected repository; a bare name borrows the connection's owner, or
    /// the configured default owner.
    fn resolve_repository(
        &self,
        project: &Project,
        repo_name: Option<&str>,
    ) -> Result<RepoCoordinates, PipelineError> {
        let connected = project.connection.as_ref().map(RepositoryConnection::coordinates);

        match repo_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(raw) => {
                let (owner, name) = split_repo_name(raw);
                let owner = owner
                    .map(str::to_string)
                    .or_else(|| connected.map(|c| c.owner))
                    .or_else(|| self.settings.default_owner.clone())
                    .ok_or_else(|| PipelineError::validation("GitHub owner not found"))?;
                Ok(RepoCoordinates::new(owner, name))
            }
            None => connected.ok_or_else(|| {
                PipelineError::validation("No repository connected to this project")
            }),
        }
    }

    pub async fn get_project(&self, id: &str) -> Result<Project, PipelineError> {
        let id = ProjectId::parse(id)?;
        self.load(&id).await
    }

    pub async fn analyses(&self, id: &str) -> Result<Vec<AnalysisRecord>, PipelineError> {
        let id = ProjectId::parse(id)?;
        self.load(&id).await?;
        Ok(self.repository.analyses(&id).await?)
    }

    /// Look for the milestone's commit among the most recent commits and
    /// flag the milestone as detected on a match.
    pub async fn verify_commit(
        &self,
        correlation_id: Option<&str>,
        id: &str,
        request: VerifyCommitRequest,
    ) -> Result<VerifyCommitResponse, PipelineError> {
        let id = ProjectId::parse(id)?;
        let signature = required(&request.expected_commit_title, "expectedCommitTitle")?;
        let milestone_title = required(&request.milestone_title, "milestoneTitle")?;

        let project = self.load(&id).await?;
        let index = verification_target(&project, milestone_title)?;
        let repo = self.resolve_repository(&project, request.repo_name.as_deref())?;

        info!(
            "Verifying milestone '{}' of project {} against {}",
            milestone_title, id, repo
        );

        match self.matcher.find(correlation_id, &repo, signature).await? {
            MatchOutcome::Matched { sha, message, url } => {
                let result = milestone::transition(
                    &project.milestones[index],
                    &MilestoneEvent::CommitDetected { sha: sha.clone() },
                );
                if result.changed {
                    self.repository
                        .update(
                            &id,
                            vec![ProjectUpdate::Milestone {
                                index,
                                milestone: result.milestone,
                            }],
                        )
                        .await?;
                    info!(
                        "Milestone '{}' of project {} detected at commit {}",
                        milestone_title,
                        id,
                        sha.short()
                    );
                }

                Ok(VerifyCommitResponse {
                    matched: true,
                    message: format!("Matched commit: {}", message),
                    commit_sha: Some(sha),
                    commit_url: url,
                    latest_commit_title: None,
                })
            }
            MatchOutcome::NotMatched {
                latest_message: None,
                ..
            } => Ok(VerifyCommitResponse {
                matched: false,
                message: "No commits found in repository".to_string(),
                commit_sha: None,
                commit_url: None,
                latest_commit_title: None,
            }),
            MatchOutcome::NotMatched { latest_message, .. } => Ok(VerifyCommitResponse {
                matched: false,
                message: "No matching commit found".to_string(),
                commit_sha: None,
                commit_url: None,
                latest_commit_title: latest_message,
            }),
        }
    }

    /// Evaluate a commit and write its audit record. A confident verdict
    /// completes the milestone in the same write, so neither lands alone.
    pub async fn analyze_commit(
        &self,
        correlation_id: Option<&str>,
        id: &str,
        request: CommitAnalysisRequest,
    ) -> Result<CommitAnalysisResponse, PipelineError> {
        let id = ProjectId::parse(id)?;
        let milestone_title = required(&request.milestone_title, "milestoneTitle")?;
        let sha = CommitSha::parse(required(&request.commit_sha, "commitSha")?)?;

        let project = self.load(&id).await?;
        if project.milestone(milestone_title).is_none() {
            return Err(PipelineError::not_found(format!(
                "Milestone '{}'",
                milestone_title
            )));
        }
        let repo = self.resolve_repository(&project, None)?;

        let analysis = self
            .analyzer
            .analyze(correlation_id, &project, &repo, milestone_title, &sha)
            .await?;

        let mut updates = Vec::new();
        if analysis.applicable {
            let result = milestone::transition(
                &project.milestones[analysis.milestone_index],
                &MilestoneEvent::VerdictAccepted {
                    verdict: analysis.verdict.clone(),
                },
            );
            if result.changed {
                updates.push(ProjectUpdate::Milestone {
                    index: analysis.milestone_index,
                    milestone: result.milestone,
                });
            }
        }
        let completes = !updates.is_empty();

        let record = AnalysisRecord {
            project_id: id.clone(),
            milestone_title: milestone_title.to_string(),
            commit_sha: sha.clone(),
            verdict: analysis.verdict.clone(),
            applied: analysis.applicable,
            created_at: Utc::now(),
        };
        self.repository
            .record_analysis(record, updates)
            .await
            .inspect_err(|e| error!("Failed to store analysis for project {}: {}", id, e))?;

        if completes {
            info!(
                "Milestone '{}' of project {} completed by commit {}",
                milestone_title,
                id,
                sha.short()
            );
        }

        Ok(CommitAnalysisResponse {
            analysis: analysis.verdict,
            applied: analysis.applicable,
            commit_details: analysis.commit,
        })
    }

    pub async fn generate_context(
        &self,
        correlation_id: Option<&str>,
        payload: ContextPayload,
    ) -> Result<ContextResponse, PipelineError> {
        let (kind, context) = self
            .synthesizer
            .generate_payload(correlation_id, payload)
            .await?;
        Ok(ContextResponse { context, kind })
    }

    /// Generate review contexts for a whole project and persist whatever was
    /// produced.
    pub async fn generate_project_contexts(
        &self,
        correlation_id: Option<&str>,
        id: &str,
    ) -> Result<ContextReport, PipelineError> {
        let id = ProjectId::parse(id)?;
        let project = self.load(&id).await?;
        let repository = project
            .connection
            .as_ref()
            .map(|c| c.full_name.clone().unwrap_or_else(|| c.name.clone()));

        let report = self
            .synthesizer
            .run_batch(
                correlation_id,
                &project,
                repository.as_deref(),
                self.settings.batch_delays,
            )
            .await;

        let mut updates = Vec::new();
        if let Some(context) = &report.project_context {
            updates.push(ProjectUpdate::ProjectContext(Some(context.clone())));
        }
        for index in report.touched_milestones() {
            updates.push(ProjectUpdate::MilestoneContexts {
                index,
                context: report.milestone_contexts.get(&index).cloned(),
                goal_contexts: report.goal_contexts.get(&index).cloned().unwrap_or_default(),
            });
        }

        if !updates.is_empty() {
            self.repository.update(&id, updates).await?;
        }

        Ok(report)
    }

    /// Answer a question about a stored project, or decline when the
    /// relevance gate says it is off topic.
    pub async fn project_chat(
        &self,
        correlation_id: Option<&str>,
        request: ProjectChatRequest,
    ) -> Result<ChatReply, PipelineError> {
        let id = ProjectId::parse(required(&request.project_id, "projectId")?)?;
        let message = required(&request.message, "message")?;
        let project = self.load(&id).await?;
        self.mentor.answer(correlation_id, &project, message).await
    }

    pub async fn milestone_guidance(
        &self,
        correlation_id: Option<&str>,
        payload: GuidancePayload,
    ) -> Result<GuidanceResponse, PipelineError> {
        let response = self.mentor.guidance(correlation_id, &payload).await?;
        Ok(GuidanceResponse { response })
    }

    pub async fn ping(&self, correlation_id: Option<&str>) -> Result<PingResponse, PipelineError> {
        let response = self
            .generator
            .generate(correlation_id, PING_PROMPT, PING_ATTEMPTS)
            .await?;
        Ok(PingResponse {
            status: "success".to_string(),
            message: "API key is configured correctly".to_string(),
            response,
        })
    }

    pub async fn toggle_goal(
        &self,
        id: &str,
        request: GoalToggleRequest,
    ) -> Result<Project, PipelineError> {
        let id = ProjectId::parse(id)?;
        let milestone_title = required(&request.milestone_title, "milestoneTitle")?;
        let goal = required(&request.goal, "goal")?;

        let project = self.load(&id).await?;
        let index = project
            .milestone_index(milestone_title)
            .ok_or_else(|| PipelineError::not_found(format!("Milestone '{}'", milestone_title)))?;
        let milestone = &project.milestones[index];

        let declared = milestone
            .goals
            .iter()
            .find(|g| g.trim() == goal)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "Goal '{}' is not declared by milestone '{}'",
                    goal, milestone_title
                ))
            })?;

        let result = milestone::transition(
            milestone,
            &MilestoneEvent::GoalToggled {
                goal: declared.clone(),
                completed: request.completed,
            },
        );
        if !result.changed {
            return Ok(project);
        }

        let completed = result.milestone.completed;
        let updated = self
            .repository
            .update(
                &id,
                vec![ProjectUpdate::Milestone {
                    index,
                    milestone: result.milestone,
                }],
            )
            .await?;
        info!(
            "Goal '{}' of milestone '{}' set to {} (milestone completed: {})",
            declared, milestone_title, request.completed, completed
        );
        Ok(updated)
    }

    pub async fn connect_repository(
        &self,
        correlation_id: Option<&str>,
        id: &str,
        request: ConnectRepoRequest,
    ) -> Result<Project, PipelineError> {
        let id = ProjectId::parse(id)?;
        let (embedded_owner, name) = split_repo_name(required(&request.repo_name, "repoName")?);
        let name = required(name, "repoName")?;
        let owner = request
            .owner
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .or(embedded_owner)
            .map(str::to_string)
            .or_else(|| self.settings.default_owner.clone())
            .ok_or_else(|| PipelineError::validation("GitHub owner not found"))?;

        self.load(&id).await?;
        let info = self
            .hosting
            .get_repository(correlation_id, &RepoCoordinates::new(owner, name))
            .await?;

        let connection = RepositoryConnection {
            owner: info.owner.login,
            name: info.name,
            full_name: Some(info.full_name),
            default_branch: info.default_branch,
            html_url: info.html_url,
            connected_at: Utc::now(),
        };
        info!(
            "Connecting project {} to {}",
            id,
            connection.coordinates()
        );

        Ok(self
            .repository
            .update(&id, vec![ProjectUpdate::Connection(Some(connection))])
            .await?)
    }

    pub async fn disconnect_repository(&self, id: &str) -> Result<DisconnectResponse, PipelineError> {
        let id = ProjectId::parse(id)?;
        let project = self.load(&id).await?;
        if project.connection.is_none() {
            return Err(PipelineError::validation(
                "No repository connected to this project",
            ));
        }

        let result = milestone::disconnect_repository(&project);

        let mut updates = vec![ProjectUpdate::Connection(None)];
        for (index, (before, after)) in project
            .milestones
            .iter()
            .zip(&result.project.milestones)
            .enumerate()
        {
            if before != after {
                updates.push(ProjectUpdate::Milestone {
                    index,
                    milestone: after.clone(),
                });
            }
        }

        self.repository.update(&id, updates).await?;
        info!(
            "Disconnected repository from project {} ({} milestones reset)",
            id, result.milestones_reset
        );

        Ok(DisconnectResponse {
            success: true,
            milestones_reset: result.milestones_reset,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::repository::fixtures::project_id;
    use crate::repository::{InMemoryRepository, RepositoryError};
    use async_trait::async_trait;
    use waypoint_core::{GenerationError, HostingError, ModelTiers};

    fn verify_request(signature: &str, milestone: &str) -> VerifyCommitRequest {
        VerifyCommitRequest {
            repo_name: None,
            expected_commit_title: signature.to_string(),
            milestone_title: milestone.to_string(),
        }
    }

    async fn stored(h: &Harness) -> Project {
        h.repository.get(&project_id()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_verify_match_sets_detected_only() {
        let h = harness(
            FakeHosting {
                commits: vec![
                    listing("bbbbbbb", "Fix typo"),
                    listing("aaaaaaa", "  INITIAL COMMIT with scaffolding "),
                ],
                ..FakeHosting::default()
            },
            vec![],
        );

        let response = h
            .pipeline
            .verify_commit(None, PROJECT_ID, verify_request("initial commit", "Setup"))
            .await
            .unwrap();

        assert!(response.matched);
        assert_eq!(response.commit_sha, Some(CommitSha::from("aaaaaaa")));
        let project = stored(&h).await;
        assert!(project.milestones[0].detected);
        assert!(!project.milestones[0].completed);
        assert!(project.milestones[0].completed_goals.is_empty());
    }

    #[tokio::test]
    async fn test_verify_no_match_leaves_state() {
        let h = harness(
            FakeHosting {
                commits: vec![listing("bbbbbbb", "Fix typo")],
                ..FakeHosting::default()
            },
            vec![],
        );
        let before = stored(&h).await;

        let response = h
            .pipeline
            .verify_commit(None, PROJECT_ID, verify_request("Initial commit", "Setup"))
            .await
            .unwrap();

        assert!(!response.matched);
        assert_eq!(response.latest_commit_title.as_deref(), Some("Fix typo"));
        assert_eq!(stored(&h).await, before);
    }

    #[tokio::test]
    async fn test_verify_empty_repository() {
        let h = harness(FakeHosting::default(), vec![]);
        let response = h
            .pipeline
            .verify_commit(None, PROJECT_ID, verify_request("Initial commit", "Setup"))
            .await
            .unwrap();
        assert_eq!(response.message, "No commits found in repository");
    }

    #[tokio::test]
    async fn test_verify_rejects_inactive_milestone_before_fetch() {
        let h = harness(FakeHosting::default(), vec![]);
        let err = h
            .pipeline
            .verify_commit(None, PROJECT_ID, verify_request("Add login", "Auth"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.hosting.calls(), 0);
    }

    #[tokio::test]
    async fn test_verify_hosting_failure_is_upstream_error() {
        let h = harness(
            FakeHosting {
                failure: Some(HostingError::Unauthorized {
                    status: 401,
                    message: "Bad credentials".to_string(),
                }),
                ..FakeHosting::default()
            },
            vec![],
        );
        let err = h
            .pipeline
            .verify_commit(None, PROJECT_ID, verify_request("Initial commit", "Setup"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_invalid_project_id() {
        let h = harness(FakeHosting::default(), vec![]);
        let err = h.pipeline.get_project("nope").await.unwrap_err();
        assert!(err.is_validation());
    }

    fn analysis_request(sha: &str) -> CommitAnalysisRequest {
        CommitAnalysisRequest {
            milestone_title: "Setup".to_string(),
            commit_sha: sha.to_string(),
        }
    }

    fn hosting_with_commit() -> FakeHosting {
        let mut hosting = FakeHosting::default();
        hosting
            .details
            .insert("abc1234".to_string(), detail("abc1234", "Initial commit"));
        hosting
    }

    #[tokio::test]
    async fn test_confident_verdict_completes_milestone() {
        let h = harness(
            hosting_with_commit(),
            vec![Ok(verdict_json(true, 85, &["Create repo"]))],
        );

        let response = h
            .pipeline
            .analyze_commit(None, PROJECT_ID, analysis_request("abc1234"))
            .await
            .unwrap();

        assert!(response.applied);
        assert_eq!(response.commit_details.files_changed, 1);
        let project = stored(&h).await;
        assert!(project.milestones[0].completed);
        assert!(project.milestones[0].completed_goals.contains("Create repo"));
        assert!(!project.milestones[0].completed_goals.contains("Add README"));

        let records = h.repository.analyses(&project_id()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].applied);
    }

    #[tokio::test]
    async fn test_low_confidence_verdict_is_only_audited() {
        let h = harness(
            hosting_with_commit(),
            vec![Ok(verdict_json(true, 60, &["Create repo"]))],
        );
        let before = stored(&h).await;

        let response = h
            .pipeline
            .analyze_commit(None, PROJECT_ID, analysis_request("abc1234"))
            .await
            .unwrap();

        assert!(!response.applied);
        assert_eq!(stored(&h).await, before);
        let records = h.repository.analyses(&project_id()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].applied);
    }

    #[tokio::test]
    async fn test_unparseable_verdict_is_degraded_and_audited() {
        let h = harness(hosting_with_commit(), vec![Ok("Looks great!".to_string())]);

        let response = h
            .pipeline
            .analyze_commit(None, PROJECT_ID, analysis_request("abc1234"))
            .await
            .unwrap();

        assert!(!response.applied);
        assert_eq!(response.analysis.confidence_score, 0);
        assert!(!stored(&h).await.milestones[0].completed);
        assert_eq!(h.repository.analyses(&project_id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_sha_rejected_without_calls() {
        let h = harness(hosting_with_commit(), vec![]);
        let err = h
            .pipeline
            .analyze_commit(None, PROJECT_ID, analysis_request("not-a-sha"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.hosting.calls(), 0);
        assert_eq!(h.backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_failure_leaves_no_trace() {
        let failure = || {
            Err(GenerationError::Unavailable {
                model: "m".to_string(),
                message: "500".to_string(),
            })
        };
        let h = harness(hosting_with_commit(), vec![failure(), failure(), failure()]);

        let err = h
            .pipeline
            .analyze_commit(None, PROJECT_ID, analysis_request("abc1234"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::UpstreamUnavailable { .. }));
        assert!(h.repository.analyses(&project_id()).await.unwrap().is_empty());
    }

    fn toggle(goal: &str, completed: bool) -> GoalToggleRequest {
        GoalToggleRequest {
            milestone_title: "Setup".to_string(),
            goal: goal.to_string(),
            completed,
        }
    }

    #[tokio::test]
    async fn test_toggling_every_goal_completes_and_keeps_detected() {
        let h = harness(
            FakeHosting {
                commits: vec![listing("aaaaaaa", "Initial commit")],
                ..FakeHosting::default()
            },
            vec![],
        );
        h.pipeline
            .verify_commit(None, PROJECT_ID, verify_request("Initial commit", "Setup"))
            .await
            .unwrap();

        h.pipeline.toggle_goal(PROJECT_ID, toggle("Create repo", true)).await.unwrap();
        let project = h
            .pipeline
            .toggle_goal(PROJECT_ID, toggle("Add README", true))
            .await
            .unwrap();

        assert!(project.milestones[0].completed);
        assert!(project.milestones[0].detected);
        assert_eq!(project.active_milestone().unwrap().title, "Auth");
    }

    #[tokio::test]
    async fn test_toggling_undeclared_goal_is_rejected() {
        let h = harness(FakeHosting::default(), vec![]);
        let err = h
            .pipeline
            .toggle_goal(PROJECT_ID, toggle("Deploy to prod", true))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_disconnect_resets_completion_only() {
        let h = harness(FakeHosting::default(), vec![]);
        for goal in ["Create repo", "Add README"] {
            h.pipeline.toggle_goal(PROJECT_ID, toggle(goal, true)).await.unwrap();
        }

        let response = h.pipeline.disconnect_repository(PROJECT_ID).await.unwrap();

        assert_eq!(response.milestones_reset, 1);
        let project = stored(&h).await;
        assert!(project.connection.is_none());
        assert!(!project.milestones[0].completed);
        assert_eq!(project.milestones[0].completed_goals.len(), 2);

        let err = h.pipeline.disconnect_repository(PROJECT_ID).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_connect_uses_default_owner() {
        let h = harness(FakeHosting::default(), vec![]);
        h.pipeline.disconnect_repository(PROJECT_ID).await.unwrap();

        let project = h
            .pipeline
            .connect_repository(
                None,
                PROJECT_ID,
                ConnectRepoRequest {
                    owner: None,
                    repo_name: "todo-v2".to_string(),
                },
            )
            .await
            .unwrap();

        let connection = project.connection.unwrap();
        assert_eq!(connection.owner, "default-owner");
        assert_eq!(connection.full_name.as_deref(), Some("default-owner/todo-v2"));
        assert_eq!(connection.default_branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_connect_accepts_owner_slash_name() {
        let h = harness(FakeHosting::default(), vec![]);
        let project = h
            .pipeline
            .connect_repository(
                None,
                PROJECT_ID,
                ConnectRepoRequest {
                    owner: None,
                    repo_name: "someone/else".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(project.connection.unwrap().coordinates().to_string(), "someone/else");
    }

    #[tokio::test]
    async fn test_generate_context_validates_before_calling() {
        let h = harness(FakeHosting::default(), vec![]);
        let payload = ContextPayload {
            kind: Some("goal".to_string()),
            project_title: Some("Todo".to_string()),
            ..ContextPayload::default()
        };
        let err = h.pipeline.generate_context(None, payload).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_project_contexts_are_persisted() {
        let h = harness(FakeHosting::default(), vec![]);

        let report = h
            .pipeline
            .generate_project_contexts(None, PROJECT_ID)
            .await
            .unwrap();

        // project + 2 milestones + 4 goals
        assert_eq!(report.generated(), 7);
        let project = stored(&h).await;
        assert_eq!(project.context.as_deref(), Some("generated context"));
        assert_eq!(project.milestones[1].goal_contexts.len(), 2);
        assert!(h.backend.prompts.lock().unwrap()[0].contains("REPOSITORY NAME: octo/todo"));
    }

    #[tokio::test]
    async fn test_ping_reports_success() {
        let h = harness(FakeHosting::default(), vec![Ok("API key is working correctly".to_string())]);
        let ping = h.pipeline.ping(None).await.unwrap();
        assert_eq!(ping.status, "success");
        assert_eq!(ping.response, "API key is working correctly");
    }

    /// Stores projects in memory but fails every analysis write.
    struct AuditFailingRepository(InMemoryRepository);

    #[async_trait]
    impl ProjectRepository for AuditFailingRepository {
        async fn get(&self, id: &ProjectId) -> Result<Option<Project>, RepositoryError> {
            self.0.get(id).await
        }

        async fn put(&self, project: Project) -> Result<(), RepositoryError> {
            self.0.put(project).await
        }

        async fn update(
            &self,
            id: &ProjectId,
            updates: Vec<ProjectUpdate>,
        ) -> Result<Project, RepositoryError> {
            self.0.update(id, updates).await
        }

        async fn record_analysis(
            &self,
            _record: AnalysisRecord,
            _updates: Vec<ProjectUpdate>,
        ) -> Result<(), RepositoryError> {
            Err(RepositoryError::storage("record analysis", "disk full"))
        }

        async fn analyses(&self, id: &ProjectId) -> Result<Vec<AnalysisRecord>, RepositoryError> {
            self.0.analyses(id).await
        }
    }

    #[tokio::test]
    async fn test_failed_audit_write_leaves_milestone_open() {
        let repository = Arc::new(AuditFailingRepository(InMemoryRepository::with_projects([
            crate::repository::fixtures::project(),
        ])));
        let backend = Arc::new(FakeBackend::new(vec![Ok(verdict_json(
            true,
            85,
            &["Create repo", "Add README"],
        ))]));
        let pipeline = Pipeline::new(
            repository.clone(),
            Arc::new(hosting_with_commit()),
            Arc::new(ContentGenerator::new(backend, ModelTiers::default())),
            PipelineSettings::default(),
        );

        let err = pipeline
            .analyze_commit(None, PROJECT_ID, analysis_request("abc1234"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Storage(_)));
        let project = repository.get(&project_id()).await.unwrap().unwrap();
        assert!(!project.milestones[0].completed);
        assert!(project.milestones[0].completed_goals.is_empty());
    }

    fn chat(message: &str) -> ProjectChatRequest {
        ProjectChatRequest {
            project_id: PROJECT_ID.to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_project_chat_answers_with_stored_progress() {
        let h = harness(
            FakeHosting {
                commits: vec![listing("aaaaaaa", "Initial commit")],
                ..FakeHosting::default()
            },
            vec![Ok("yes".to_string()), Ok("Setup is the active milestone.".to_string())],
        );

        let reply = h
            .pipeline
            .project_chat(None, chat("What am I working on?"))
            .await
            .unwrap();

        assert!(reply.on_topic);
        assert_eq!(reply.response, "Setup is the active milestone.");
        let prompts = h.backend.prompts.lock().unwrap().clone();
        assert!(prompts[0].contains("Answer with ONLY \"yes\" or \"no\""));
        assert!(prompts[1].contains("- Setup: No description\n  Status: ACTIVE"));
        assert!(prompts[1].contains("Connected Repository: octo/todo"));
        assert!(prompts[1].contains("Latest Commit: Initial commit"));
    }

    #[tokio::test]
    async fn test_project_chat_unknown_project() {
        let h = harness(FakeHosting::default(), vec![]);
        let err = h
            .pipeline
            .project_chat(
                None,
                ProjectChatRequest {
                    project_id: "0123456789abcdef01234567".to_string(),
                    message: "Status?".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
        assert_eq!(h.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_milestone_guidance_returns_model_text() {
        let h = harness(FakeHosting::default(), vec![Ok("1. Sketch the form".to_string())]);
        let payload = GuidancePayload {
            project_title: Some("Todo".to_string()),
            milestone: Some("Auth".to_string()),
            ..GuidancePayload::default()
        };
        let guidance = h.pipeline.milestone_guidance(None, payload).await.unwrap();
        assert_eq!(guidance.response, "1. Sketch the form");
    }
}
