//! AI evaluation of a single commit against a milestone.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::backoff::DEFAULT_MAX_ATTEMPTS;
use crate::error::PipelineError;
use crate::generator::ContentGenerator;
use crate::github::{CommitDetail, HostingService};
use crate::model::{CommitSha, Project, RepoCoordinates};
use crate::prompts::{evaluation_prompt, PatchLimits};
use crate::verdict::{parse_verdict, should_apply, CommitVerdict, ParsedVerdict};

/// Commit facts echoed back to callers alongside the verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub sha: CommitSha,
    pub message: String,
    pub author: String,
    pub date: String,
    pub files_changed: usize,
}

impl CommitSummary {
    fn from_detail(sha: &CommitSha, detail: &CommitDetail) -> Self {
        let author = detail.commit.author.as_ref();
        Self {
            sha: sha.clone(),
            message: detail.commit.message.clone(),
            author: author.map(|a| a.name.clone()).unwrap_or_default(),
            date: author.map(|a| a.date.clone()).unwrap_or_default(),
            files_changed: detail.files.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub milestone_index: usize,
    pub verdict: CommitVerdict,
    /// False when the model output was unreadable and `verdict` is degraded.
    pub parsed: bool,
    /// The verdict cleared the completion gate.
    pub applicable: bool,
    pub commit: CommitSummary,
}

pub struct CommitAnalyzer {
    hosting: Arc<dyn HostingService>,
    generator: Arc<ContentGenerator>,
    max_attempts: u32,
    limits: PatchLimits,
}

impl CommitAnalyzer {
    pub fn new(hosting: Arc<dyn HostingService>, generator: Arc<ContentGenerator>) -> Self {
        Self {
            hosting,
            generator,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            limits: PatchLimits::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_patch_limits(mut self, limits: PatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Evaluate `sha` against the milestone titled `milestone_title`.
    ///
    /// Nothing is mutated here. Unreadable model output yields a degraded
    /// verdict rather than an error.
    pub async fn analyze(
        &self,
        correlation_id: Option<&str>,
        project: &Project,
        repo: &RepoCoordinates,
        milestone_title: &str,
        sha: &CommitSha,
    ) -> Result<Analysis, PipelineError> {
        let milestone_index = project
            .milestone_index(milestone_title)
            .ok_or_else(|| PipelineError::not_found(format!("Milestone '{}'", milestone_title)))?;
        let milestone = &project.milestones[milestone_index];

        let detail = self.hosting.get_commit(correlation_id, repo, sha.as_str()).await?;
        info!(
            "Analyzing commit {} ({} files) against milestone '{}'",
            sha.short(),
            detail.files.len(),
            milestone.title
        );

        let prompt = evaluation_prompt(project, milestone, sha, &detail, self.limits);
        let text = self
            .generator
            .generate(correlation_id, &prompt, self.max_attempts)
            .await?;

        let parsed = parse_verdict(&text);
        let was_parsed = parsed.is_parsed();
        if let ParsedVerdict::Malformed(raw) = &parsed {
            warn!(
                "Could not parse analysis of commit {} ({} bytes of model output); using degraded verdict",
                sha.short(),
                raw.len()
            );
        }
        let verdict = parsed.into_verdict(&milestone.goals);
        let applicable = should_apply(&verdict);

        info!(
            "Verdict for commit {}: should_complete={}, confidence={}, applicable={}",
            sha.short(),
            verdict.should_complete,
            verdict.confidence_score,
            applicable
        );

        Ok(Analysis {
            milestone_index,
            commit: CommitSummary::from_detail(sha, &detail),
            verdict,
            parsed: was_parsed,
            applicable,
        })
    }
}
