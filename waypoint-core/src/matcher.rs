//! Locating the commit that corresponds to a milestone.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::PipelineError;
use crate::github::{CommitListing, HostingService};
use crate::model::{CommitSha, Project, RepoCoordinates};

pub const DEFAULT_COMMIT_WINDOW: usize = 5;

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Does `message` carry `signature`? Both sides are trimmed and
/// case-folded and the comparison is a substring test.
pub fn message_matches(message: &str, signature: &str) -> bool {
    normalize(message).contains(&normalize(signature))
}

/// First commit, in the given (recency) order, whose message carries the
/// signature.
pub fn match_signature<'a>(
    commits: &'a [CommitListing],
    signature: &str,
) -> Option<&'a CommitListing> {
    commits
        .iter()
        .find(|c| message_matches(&c.commit.message, signature))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum MatchOutcome {
    Matched {
        sha: CommitSha,
        message: String,
        url: Option<String>,
    },
    NotMatched {
        /// Message of the most recent commit, if the repository has any.
        latest_message: Option<String>,
        inspected: usize,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Index of `milestone_title` if it is the project's active milestone.
///
/// Completed milestones and milestones further down the sequence are
/// rejected.
pub fn verification_target(project: &Project, milestone_title: &str) -> Result<usize, PipelineError> {
    let index = project
        .milestone_index(milestone_title)
        .ok_or_else(|| PipelineError::not_found(format!("Milestone '{}'", milestone_title)))?;

    if project.milestones[index].completed {
        return Err(PipelineError::validation(format!(
            "Milestone '{}' is already completed",
            milestone_title
        )));
    }

    if project.active_milestone_index() != Some(index) {
        return Err(PipelineError::validation(format!(
            "Milestone '{}' is not the active milestone; complete the earlier milestones first",
            milestone_title
        )));
    }

    Ok(index)
}

pub struct CommitMatcher {
    hosting: Arc<dyn HostingService>,
    window: usize,
}

impl CommitMatcher {
    pub fn new(hosting: Arc<dyn HostingService>) -> Self {
        Self {
            hosting,
            window: DEFAULT_COMMIT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Scan the most recent commits of `repo` for `signature`.
    ///
    /// An empty history is an ordinary no-match. Hosting failures are
    /// returned as is; nothing here retries.
    pub async fn find(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
        signature: &str,
    ) -> Result<MatchOutcome, PipelineError> {
        if signature.trim().is_empty() {
            return Err(PipelineError::validation(
                "Expected commit title must not be empty",
            ));
        }

        let commits = self.hosting.list_commits(correlation_id, repo, self.window).await?;

        if let Some(commit) = match_signature(&commits, signature) {
            info!(
                "Commit {} in {} matches '{}'",
                CommitSha::from(commit.sha.as_str()).short(),
                repo,
                signature.trim()
            );
            return Ok(MatchOutcome::Matched {
                sha: CommitSha::from(commit.sha.as_str()),
                message: commit.commit.message.clone(),
                url: commit.html_url.clone(),
            });
        }

        info!(
            "No commit among the {} most recent in {} matches '{}'",
            commits.len(),
            repo,
            signature.trim()
        );
        Ok(MatchOutcome::NotMatched {
            latest_message: commits.first().map(|c| c.commit.message.clone()),
            inspected: commits.len(),
        })
    }
}
