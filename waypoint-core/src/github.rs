use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::error::{PipelineError, Upstream};
use crate::http::create_http_client;
use crate::model::RepoCoordinates;
use crate::recording::CORRELATION_ID_HEADER;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostingError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("GitHub rejected credentials: {status} - {message}")]
    Unauthorized { status: u16, message: String },

    #[error("GitHub API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("failed to reach GitHub: {0}")]
    Transport(String),
}

impl From<HostingError> for PipelineError {
    fn from(err: HostingError) -> Self {
        match err {
            HostingError::NotFound(what) => PipelineError::NotFound(what),
            HostingError::Api { status: 429, .. } => PipelineError::RateLimited {
                service: Upstream::Hosting,
                message: err.to_string(),
            },
            other => PipelineError::UpstreamUnavailable {
                service: Upstream::Hosting,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub message: String,
    pub author: Option<CommitAuthor>,
}

/// One entry of the commit list, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitListing {
    pub sha: String,
    pub commit: CommitInfo,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFile {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changes: u64,
    /// Absent for binary files and very large diffs.
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDetail {
    pub sha: String,
    pub commit: CommitInfo,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub files: Vec<CommitFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryOwner {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub full_name: String,
    pub owner: RepositoryOwner,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// Read access to a repository hosting service.
#[async_trait]
pub trait HostingService: Send + Sync {
    /// Most recent commits on the default branch, newest first.
    ///
    /// `correlation_id` is forwarded in the `X-Correlation-ID` header.
    async fn list_commits(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
        limit: usize,
    ) -> Result<Vec<CommitListing>, HostingError>;

    /// A single commit including per-file patches.
    async fn get_commit(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
        sha: &str,
    ) -> Result<CommitDetail, HostingError>;

    async fn get_repository(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
    ) -> Result<RepositoryInfo, HostingError>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    token: Option<String>,
    base_url: String,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(
            create_http_client(Duration::from_secs(120))?,
            token,
            DEFAULT_GITHUB_API_URL,
        ))
    }

    pub fn with_client(
        client: ClientWithMiddleware,
        token: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token: token.filter(|t| !t.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        correlation_id: Option<&str>,
        url: &str,
        what: &str,
    ) -> Result<T, HostingError> {
        let mut request_builder = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json");

        if let Some(token) = &self.token {
            request_builder = request_builder.header("Authorization", format!("token {}", token));
        }

        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| HostingError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read error body: {}>", e));
            error!(
                "GitHub API error fetching {}: {} - {}",
                what, status, error_text
            );
            return Err(match status {
                StatusCode::NOT_FOUND => HostingError::NotFound(what.to_string()),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HostingError::Unauthorized {
                    status: status.as_u16(),
                    message: error_text,
                },
                _ => HostingError::Api {
                    status: status.as_u16(),
                    message: error_text,
                },
            });
        }

        response
            .json()
            .await
            .map_err(|e| HostingError::Transport(format!("failed to parse {}: {}", what, e)))
    }
}

#[async_trait]
impl HostingService for GitHubClient {
    async fn list_commits(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
        limit: usize,
    ) -> Result<Vec<CommitListing>, HostingError> {
        let url = format!(
            "{}/repos/{}/{}/commits?per_page={}",
            self.base_url,
            repo.owner,
            repo.name,
            limit.clamp(1, 100)
        );

        info!("Fetching {} most recent commits from {}", limit, repo);

        let commits: Vec<CommitListing> = self
            .get_json(correlation_id, &url, &format!("repository {}", repo))
            .await?;

        info!("Received {} commits from {}", commits.len(), repo);
        Ok(commits)
    }

    async fn get_commit(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
        sha: &str,
    ) -> Result<CommitDetail, HostingError> {
        let url = format!(
            "{}/repos/{}/{}/commits/{}",
            self.base_url, repo.owner, repo.name, sha
        );

        info!("Fetching commit {} from {}", sha, repo);

        let detail: CommitDetail = self
            .get_json(correlation_id, &url, &format!("commit {} in {}", sha, repo))
            .await?;

        info!(
            "Fetched commit {} ({} files changed)",
            detail.sha,
            detail.files.len()
        );
        Ok(detail)
    }

    async fn get_repository(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoCoordinates,
    ) -> Result<RepositoryInfo, HostingError> {
        let url = format!("{}/repos/{}/{}", self.base_url, repo.owner, repo.name);
        info!("Fetching repository details for {}", repo);
        self.get_json(correlation_id, &url, &format!("repository {}", repo))
            .await
    }
}
