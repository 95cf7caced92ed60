//! Project and milestone records.
//!
//! These mirror the persisted project document. Progress fields on
//! [`Milestone`] are only ever changed through [`crate::milestone`]
//! transitions; everything else is owned by the authoring workflow.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PipelineError;

/// Newtype for a project identifier (24 hexadecimal digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub const LEN: usize = 24;

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let raw = raw.trim();
        if raw.len() != Self::LEN || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::validation(format!(
                "Invalid project ID format: '{}'",
                raw
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Validate a SHA supplied by a caller.
    ///
    /// Git SHAs are hexadecimal and between 7 (abbreviated) and 40 characters.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let raw = raw.trim();
        if raw.len() < 7 || raw.len() > 40 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::validation(format!(
                "Invalid commit SHA: '{}'",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Owner/name pair addressing a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoCoordinates {
    pub owner: String,
    pub name: String,
}

impl RepoCoordinates {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Repository connected to a project, with the hosting metadata captured at
/// connection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConnection {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl RepositoryConnection {
    pub fn coordinates(&self) -> RepoCoordinates {
        RepoCoordinates::new(self.owner.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub connection: Option<RepositoryConnection>,
    #[serde(default)]
    pub context: Option<String>,
}

impl Project {
    /// Index of the milestone with the given title.
    pub fn milestone_index(&self, title: &str) -> Option<usize> {
        self.milestones.iter().position(|m| m.title == title)
    }

    pub fn milestone(&self, title: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.title == title)
    }

    /// The first milestone (in declared order) that is not completed.
    pub fn active_milestone_index(&self) -> Option<usize> {
        self.milestones.iter().position(|m| !m.completed)
    }

    pub fn active_milestone(&self) -> Option<&Milestone> {
        self.active_milestone_index().map(|i| &self.milestones[i])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub title: String,
    /// Expected commit-message signature.
    #[serde(default)]
    pub commit_title: String,
    #[serde(default, deserialize_with = "deserialize_goals")]
    pub goals: Vec<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub goal_contexts: BTreeMap<String, String>,
    #[serde(default)]
    pub completed_goals: BTreeSet<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub detected: bool,
    #[serde(default)]
    pub commit_sha: Option<CommitSha>,
}

impl Milestone {
    pub fn new(title: impl Into<String>, commit_title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            commit_title: commit_title.into(),
            ..Self::default()
        }
    }

    pub fn with_goals<I, S>(mut self, goals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.goals = goals.into_iter().map(Into::into).collect();
        self
    }

    pub fn declares_goal(&self, goal: &str) -> bool {
        self.goals.iter().any(|g| g == goal)
    }

    /// True when goals are declared and every one of them is completed.
    pub fn all_goals_completed(&self) -> bool {
        !self.goals.is_empty() && self.goals.iter().all(|g| self.completed_goals.contains(g))
    }
}

/// Split a stored goal list. Older records keep goals as one comma-separated
/// string rather than an array.
fn parse_goal_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn deserialize_goals<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum GoalList {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match GoalList::deserialize(deserializer)? {
        GoalList::List(goals) => goals
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect(),
        GoalList::Joined(raw) => parse_goal_list(&raw),
    })
}
