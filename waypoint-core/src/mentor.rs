//! Project question answering and milestone guidance.
//!
//! Questions go through a yes/no relevance gate before the full project
//! brief is sent. Answers are clipped to a short reply with at most one code
//! example.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backoff::DEFAULT_MAX_ATTEMPTS;
use crate::error::PipelineError;
use crate::generator::ContentGenerator;
use crate::github::HostingService;
use crate::model::{deserialize_goals, Project};
use crate::prompts;

/// Commit titles fetched for the project brief.
pub const RECENT_COMMITS: usize = 5;

/// Longest chat reply returned, in bytes.
pub const MAX_REPLY_LEN: usize = 800;

pub const OFF_TOPIC_REPLY: &str = "I'm sorry, but I can only answer questions related to this specific project. Please ask me about something directly related to the project's features, requirements, or implementation details.";

const ONE_EXAMPLE_NOTE: &str = " (I've provided just one example for clarity.)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub on_topic: bool,
}

/// Milestone guidance request as it arrives on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidancePayload {
    #[serde(default)]
    pub project_title: Option<String>,
    #[serde(default)]
    pub project_description: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub milestone: Option<String>,
    #[serde(default)]
    pub commit_title: Option<String>,
    /// Either a list or one comma-separated string.
    #[serde(default, deserialize_with = "deserialize_goals")]
    pub goals: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl GuidancePayload {
    fn prompt(&self) -> Result<String, PipelineError> {
        let (Some(project_title), Some(milestone)) = (
            present(self.project_title.as_deref()),
            present(self.milestone.as_deref()),
        ) else {
            return Err(PipelineError::validation(
                "Missing required fields: projectTitle and milestone are required",
            ));
        };
        let files: Vec<String> = self
            .files
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        Ok(prompts::milestone_guidance_prompt(
            project_title,
            present(self.project_description.as_deref()),
            present(self.repository.as_deref()),
            milestone,
            present(self.commit_title.as_deref()),
            &self.goals,
            &files,
        ))
    }
}

/// The gate only rejects an explicit "no"; anything else is answered.
pub fn is_off_topic(answer: &str) -> bool {
    answer
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .eq_ignore_ascii_case("no")
}

/// Split after `.`, `!` or `?` followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut after_stop = false;
    for (i, c) in text.char_indices() {
        if after_stop && c.is_whitespace() {
            let sentence = text[start..i].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = i;
        }
        after_stop = matches!(c, '.' | '!' | '?');
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Keep whole sentences up to `max` bytes. A first sentence longer than
/// `max` is cut on a char boundary instead.
pub fn clip_reply(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }

    let mut out = String::new();
    for sentence in sentences(text) {
        let joined = if out.is_empty() { 0 } else { 1 };
        if out.len() + joined + sentence.len() > max {
            break;
        }
        if joined == 1 {
            out.push(' ');
        }
        out.push_str(sentence);
    }

    if out.is_empty() {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        out.push_str(&text[..end]);
    }
    out
}

/// Drop every fenced code block after the first.
pub fn single_code_example(text: &str) -> String {
    let parts: Vec<&str> = text.split("```").collect();
    if parts.len() <= 3 {
        return text.to_string();
    }
    format!("{}```{}```{}", parts[0], parts[1], ONE_EXAMPLE_NOTE)
}

pub struct Mentor {
    hosting: Arc<dyn HostingService>,
    generator: Arc<ContentGenerator>,
    max_attempts: u32,
}

impl Mentor {
    pub fn new(hosting: Arc<dyn HostingService>, generator: Arc<ContentGenerator>) -> Self {
        Self {
            hosting,
            generator,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// First lines of the newest commits of the connected repository.
    ///
    /// The brief is still useful without them, so a hosting failure is
    /// logged and yields an empty list.
    async fn recent_commits(&self, correlation_id: Option<&str>, project: &Project) -> Vec<String> {
        let Some(connection) = &project.connection else {
            return Vec::new();
        };
        let repo = connection.coordinates();
        match self
            .hosting
            .list_commits(correlation_id, &repo, RECENT_COMMITS)
            .await
        {
            Ok(commits) => commits
                .iter()
                .filter_map(|c| c.commit.message.lines().next())
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            Err(e) => {
                warn!("Failed to list recent commits of {} for chat: {}", repo, e);
                Vec::new()
            }
        }
    }

    pub async fn answer(
        &self,
        correlation_id: Option<&str>,
        project: &Project,
        question: &str,
    ) -> Result<ChatReply, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::validation(
                "Missing required field: message",
            ));
        }

        let commits = self.recent_commits(correlation_id, project).await;
        let brief = prompts::project_brief(project, &commits);

        let gate = self
            .generator
            .generate(
                correlation_id,
                &prompts::relevance_prompt(&brief, question),
                self.max_attempts,
            )
            .await?;
        if is_off_topic(&gate) {
            info!("Question about project {} judged off topic", project.id);
            return Ok(ChatReply {
                response: OFF_TOPIC_REPLY.to_string(),
                on_topic: false,
            });
        }

        let text = self
            .generator
            .generate(
                correlation_id,
                &prompts::project_chat_prompt(&brief, question),
                self.max_attempts,
            )
            .await?;
        info!(
            "Answered question about project {} ({} bytes before clipping)",
            project.id,
            text.len()
        );

        Ok(ChatReply {
            response: single_code_example(&clip_reply(&text, MAX_REPLY_LEN)),
            on_topic: true,
        })
    }

    pub async fn guidance(
        &self,
        correlation_id: Option<&str>,
        payload: &GuidancePayload,
    ) -> Result<String, PipelineError> {
        let prompt = payload.prompt()?;
        Ok(self
            .generator
            .generate(correlation_id, &prompt, self.max_attempts)
            .await?)
    }
}
