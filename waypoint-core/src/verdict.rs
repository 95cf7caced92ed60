//! Commit verdicts produced by the evaluation model.
//!
//! Model output is untrusted text. [`parse_verdict`] never fails: output it
//! cannot read is reported as [`ParsedVerdict::Malformed`] and turned into a
//! [`CommitVerdict::degraded`] verdict that can never complete a milestone.

use serde::{Deserialize, Serialize};

/// Minimum confidence for a verdict to be applied to milestone state.
pub const CONFIDENCE_THRESHOLD: u8 = 70;

const DEGRADED_EXPLANATION: &str = "The analysis could not be read; this goal was not evaluated.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalAssessment {
    pub goal: String,
    pub achieved: bool,
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictMetrics {
    pub goal_alignment: u8,
    pub security_risk: u8,
    pub code_quality: u8,
    pub commit_clarity: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitVerdict {
    pub overall_assessment: String,
    pub goals_achieved: Vec<GoalAssessment>,
    pub metrics: VerdictMetrics,
    pub suggestions: Vec<String>,
    pub should_complete: bool,
    pub confidence_score: u8,
    pub description: String,
}

impl CommitVerdict {
    /// Stand-in verdict for unreadable model output: every declared goal
    /// unachieved, zero metrics and zero confidence.
    pub fn degraded(goals: &[String]) -> Self {
        Self {
            overall_assessment: "The AI analysis could not be parsed.".to_string(),
            goals_achieved: goals
                .iter()
                .map(|g| GoalAssessment {
                    goal: g.clone(),
                    achieved: false,
                    explanation: DEGRADED_EXPLANATION.to_string(),
                })
                .collect(),
            metrics: VerdictMetrics::default(),
            suggestions: Vec::new(),
            should_complete: false,
            confidence_score: 0,
            description: String::new(),
        }
    }

    /// Goals the model reports as achieved.
    pub fn achieved_goals(&self) -> impl Iterator<Item = &str> {
        self.goals_achieved
            .iter()
            .filter(|g| g.achieved)
            .map(|g| g.goal.as_str())
    }
}

/// Apply only confident completion verdicts.
pub fn should_apply(verdict: &CommitVerdict) -> bool {
    verdict.should_complete && verdict.confidence_score >= CONFIDENCE_THRESHOLD
}

/// Lenient mirror of the JSON the model is asked to produce.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    #[serde(default)]
    overall_assessment: String,
    #[serde(default)]
    goals_achieved: Vec<RawGoal>,
    #[serde(default)]
    metrics: RawMetrics,
    #[serde(default)]
    suggestions: Vec<String>,
    should_complete: bool,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawGoal {
    goal: String,
    #[serde(default)]
    achieved: bool,
    #[serde(default)]
    explanation: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetrics {
    #[serde(default)]
    goal_alignment: f64,
    #[serde(default)]
    security_risk: f64,
    #[serde(default)]
    code_quality: f64,
    #[serde(default)]
    commit_clarity: f64,
}

/// Clamp a model-supplied score into 0..=100.
fn score(value: f64) -> u8 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(0.0, 100.0) as u8
    }
}

impl From<RawVerdict> for CommitVerdict {
    fn from(raw: RawVerdict) -> Self {
        Self {
            overall_assessment: raw.overall_assessment,
            goals_achieved: raw
                .goals_achieved
                .into_iter()
                .map(|g| GoalAssessment {
                    goal: g.goal,
                    achieved: g.achieved,
                    explanation: g.explanation,
                })
                .collect(),
            metrics: VerdictMetrics {
                goal_alignment: score(raw.metrics.goal_alignment),
                security_risk: score(raw.metrics.security_risk),
                code_quality: score(raw.metrics.code_quality),
                commit_clarity: score(raw.metrics.commit_clarity),
            },
            suggestions: raw.suggestions,
            should_complete: raw.should_complete,
            confidence_score: score(raw.confidence_score),
            description: raw.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedVerdict {
    Parsed(CommitVerdict),
    /// The raw model output that could not be read.
    Malformed(String),
}

impl ParsedVerdict {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    /// The parsed verdict, or the degraded verdict for `goals`.
    pub fn into_verdict(self, goals: &[String]) -> CommitVerdict {
        match self {
            Self::Parsed(verdict) => verdict,
            Self::Malformed(_) => CommitVerdict::degraded(goals),
        }
    }
}

/// Body of the first fenced code block, or the whole text when there is
/// none. The info string after the opening fence is skipped.
pub fn extract_payload(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text.trim();
    };
    let after_fence = &text[open + 3..];
    let body_start = match after_fence.find('\n') {
        Some(newline) => newline + 1,
        None => return text.trim(),
    };
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

pub fn parse_verdict(text: &str) -> ParsedVerdict {
    match serde_json::from_str::<RawVerdict>(extract_payload(text)) {
        Ok(raw) => ParsedVerdict::Parsed(raw.into()),
        Err(_) => ParsedVerdict::Malformed(text.to_string()),
    }
}
