//! Prompt templates sent to the generative backend.

use crate::github::{CommitDetail, CommitFile};
use crate::milestone::{self, MilestoneStatus};
use crate::model::{CommitSha, Milestone, Project};

/// The sentence a reviewer is told to emit when an implementation is correct.
pub const ALL_GOOD_SENTINEL: &str = "All Good";

pub fn project_context_prompt(
    title: &str,
    description: Option<&str>,
    repository: Option<&str>,
) -> String {
    format!(
        r#"
You are a code reviewer for the following project. Generate a concise context that will guide AI-based code review:

PROJECT TITLE: {title}
PROJECT DESCRIPTION: {description}
REPOSITORY NAME: {repository}

Create a brief, focused context that:
1. Explains exactly what this project is supposed to accomplish
2. Specifies what technical aspects should be evaluated during code review
3. Mentions key quality expectations (performance, readability, etc.)
4. Notes specific areas that need special attention

Be factual, precise, and limit your response to 2-3 sentences about each point. Avoid speculation or information not directly related to reviewing this codebase. Format as a single paragraph of 80-120 words.
"#,
        title = title,
        description = description.unwrap_or("No description provided"),
        repository = repository.unwrap_or("No repository name provided"),
    )
}

pub fn milestone_context_prompt(
    project_title: &str,
    milestone_title: &str,
    commit_title: Option<&str>,
    description: Option<&str>,
    files: &[String],
) -> String {
    let mut details = String::new();
    if let Some(commit) = commit_title {
        details.push_str(&format!("COMMIT: {}\n", commit));
    }
    if let Some(description) = description {
        details.push_str(&format!("DETAILS: {}\n", description));
    }
    if !files.is_empty() {
        details.push_str(&format!("FILES: {}\n", files.join(", ")));
    }

    format!(
        r#"
You are a code reviewer for the following project milestone. Generate a concise context for reviewing code at this stage:

PROJECT: {project_title}
MILESTONE: {milestone_title}
{details}
Create a brief, focused review context (50-70 words) that:
1. Clarifies exactly what functionality should be working at this stage
2. Specifies technical requirements to verify
3. Lists potential issues to watch for

Be factual and precise. Avoid speculation. Focus only on what's directly relevant to reviewing this code. If the implementation is correct, the reviewer should state "{sentinel}".
"#,
        sentinel = ALL_GOOD_SENTINEL,
    )
}

pub fn goal_context_prompt(project_title: &str, milestone_title: Option<&str>, goal: &str) -> String {
    format!(
        r#"
You are a code reviewer examining a specific goal within a project. Generate a concise review context:

PROJECT: {project_title}
MILESTONE: {milestone}
GOAL: {goal}

Create a brief, focused review guideline (30-50 words) that:
1. Explains precisely what this goal accomplishes
2. Lists specific implementation details to verify
3. Notes common issues to check for

Be factual and direct. Avoid speculation. Focus exclusively on reviewing code that implements this goal. If the code successfully implements the goal, the reviewer should state "{sentinel}".
"#,
        milestone = milestone_title.unwrap_or("Unknown milestone"),
        sentinel = ALL_GOOD_SENTINEL,
    )
}

/// Character budgets for diffs embedded in the evaluation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLimits {
    pub per_file: usize,
    pub total: usize,
}

impl Default for PatchLimits {
    fn default() -> Self {
        Self {
            per_file: 4_000,
            total: 40_000,
        }
    }
}

/// Truncate `text` to at most `max` bytes on a char boundary.
fn truncate(text: &str, max: usize) -> (&str, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

fn render_files(files: &[CommitFile], limits: PatchLimits) -> String {
    let mut remaining = limits.total;
    let mut out = Vec::with_capacity(files.len());

    for file in files {
        let mut entry = format!(
            "\n- Filename: {}\n- Status: {}\n- Changes: {} additions, {} deletions\n",
            file.filename, file.status, file.additions, file.deletions
        );

        match file.patch.as_deref() {
            Some(patch) if remaining > 0 => {
                let (kept, cut) = truncate(patch, limits.per_file.min(remaining));
                remaining -= kept.len();
                entry.push_str(&format!("- Diff:\n```\n{}\n```\n", kept));
                if cut {
                    entry.push_str("- (diff truncated)\n");
                }
            }
            Some(_) => entry.push_str("- Diff omitted (size budget exhausted)\n"),
            None => {}
        }

        out.push(entry);
    }

    out.join("\n")
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the prompt asking the model to judge a commit against a milestone.
pub fn evaluation_prompt(
    project: &Project,
    milestone: &Milestone,
    sha: &CommitSha,
    commit: &CommitDetail,
    limits: PatchLimits,
) -> String {
    let author = commit.commit.author.as_ref();
    let author_name = author.map(|a| a.name.as_str()).unwrap_or("Unknown");
    let date = author.map(|a| a.date.as_str()).unwrap_or("Unknown");

    let mut review_context = String::new();
    if let Some(context) = project.context.as_deref() {
        review_context.push_str(&format!("PROJECT REVIEW CONTEXT:\n{}\n\n", context.trim()));
    }
    if let Some(context) = milestone.context.as_deref() {
        review_context.push_str(&format!("MILESTONE REVIEW CONTEXT:\n{}\n\n", context.trim()));
    }
    let goal_contexts: Vec<String> = milestone
        .goals
        .iter()
        .filter_map(|g| {
            milestone
                .goal_contexts
                .get(g)
                .map(|c| format!("- {}: {}", g, c.trim()))
        })
        .collect();
    if !goal_contexts.is_empty() {
        review_context.push_str(&format!(
            "GOAL REVIEW CONTEXTS:\n{}\n\n",
            goal_contexts.join("\n")
        ));
    }

    format!(
        r#"
You are a code mentor analyzing a student's commit for a coding project milestone. Your task is to evaluate whether the commit
successfully implemented the requirements and meets the goals.

PROJECT MILESTONE INFORMATION:
- Milestone Title: {title}
- Expected Commit: "{commit_title}"
- Description: {description}

GOALS TO ACHIEVE:
{goals}

FILES THAT SHOULD BE MODIFIED:
{expected_files}

{review_context}ACTUAL COMMIT DETAILS:
- Commit SHA: {sha}
- Commit Message: "{message}"
- Author: {author_name}
- Date: {date}

FILES MODIFIED IN THIS COMMIT:
{files}

ANALYSIS TASKS:
1. Evaluate if the commit successfully implements each goal listed above
2. For each goal, provide a YES or NO if it was achieved, followed by a brief explanation
3. Score the commit on the following metrics (0-100 scale):
   - Goal alignment: How well does the commit align with the milestone goals?
   - Security risk: How secure is the code? (0 = high risk, 100 = no risk)
   - Code quality: How well-structured and maintainable is the code?
   - Commit clarity: How clear is the commit message and changes?
4. Provide 1-2 specific suggestions for improvement if applicable
5. Give an overall assessment of whether the milestone should be marked as completed based on this commit
6. Provide a confidence score (0-100) for your assessment

FORMAT YOUR RESPONSE USING THE FOLLOWING JSON STRUCTURE:
```json
{{
  "overallAssessment": "Brief overall assessment of the commit (1-2 sentences)",
  "goalsAchieved": [
    {{
      "goal": "Goal text here",
      "achieved": true,
      "explanation": "Brief explanation"
    }}
  ],
  "metrics": {{
    "goalAlignment": 85,
    "securityRisk": 70,
    "codeQuality": 80,
    "commitClarity": 75
  }},
  "suggestions": [
    "Suggestion 1",
    "Suggestion 2"
  ],
  "shouldComplete": true,
  "confidenceScore": 90,
  "description": "Detailed description of what the commit did and how it relates to the milestone goals (2-3 paragraphs)"
}}
```

IMPORTANT: Ensure your response is valid JSON and follows this exact structure.
"#,
        title = milestone.title,
        commit_title = milestone.commit_title,
        description = milestone.description.as_deref().unwrap_or("N/A"),
        goals = bullet_list(&milestone.goals, "No goals declared"),
        expected_files = bullet_list(&milestone.expected_files, "No specific files required"),
        message = commit.commit.message,
        files = render_files(&commit.files, limits),
    )
}

/// Technologies implied by the file extensions a project's milestones expect
/// to touch, in first-seen order.
pub fn tech_stack(project: &Project) -> Vec<&'static str> {
    let mut stack = Vec::new();
    for ext in file_extensions(project) {
        let implied: &[&'static str] = match ext.as_str() {
            "html" => &["HTML"],
            "css" => &["CSS"],
            "js" => &["JavaScript"],
            "jsx" => &["React"],
            "tsx" => &["React", "TypeScript"],
            "ts" => &["TypeScript"],
            "py" => &["Python"],
            "java" => &["Java"],
            "rs" => &["Rust"],
            _ => &[],
        };
        for tech in implied {
            if !stack.contains(tech) {
                stack.push(*tech);
            }
        }
    }
    stack
}

/// Lowercased extensions of every expected file, deduplicated.
pub fn file_extensions(project: &Project) -> Vec<String> {
    let mut extensions: Vec<String> = Vec::new();
    for file in project.milestones.iter().flat_map(|m| &m.expected_files) {
        let Some((_, ext)) = file.rsplit_once('.') else {
            continue;
        };
        let ext = ext.trim().to_ascii_lowercase();
        if !ext.is_empty() && !extensions.contains(&ext) {
            extensions.push(ext);
        }
    }
    extensions
}

fn status_label(status: MilestoneStatus) -> &'static str {
    match status {
        MilestoneStatus::Completed => "COMPLETED",
        MilestoneStatus::Active => "ACTIVE",
        MilestoneStatus::Detected => "ACTIVE (matching commit found)",
        MilestoneStatus::Pending => "PENDING",
    }
}

fn milestone_brief(milestone: &Milestone, status: MilestoneStatus) -> String {
    let mut lines = vec![
        format!(
            "- {}: {}",
            milestone.title,
            milestone.description.as_deref().unwrap_or("No description")
        ),
        format!("  Status: {}", status_label(status)),
        format!("  Commit Title: {}", milestone.commit_title),
    ];
    if !milestone.goals.is_empty() {
        lines.push(format!("  Goals: {}", milestone.goals.join(", ")));
    }
    if !milestone.completed_goals.is_empty() {
        let done: Vec<&str> = milestone.completed_goals.iter().map(String::as_str).collect();
        lines.push(format!("  Completed Goals: {}", done.join(", ")));
    }
    if !milestone.expected_files.is_empty() {
        lines.push(format!(
            "  Files to Modify: {}",
            milestone.expected_files.join(", ")
        ));
    }
    lines.join("\n")
}

/// Everything the assistant knows about a project: its description, derived
/// milestone statuses, likely stack, and the most recent commit titles.
pub fn project_brief(project: &Project, recent_commits: &[String]) -> String {
    let mut out = format!(
        "Project Title: {}\nDescription: {}\n",
        project.title,
        if project.description.trim().is_empty() {
            "No description available"
        } else {
            project.description.trim()
        }
    );
    if let Some(context) = project.context.as_deref() {
        out.push_str(&format!("Additional Context: {}\n", context.trim()));
    }
    out.push('\n');

    let stack = tech_stack(project);
    if !stack.is_empty() {
        out.push_str(&format!("Technologies: {}\n", stack.join(", ")));
    }
    let extensions = file_extensions(project);
    if !extensions.is_empty() {
        out.push_str(&format!("File Types: {}\n", extensions.join(", ")));
    }
    match &project.connection {
        Some(connection) => out.push_str(&format!(
            "Connected Repository: {}\n",
            connection.coordinates()
        )),
        None => out.push_str("No repository connected\n"),
    }
    out.push('\n');

    match recent_commits.first() {
        Some(latest) => {
            out.push_str(&format!("Latest Commit: {}\n", latest));
            out.push_str(&format!(
                "Recent Commits:\n{}\n",
                bullet_list(recent_commits, "")
            ));
        }
        None => out.push_str("Latest Commit: No commits yet\n"),
    }

    let milestones: Vec<String> = project
        .milestones
        .iter()
        .zip(milestone::statuses(project))
        .map(|(m, status)| milestone_brief(m, status))
        .collect();
    if !milestones.is_empty() {
        out.push_str(&format!("\nMILESTONES:\n{}\n", milestones.join("\n\n")));
    }
    out
}

/// Yes/no gate run before a project question is answered.
pub fn relevance_prompt(brief: &str, question: &str) -> String {
    format!(
        r#"
You are an assistant that determines if questions are relevant to this specific coding project.

PROJECT INFORMATION:
{brief}
User Question: "{question}"

IMPORTANT GUIDELINES FOR RELEVANCE:
1. Questions about programming languages, technologies, or file types used in this project ARE relevant
2. Questions about general coding concepts that apply to this project ARE relevant
3. Questions about web development basics (like HTML, CSS, JavaScript) ARE relevant if this is a web project
4. Questions about development tools likely to be used in this project ARE relevant
5. Questions about the project status, progress, milestones, or deadlines ARE relevant
6. Only questions completely unrelated to software development or this project are NOT relevant

Based on these criteria, is this question clearly relevant to this specific project? Answer with ONLY "yes" or "no".
"#
    )
}

pub fn project_chat_prompt(brief: &str, question: &str) -> String {
    format!(
        r#"
You are an AI assistant for a specific coding project with complete knowledge of all project details.

PROJECT DETAILS:
{brief}
USER QUESTION: {question}

CRITICAL RESPONSE GUIDELINES:
1. Keep responses BRIEF and CONCISE (1-3 paragraphs maximum)
2. You should reference specific details from the project when answering status-related questions
3. Mention milestone names and completion status when relevant
4. You SHOULD explain the technologies this project uses
5. When discussing code:
   - DO provide property names, values, attributes, or tags that would help
   - DO provide 1-2 lines of example code if absolutely necessary
   - DO NOT provide complete solutions (more than 5 lines of code)
6. For questions about project status, be accurate and specific about which milestones are completed
7. For any question completely unrelated to this project, respond with: "I'm sorry, but I can only answer questions related to this project."

Provide a helpful response based on the specific project details available.
"#
    )
}

/// Mentoring prompt for one milestone.
pub fn milestone_guidance_prompt(
    project_title: &str,
    project_description: Option<&str>,
    repository: Option<&str>,
    milestone: &str,
    commit_title: Option<&str>,
    goals: &[String],
    files: &[String],
) -> String {
    let mut project = format!("PROJECT: {}\n", project_title);
    if let Some(description) = project_description {
        project.push_str(&format!("DESCRIPTION: {}\n", description));
    }
    if let Some(repository) = repository {
        project.push_str(&format!("REPOSITORY: {}\n", repository));
    }

    let mut details = format!("MILESTONE: {}\n", milestone);
    if let Some(commit) = commit_title {
        details.push_str(&format!("EXPECTED COMMIT: {}\n", commit));
    }
    if !goals.is_empty() {
        details.push_str(&format!("\nGOALS TO ACHIEVE:\n{}\n", bullet_list(goals, "")));
    }
    if !files.is_empty() {
        details.push_str(&format!("\nFILES TO MODIFY:\n{}\n", bullet_list(files, "")));
    }

    format!(
        r#"
As a coding mentor, please provide guidance for the following project milestone:

{project}
{details}
Please provide:
1. A step-by-step approach to complete this milestone
2. Key coding concepts I should understand
3. Potential challenges I might face and how to overcome them
4. Tips for testing my implementation
"#
    )
}
