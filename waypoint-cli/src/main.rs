use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use waypoint_core::backoff::DEFAULT_MAX_ATTEMPTS;
use waypoint_core::context::BatchDelays;
use waypoint_core::gemini::DEFAULT_GEMINI_API_URL;
use waypoint_core::github::DEFAULT_GITHUB_API_URL;
use waypoint_core::matcher::DEFAULT_COMMIT_WINDOW;
use waypoint_core::{
    create_http_client, CommitAnalyzer, CommitMatcher, CommitSha, ContentGenerator,
    ContextSynthesizer, GeminiClient, GitHubClient, MatchOutcome, ModelTiers, Project,
    RepoCoordinates,
};

/// Waypoint: milestone verification against repository history
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(about = "Milestone verification and AI-assisted commit analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate review contexts for every milestone and goal of a project file
    Context(ContextArgs),
    /// Look for a commit title among a repository's most recent commits
    Match(MatchArgs),
    /// Ask the model whether a commit completes a milestone
    Analyze(AnalyzeArgs),
    /// Check that the generative AI service answers
    Ping(GeminiArgs),
}

#[derive(Args, Debug)]
struct GeminiArgs {
    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Comma-separated models, primary first
    #[arg(long, env = "MODEL_TIERS")]
    model_tiers: Option<String>,

    #[arg(long, env = "GEMINI_API_URL", default_value = DEFAULT_GEMINI_API_URL)]
    gemini_api_url: String,

    /// Maximum generation calls per prompt
    #[arg(long, env = "GENERATION_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 120)]
    timeout_secs: u64,
}

impl GeminiArgs {
    fn generator(&self) -> Result<Arc<ContentGenerator>> {
        let tiers = match &self.model_tiers {
            Some(raw) => ModelTiers::parse_list(raw).context("--model-tiers must name at least one model")?,
            None => ModelTiers::default(),
        };
        let http = create_http_client(Duration::from_secs(self.timeout_secs))
            .context("Failed to build HTTP client")?;
        let client = GeminiClient::with_client(
            http,
            self.api_key.clone(),
            self.gemini_api_url.clone(),
        );
        Ok(Arc::new(ContentGenerator::new(Arc::new(client), tiers)))
    }
}

#[derive(Args, Debug)]
struct GitHubArgs {
    /// GitHub access token; requests are unauthenticated without one
    #[arg(long, env = "GITHUB_ACCESS_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_GITHUB_API_URL)]
    github_api_url: String,
}

impl GitHubArgs {
    fn client(&self, timeout: Duration) -> Result<GitHubClient> {
        let http = create_http_client(timeout).context("Failed to build HTTP client")?;
        Ok(GitHubClient::with_client(
            http,
            self.github_token.clone(),
            self.github_api_url.clone(),
        ))
    }
}

#[derive(Parser, Debug)]
struct ContextArgs {
    /// Project JSON file
    #[arg(long)]
    project: PathBuf,

    /// Where to write the project with its contexts; stdout if omitted
    #[arg(long)]
    output: Option<PathBuf>,

    /// Repository name given to the project prompt
    #[arg(long)]
    repository: Option<String>,

    /// Pause before each milestone, in milliseconds
    #[arg(long, env = "CONTEXT_MILESTONE_DELAY_MS", default_value_t = 1500)]
    milestone_delay_ms: u64,

    /// Pause before each goal, in milliseconds
    #[arg(long, env = "CONTEXT_GOAL_DELAY_MS", default_value_t = 1000)]
    goal_delay_ms: u64,

    #[command(flatten)]
    gemini: GeminiArgs,
}

#[derive(Parser, Debug)]
struct MatchArgs {
    #[arg(long)]
    owner: String,

    #[arg(long)]
    repo: String,

    /// Expected commit title
    #[arg(long)]
    signature: String,

    /// Number of recent commits to inspect
    #[arg(long, env = "COMMIT_WINDOW", default_value_t = DEFAULT_COMMIT_WINDOW)]
    window: usize,

    #[command(flatten)]
    github: GitHubArgs,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Project JSON file
    #[arg(long)]
    project: PathBuf,

    /// Title of the milestone to evaluate against
    #[arg(long)]
    milestone: String,

    #[arg(long)]
    sha: String,

    /// Repository owner; defaults to the project's connected repository
    #[arg(long, requires = "repo")]
    owner: Option<String>,

    #[arg(long, requires = "owner")]
    repo: Option<String>,

    #[command(flatten)]
    github: GitHubArgs,

    #[command(flatten)]
    gemini: GeminiArgs,
}

fn read_project(path: &Path) -> Result<Project> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse project file {}", path.display()))
}

async fn run_context(args: ContextArgs) -> Result<()> {
    let mut project = read_project(&args.project)?;
    let repository = args.repository.or_else(|| {
        project
            .connection
            .as_ref()
            .map(|c| c.full_name.clone().unwrap_or_else(|| c.name.clone()))
    });
    let delays = BatchDelays {
        before_milestone: Duration::from_millis(args.milestone_delay_ms),
        before_goal: Duration::from_millis(args.goal_delay_ms),
    };

    let synthesizer = ContextSynthesizer::new(args.gemini.generator()?)
        .with_max_attempts(args.gemini.max_attempts);
    let report = synthesizer
        .run_batch(None, &project, repository.as_deref(), delays)
        .await;

    for failure in &report.failures {
        eprintln!("Failed: {}: {}", failure.target, failure.error);
    }
    report.apply_to(&mut project);

    let output = serde_json::to_string_pretty(&project)?;
    match &args.output {
        Some(path) => {
            fs::write(path, output)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "Wrote {} contexts ({} failed) to {}",
                report.generated(),
                report.failures.len(),
                path.display()
            );
        }
        None => println!("{}", output),
    }
    Ok(())
}

async fn run_match(args: MatchArgs) -> Result<()> {
    let hosting = Arc::new(args.github.client(Duration::from_secs(120))?);
    let matcher = CommitMatcher::new(hosting).with_window(args.window);
    let repo = RepoCoordinates::new(args.owner, args.repo);

    match matcher.find(None, &repo, &args.signature).await? {
        MatchOutcome::Matched { sha, message, url } => {
            println!("Matched commit {}: {}", sha.short(), message.trim());
            if let Some(url) = url {
                println!("{}", url);
            }
        }
        MatchOutcome::NotMatched {
            latest_message: Some(latest),
            inspected,
        } => {
            println!(
                "No matching commit among the last {}; latest is: {}",
                inspected,
                latest.trim()
            );
        }
        MatchOutcome::NotMatched { .. } => println!("No commits found in repository"),
    }
    Ok(())
}

async fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let project = read_project(&args.project)?;
    let repo = match (args.owner, args.repo) {
        (Some(owner), Some(repo)) => RepoCoordinates::new(owner, repo),
        _ => match &project.connection {
            Some(connection) => connection.coordinates(),
            None => bail!("Project has no connected repository; pass --owner and --repo"),
        },
    };
    let sha = CommitSha::parse(&args.sha)?;

    let hosting = Arc::new(
        args.github
            .client(Duration::from_secs(args.gemini.timeout_secs))?,
    );
    let analyzer = CommitAnalyzer::new(hosting, args.gemini.generator()?)
        .with_max_attempts(args.gemini.max_attempts);
    let analysis = analyzer
        .analyze(None, &project, &repo, &args.milestone, &sha)
        .await?;

    println!("{}", serde_json::to_string_pretty(&analysis.verdict)?);
    if !analysis.parsed {
        eprintln!("Model output could not be parsed; showing the degraded verdict");
    }
    eprintln!(
        "Would {}complete milestone '{}'",
        if analysis.applicable { "" } else { "not " },
        args.milestone
    );
    Ok(())
}

async fn run_ping(args: GeminiArgs) -> Result<()> {
    let generator = args.generator()?;
    let response = generator
        .generate(
            None,
            "Respond with 'API key is working correctly' if this request succeeds.",
            2,
        )
        .await?;
    println!("{}", response.trim());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Context(args) => run_context(args).await,
        Commands::Match(args) => run_match(args).await,
        Commands::Analyze(args) => run_analyze(args).await,
        Commands::Ping(args) => run_ping(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_analyze_requires_owner_and_repo_together() {
        let result = Cli::try_parse_from([
            "waypoint",
            "analyze",
            "--project",
            "p.json",
            "--milestone",
            "Setup",
            "--sha",
            "abc1234",
            "--owner",
            "octo",
            "--api-key",
            "k",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_match_defaults_window() {
        let cli = Cli::try_parse_from([
            "waypoint",
            "match",
            "--owner",
            "octo",
            "--repo",
            "todo",
            "--signature",
            "Initial commit",
        ])
        .unwrap();
        match cli.command {
            Commands::Match(args) => assert_eq!(args.window, DEFAULT_COMMIT_WINDOW),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
