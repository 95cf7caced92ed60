use anyhow::{Context, Result};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};

use waypoint_core::{
    base_http_client, ContentGenerator, GeminiClient, GitHubClient, Project, ServiceType,
};
use waypoint_server::api::api_router;
use waypoint_server::config::Config;
use waypoint_server::{
    AppState, Pipeline, PipelineSettings, ProjectRepository, RecordingLogger,
    RecordingMiddleware, SqliteRepository,
};

/// HTTP client for one upstream, recording its traffic when a logger is set.
fn http_client(
    timeout: Duration,
    recording_logger: Option<&RecordingLogger>,
    service_type: ServiceType,
) -> Result<ClientWithMiddleware> {
    let client = base_http_client(timeout)
        .with_context(|| format!("Failed to build HTTP client for {:?}", service_type))?;

    let mut builder = ClientBuilder::new(client);
    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger.clone(), service_type));
    }
    Ok(builder.build())
}

async fn seed_projects(repository: &dyn ProjectRepository, path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read projects file {}", path.display()))?;
    let projects: Vec<Project> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse projects file {}", path.display()))?;

    let count = projects.len();
    for project in projects {
        if repository.get(&project.id).await?.is_some() {
            info!("Project {} already stored, keeping stored progress", project.id);
            continue;
        }
        repository.put(project).await?;
    }
    info!("Loaded {} projects from {}", count, path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting waypoint {}", waypoint_server::version());

    let config = Config::from_env().context("Failed to load configuration from environment variables")?;

    let recording_logger = if config.recording_enabled {
        match RecordingLogger::new(PathBuf::from(&config.recording_log_path)) {
            Ok(logger) => {
                info!(
                    "Recording enabled, logging to: {}",
                    config.recording_log_path
                );
                Some(logger)
            }
            Err(e) => {
                error!("Failed to initialize recording logger: {}", e);
                None
            }
        }
    } else {
        None
    };

    let github_client = GitHubClient::with_client(
        http_client(
            config.http_timeout,
            recording_logger.as_ref(),
            ServiceType::Hosting,
        )?,
        config.github_token.clone(),
        config.github_api_url.clone(),
    );
    if config.github_token.is_none() {
        info!("GITHUB_ACCESS_TOKEN not set, using unauthenticated GitHub requests");
    }

    let gemini_client = GeminiClient::with_client(
        http_client(
            config.http_timeout,
            recording_logger.as_ref(),
            ServiceType::Generative,
        )?,
        config.gemini_api_key.clone(),
        config.gemini_api_url.clone(),
    );
    let generator = ContentGenerator::new(Arc::new(gemini_client), config.model_tiers.clone());

    let db_path = config.state_dir.join("waypoint.db");
    info!("Using state database: {}", db_path.display());
    let repository: Arc<dyn ProjectRepository> = Arc::new(
        SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
    );

    if let Some(path) = &config.projects_file {
        seed_projects(repository.as_ref(), path).await?;
    }

    let settings = PipelineSettings {
        max_attempts: config.generation_max_attempts,
        commit_window: config.commit_window,
        batch_delays: config.batch_delays,
        default_owner: config.github_default_owner.clone(),
        ..PipelineSettings::default()
    };
    let pipeline = Pipeline::new(
        repository,
        Arc::new(github_client),
        Arc::new(generator),
        settings,
    );

    let app_state = Arc::new(AppState { pipeline });

    let app = api_router()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
