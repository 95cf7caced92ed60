use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    Extension,
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use waypoint_core::{
    ChatReply, ContextPayload, ContextReport, CorrelationId, GuidancePayload, PipelineError,
    Project, CORRELATION_ID_HEADER,
};

use crate::pipeline::{
    CommitAnalysisRequest, CommitAnalysisResponse, ConnectRepoRequest, ContextResponse,
    DisconnectResponse, GoalToggleRequest, GuidanceResponse, PingResponse, ProjectChatRequest,
    VerifyCommitRequest, VerifyCommitResponse,
};
use crate::repository::AnalysisRecord;
use crate::AppState;

/// A [`PipelineError`] rendered as `{"error": message}` with a mapped status.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, message);
        } else {
            warn!("Request rejected with {}: {}", status, message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Unwrap a JSON body, reporting unreadable bodies as validation failures.
fn body<T: DeserializeOwned>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| PipelineError::validation(rejection.body_text()).into())
}

/// Tag each request with a correlation id, honouring one supplied by the
/// caller, and echo it on the response.
async fn assign_correlation_id(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        "{} {} (correlation id {})",
        request.method(),
        request.uri().path(),
        correlation_id
    );
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "waypoint",
        "version": crate::version(),
    }))
}

async fn help_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "waypoint",
        "version": crate::version(),
        "description": "Milestone progress verification against repository history, with AI-assisted commit analysis",
        "endpoints": [
            {"path": "/health", "method": "GET", "description": "Health check endpoint"},
            {"path": "/help", "method": "GET", "description": "API documentation and service information"},
            {"path": "/projects/{id}", "method": "GET", "description": "Project with milestone progress"},
            {"path": "/projects/{id}/analyses", "method": "GET", "description": "Audit trail of commit analyses, oldest first"},
            {"path": "/projects/{id}/verify-commit", "method": "POST", "description": "Search recent commits for the active milestone's commit title"},
            {"path": "/projects/{id}/commit-analysis", "method": "POST", "description": "AI evaluation of a commit against a milestone"},
            {"path": "/projects/{id}/milestone-goals", "method": "PUT", "description": "Mark a milestone goal complete or incomplete"},
            {"path": "/projects/{id}/connect-repo", "method": "POST", "description": "Connect a GitHub repository"},
            {"path": "/projects/{id}/disconnect-repo", "method": "POST", "description": "Disconnect the repository and reset milestone completion"},
            {"path": "/projects/{id}/contexts", "method": "POST", "description": "Generate review contexts for the project, its milestones and goals"},
            {"path": "/ai/generate-context", "method": "POST", "description": "Generate a single project, milestone or goal review context"},
            {"path": "/ai/generate-context", "method": "GET", "description": "Check that the generative AI service is reachable"},
            {"path": "/ai/project-chat", "method": "POST", "description": "Answer a question about a stored project"},
            {"path": "/ai/milestone-guidance", "method": "POST", "description": "Step-by-step mentoring for one milestone"}
        ],
        "configuration": {
            "required_env_vars": ["GEMINI_API_KEY (or GOOGLE_AI_API_KEY)"],
            "optional_env_vars": [
                "GITHUB_ACCESS_TOKEN",
                "GITHUB_DEFAULT_OWNER",
                "MODEL_TIERS (default: gemini-1.5-flash,gemini-1.0-pro-latest)",
                "GENERATION_MAX_ATTEMPTS (default: 3)",
                "COMMIT_WINDOW (default: 5)",
                "PORT (default: 3000)",
                "STATE_DIR (default: current directory)",
                "PROJECTS_FILE",
                "RECORDING_ENABLED (default: false)",
                "RECORDING_LOG_PATH (default: recordings.jsonl)"
            ]
        }
    }))
}

async fn get_project(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Project> {
    Ok(Json(state.pipeline.get_project(&id).await?))
}

async fn list_analyses(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<AnalysisRecord>> {
    Ok(Json(state.pipeline.analyses(&id).await?))
}

async fn verify_commit(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Path(id): Path<String>,
    payload: Result<Json<VerifyCommitRequest>, JsonRejection>,
) -> ApiResult<VerifyCommitResponse> {
    let request = body(payload)?;
    Ok(Json(state.pipeline.verify_commit(Some(&correlation_id), &id, request).await?))
}

async fn analyze_commit(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Path(id): Path<String>,
    payload: Result<Json<CommitAnalysisRequest>, JsonRejection>,
) -> ApiResult<CommitAnalysisResponse> {
    let request = body(payload)?;
    Ok(Json(state.pipeline.analyze_commit(Some(&correlation_id), &id, request).await?))
}

async fn toggle_goal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<GoalToggleRequest>, JsonRejection>,
) -> ApiResult<Project> {
    let request = body(payload)?;
    Ok(Json(state.pipeline.toggle_goal(&id, request).await?))
}

async fn connect_repo(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Path(id): Path<String>,
    payload: Result<Json<ConnectRepoRequest>, JsonRejection>,
) -> ApiResult<Project> {
    let request = body(payload)?;
    Ok(Json(state.pipeline.connect_repository(Some(&correlation_id), &id, request).await?))
}

async fn disconnect_repo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DisconnectResponse> {
    Ok(Json(state.pipeline.disconnect_repository(&id).await?))
}

async fn generate_project_contexts(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> ApiResult<ContextReport> {
    Ok(Json(state.pipeline.generate_project_contexts(Some(&correlation_id), &id).await?))
}

async fn generate_context(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    payload: Result<Json<ContextPayload>, JsonRejection>,
) -> ApiResult<ContextResponse> {
    let payload = body(payload)?;
    Ok(Json(state.pipeline.generate_context(Some(&correlation_id), payload).await?))
}

async fn project_chat(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    payload: Result<Json<ProjectChatRequest>, JsonRejection>,
) -> ApiResult<ChatReply> {
    let request = body(payload)?;
    Ok(Json(
        state
            .pipeline
            .project_chat(Some(&correlation_id), request)
            .await?,
    ))
}

async fn milestone_guidance(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    payload: Result<Json<GuidancePayload>, JsonRejection>,
) -> ApiResult<GuidanceResponse> {
    let payload = body(payload)?;
    Ok(Json(
        state
            .pipeline
            .milestone_guidance(Some(&correlation_id), payload)
            .await?,
    ))
}

async fn ping_generator(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
) -> ApiResult<PingResponse> {
    Ok(Json(state.pipeline.ping(Some(&correlation_id)).await?))
}

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .route("/projects/:id", get(get_project))
        .route("/projects/:id/analyses", get(list_analyses))
        .route("/projects/:id/verify-commit", post(verify_commit))
        .route("/projects/:id/commit-analysis", post(analyze_commit))
        .route("/projects/:id/milestone-goals", put(toggle_goal))
        .route("/projects/:id/connect-repo", post(connect_repo))
        .route("/projects/:id/disconnect-repo", post(disconnect_repo))
        .route("/projects/:id/contexts", post(generate_project_contexts))
        .route(
            "/ai/generate-context",
            post(generate_context).get(ping_generator),
        )
        .route("/ai/project-chat", post(project_chat))
        .route("/ai/milestone-guidance", post(milestone_guidance))
        .layer(middleware::from_fn(assign_correlation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::*;
    use axum::body::Body;
    use axum::http::{header, Method};
    use std::future::IntoFuture;
    use tower::ServiceExt;
    use waypoint_core::{GenerationError, HostingError, Upstream};

    fn app(h: Harness) -> Router {
        api_router().with_state(Arc::new(AppState {
            pipeline: h.pipeline,
        }))
    }

    async fn send(
        app: Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (PipelineError::validation("bad"), StatusCode::BAD_REQUEST),
            (PipelineError::not_found("Project"), StatusCode::NOT_FOUND),
            (
                PipelineError::RateLimited {
                    service: Upstream::Generator,
                    message: "slow".to_string(),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                PipelineError::UpstreamUnavailable {
                    service: Upstream::Hosting,
                    message: "down".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                PipelineError::Storage("disk".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[tokio::test]
    async fn test_health_reports_version() {
        let (status, body) = send(
            app(harness(FakeHosting::default(), vec![])),
            Method::GET,
            "/health",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["version"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_correlation_id_is_echoed() {
        let app = app(harness(FakeHosting::default(), vec![]));
        let request = axum::http::Request::builder()
            .uri("/health")
            .header(CORRELATION_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).unwrap(),
            "abc-123"
        );
    }

    #[tokio::test]
    async fn test_verify_commit_round_trip() {
        let hosting = FakeHosting {
            commits: vec![listing("aaaaaaa", "Initial commit")],
            ..FakeHosting::default()
        };
        let (status, body) = send(
            app(harness(hosting, vec![])),
            Method::POST,
            &format!("/projects/{}/verify-commit", PROJECT_ID),
            Some(json!({"expectedCommitTitle": "initial commit", "milestoneTitle": "Setup"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matched"], true);
        assert_eq!(body["commitSha"], "aaaaaaa");
        assert_eq!(body["message"], "Matched commit: Initial commit");
    }

    #[tokio::test]
    async fn test_missing_field_is_bad_request() {
        let (status, body) = send(
            app(harness(FakeHosting::default(), vec![])),
            Method::POST,
            &format!("/projects/{}/verify-commit", PROJECT_ID),
            Some(json!({"milestoneTitle": "Setup"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("expectedCommitTitle"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let app = app(harness(FakeHosting::default(), vec![]));
        let request = axum::http::Request::builder()
            .method(Method::PUT)
            .uri(format!("/projects/{}/milestone-goals", PROJECT_ID))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let (status, body) = send(
            app(harness(FakeHosting::default(), vec![])),
            Method::GET,
            "/projects/ffffffffffffffffffffffff",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_hosting_rate_limit_maps_to_429() {
        let hosting = FakeHosting {
            failure: Some(HostingError::Api {
                status: 429,
                message: "API rate limit exceeded".to_string(),
            }),
            ..FakeHosting::default()
        };
        let (status, _) = send(
            app(harness(hosting, vec![])),
            Method::POST,
            &format!("/projects/{}/verify-commit", PROJECT_ID),
            Some(json!({"expectedCommitTitle": "Initial commit", "milestoneTitle": "Setup"})),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_goal_toggle_returns_project() {
        let (status, body) = send(
            app(harness(FakeHosting::default(), vec![])),
            Method::PUT,
            &format!("/projects/{}/milestone-goals", PROJECT_ID),
            Some(json!({"milestoneTitle": "Setup", "goal": "Create repo", "completed": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["milestones"][0]["completedGoals"], json!(["Create repo"]));
        assert_eq!(body["milestones"][0]["completed"], false);
    }

    #[tokio::test]
    async fn test_generate_context_response_shape() {
        let (status, body) = send(
            app(harness(
                FakeHosting::default(),
                vec![Ok("Check the login form.".to_string())],
            )),
            Method::POST,
            "/ai/generate-context",
            Some(json!({"type": "goal", "projectTitle": "Todo", "goal": "Login form"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "goal");
        assert_eq!(body["context"], "Check the login form.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_failure_is_bad_gateway() {
        let failure = || {
            Err(GenerationError::Unavailable {
                model: "m".to_string(),
                message: "invalid key".to_string(),
            })
        };
        let (status, _) = send(
            app(harness(FakeHosting::default(), vec![failure(), failure()])),
            Method::GET,
            "/ai/generate-context",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let app = app(harness(FakeHosting::default(), vec![]));
        let uri = format!("/projects/{}/disconnect-repo", PROJECT_ID);

        let (status, body) = send(app.clone(), Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "milestonesReset": 0}));

        let (status, _) = send(app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    /// Correlation ids seen by a local stand-in for GitHub and Gemini.
    type Seen = Arc<std::sync::Mutex<Vec<(String, Option<String>)>>>;

    fn seen_header(headers: &axum::http::HeaderMap) -> Option<String> {
        headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn spawn_upstream() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let commits_seen = seen.clone();
        let generate_seen = seen.clone();
        let upstream = Router::new()
            .route(
                "/repos/:owner/:repo/commits",
                get(move |headers: axum::http::HeaderMap| async move {
                    commits_seen
                        .lock()
                        .unwrap()
                        .push(("commits".to_string(), seen_header(&headers)));
                    Json(json!([{"sha": "aaaaaaa", "commit": {"message": "Initial commit"}}]))
                }),
            )
            .route(
                "/v1beta/models/:model",
                post(move |headers: axum::http::HeaderMap| async move {
                    generate_seen
                        .lock()
                        .unwrap()
                        .push(("generate".to_string(), seen_header(&headers)));
                    Json(json!({"candidates": [{"content": {"parts": [{"text": "API key is working correctly"}]}}]}))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, upstream).into_future());
        (format!("http://{}", addr), seen)
    }

    fn live_app(base_url: &str) -> Router {
        use crate::pipeline::{Pipeline, PipelineSettings};
        use crate::repository::InMemoryRepository;
        use std::time::Duration;
        use waypoint_core::{
            create_http_client, ContentGenerator, GeminiClient, GitHubClient, ModelTiers,
        };

        let client = || create_http_client(Duration::from_secs(5)).unwrap();
        let hosting = GitHubClient::with_client(client(), None, base_url);
        let backend = GeminiClient::with_client(client(), "key".to_string(), base_url);
        let pipeline = Pipeline::new(
            Arc::new(InMemoryRepository::with_projects([
                crate::repository::fixtures::project(),
            ])),
            Arc::new(hosting),
            Arc::new(ContentGenerator::new(Arc::new(backend), ModelTiers::default())),
            PipelineSettings::default(),
        );
        api_router().with_state(Arc::new(AppState { pipeline }))
    }

    #[tokio::test]
    async fn test_correlation_id_reaches_upstream_calls() {
        let (base_url, seen) = spawn_upstream().await;
        let app = live_app(&base_url);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri(format!("/projects/{}/verify-commit", PROJECT_ID))
            .header(header::CONTENT_TYPE, "application/json")
            .header(CORRELATION_ID_HEADER, "req-42")
            .body(Body::from(
                json!({"expectedCommitTitle": "Initial commit", "milestoneTitle": "Setup"})
                    .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = axum::http::Request::builder()
            .uri("/ai/generate-context")
            .header(CORRELATION_ID_HEADER, "req-43")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("commits".to_string(), Some("req-42".to_string())),
                ("generate".to_string(), Some("req-43".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_generated_correlation_id_is_forwarded() {
        let (base_url, seen) = spawn_upstream().await;
        let response = live_app(&base_url)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ai/generate-context")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let echoed = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(seen.lock().unwrap()[0].1.as_deref(), Some(echoed.as_str()));
    }

    #[tokio::test]
    async fn test_project_chat_route() {
        let (status, body) = send(
            app(harness(
                FakeHosting::default(),
                vec![Ok("yes".to_string()), Ok("You are on Setup.".to_string())],
            )),
            Method::POST,
            "/ai/project-chat",
            Some(json!({"projectId": PROJECT_ID, "message": "Where am I?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "You are on Setup.");
        assert_eq!(body["onTopic"], true);
    }

    #[tokio::test]
    async fn test_milestone_guidance_requires_milestone() {
        let (status, body) = send(
            app(harness(FakeHosting::default(), vec![])),
            Method::POST,
            "/ai/milestone-guidance",
            Some(json!({"projectTitle": "Todo"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("milestone"));
    }
}
