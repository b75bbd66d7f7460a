use analysis_flow::{
    AnalysisService, ChatModel, Domain, FlowError, OpenRouterModel, Operation, Orchestrator,
    OrchestratorConfig, Settings, ToolRegistry, TurnEvent, build_registry,
};
use axum::{
    Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{Next, from_fn},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::models::{ChatRequest, ChatResponse, DirectRequest};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

const CORRELATION_HEADER: &str = "x-correlation-id";

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "resource": what
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn model_error(err: &FlowError) -> ApiError {
    let status = match err {
        FlowError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        FlowError::ModelTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        FlowError::ModelTransport(_) => StatusCode::BAD_GATEWAY,
        _ => return internal_error("Conversation failed", &err.to_string()),
    };
    (
        status,
        Json(json!({
            "error": "Language model unavailable",
            "details": err.to_string()
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<BTreeMap<Domain, Arc<AnalysisService>>>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        services: Vec<Arc<AnalysisService>>,
        model: Arc<dyn ChatModel>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry: Arc<ToolRegistry> = Arc::new(build_registry(&services));
        let services: BTreeMap<Domain, Arc<AnalysisService>> =
            services.into_iter().map(|s| (s.domain(), s)).collect();
        Self {
            services: Arc::new(services),
            orchestrator: Arc::new(Orchestrator::new(model, registry, config)),
        }
    }

    fn service(&self, domain: &str) -> Result<&Arc<AnalysisService>, ApiError> {
        let parsed: Domain = domain
            .parse()
            .map_err(|_| not_found_error("Unknown analysis domain", domain))?;
        self.services
            .get(&parsed)
            .ok_or_else(|| not_found_error("Analysis domain not configured", domain))
    }
}

pub async fn create_app(settings: &Settings) -> anyhow::Result<Router> {
    let services = settings.build_services()?;
    let model = Arc::new(OpenRouterModel::new(settings.model.clone())?);
    info!(model = %model.model(), "Language model configured");
    let state = AppState::new(services, model, settings.orchestrator.clone());
    Ok(build_router(state))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/chat", post(chat))
        .route("/tools", get(list_tools))
        .route("/tools/{name}/history", get(tool_history))
        .route("/api/{domain}/health", get(domain_health))
        .route("/api/{domain}/health/recheck", post(recheck_health))
        .route("/api/{domain}/{operation}", post(run_analysis))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tag each request with a correlation id and run it inside a span carrying it.
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    // Reuse the caller's correlation ID or generate one for this request
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Add correlation ID to request headers for downstream use
    let header = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }

    // Create a tracing span for this request with correlation ID
    let span = info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path()
    );
    // Execute the request within the span and echo the ID back
    let mut response = next.run(request).instrument(span).await;
    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Analysis Orchestration Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Conversational and direct access to phospho, transcriptome, single-cell and proteomics analyses",
        "endpoints": {
            "POST /chat": "Converse with the analysis assistant (set stream=true for server-sent events)",
            "GET /tools": "Tool catalogue and call statistics",
            "GET /tools/{name}/history": "Recent calls of one tool",
            "POST /api/{domain}/{operation}": "Run query, grouped-comparison, survival, correlation, enrichment or comprehensive",
            "GET /api/{domain}/health": "Backend health for a domain",
            "POST /api/{domain}/health/recheck": "Probe a domain's remote backend again",
            "GET /health": "Health check"
        },
        "domains": Domain::ALL.iter().map(Domain::as_str).collect::<Vec<_>>()
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let backends: Map<String, Value> = state
        .services
        .iter()
        .map(|(domain, service)| {
            (
                domain.to_string(),
                serde_json::to_value(service.health()).unwrap_or(Value::Null),
            )
        })
        .collect();
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backends": backends
    }))
}

async fn domain_health(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<Value> {
    let service = state.service(&domain)?;
    Ok(Json(json!({
        "domain": service.domain(),
        "health": service.health()
    })))
}

async fn recheck_health(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<Value> {
    let service = state.service(&domain)?;
    info!(domain = %service.domain(), "Health re-check requested");
    let health = service.recheck_health().await;
    Ok(Json(json!({
        "domain": service.domain(),
        "health": health
    })))
}

async fn run_analysis(
    State(state): State<AppState>,
    Path((domain, operation)): Path<(String, String)>,
    Json(request): Json<DirectRequest>,
) -> ApiResult<Value> {
    let service = state.service(&domain)?;
    let operation: Operation = operation
        .parse()
        .map_err(|_| not_found_error("Unknown analysis operation", &operation))?;

    info!(domain = %service.domain(), %operation, gene = %request.gene, "Direct analysis requested");

    let body = if operation == Operation::Comprehensive {
        // Validation errors are a 400 here, not an error-status composite
        service
            .validate(operation, &request.gene, request.params.clone())
            .map_err(|e| bad_request_error(&e.to_string()))?;
        let composite = service.comprehensive(&request.gene, request.params).await;
        serde_json::to_value(composite)
    } else {
        let validated = service
            .validate(operation, &request.gene, request.params)
            .map_err(|e| bad_request_error(&e.to_string()))?;
        let result = service.execute_single_analysis(&validated).await;
        serde_json::to_value(result)
    };

    body.map(Json).map_err(|e| {
        error!(error = %e, "Failed to serialize analysis result");
        internal_error("Failed to serialize analysis result", &e.to_string())
    })
}

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    let registry = state.orchestrator.registry();
    Json(json!({
        "tools": registry.definitions(),
        "stats": registry.stats()
    }))
}

async fn tool_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let registry = state.orchestrator.registry();
    if !registry.contains(&name) {
        return Err(not_found_error("Unknown tool", &name));
    }
    Ok(Json(json!({
        "tool": name,
        "history": registry.history(&name)
    })))
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    if !request.has_input() {
        return bad_request_error("message or messages is required").into_response();
    }
    // Sessions are not stored; the id is echoed so the client can correlate turns
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let conversation = state
        .orchestrator
        .conversation(request.messages, request.message);

    info!(%session_id, stream = request.stream, messages = conversation.len(), "Chat request");

    // Streaming clients get progress events followed by the final response
    if request.stream {
        return stream_chat(state.orchestrator.clone(), conversation, session_id).into_response();
    }

    match state.orchestrator.run(conversation).await {
        Ok(outcome) => Json(ChatResponse::new(session_id, outcome)).into_response(),
        Err(e) => {
            error!(%session_id, error = %e, "Chat request failed");
            model_error(&e).into_response()
        }
    }
}

fn sse_event(name: &str, payload: &Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

/// Run the orchestrator in the background and forward its events as SSE,
/// closing with a `final` (or `error`) event.
fn stream_chat(
    orchestrator: Arc<Orchestrator>,
    conversation: analysis_flow::Conversation,
    session_id: String,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (sse_tx, sse_rx) = mpsc::channel::<Event>(32);

    tokio::spawn(
        async move {
            let (events_tx, mut events_rx) = mpsc::channel::<TurnEvent>(32);
            let run = orchestrator.run_with_events(conversation, Some(events_tx));
            let forward = async {
                let mut connected = true;
                // Keep draining after a disconnect so the run never blocks on a full channel.
                while let Some(event) = events_rx.recv().await {
                    if !connected {
                        continue;
                    }
                    let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                    let name = payload
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("event")
                        .to_string();
                    if sse_tx.send(sse_event(&name, &payload)).await.is_err() {
                        info!("Streaming client disconnected, finishing the run without it");
                        connected = false;
                    }
                }
            };
            let (outcome, ()) = tokio::join!(run, forward);

            let last = match outcome {
                Ok(outcome) => {
                    let response = ChatResponse::new(session_id, outcome);
                    sse_event(
                        "final",
                        &serde_json::to_value(&response).unwrap_or(Value::Null),
                    )
                }
                Err(e) => {
                    warn!(error = %e, "Streaming chat failed");
                    sse_event("error", &json!({ "error": e.to_string() }))
                }
            };
            let _ = sse_tx.send(last).await;
        }
        .in_current_span(),
    );

    let stream = ReceiverStream::new(sse_rx).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_flow::{
        AnalysisRequest, ChatMessage, ExecutionBackend, ModelReply, ProbePolicy, RemoteStrategy,
        Result, SubprocessStrategy, ToolCall, ToolDefinition,
    };
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request as HttpRequest, header};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    struct DownRemote;

    #[async_trait]
    impl RemoteStrategy for DownRemote {
        async fn probe(&self) -> Result<()> {
            Err(FlowError::BackendUnavailable("connection refused".to_string()))
        }

        async fn call(&self, _request: &AnalysisRequest) -> Result<Value> {
            Err(FlowError::BackendUnavailable("connection refused".to_string()))
        }

        fn supports_composite(&self) -> bool {
            true
        }
    }

    struct RowsEngine;

    #[async_trait]
    impl SubprocessStrategy for RowsEngine {
        async fn run(&self, request: &AnalysisRequest) -> Result<Value> {
            Ok(json!({
                "status": ["success"],
                "message": [format!("{} for {}", request.operation(), request.gene())],
                "data": [{"site": "Y703", "gene": request.gene()}]
            }))
        }
    }

    struct ScriptedModel {
        turn: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _messages: &[ChatMessage], _tools: &[ToolDefinition]) -> Result<ModelReply> {
            match self.turn.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(ModelReply::ToolCalls {
                    content: String::new(),
                    calls: vec![ToolCall::new(
                        "c1",
                        "phospho_analysis",
                        json!({"operation": "survival", "gene": "KIT"}),
                    )],
                }),
                _ => Ok(ModelReply::Answer("KIT Y703 predicts survival.".to_string())),
            }
        }
    }

    /// Keeps asking for ten phospho queries per turn.
    struct LoopingModel;

    #[async_trait]
    impl ChatModel for LoopingModel {
        async fn complete(&self, _messages: &[ChatMessage], _tools: &[ToolDefinition]) -> Result<ModelReply> {
            let calls = (0..10)
                .map(|i| {
                    ToolCall::new(
                        format!("q{i}"),
                        "phospho_analysis",
                        json!({"operation": "query", "gene": "KIT"}),
                    )
                })
                .collect();
            Ok(ModelReply::ToolCalls {
                content: String::new(),
                calls,
            })
        }
    }

    fn services() -> Vec<Arc<AnalysisService>> {
        let policy = ProbePolicy {
            timeout: Duration::from_millis(100),
            attempts: 1,
            backoff: Duration::ZERO,
        };
        Domain::ALL
            .iter()
            .map(|domain| {
                Arc::new(AnalysisService::new(ExecutionBackend::new(
                    *domain,
                    Some(Arc::new(DownRemote)),
                    Some(Arc::new(RowsEngine)),
                    policy.clone(),
                )))
            })
            .collect()
    }

    fn app() -> Router {
        let model = Arc::new(ScriptedModel {
            turn: AtomicUsize::new(0),
        });
        build_router(AppState::new(services(), model, OrchestratorConfig::default()))
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = HttpRequest::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (status, body) = send(app(), "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["endpoints"].get("POST /chat").is_some());
        assert_eq!(body["domains"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn health_reports_every_backend() {
        let (status, body) = send(app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["backends"]["singlecell"]["state"], json!("unknown"));
    }

    #[tokio::test]
    async fn correlation_id_is_echoed() {
        let request = HttpRequest::builder()
            .uri("/health")
            .header(CORRELATION_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.headers()[CORRELATION_HEADER], "abc-123");

        let response = app()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().contains_key(CORRELATION_HEADER));
    }

    #[tokio::test]
    async fn direct_query_falls_back_to_subprocess() {
        let (status, body) = send(
            app(),
            "POST",
            "/api/phospho/query",
            Some(json!({"gene": "KIT"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("success"));
        assert_eq!(body["executed_by"], json!("subprocess"));
        assert_eq!(body["data"][0]["site"], json!("Y703"));
    }

    #[tokio::test]
    async fn direct_endpoints_validate_input() {
        let (status, _) = send(
            app(),
            "POST",
            "/api/phospho/survival",
            Some(json!({"gene": "KIT'); DROP TABLE"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            app(),
            "POST",
            "/api/proteomics/enrichment",
            Some(json!({"gene": "KIT"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app(), "POST", "/api/metabolomics/query", Some(json!({"gene": "KIT"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["resource"], json!("metabolomics"));

        let (status, _) = send(app(), "POST", "/api/phospho/heatmap", Some(json!({"gene": "KIT"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn direct_comprehensive_rejects_invalid_gene() {
        let (status, body) = send(
            app(),
            "POST",
            "/api/phospho/comprehensive",
            Some(json!({"gene": "KIT; DROP"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Validation failed"));

        let (status, _) = send(app(), "POST", "/api/phospho/comprehensive", Some(json!({"gene": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn direct_comprehensive_returns_summary() {
        let (status, body) = send(
            app(),
            "POST",
            "/api/phospho/comprehensive",
            Some(json!({"gene": "KIT"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["total"], json!(4));
        assert_eq!(body["summary"]["successful"], json!(4));
        assert_eq!(body["results"]["survival"]["executed_by"], json!("subprocess"));
    }

    #[tokio::test]
    async fn domain_health_and_recheck() {
        let app = app();
        let (status, body) = send(app.clone(), "POST", "/api/transcriptome/health/recheck", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["health"]["state"], json!("unavailable"));

        let (status, body) = send(app, "GET", "/api/transcriptome/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], json!("transcriptome"));
    }

    #[tokio::test]
    async fn chat_runs_tools_and_merges_analyses() {
        let app = app();
        let (status, body) = send(
            app.clone(),
            "POST",
            "/chat",
            Some(json!({"message": "How does KIT affect survival?", "session_id": "s-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], json!("s-1"));
        assert_eq!(body["reply"], json!("KIT Y703 predicts survival."));
        assert_eq!(body["stop_reason"], json!("answered"));
        assert_eq!(body["tool_calls"], json!(1));
        assert_eq!(body["analyses"]["phospho"]["status"], json!("success"));

        let (_, tools) = send(app, "GET", "/tools", None).await;
        assert_eq!(tools["stats"]["phospho_analysis"]["calls"], json!(1));
        assert_eq!(tools["tools"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn chat_requires_a_message() {
        let (status, _) = send(app(), "POST", "/chat", Some(json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_streams_events() {
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"message": "KIT?", "stream": true}).to_string()))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let model_turn = text.find("event: model_turn").unwrap();
        let finished = text.find("event: tool_finished").unwrap();
        let last = text.find("event: final").unwrap();
        assert!(model_turn < finished && finished < last);
        assert!(text.contains("KIT Y703 predicts survival."));
    }

    #[tokio::test]
    async fn streamed_run_finishes_after_client_disconnects() {
        let state = AppState::new(services(), Arc::new(LoopingModel), OrchestratorConfig::default());
        let registry = state.orchestrator.registry().clone();
        let expected = OrchestratorConfig::default().max_turns * 10;

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"message": "KIT?", "stream": true}).to_string()))
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        drop(response);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let calls = registry.stats()["phospho_analysis"].calls;
            if calls == expected {
                break;
            }
            assert!(Instant::now() < deadline, "run stalled after {calls} tool calls");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn unknown_tool_history_is_not_found() {
        let (status, _) = send(app(), "GET", "/tools/nope/history", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(app(), "GET", "/tools/backend_status/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["history"], json!([]));
    }
}
