//! HTTP server wiring. Pipeline order is exactly: auth gate → router →
//! target resolution → chain lookup/build → request-in → request-out →
//! forwarder → response-in → response-out → reply.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{self, RoutingError, TransformError};
use crate::frontend::{Frontend, GeminiFrontend};
use crate::metrics;
use crate::proxy::{ForwardedResponse, Forwarder};
use crate::router;
use crate::sse::SseEvent;
use crate::transformer::TransformerRegistry;
use crate::types::AnthropicRequest;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<TransformerRegistry>,
    pub forwarder: Arc<Forwarder>,
    pub active_requests: Arc<AtomicUsize>,
    pub started_at: Instant,
}

impl AppState {
    /// Builds the registry with every `customTransformers` entry installed
    /// in addition to the built-ins. Config loading already validated each
    /// entry's `path` eagerly, so this only fails if the registry and the
    /// config validator have drifted out of sync.
    pub fn new(config: Config) -> Self {
        let mut registry = TransformerRegistry::new();
        if let Err(e) = registry.install_custom(config.custom_transformers()) {
            tracing::error!(error = %e, "failed to install custom transformers despite eager config validation");
        }
        AppState {
            forwarder: Arc::new(Forwarder::new(config.clone())),
            config,
            registry: Arc::new(registry),
            active_requests: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    // Health and root are exempt from the auth gate, so they live on a
    // separate sub-router that the shared-secret middleware never wraps.
    let open = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(health_handler));

    let guarded = Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1beta/models/{model_action}", post(gemini_native_handler))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn_with_state(state.config.clone(), crate::auth::require_shared_secret));

    open.merge(guarded)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    let mut response = metrics::render().into_response();
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain; version=0.0.4"));
    response
}

async fn messages_handler(State(state): State<AppState>, body: Json<Value>) -> Response {
    handle_request(state, body.0, None).await
}

async fn gemini_native_handler(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    body: Json<Value>,
) -> Response {
    // Path segment is `<model>:<action>` (e.g. `gemini-1.5-pro:generateContent`);
    // only the model name is relevant here, the action only selects streaming.
    let (model, action) = model_action.split_once(':').unwrap_or((model_action.as_str(), ""));
    let frontend = GeminiFrontend;

    let internal_req = match frontend.parse_request(body.0, model) {
        Ok(req) => req,
        Err(e) => return error::error_response(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string(), None),
    };

    let mut internal_value = match serde_json::to_value(&internal_req) {
        Ok(v) => v,
        Err(e) => return error::error_response(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string(), None),
    };
    internal_value["stream"] = Value::Bool(action.contains("stream"));

    let response = handle_request(state, internal_value, None).await;
    // Native responses are always buffered in this adapter; streaming
    // native Gemini clients are not yet supported (see DESIGN.md).
    let (parts, body) = response.into_parts();
    if parts.status != StatusCode::OK {
        return Response::from_parts(parts, body);
    }
    match http_body_util::BodyExt::collect(body).await {
        Ok(collected) => {
            let anthropic_value: Value = match serde_json::from_slice(&collected.to_bytes()) {
                Ok(v) => v,
                Err(e) => {
                    return error::error_response(StatusCode::BAD_GATEWAY, "invalid_response", &e.to_string(), None)
                }
            };
            match frontend.serialize_response(anthropic_value) {
                Ok(native) => Json(native).into_response(),
                Err(e) => error::error_response(StatusCode::BAD_GATEWAY, "invalid_response", &e.to_string(), None),
            }
        }
        Err(e) => error::error_response(StatusCode::BAD_GATEWAY, "invalid_response", &e.to_string(), None),
    }
}

async fn handle_request(state: AppState, body: Value, request_id_override: Option<String>) -> Response {
    let request_id = request_id_override.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let start = Instant::now();
    state.active_requests.fetch_add(1, Ordering::SeqCst);
    let _guard = scopeguard(&state.active_requests);

    let mut req: AnthropicRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error::error_response(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string(), None);
        }
    };

    let decision = router::route(&mut req, &state.config);
    metrics::REQUESTS_TOTAL.with_label_values(&[decision.route_class]).inc();

    let Some(provider) = state.config.resolve_provider(&req.model) else {
        let (_, provider_name) = Config::split_target(&req.model).unwrap_or(("", &req.model));
        return RoutingError::UnknownProvider(provider_name.to_string()).into_response();
    };

    let Some(chain) = state.registry.chain_for(&state.config, &req.model) else {
        return RoutingError::NoSuchRoute(req.model.clone()).into_response();
    };

    // `req.model` still carries the `"provider,model"` composite the router
    // wrote for dispatch; replace it with the bare model name before the
    // transformer chain (and ultimately the provider) ever sees it.
    let (_, bare_model) = Config::split_target(&req.model).unwrap_or(("", req.model.as_str()));
    req.model = bare_model.to_string();

    let stream_requested = req.stream;
    let request_value = match serde_json::to_value(&req) {
        Ok(v) => v,
        Err(e) => return error::error_response(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string(), None),
    };

    let outbound = match chain
        .apply_request_in(request_value)
        .and_then(|v| chain.apply_request_out(v))
    {
        Ok(v) => v,
        Err(e) => return record_transform_failure(e),
    };

    let cancel = CancellationToken::new();
    let forwarded = state
        .forwarder
        .forward(provider, &chain, outbound, stream_requested, cancel.clone())
        .await;

    let elapsed = start.elapsed().as_secs_f64();
    metrics::REQUEST_DURATION.with_label_values(&[decision.route_class]).observe(elapsed);

    match forwarded {
        Ok(ForwardedResponse::Buffered(resp)) => match chain
            .apply_response_in(resp)
            .and_then(|v| chain.apply_response_out(v))
        {
            Ok(final_value) => {
                let mut response = Json(final_value).into_response();
                insert_request_id(&mut response, &request_id);
                response
            }
            Err(e) => record_transform_failure(e),
        },
        Ok(ForwardedResponse::Streaming(events)) => {
            metrics::ACTIVE_STREAMS.inc();
            let transformed = chain.apply_stream(events);
            let byte_stream = GuardedEventStream {
                inner: transformed,
                _guard: cancel.drop_guard(),
            };
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .header("connection", "keep-alive")
                .body(Body::from_stream(byte_stream.map_to_bytes()))
                .expect("static headers are always valid");
            insert_request_id(&mut response, &request_id);
            response
        }
        Err(e) => {
            metrics::PROVIDER_FAILURES_TOTAL.with_label_values(&[&provider.name]).inc();
            e.into_response()
        }
    }
}

fn record_transform_failure(e: TransformError) -> Response {
    metrics::TRANSFORM_FAILURES_TOTAL.with_label_values(&[&e.step]).inc();
    e.into_response()
}

fn insert_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
}

/// RAII guard decrementing the in-flight counter the Supervisor consults
/// before shutting down.
struct ActiveRequestGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveRequestGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn scopeguard(counter: &AtomicUsize) -> ActiveRequestGuard<'_> {
    ActiveRequestGuard(counter)
}

/// Wraps the final SSE event stream together with the request's
/// cancellation drop-guard, so that when Axum drops the response body on
/// client disconnect, the guard fires and the forwarder's in-flight select
/// observes cancellation within one chunk. Also balances the
/// `ACTIVE_STREAMS` gauge incremented when the stream was opened.
struct GuardedEventStream<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S> Drop for GuardedEventStream<S> {
    fn drop(&mut self) {
        metrics::ACTIVE_STREAMS.dec();
    }
}

impl<S: Stream<Item = SseEvent> + Unpin> Stream for GuardedEventStream<S> {
    type Item = SseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S: Stream<Item = SseEvent> + Unpin + Send + 'static> GuardedEventStream<S> {
    fn map_to_bytes(self) -> impl Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send + 'static {
        futures::StreamExt::map(self, |event| Ok(event.encode()))
    }
}
