//! Error kinds for the proxy core.
//!
//! Each variant maps to a specific client-visible outcome. Handlers convert
//! these into HTTP responses; nothing here retries or falls back across
//! providers — that cascade is an explicit non-goal.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Raised while loading or validating the on-disk configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("routes.default `{route}` references unknown provider `{provider}`")]
    UnknownDefaultProvider { route: String, provider: String },
    #[error("routes.default `{route}` references model `{model}` not in provider `{provider}`.models")]
    UnknownDefaultModel {
        route: String,
        provider: String,
        model: String,
    },
    #[error("route class `{class}` -> `{route}` references unknown provider `{provider}`")]
    UnknownRouteProvider {
        class: String,
        route: String,
        provider: String,
    },
    #[error("route class `{class}` -> `{route}` references model `{model}` not in provider `{provider}`.models")]
    UnknownRouteModel {
        class: String,
        route: String,
        provider: String,
        model: String,
    },
    #[error("provider `{provider}` perModel entry `{model}` is not in `{provider}`.models")]
    UnknownPerModelEntry { provider: String, model: String },
    #[error("duplicate provider name `{0}`")]
    DuplicateProvider(String),
    #[error("customTransformers entry `{0}` is not a compiled allow-listed extension")]
    UnknownCustomTransformer(String),
}

/// Raised by the auth gate.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or invalid credential")]
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        error_response(StatusCode::UNAUTHORIZED, "auth_error", &self.to_string(), None)
    }
}

/// Raised when a `(provider, model)` target cannot be resolved.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no route configured for class `{0}`")]
    NoSuchRoute(String),
    #[error("target provider `{0}` is not configured")]
    UnknownProvider(String),
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        error_response(StatusCode::BAD_REQUEST, "routing_error", &self.to_string(), None)
    }
}

/// Raised when a transformer step fails; the chain short-circuits.
#[derive(Debug, thiserror::Error)]
#[error("transform step `{step}` failed: {source}")]
pub struct TransformError {
    pub step: String,
    #[source]
    pub source: anyhow::Error,
}

impl IntoResponse for TransformError {
    fn into_response(self) -> Response {
        error_response(
            StatusCode::BAD_GATEWAY,
            "transform_error",
            &self.to_string(),
            Some(&self.step),
        )
    }
}

/// Raised when the upstream provider answers with a non-2xx status.
#[derive(Debug, thiserror::Error)]
#[error("provider returned status {status}: {body}")]
pub struct ProviderError {
    pub status: StatusCode,
    pub body: String,
}

impl IntoResponse for ProviderError {
    fn into_response(self) -> Response {
        let status = if self.status.is_client_error() || self.status.is_server_error() {
            self.status
        } else {
            StatusCode::BAD_GATEWAY
        };
        error_response(status, "provider_error", &self.body, None)
    }
}

/// Raised mid-stream when the provider connection fails after headers were sent.
#[derive(Debug, thiserror::Error)]
#[error("stream failed: {0}")]
pub struct StreamError(pub String);

/// Raised by the Token Counter — treated by the router as "count
/// unknown, use default route", never surfaced to the client directly.
#[derive(Debug, thiserror::Error)]
pub enum TokenCountError {
    #[error("failed to initialize bpe vocabulary: {0}")]
    VocabInit(String),
}

/// Raised by the supervisor on torn or stale PID/refcount files.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("daemon already running with pid {0}")]
    AlreadyRunning(u32),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pid file contents are not a valid pid: {0:?}")]
    TornPidFile(String),
    #[error("refcount file contents are not a valid non-negative integer: {0:?}")]
    TornRefcountFile(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<&'a str>,
}

/// Builds a client-visible error response carrying an opaque request ID that
/// correlates with a log line.
pub fn error_response(status: StatusCode, kind: &str, message: &str, step: Option<&str>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::warn!(request_id = %request_id, kind, message, "request failed");
    let body = ErrorBody {
        error: kind,
        message,
        request_id,
        step,
    };
    (status, Json(body)).into_response()
}
