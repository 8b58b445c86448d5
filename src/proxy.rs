//! The Proxy Forwarder: one POST per request, no retries, raw byte-stream
//! passthrough for SSE. Cross-provider retry/backoff is an explicit
//! non-goal, so a connection failure becomes a single error surfaced to
//! the chain rather than a fallback attempt.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Provider};
use crate::error::{ProviderError, StreamError};
use crate::sse::{EventStream, SseDecoder};
use crate::transformer::TransformerChain;

pub enum ForwardedResponse {
    Buffered(Value),
    Streaming(EventStream),
}

/// Issues the single outbound call for a request, honoring the chain's
/// header choice, the configured outbound proxy (already baked into the
/// shared client), and the caller's cancellation token.
pub struct Forwarder {
    config: Config,
}

impl Forwarder {
    pub fn new(config: Config) -> Self {
        Forwarder { config }
    }

    pub async fn forward(
        &self,
        provider: &Provider,
        chain: &TransformerChain,
        body: Value,
        stream_requested: bool,
        cancel: CancellationToken,
    ) -> Result<ForwardedResponse, ProviderError> {
        let mut headers = HeaderMap::new();
        match chain.auth_header(&provider.api_key) {
            Some((name, value)) => {
                if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                    headers.insert(name, value);
                }
            }
            None => {
                // No transformer in the chain expressed an opinion — an
                // empty chain means the provider speaks the Anthropic
                // dialect natively, so use its `x-api-key` convention.
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(b"x-api-key"),
                    HeaderValue::from_str(&provider.api_key),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let request = self
            .config
            .http_client()
            .post(&provider.base_url)
            .headers(headers)
            .json(&body);

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| ProviderError {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: format!("request to {} failed: {e}", provider.base_url),
            })?,
            _ = cancel.cancelled() => {
                return Err(ProviderError {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "request cancelled by client disconnect".to_string(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError { status, body: body_text });
        }

        if stream_requested {
            Ok(ForwardedResponse::Streaming(stream_sse_body(response, cancel)))
        } else {
            let bytes = response.bytes().await.map_err(|e| ProviderError {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: format!("failed reading response body: {e}"),
            })?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| ProviderError {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: format!("provider response was not valid JSON: {e}"),
            })?;
            Ok(ForwardedResponse::Buffered(value))
        }
    }
}

/// Turns a `reqwest::Response`'s byte stream into an `EventStream`,
/// preserving the provider's own chunk arrival timing via an incremental
/// `SseDecoder`. A mid-stream transport error becomes a single terminal
/// error event rather than a panic or a silently-truncated stream.
fn stream_sse_body(response: reqwest::Response, cancel: CancellationToken) -> EventStream {
    let byte_stream = response.bytes_stream();
    let decoder = SseDecoder::new();

    stream::unfold(
        (byte_stream, decoder, std::collections::VecDeque::new(), cancel, false),
        |(mut bytes, mut decoder, mut outbuf, cancel, mut terminated)| async move {
            loop {
                if let Some(event) = outbuf.pop_front() {
                    return Some((event, (bytes, decoder, outbuf, cancel, terminated)));
                }
                if terminated {
                    return None;
                }

                let next: Option<Result<Bytes, reqwest::Error>> = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        terminated = true;
                        None
                    }
                    chunk = bytes.next() => chunk,
                };

                match next {
                    Some(Ok(chunk)) => {
                        outbuf.extend(decoder.feed(&chunk));
                    }
                    Some(Err(e)) => {
                        terminated = true;
                        let err = StreamError(e.to_string());
                        outbuf.push_back(crate::sse::SseEvent::new(
                            "error",
                            serde_json::json!({"type": "error", "error": {"type": "api_error", "message": err.0}})
                                .to_string(),
                        ));
                    }
                    None => {
                        terminated = true;
                    }
                }
            }
        },
    )
    .boxed()
}
