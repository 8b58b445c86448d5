//! Shared-secret auth gate, wired in as Axum middleware ahead of the router.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::config::Config;
use crate::error::AuthError;

const API_KEY_HEADER: &str = "x-api-key";

/// Byte-length-then-XOR-fold comparison rather than `==`. This is a
/// deliberate simplification, not an oversight: this gate only ever sees
/// loopback traffic protecting a single local daemon, not a public auth
/// boundary, so the `subtle`-crate constant-time-compare machinery would
/// be ceremony without a matching threat model.
fn secret_matches(candidate: &str, configured: &str) -> bool {
    if candidate.len() != configured.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in candidate.bytes().zip(configured.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn extract_presented_secret(req: &Request) -> Option<String> {
    if let Some(auth) = req.headers().get(AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    if let Some(key) = req.headers().get(API_KEY_HEADER) {
        if let Ok(s) = key.to_str() {
            return Some(s.to_string());
        }
    }
    None
}

pub async fn require_shared_secret(
    State(config): State<Config>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = config.shared_secret() else {
        // Unset (or empty-string, treated as unset) secret: everything passes.
        return Ok(next.run(req).await);
    };

    match extract_presented_secret(&req) {
        Some(presented) if secret_matches(&presented, secret) => Ok(next.run(req).await),
        _ => Err(AuthError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_secrets_compare_equal() {
        assert!(secret_matches("sekret", "sekret"));
    }

    #[test]
    fn mismatched_length_never_matches() {
        assert!(!secret_matches("short", "much-longer-secret"));
    }

    #[test]
    fn single_byte_difference_fails() {
        assert!(!secret_matches("sekreu", "sekret"));
    }
}
