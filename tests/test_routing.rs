use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelmux::config::{Config, ConfigFile};
use modelmux::server::{build_router, AppState};

fn build_app(config: Config) -> axum::Router {
    build_router(AppState::new(config))
}

fn parse_config(json: serde_json::Value) -> Config {
    let file: ConfigFile = serde_json::from_value(json).unwrap();
    Config::from_parsed(file).unwrap()
}

async fn post_messages(app: axum::Router, body: serde_json::Value) -> axum::response::Response {
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn default_route_forwards_to_default_provider() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "providers": [{
            "name": "mock",
            "baseURL": format!("{}/messages", mock_server.uri()),
            "apiKey": "k",
            "models": ["m1"]
        }],
        "routes": {"default": "mock,m1"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "plain-model", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn explicit_target_overrides_default_route() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/explicit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "from explicit"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "providers": [
            {"name": "default_prov", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["dm"]},
            {"name": "picked", "baseURL": format!("{}/explicit", mock_server.uri()), "apiKey": "k2", "models": ["pm"]}
        ],
        "routes": {"default": "default_prov,dm"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "picked,pm", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn long_context_request_reroutes_to_long_context_provider() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/long"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "providers": [
            {"name": "default_prov", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["dm"]},
            {"name": "big", "baseURL": format!("{}/long", mock_server.uri()), "apiKey": "k2", "models": ["bm"]}
        ],
        "routes": {"default": "default_prov,dm", "longContext": "big,bm"}
    }));

    let app = build_app(config);
    let huge_text = "word ".repeat(70_000);
    let resp = post_messages(
        app,
        json!({"model": "plain-model", "messages": [{"role": "user", "content": huge_text}], "max_tokens": 64}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn background_model_prefix_reroutes() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "providers": [
            {"name": "default_prov", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["dm"]},
            {"name": "bg_prov", "baseURL": format!("{}/bg", mock_server.uri()), "apiKey": "k2", "models": ["haiku"]}
        ],
        "routes": {"default": "default_prov,dm", "background": "bg_prov,haiku"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "claude-3-5-haiku-20241022", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn thinking_flag_reroutes_to_think_provider() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/think"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "providers": [
            {"name": "default_prov", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["dm"]},
            {"name": "thinker", "baseURL": format!("{}/think", mock_server.uri()), "apiKey": "k2", "models": ["tm"]}
        ],
        "routes": {"default": "default_prov,dm", "think": "thinker,tm"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({
            "model": "plain-model",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64,
            "thinking": {"type": "enabled", "budget_tokens": 1024}
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_provider_in_explicit_target_returns_error() {
    let config = parse_config(json!({
        "providers": [{"name": "real", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["m"]}],
        "routes": {"default": "real,m"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "ghost,m", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}),
    )
    .await;
    assert_ne!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn provider_failure_surfaces_as_bad_gateway() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fails"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "providers": [{"name": "flaky", "baseURL": format!("{}/fails", mock_server.uri()), "apiKey": "k", "models": ["m"]}],
        "routes": {"default": "flaky,m"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "plain-model", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn health_endpoint_bypasses_auth_gate() {
    let config = parse_config(json!({
        "sharedSecret": "topsecret",
        "providers": [{"name": "p", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["m"]}],
        "routes": {"default": "p,m"}
    }));

    let app = build_app(config);
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn messages_endpoint_rejects_missing_shared_secret() {
    let config = parse_config(json!({
        "sharedSecret": "topsecret",
        "listen": {"host": "127.0.0.1", "port": 0},
        "providers": [{"name": "p", "baseURL": "http://127.0.0.1:1/unused", "apiKey": "k", "models": ["m"]}],
        "routes": {"default": "p,m"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "plain-model", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn custom_transformer_entry_clamps_max_tokens_via_allowlisted_wrap() {
    let mock_server = MockServer::start().await;
    let captured = std::sync::Arc::new(std::sync::Mutex::new(None));
    let captured_clone = captured.clone();

    Mock::given(method("POST"))
        .and(path("/custom"))
        .respond_with(move |req: &wiremock::Request| {
            let body: serde_json::Value = req.body_json().unwrap();
            *captured_clone.lock().unwrap() = Some(body);
            ResponseTemplate::new(200).set_body_json(json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "ok"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }))
        })
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "customTransformers": [{"path": "./plugins/maxtoken-strict.js", "options": {"max_tokens": 256}}],
        "providers": [{
            "name": "custom_prov",
            "baseURL": format!("{}/custom", mock_server.uri()),
            "apiKey": "k",
            "models": ["m1"],
            "transformer": {"use": ["maxtoken-strict"]}
        }],
        "routes": {"default": "custom_prov,m1"}
    }));

    let app = build_app(config);
    let resp = post_messages(
        app,
        json!({"model": "plain-model", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 100_000}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let forwarded = captured.lock().unwrap().take().unwrap();
    assert_eq!(forwarded["max_tokens"], 256);
}

#[tokio::test]
async fn messages_endpoint_accepts_matching_shared_secret() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/secure"))
        .and(header("x-api-key", "provider-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = parse_config(json!({
        "sharedSecret": "topsecret",
        "listen": {"host": "127.0.0.1", "port": 0},
        "providers": [{"name": "p", "baseURL": format!("{}/secure", mock_server.uri()), "apiKey": "provider-key", "models": ["m"]}],
        "routes": {"default": "p,m"}
    }));

    let app = build_app(config);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .header("x-api-key", "topsecret")
                .body(Body::from(
                    serde_json::to_vec(&json!({"model": "plain-model", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 64}))
                        .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
