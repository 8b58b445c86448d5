//! Request classification. Deliberately a single pure function: no tier
//! cascade, no cross-provider retry — retry/backoff across providers is
//! an explicit non-goal here.

use crate::config::Config;
use crate::token_counter;
use crate::types::AnthropicRequest;

const LONG_CONTEXT_THRESHOLD: u64 = 60_000;
const BACKGROUND_MODEL_PREFIX: &str = "claude-3-5-haiku";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub route_class: &'static str,
    pub target: String,
}

/// Classifies `req` and returns the resolved `"provider,model"` target.
/// First matching rule wins; on any internal failure this falls back to
/// `routes.default` rather than failing the request.
pub fn classify(req: &AnthropicRequest, config: &Config) -> RouteDecision {
    if let Some((provider, model)) = req.explicit_target() {
        return RouteDecision {
            route_class: "explicit",
            target: format!("{provider},{model}"),
        };
    }

    let token_count = token_counter::count_tokens(req).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "token count failed, falling back to default route");
        0
    });

    if token_count > LONG_CONTEXT_THRESHOLD {
        if let Some(route) = config.routes().long_context.as_deref() {
            return RouteDecision {
                route_class: "longContext",
                target: route.to_string(),
            };
        }
    }

    if req.model.starts_with(BACKGROUND_MODEL_PREFIX) {
        if let Some(route) = config.routes().background.as_deref() {
            return RouteDecision {
                route_class: "background",
                target: route.to_string(),
            };
        }
    }

    if req.has_thinking() {
        if let Some(route) = config.routes().think.as_deref() {
            return RouteDecision {
                route_class: "think",
                target: route.to_string(),
            };
        }
    }

    RouteDecision {
        route_class: "default",
        target: config.routes().default.clone(),
    }
}

/// Mutates `req.model` in place to the resolved target.
pub fn route(req: &mut AnthropicRequest, config: &Config) -> RouteDecision {
    let decision = classify(req, config);
    req.model = decision.target.clone();
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigFile};
    use crate::types::{Message, TextOrBlocks, Thinking};

    fn config_with_routes(json_routes: &str) -> Config {
        let json = format!(
            r#"{{
                "providers": [
                    {{"name":"p1","baseURL":"https://p1","apiKey":"k1","models":["m1"]}},
                    {{"name":"p2","baseURL":"https://p2","apiKey":"k2","models":["m2"]}},
                    {{"name":"p3","baseURL":"https://p3","apiKey":"k3","models":["m3"]}},
                    {{"name":"p4","baseURL":"https://p4","apiKey":"k4","models":["m4"]}}
                ],
                "routes": {json_routes}
            }}"#
        );
        let file: ConfigFile = serde_json::from_str(&json).unwrap();
        Config::from_parsed(file).unwrap()
    }

    fn base_req(model: &str) -> AnthropicRequest {
        AnthropicRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: TextOrBlocks::Text("hi".to_string()),
            }],
            system: None,
            tools: vec![],
            thinking: None,
            stream: false,
            max_tokens: None,
            extra: serde_json::json!({}),
        }
    }

    #[test]
    fn explicit_target_bypasses_all_rules() {
        let config = config_with_routes(r#"{"default":"p1,m1","longContext":"p2,m2"}"#);
        let req = base_req("p2,m2");
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "explicit");
        assert_eq!(decision.target, "p2,m2");
    }

    #[test]
    fn long_context_reroutes_above_threshold() {
        let config = config_with_routes(r#"{"default":"p1,m1","longContext":"p2,m2"}"#);
        let mut req = base_req("plain-model");
        req.messages[0].content = TextOrBlocks::Text("word ".repeat(70_000));
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "longContext");
        assert_eq!(decision.target, "p2,m2");
    }

    #[test]
    fn exactly_at_threshold_does_not_trigger_long_context() {
        // boundary case : tokenCount must be STRICTLY greater than
        // 60000 to reroute.
        let config = config_with_routes(r#"{"default":"p1,m1","longContext":"p2,m2"}"#);
        let req = base_req("plain-model");
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "default");
    }

    #[test]
    fn background_prefix_reroutes() {
        let config = config_with_routes(r#"{"default":"p1,m1","background":"p3,m3"}"#);
        let req = base_req("claude-3-5-haiku-foo");
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "background");
        assert_eq!(decision.target, "p3,m3");
    }

    #[test]
    fn thinking_reroutes() {
        let config = config_with_routes(r#"{"default":"p1,m1","think":"p4,m4"}"#);
        let mut req = base_req("plain-model");
        req.thinking = Some(Thinking {
            kind: "enabled".to_string(),
            budget_tokens: None,
        });
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "think");
        assert_eq!(decision.target, "p4,m4");
    }

    #[test]
    fn empty_thinking_object_does_not_trigger() {
        let config = config_with_routes(r#"{"default":"p1,m1","think":"p4,m4"}"#);
        let mut req = base_req("plain-model");
        req.thinking = Some(Thinking {
            kind: String::new(),
            budget_tokens: None,
        });
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "default");
    }

    #[test]
    fn falls_back_to_default_when_no_rule_matches() {
        let config = config_with_routes(r#"{"default":"p1,m1"}"#);
        let req = base_req("plain-model");
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "default");
        assert_eq!(decision.target, "p1,m1");
    }

    #[test]
    fn model_with_two_commas_splits_on_first() {
        let config = config_with_routes(r#"{"default":"p1,m1"}"#);
        let req = base_req("p2,m2,extra");
        let decision = classify(&req, &config);
        assert_eq!(decision.route_class, "explicit");
        assert_eq!(decision.target, "p2,m2,extra");
    }

    #[test]
    fn route_mutates_model_field_in_place() {
        let config = config_with_routes(r#"{"default":"p1,m1"}"#);
        let mut req = base_req("plain-model");
        route(&mut req, &config);
        assert_eq!(req.model, "p1,m1");
    }
}
