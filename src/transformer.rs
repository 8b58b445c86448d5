//! The transformer trait, chain, and registry — the heart of the core.
//! Each transformer exposes up to four passes (`request_in`/`request_out`/
//! `response_in`/`response_out`, any of which may be absent), plus a
//! streaming counterpart for each response pass.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::{Config, CustomTransformerEntry, Provider, TransformerEntry};
use crate::error::TransformError;
use crate::sse::EventStream;

/// Compiled allow-list for `customTransformers` entries (spec §9's "two-tier
/// registry" design note): arbitrary on-disk plug-in loading is out of
/// scope, so a custom entry's `path` must name one of these compiled
/// extensions, each of which just renames+parameterizes a built-in. Keyed
/// by the path's file stem (e.g. `"./transformers/maxtoken-strict.js"` ->
/// `"maxtoken-strict"`).
pub const CUSTOM_TRANSFORMER_ALLOWLIST: &[(&str, &str)] = &[
    ("maxtoken-strict", "maxtoken"),
    ("openai-compatible", "openai"),
    ("tooluse-silent", "tooluse"),
];

/// Resolves a `customTransformers[].path` entry to the compiled built-in it
/// wraps, or `None` if `path`'s stem is not on the allow-list.
pub fn resolve_custom_path(path: &str) -> Option<(&'static str, &'static str)> {
    let stem = std::path::Path::new(path).file_stem()?.to_str()?;
    CUSTOM_TRANSFORMER_ALLOWLIST
        .iter()
        .find(|(name, _)| *name == stem)
        .copied()
}

/// One step in a chain. Every method defaults to identity so a transformer
/// only needs to override the passes it actually touches; absent operations
/// skip without allocating.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// Structural request adjustments: add/remove/rename fields, inject
    /// messages, force `tool_choice`, clamp ceilings. Runs forward.
    fn request_in(&self, req: Value) -> Result<Value, anyhow::Error> {
        Ok(req)
    }

    /// Dialect serialization: the final shape handed to the forwarder.
    /// Runs forward, after every `request_in`.
    fn request_out(&self, req: Value) -> Result<Value, anyhow::Error> {
        Ok(req)
    }

    /// Runs in reverse chain order; outermost transformer sees the raw
    /// provider response first.
    fn response_in(&self, resp: Value) -> Result<Value, anyhow::Error> {
        Ok(resp)
    }

    /// Final polishing, forward order, closest-to-client transformer last.
    fn response_out(&self, resp: Value) -> Result<Value, anyhow::Error> {
        Ok(resp)
    }

    /// Streaming counterpart of `response_in`. Default is identity: pass
    /// the upstream event stream through untouched.
    fn stream_response_in(&self, events: EventStream) -> EventStream {
        events
    }

    /// Streaming counterpart of `response_out`.
    fn stream_response_out(&self, events: EventStream) -> EventStream {
        events
    }

    fn is_passthrough(&self) -> bool {
        false
    }

    /// Names the header (and its value) this transformer's dialect expects
    /// the provider API key in, if it has an opinion. Field-only
    /// transformers like `maxtoken` return `None`.
    fn auth_header(&self, _api_key: &str) -> Option<(&'static str, String)> {
        None
    }
}

/// Ordered composition of transformer instances for one `(provider, model)`
/// target.
pub struct TransformerChain {
    steps: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new(steps: Vec<Arc<dyn Transformer>>) -> Self {
        TransformerChain { steps }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// First opinion wins, in chain order — the dialect-crossing
    /// transformer is always listed first for a given provider in
    /// practice, so its header choice takes precedence over any
    /// field-tweaking sibling.
    pub fn auth_header(&self, api_key: &str) -> Option<(&'static str, String)> {
        self.steps.iter().find_map(|step| step.auth_header(api_key))
    }

    pub fn apply_request_in(&self, mut req: Value) -> Result<Value, TransformError> {
        for step in &self.steps {
            req = step.request_in(req).map_err(|source| TransformError {
                step: format!("{}.requestIn", step.name()),
                source,
            })?;
        }
        Ok(req)
    }

    pub fn apply_request_out(&self, mut req: Value) -> Result<Value, TransformError> {
        for step in &self.steps {
            req = step.request_out(req).map_err(|source| TransformError {
                step: format!("{}.requestOut", step.name()),
                source,
            })?;
        }
        Ok(req)
    }

    /// Response passes run in reverse chain order.
    pub fn apply_response_in(&self, mut resp: Value) -> Result<Value, TransformError> {
        for step in self.steps.iter().rev() {
            resp = step.response_in(resp).map_err(|source| TransformError {
                step: format!("{}.responseIn", step.name()),
                source,
            })?;
        }
        Ok(resp)
    }

    pub fn apply_response_out(&self, mut resp: Value) -> Result<Value, TransformError> {
        for step in &self.steps {
            resp = step.response_out(resp).map_err(|source| TransformError {
                step: format!("{}.responseOut", step.name()),
                source,
            })?;
        }
        Ok(resp)
    }

    /// Pipelines the streaming passes the same way: `response_in` in
    /// reverse, then `response_out` forward, each step composing directly
    /// on the event-stream value.
    pub fn apply_stream(&self, mut events: EventStream) -> EventStream {
        for step in self.steps.iter().rev() {
            events = step.stream_response_in(events);
        }
        for step in &self.steps {
            events = step.stream_response_out(events);
        }
        events
    }
}

type TransformerFactory = Box<dyn Fn(Option<&Value>) -> Arc<dyn Transformer> + Send + Sync>;

/// Process-wide mapping from transformer name to factory.
/// Populated once at startup with the built-ins plus any allow-listed
/// custom entries; read-only (lock-free) thereafter.
pub struct TransformerRegistry {
    factories: HashMap<String, TransformerFactory>,
    chain_cache: RwLock<HashMap<String, Arc<TransformerChain>>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        let mut registry = TransformerRegistry {
            factories: HashMap::new(),
            chain_cache: RwLock::new(HashMap::new()),
        };
        registry.register_builtins();
        registry
    }

    /// Registers a factory under `name`. Duplicate registration is rejected —
    /// the registry is built once at startup from a fixed list of names, so
    /// a duplicate here indicates a programming error, not user input, and
    /// panics accordingly.
    fn register(&mut self, name: &str, factory: TransformerFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            panic!("duplicate transformer registration for `{name}`");
        }
    }

    fn register_builtins(&mut self) {
        use crate::transform::{
            deepseek::DeepSeekTransformer, gemini::GeminiTransformer, groq::GroqTransformer,
            identity::IdentityTransformer, maxtoken::MaxTokenTransformer,
            openai::OpenAiTransformer, openrouter::OpenRouterTransformer,
            tooluse::ToolUseTransformer,
        };

        self.register("anthropic", Box::new(|_| Arc::new(IdentityTransformer)));
        self.register("openai", Box::new(|_| Arc::new(OpenAiTransformer::default())));
        self.register("deepseek", Box::new(|_| Arc::new(DeepSeekTransformer::default())));
        self.register(
            "openrouter",
            Box::new(|_| Arc::new(OpenRouterTransformer::default())),
        );
        self.register("gemini", Box::new(|_| Arc::new(GeminiTransformer::default())));
        self.register("groq", Box::new(|_| Arc::new(GroqTransformer::default())));
        self.register(
            "maxtoken",
            Box::new(|opts| {
                let max_tokens = opts
                    .and_then(|v| v.get("max_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(4096);
                Arc::new(MaxTokenTransformer::new(max_tokens))
            }),
        );
        self.register("tooluse", Box::new(|_| Arc::new(ToolUseTransformer::default())));
    }

    /// Registers a compiled custom transformer under a new name, wrapping
    /// one of the built-in constructors — the "two-tier registry" design
    /// from: arbitrary on-disk plug-in loading stays out of scope,
    /// custom entries just rename+parameterize a built-in.
    pub fn register_custom(&mut self, name: &str, wraps: &str, options: Value) -> Result<(), String> {
        if self.factories.contains_key(name) {
            return Err(format!("duplicate transformer registration for `{name}`"));
        }
        let base = self
            .factories
            .get(wraps)
            .ok_or_else(|| format!("custom transformer `{name}` wraps unknown built-in `{wraps}`"))?;
        let instance = base(Some(&options));
        self.factories.insert(name.to_string(), Box::new(move |_| instance.clone()));
        Ok(())
    }

    /// Registers every `customTransformers` entry from Configuration,
    /// resolving each `path` through [`CUSTOM_TRANSFORMER_ALLOWLIST`].
    /// Config loading already validated every path eagerly (see
    /// `config::validate`), so a lookup failure here indicates the
    /// registry and the config validator have drifted out of sync.
    pub fn install_custom(&mut self, entries: &[CustomTransformerEntry]) -> Result<(), String> {
        for entry in entries {
            let (name, wraps) = resolve_custom_path(&entry.path)
                .ok_or_else(|| format!("custom transformer path `{}` is not on the compiled allow-list", entry.path))?;
            self.register_custom(name, wraps, entry.options.clone())?;
        }
        Ok(())
    }

    fn instantiate(&self, entry: &TransformerEntry) -> Option<Arc<dyn Transformer>> {
        let factory = self.factories.get(entry.name())?;
        Some(factory(entry.options()))
    }

    /// Builds (or returns the cached) chain for `(providerName, modelName)`:
    /// the provider's own `transformer.use` list, then that provider's
    /// `perModel[model].use` list appended.
    pub fn chain_for(&self, config: &Config, target: &str) -> Option<Arc<TransformerChain>> {
        if let Some(chain) = self.chain_cache.read().get(target) {
            return Some(chain.clone());
        }

        let (provider_name, model) = Config::split_target(target)?;
        let provider: &Provider = config.find_provider(provider_name)?;

        let mut entries: Vec<&TransformerEntry> = provider.provider_transformers().iter().collect();
        if let Some(per_model) = provider.model_transformers(model) {
            entries.extend(per_model.iter());
        }

        let steps: Vec<Arc<dyn Transformer>> = entries
            .iter()
            .filter_map(|entry| self.instantiate(entry))
            .collect();

        let chain = Arc::new(TransformerChain::new(steps));
        self.chain_cache.write().insert(target.to_string(), chain.clone());
        Some(chain)
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;

    fn config_with_chain() -> Config {
        let json = r#"{
            "providers": [{
                "name": "p1",
                "baseURL": "https://p1.example",
                "apiKey": "k1",
                "models": ["m1"],
                "transformer": {
                    "use": ["openai"],
                    "perModel": {"m1": {"use": [["maxtoken", {"max_tokens": 2048}]]}}
                }
            }],
            "routes": {"default": "p1,m1"}
        }"#;
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        Config::from_parsed(file).unwrap()
    }

    #[test]
    fn builds_chain_combining_provider_and_per_model_entries() {
        let config = config_with_chain();
        let registry = TransformerRegistry::new();
        let chain = registry.chain_for(&config, "p1,m1").unwrap();
        assert_eq!(chain.step_names(), vec!["openai", "maxtoken(2048)"]);
    }

    #[test]
    fn chain_is_cached_across_calls() {
        let config = config_with_chain();
        let registry = TransformerRegistry::new();
        let a = registry.chain_for(&config, "p1,m1").unwrap();
        let b = registry.chain_for(&config, "p1,m1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_target_returns_none() {
        let config = config_with_chain();
        let registry = TransformerRegistry::new();
        assert!(registry.chain_for(&config, "ghost,m1").is_none());
    }

    #[test]
    fn resolves_allow_listed_custom_path() {
        let (name, wraps) = resolve_custom_path("./transformers/maxtoken-strict.js").unwrap();
        assert_eq!(name, "maxtoken-strict");
        assert_eq!(wraps, "maxtoken");
    }

    #[test]
    fn rejects_custom_path_not_on_allowlist() {
        assert!(resolve_custom_path("./transformers/does-not-exist.js").is_none());
    }

    #[test]
    fn install_custom_registers_a_usable_transformer() {
        use crate::config::CustomTransformerEntry;

        let mut registry = TransformerRegistry::new();
        let entries = vec![CustomTransformerEntry {
            path: "./transformers/maxtoken-strict.js".to_string(),
            options: serde_json::json!({"max_tokens": 512}),
        }];
        registry.install_custom(&entries).unwrap();

        let factory = registry.factories.get("maxtoken-strict").unwrap();
        let instance = factory(None);
        let out = instance.request_in(serde_json::json!({"max_tokens": 100_000})).unwrap();
        assert_eq!(out["max_tokens"], 512);
    }
}
