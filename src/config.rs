//! Process-wide configuration.
//!
//! Loaded once at startup from a JSON file, validated eagerly, then held
//! immutable for the daemon's lifetime. Mirrors a foreground-only proxy's
//! `TransformerEntry`/`ProviderTransformer` deserialization pattern, which
//! handles the Node.js-flavoured `"use": ["name", ["name", {opts}]]` shape.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::Arc;

use crate::error::ConfigError;

/// A single entry in a transformer `use` array: either a bare name or a
/// `[name, options]` tuple.
#[derive(Debug, Clone, Serialize)]
pub enum TransformerEntry {
    Name(String),
    WithOptions {
        name: String,
        options: serde_json::Value,
    },
}

impl TransformerEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::WithOptions { name, .. } => name,
        }
    }

    pub fn options(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Name(_) => None,
            Self::WithOptions { options, .. } => Some(options),
        }
    }
}

impl<'de> Deserialize<'de> for TransformerEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = TransformerEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"a transformer name string or ["name", {options}] tuple"#)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(TransformerEntry::Name(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(TransformerEntry::Name(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &"a [name, options] tuple"))?;
                let options: serde_json::Value = seq
                    .next_element()?
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                Ok(TransformerEntry::WithOptions { name, options })
            }
        }

        deserializer.deserialize_any(EntryVisitor)
    }
}

/// `{use: [...]}` applied to every model of a provider, plus optional
/// `perModel` overrides layered on top for specific models.
#[derive(Debug, Clone, Default)]
pub struct ProviderTransformer {
    pub use_list: Vec<TransformerEntry>,
    pub per_model: HashMap<String, Vec<TransformerEntry>>,
}

impl ProviderTransformer {
    pub fn model_transformers(&self, model: &str) -> Option<&[TransformerEntry]> {
        self.per_model.get(model).map(|v| v.as_slice())
    }
}

impl<'de> Deserialize<'de> for ProviderTransformer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            use_list: Vec<TransformerEntry>,
            #[serde(default, rename = "perModel")]
            per_model: HashMap<String, PerModelEntry>,
        }

        #[derive(Deserialize)]
        struct PerModelEntry {
            #[serde(default, rename = "use")]
            use_list: Vec<TransformerEntry>,
        }

        // serde can't rename a field to "use" (a reserved identifier clash with
        // the `use_list` we also want addressable in Rust), so hand-roll it via
        // a generic map the way config.rs does.
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::Map::deserialize(deserializer)?;
        let mut raw_value = serde_json::Map::new();
        if let Some(use_value) = map.get("use") {
            raw_value.insert("use_list".to_string(), use_value.clone());
        }
        if let Some(per_model) = map.get("perModel") {
            raw_value.insert("perModel".to_string(), per_model.clone());
        }
        let raw: Raw =
            serde_json::from_value(serde_json::Value::Object(raw_value)).map_err(de::Error::custom)?;

        Ok(ProviderTransformer {
            use_list: raw.use_list,
            per_model: raw
                .per_model
                .into_iter()
                .map(|(k, v)| (k, v.use_list))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub name: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub transformer: Option<ProviderTransformer>,
}

impl Provider {
    pub fn provider_transformers(&self) -> &[TransformerEntry] {
        self.transformer
            .as_ref()
            .map(|t| t.use_list.as_slice())
            .unwrap_or(&[])
    }

    pub fn model_transformers(&self, model: &str) -> Option<&[TransformerEntry]> {
        self.transformer.as_ref().and_then(|t| t.model_transformers(model))
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Route classes: mapping from route-class to a resolved `(provider, model)` pair.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Routes {
    pub default: String,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub think: Option<String>,
    #[serde(default, rename = "longContext")]
    pub long_context: Option<String>,
    #[serde(default, rename = "webSearch")]
    pub web_search: Option<String>,
}

impl Routes {
    /// Iterate `(class_name, "provider,model")` pairs for every configured route.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![("default", self.default.as_str())];
        if let Some(r) = &self.background {
            out.push(("background", r.as_str()));
        }
        if let Some(r) = &self.think {
            out.push(("think", r.as_str()));
        }
        if let Some(r) = &self.long_context {
            out.push(("longContext", r.as_str()));
        }
        if let Some(r) = &self.web_search {
            out.push(("webSearch", r.as_str()));
        }
        out
    }

    pub fn get(&self, class: &str) -> Option<&str> {
        match class {
            "default" => Some(self.default.as_str()),
            "background" => self.background.as_deref(),
            "think" => self.think.as_deref(),
            "longContext" => self.long_context.as_deref(),
            "webSearch" => self.web_search.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomTransformerEntry {
    pub path: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listen {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Listen {
    fn default() -> Self {
        Listen {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

fn default_timeout_ms() -> u64 {
    600_000 // ten minutes, "Timeouts"
}

/// The on-disk configuration shape. Parsing the file itself is a
/// collaborator's concern, but a concrete shape must exist to load something.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: Listen,
    #[serde(rename = "sharedSecret", default)]
    pub shared_secret: Option<String>,
    #[serde(rename = "outboundProxy", default)]
    pub outbound_proxy: Option<String>,
    #[serde(default)]
    pub log: bool,
    pub providers: Vec<Provider>,
    pub routes: Routes,
    #[serde(rename = "customTransformers", default)]
    pub custom_transformers: Vec<CustomTransformerEntry>,
    #[serde(rename = "requestTimeoutMs", default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
}

struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

/// Runtime configuration handle shared across all handlers via Axum state.
/// Cloning is cheap (Arc); the inner value never mutates after load.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn providers(&self) -> &[Provider] {
        &self.inner.file.providers
    }

    pub fn routes(&self) -> &Routes {
        &self.inner.file.routes
    }

    pub fn listen(&self) -> &Listen {
        &self.inner.file.listen
    }

    pub fn shared_secret(&self) -> Option<&str> {
        self.inner.file.shared_secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn outbound_proxy(&self) -> Option<&str> {
        self.inner.file.outbound_proxy.as_deref()
    }

    pub fn log_enabled(&self) -> bool {
        self.inner.file.log
    }

    pub fn custom_transformers(&self) -> &[CustomTransformerEntry] {
        &self.inner.file.custom_transformers
    }

    pub fn request_timeout_ms(&self) -> u64 {
        self.inner.file.request_timeout_ms
    }

    /// The shared outbound HTTP client — one connection pool for the whole
    /// daemon.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub fn find_provider(&self, name: &str) -> Option<&Provider> {
        self.providers().iter().find(|p| p.name == name)
    }

    /// Parse a `"provider,model"` route string into its parts.
    pub fn split_target(route: &str) -> Option<(&str, &str)> {
        let (provider, model) = route.split_once(',')?;
        Some((provider, model))
    }

    pub fn resolve_provider(&self, route: &str) -> Option<&Provider> {
        let (provider_name, _) = Self::split_target(route)?;
        self.find_provider(provider_name)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let file: ConfigFile = serde_json::from_str(&content)?;
        Self::from_parsed(file)
    }

    pub fn from_parsed(file: ConfigFile) -> Result<Self, ConfigError> {
        validate(&file)?;

        // Security invariant : an unset shared secret forces a
        // loopback bind regardless of what the file says.
        let mut file = file;
        if file.shared_secret.as_deref().map(str::is_empty).unwrap_or(true) {
            file.listen.host = default_host();
        }

        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(file.request_timeout_ms))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true);

        if let Some(proxy_url) = &file.outbound_proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| ConfigError::Parse(
                serde_json::Error::io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)),
            ))?;
            builder = builder.proxy(proxy);
        }

        let http_client = builder
            .build()
            .expect("reqwest client builder invariants are satisfied above");

        Ok(Config {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }
}

/// Enforces invariants 3, 4, 5 eagerly at load time.
fn validate(file: &ConfigFile) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for p in &file.providers {
        if !seen.insert(p.name.as_str()) {
            return Err(ConfigError::DuplicateProvider(p.name.clone()));
        }
    }

    let check_route = |class: &str, route: &str| -> Result<(), ConfigError> {
        let (provider_name, model) = Config::split_target(route).ok_or_else(|| {
            if class == "default" {
                ConfigError::UnknownDefaultProvider {
                    route: route.to_string(),
                    provider: route.to_string(),
                }
            } else {
                ConfigError::UnknownRouteProvider {
                    class: class.to_string(),
                    route: route.to_string(),
                    provider: route.to_string(),
                }
            }
        })?;
        let provider = file
            .providers
            .iter()
            .find(|p| p.name == provider_name)
            .ok_or_else(|| {
                if class == "default" {
                    ConfigError::UnknownDefaultProvider {
                        route: route.to_string(),
                        provider: provider_name.to_string(),
                    }
                } else {
                    ConfigError::UnknownRouteProvider {
                        class: class.to_string(),
                        route: route.to_string(),
                        provider: provider_name.to_string(),
                    }
                }
            })?;
        if !provider.has_model(model) {
            return if class == "default" {
                Err(ConfigError::UnknownDefaultModel {
                    route: route.to_string(),
                    provider: provider_name.to_string(),
                    model: model.to_string(),
                })
            } else {
                Err(ConfigError::UnknownRouteModel {
                    class: class.to_string(),
                    route: route.to_string(),
                    provider: provider_name.to_string(),
                    model: model.to_string(),
                })
            };
        }
        Ok(())
    };

    for (class, route) in file.routes.entries() {
        check_route(class, route)?;
    }

    for provider in &file.providers {
        if let Some(t) = &provider.transformer {
            for model in t.per_model.keys() {
                if !provider.has_model(model) {
                    return Err(ConfigError::UnknownPerModelEntry {
                        provider: provider.name.clone(),
                        model: model.clone(),
                    });
                }
            }
        }
    }

    for entry in &file.custom_transformers {
        if crate::transformer::resolve_custom_path(&entry.path).is_none() {
            return Err(ConfigError::UnknownCustomTransformer(entry.path.clone()));
        }
    }

    Ok(())
}
