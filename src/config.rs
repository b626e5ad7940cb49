//! Configuration for the mock server.
//!
//! Endpoints are declared as an HTTP method, a URL pattern and an ordered
//! list of actions. Every action's parameters are decoded into a typed
//! struct when the file is loaded, so a wrong shape never reaches a request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{SetupError, SetupReason};
use crate::route::RoutePattern;
use crate::template::TemplateEngine;

/// Main configuration for the mock server.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Listener and cache settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Endpoint definitions, routed in declaration order
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every endpoint, then check that the routes fit one router.
    pub fn validate(&self) -> Result<(), SetupError> {
        let templates = TemplateEngine::new();
        let mut seen: Vec<(String, &str, RoutePattern)> = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            endpoint.validate(&templates)?;
            let method = endpoint.method.to_uppercase();
            let route = endpoint.route()?;

            for (other_method, other_url, other) in &seen {
                let reason = if *other == route {
                    if *other_method != method {
                        continue;
                    }
                    SetupReason::DuplicateEndpoint
                } else if route.conflicts_with(other) {
                    SetupReason::RouteConflict(other_url.to_string())
                } else {
                    continue;
                };
                return Err(SetupError::endpoint(&endpoint.method, &endpoint.url, reason));
            }
            seen.push((method, endpoint.url.as_str(), route));
        }
        Ok(())
    }
}

/// Listener and cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Address to bind
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding the backing files of cached uploads
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}

/// Methods an endpoint may be declared with.
pub const SUPPORTED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// A single endpoint definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDefinition {
    /// HTTP method
    pub method: String,

    /// URL pattern, e.g. `/users/:id` or `/files/*path`
    pub url: String,

    /// Actions, executed in order for every request
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl EndpointDefinition {
    /// Check the endpoint against the pipeline rules.
    pub fn validate(&self, templates: &TemplateEngine) -> Result<(), SetupError> {
        let method = self.method.to_uppercase();
        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            return Err(self.error(SetupReason::UnsupportedMethod(self.method.clone())));
        }
        self.route()?;

        let mut multipart_parsed = false;
        for (index, action) in self.actions.iter().enumerate() {
            let fail = |reason| SetupError::action(&self.method, &self.url, action.name(), reason);

            if action.requires_body_method() && !matches!(method.as_str(), "POST" | "PUT") {
                return Err(fail(SetupReason::MethodNotAllowed));
            }

            match action {
                ActionSpec::ParseMultiPartForm(_) => multipart_parsed = true,
                ActionSpec::CacheFiles(_) if !multipart_parsed => {
                    return Err(fail(SetupReason::MultipartRequired));
                }
                ActionSpec::Request(params) if params.url.trim().is_empty() => {
                    return Err(fail(SetupReason::EmptyUrl));
                }
                ActionSpec::Response(params) => {
                    let sources = params.body_sources();
                    if sources != 1 {
                        return Err(fail(SetupReason::BodySource(sources)));
                    }
                    if index + 1 != self.actions.len() {
                        return Err(fail(SetupReason::ResponseNotLast));
                    }
                    if let StatusSpec::Code(code) = params.status {
                        if !(100..=599).contains(&code) {
                            return Err(fail(SetupReason::InvalidStatus(code)));
                        }
                    }
                }
                _ => {}
            }

            for template in action.templates() {
                templates.check(template).map_err(|source| {
                    fail(SetupReason::Template {
                        template: template.to_string(),
                        source,
                    })
                })?;
            }
        }
        Ok(())
    }

    /// The parsed URL pattern.
    pub fn route(&self) -> Result<RoutePattern, SetupError> {
        RoutePattern::parse(&self.url).map_err(|reason| self.error(SetupReason::InvalidUrl(reason)))
    }

    fn error(&self, reason: SetupReason) -> SetupError {
        SetupError::endpoint(&self.method, &self.url, reason)
    }
}

/// A typed action descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawAction")]
pub enum ActionSpec {
    ParseForm(ParseBodyParams),
    ParseJson(ParseBodyParams),
    ParseYaml(ParseBodyParams),
    ParseMultiPartForm(MultipartParams),
    Cache(CacheParams),
    CacheFiles(CacheParams),
    Request(RequestParams),
    Response(ResponseParams),
}

impl ActionSpec {
    /// The configuration type tag of this action.
    pub fn name(&self) -> &'static str {
        match self {
            ActionSpec::ParseForm(_) => "parse-form",
            ActionSpec::ParseJson(_) => "parse-json",
            ActionSpec::ParseYaml(_) => "parse-yaml",
            ActionSpec::ParseMultiPartForm(_) => "parse-multi-part-form",
            ActionSpec::Cache(_) => "cache",
            ActionSpec::CacheFiles(_) => "cache-files",
            ActionSpec::Request(_) => "request",
            ActionSpec::Response(_) => "response",
        }
    }

    /// Parsing and caching actions need a request body.
    pub fn requires_body_method(&self) -> bool {
        !matches!(self, ActionSpec::Request(_) | ActionSpec::Response(_))
    }

    /// Every templated string of this action.
    pub fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        match self {
            ActionSpec::Cache(p) | ActionSpec::CacheFiles(p) => {
                for (from, to) in &p.mapping {
                    out.push(from);
                    out.push(to);
                }
            }
            ActionSpec::Request(p) => {
                out.push(&p.method);
                out.push(&p.url);
                out.push(&p.body);
                out.extend(p.headers.iter().flat_map(|h| [h.name.as_str(), h.value.as_str()]));
            }
            ActionSpec::Response(p) => {
                out.extend(p.body.as_deref());
                out.extend(p.local_file.as_deref());
                out.extend(p.cached_file.as_deref());
                if let StatusSpec::Template(status) = &p.status {
                    out.push(status);
                }
                out.extend(p.headers.iter().flat_map(|h| [h.name.as_str(), h.value.as_str()]));
            }
            _ => {}
        }
        out
    }
}

/// Untyped `{type, params}` form of an action as written in the file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: serde_json::Value,
}

impl TryFrom<RawAction> for ActionSpec {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        fn params<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: serde_json::Value,
        ) -> Result<T, String> {
            let value = if value.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                value
            };
            serde_json::from_value(value).map_err(|e| format!("action '{kind}': {e}"))
        }

        let kind = raw.kind.as_str();
        Ok(match kind {
            "parse-form" => ActionSpec::ParseForm(params(kind, raw.params)?),
            "parse-json" => ActionSpec::ParseJson(params(kind, raw.params)?),
            "parse-yaml" => ActionSpec::ParseYaml(params(kind, raw.params)?),
            "parse-multi-part-form" => ActionSpec::ParseMultiPartForm(params(kind, raw.params)?),
            "cache" => ActionSpec::Cache(params(kind, raw.params)?),
            "cache-files" => ActionSpec::CacheFiles(params(kind, raw.params)?),
            "request" => ActionSpec::Request(params(kind, raw.params)?),
            "response" => ActionSpec::Response(params(kind, raw.params)?),
            other => return Err(format!("unsupported action type '{other}'")),
        })
    }
}

/// Parameters of parse-form, parse-json and parse-yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ParseBodyParams {
    /// Context key receiving the parsed structure
    #[serde(default = "default_context_target")]
    pub context_target: String,
}

fn default_context_target() -> String {
    "form".to_string()
}

/// Parameters of parse-multi-part-form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MultipartParams {
    /// Memory threshold in megabytes; larger uploads are spilled to disk
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    /// Context key receiving the form
    #[serde(default = "default_multipart_key")]
    pub context_key: String,
}

impl MultipartParams {
    pub fn max_bytes(&self) -> usize {
        usize::try_from(self.max_memory.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

fn default_max_memory() -> u64 {
    50
}

fn default_multipart_key() -> String {
    "multi-part".to_string()
}

/// Parameters of cache and cache-files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheParams {
    /// Source (context path or form field) to cache key, both templated
    pub mapping: BTreeMap<String, String>,

    /// Time to live in seconds; zero or less keeps entries until replaced
    #[serde(default = "default_cache_timeout")]
    pub timeout: i64,
}

impl CacheParams {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::try_from(self.timeout).unwrap_or(0))
    }
}

fn default_cache_timeout() -> i64 {
    300
}

/// Parameters of the outbound request action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestParams {
    /// HTTP method (templated)
    #[serde(default = "default_request_method")]
    pub method: String,

    /// Target URL (templated)
    pub url: String,

    /// Request headers (templated)
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,

    /// Request body (templated); an empty body is not sent
    #[serde(default = "default_request_body")]
    pub body: String,

    /// Delay before sending, in milliseconds
    #[serde(default)]
    pub delay: u64,
}

fn default_request_method() -> String {
    "GET".to_string()
}

fn default_request_body() -> String {
    "HTTP 200 OK".to_string()
}

/// Parameters of the terminal response action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResponseParams {
    /// Inline body (templated)
    #[serde(default)]
    pub body: Option<String>,

    /// Path of a local file to send (templated)
    #[serde(default)]
    pub local_file: Option<String>,

    /// Key of a cached upload to send (templated)
    #[serde(default)]
    pub cached_file: Option<String>,

    /// Status code, or a template rendering to one
    #[serde(default)]
    pub status: StatusSpec,

    /// Response headers (templated)
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,

    /// Delay before responding, in milliseconds
    #[serde(default)]
    pub delay: u64,
}

impl ResponseParams {
    /// Number of configured, non-empty body sources.
    pub fn body_sources(&self) -> usize {
        [&self.body, &self.local_file, &self.cached_file]
            .into_iter()
            .filter(|source| source.as_deref().is_some_and(|s| !s.is_empty()))
            .count()
    }
}

/// A response status, fixed or templated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StatusSpec {
    Code(u16),
    Template(String),
}

impl Default for StatusSpec {
    fn default() -> Self {
        StatusSpec::Code(200)
    }
}

/// One header, written in the file as a single-key mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl TryFrom<BTreeMap<String, String>> for HeaderEntry {
    type Error = String;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "header entry must have exactly one key, found {}",
                map.len()
            ));
        }
        let (name, value) = map.into_iter().next().ok_or("empty header entry")?;
        Ok(Self { name, value })
    }
}

impl From<HeaderEntry> for BTreeMap<String, String> {
    fn from(entry: HeaderEntry) -> Self {
        BTreeMap::from([(entry.name, entry.value)])
    }
}
