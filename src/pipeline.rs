//! Action pipelines.
//!
//! Each endpoint is compiled once into a [`Pipeline`]: an ordered list of
//! [`Action`]s sharing one set of [`Services`]. For every request the
//! actions run in declaration order against a fresh [`Exchange`]; the first
//! failing action aborts the rest and the request is answered with a
//! generic server error. Nothing is rolled back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::actions::{self, MultipartForm};
use crate::cache::{Clock, TokioClock, TtlCache};
use crate::cache_file::CacheFile;
use crate::config::EndpointDefinition;
use crate::context::{Context, CACHE_KEY};
use crate::error::{ActionError, PipelineError, SetupError};
use crate::template::TemplateEngine;

/// Process-wide collaborators injected into every compiled action.
pub struct Services {
    /// Cached context values
    pub values: TtlCache<Value>,
    /// Cached uploads
    pub files: TtlCache<Arc<CacheFile>>,
    pub templates: TemplateEngine,
    /// Client for outbound requests
    pub http: reqwest::Client,
    /// Directory holding the backing files of cached uploads
    pub cache_dir: PathBuf,
}

impl Services {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(cache_dir, Arc::new(TokioClock))
    }

    /// Build services whose caches read `clock`.
    pub fn with_clock(cache_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let values = TtlCache::with_clock("values", Arc::clone(&clock), |key, _value: Value| {
            debug!(key = %key, "cached value evicted");
            Ok(())
        });
        let files = TtlCache::with_clock("files", clock, |key, file: Arc<CacheFile>| {
            file.remove().with_context(|| {
                format!("failed to delete cache file '{}'", file.path().display())
            })?;
            debug!(key = %key, path = %file.path().display(), "cached file evicted");
            Ok(())
        });

        Self {
            values,
            files,
            templates: TemplateEngine::new(),
            http: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Start the expiry tasks of both caches.
    pub fn start_expiry(&self) -> [JoinHandle<()>; 2] {
        [
            self.values.spawn_expiry_task(),
            self.files.spawn_expiry_task(),
        ]
    }

    /// Evict every cached upload, deleting its backing file.
    pub fn drain_files(&self) -> usize {
        self.files.clear()
    }
}

/// State of one request as it moves through a pipeline.
pub struct Exchange {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub context: Context,
    /// Form parsed by parse-multi-part-form, file contents included
    pub multipart: Option<MultipartForm>,
    body: Option<Body>,
    response: Option<Response>,
}

impl Exchange {
    pub fn new(request_id: impl Into<String>, request: Request, context: Context) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            request_id: request_id.into(),
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            context,
            multipart: None,
            body: Some(body),
            response: None,
        }
    }

    /// Hand out the request body. It can be consumed only once.
    pub fn take_body(&mut self) -> Result<Body, ActionError> {
        self.body.take().ok_or(ActionError::BodyConsumed)
    }

    pub fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }

    #[cfg(test)]
    pub(crate) fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// The response written by the pipeline, or an empty `200 OK`.
    pub fn into_response(self) -> Response {
        self.response
            .unwrap_or_else(|| StatusCode::OK.into_response())
    }
}

/// One configured pipeline step.
#[async_trait]
pub trait Action: Send + Sync {
    /// Configuration type tag, used in logs.
    fn name(&self) -> &'static str;

    /// Run the step. An error aborts the rest of the pipeline.
    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError>;
}

/// The compiled actions of one endpoint.
pub struct Pipeline {
    method: String,
    url: String,
    actions: Vec<Box<dyn Action>>,
    services: Arc<Services>,
}

impl Pipeline {
    /// Compile an endpoint definition.
    pub fn compile(endpoint: &EndpointDefinition, services: Arc<Services>) -> Result<Self, SetupError> {
        endpoint.validate(&services.templates)?;
        let actions = endpoint
            .actions
            .iter()
            .map(|spec| actions::build(spec, &services))
            .collect();
        Ok(Self::new(endpoint.method.to_uppercase(), endpoint.url.clone(), actions, services))
    }

    /// Assemble a pipeline from already built actions.
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        actions: Vec<Box<dyn Action>>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            actions,
            services,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|action| action.name()).collect()
    }

    /// Run every action in order, stopping at the first failure.
    pub async fn run(&self, exchange: &mut Exchange) -> Result<(), PipelineError> {
        for action in &self.actions {
            debug!(request_id = %exchange.request_id, action = action.name(), "running action");
            action
                .execute(exchange)
                .await
                .map_err(|source| PipelineError {
                    action: action.name(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Serve one request.
    ///
    /// The context starts out with the route parameters and a snapshot of
    /// the value cache under `__cache__`.
    pub async fn handle(&self, request: Request, params: Vec<(String, String)>) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        info!(
            request_id = %request_id,
            method = %request.method(),
            uri = %request.uri(),
            "request received"
        );

        let mut context = Context::with_params(params);
        context.insert(
            CACHE_KEY,
            Value::Object(self.services.values.to_map().into_iter().collect()),
        );

        let mut exchange = Exchange::new(request_id, request, context);
        match self.run(&mut exchange).await {
            Ok(()) => exchange.into_response(),
            Err(err) => {
                error!(
                    request_id = %exchange.request_id,
                    method = %self.method,
                    url = %self.url,
                    action = err.action,
                    error = %err.source,
                    "action failed, request aborted"
                );
                failure_response()
            }
        }
    }
}

fn failure_response() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
