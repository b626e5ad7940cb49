//! HTTP front end: routes requests to compiled pipelines.

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::{FromRequestParts, RawPathParams, Request};
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MockServerConfig;
use crate::error::{SetupError, SetupReason};
use crate::pipeline::{Pipeline, Services};
use crate::route::to_axum_path;

/// Mock server
///
/// Owns the compiled pipeline of every configured endpoint and the
/// services they share.
pub struct MockServer {
    config: MockServerConfig,
    services: Arc<Services>,
    pipelines: Vec<Arc<Pipeline>>,
}

impl MockServer {
    /// Compile every endpoint of `config`.
    pub fn new(config: MockServerConfig) -> Result<Self, SetupError> {
        let services = Arc::new(Services::new(config.server.cache_dir.clone()));
        Self::with_services(config, services)
    }

    /// Compile every endpoint of `config` against the given services.
    pub fn with_services(config: MockServerConfig, services: Arc<Services>) -> Result<Self, SetupError> {
        config.validate()?;
        let pipelines = config
            .endpoints
            .iter()
            .map(|endpoint| Pipeline::compile(endpoint, Arc::clone(&services)).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            endpoints = pipelines.len(),
            cache_dir = %services.cache_dir.display(),
            "Mock server initialized"
        );

        Ok(Self {
            config,
            services,
            pipelines,
        })
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config = MockServerConfig::from_yaml(yaml)?;
        Ok(Self::new(config)?)
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    /// Build the router. Endpoints sharing a URL pattern share a route.
    pub fn router(&self) -> Result<Router, SetupError> {
        let mut routes: BTreeMap<String, MethodRouter> = BTreeMap::new();
        for pipeline in &self.pipelines {
            let path = to_axum_path(pipeline.url()).map_err(|reason| {
                SetupError::endpoint(pipeline.method(), pipeline.url(), SetupReason::InvalidUrl(reason))
            })?;
            let filter = method_filter(pipeline.method()).ok_or_else(|| {
                SetupError::endpoint(
                    pipeline.method(),
                    pipeline.url(),
                    SetupReason::UnsupportedMethod(pipeline.method().to_string()),
                )
            })?;

            let pipeline = Arc::clone(pipeline);
            let handler = move |request: Request| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    let (mut parts, body) = request.into_parts();
                    let params = RawPathParams::from_request_parts(&mut parts, &())
                        .await
                        .map(|raw| {
                            raw.iter()
                                .map(|(name, value)| (name.to_string(), value.to_string()))
                                .collect()
                        })
                        .unwrap_or_default();
                    pipeline
                        .handle(Request::from_parts(parts, body), params)
                        .await
                }
            };

            let route = routes.remove(&path).unwrap_or_else(MethodRouter::new);
            routes.insert(path, route.on(filter, handler));
        }

        Ok(routes
            .into_iter()
            .fold(Router::new(), |router, (path, route)| router.route(&path, route)))
    }

    /// Serve until interrupted, then drain the file cache.
    ///
    /// In-flight requests are not awaited.
    pub async fn run(self) -> anyhow::Result<()> {
        let router = self.router()?;
        let address = format!("{}:{}", self.config.server.ip, self.config.server.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        let expiry = self.services.start_expiry();

        info!(
            address = %listener.local_addr()?,
            endpoints = self.pipelines.len(),
            "Mock server listening"
        );

        tokio::select! {
            result = axum::serve(listener, router).into_future() => {
                result.context("server terminated")?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupt")?;
                info!("Interrupt received, shutting down");
            }
        }

        for task in expiry {
            task.abort();
        }
        self.shutdown();
        Ok(())
    }

    /// Evict every cached upload. Returns the number of files deleted.
    pub fn shutdown(&self) -> usize {
        let drained = self.services.drain_files();
        info!(files = drained, "File cache drained");
        drained
    }
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    Some(match method {
        "GET" => MethodFilter::GET,
        "POST" => MethodFilter::POST,
        "PUT" => MethodFilter::PUT,
        "PATCH" => MethodFilter::PATCH,
        "DELETE" => MethodFilter::DELETE,
        _ => return None,
    })
}
