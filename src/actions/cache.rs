//! Actions that write into the process-wide caches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::CacheParams;
use crate::context::CACHED_FILES_KEY;
use crate::error::ActionError;
use crate::pipeline::{Action, Exchange, Services};

/// Copies context values into the value cache.
pub struct CacheValues {
    mapping: Vec<(String, String)>,
    ttl: Duration,
    services: Arc<Services>,
}

impl CacheValues {
    pub fn new(params: &CacheParams, services: Arc<Services>) -> Self {
        Self {
            mapping: params.mapping.clone().into_iter().collect(),
            ttl: params.ttl(),
            services,
        }
    }
}

#[async_trait]
impl Action for CacheValues {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError> {
        let templates = &self.services.templates;
        for (path_template, key_template) in &self.mapping {
            let path = templates.render(path_template, &exchange.context)?;
            let path = path.trim_start_matches('.');
            let key = templates.render(key_template, &exchange.context)?;

            let value = exchange
                .context
                .lookup(path)
                .cloned()
                .ok_or_else(|| ActionError::MissingContextPath(path.to_string()))?;

            debug!(
                request_id = %exchange.request_id,
                path = %path,
                key = %key,
                ttl_secs = self.ttl.as_secs(),
                "caching value"
            );
            self.services.values.add(key, value, self.ttl);
        }
        Ok(())
    }
}

/// Copies uploaded files into the file cache.
///
/// Every mapping reports its outcome under `__cached_files__`, keyed by the
/// rendered cache key. A field that cannot be cached does not stop the
/// remaining fields.
pub struct CacheFiles {
    mapping: Vec<(String, String)>,
    ttl: Duration,
    services: Arc<Services>,
}

impl CacheFiles {
    pub fn new(params: &CacheParams, services: Arc<Services>) -> Self {
        Self {
            mapping: params.mapping.clone().into_iter().collect(),
            ttl: params.ttl(),
            services,
        }
    }

    fn expires_at(&self) -> String {
        if self.ttl.is_zero() {
            return "never".to_string();
        }
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    }
}

#[async_trait]
impl Action for CacheFiles {
    fn name(&self) -> &'static str {
        "cache-files"
    }

    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError> {
        let form = exchange
            .multipart
            .as_ref()
            .ok_or(ActionError::MissingMultipart)?;
        let templates = &self.services.templates;

        let mut outcomes = Map::new();
        for (field_template, key_template) in &self.mapping {
            let field = templates.render(field_template, &exchange.context)?;
            let key = templates.render(key_template, &exchange.context)?;

            let Some(upload) = form.file(&field) else {
                let message =
                    format!("Error: failed to extract form file '{field}': no file uploaded under this field");
                warn!(request_id = %exchange.request_id, field = %field, key = %key, "{message}");
                outcomes.insert(key, Value::String(message));
                continue;
            };

            let created = upload.to_cache_file(&self.services.cache_dir).await;

            let outcome = match created {
                Ok(file) => {
                    debug!(
                        request_id = %exchange.request_id,
                        field = %field,
                        key = %key,
                        path = %file.path().display(),
                        "caching uploaded file"
                    );
                    self.services.files.add(key.clone(), Arc::new(file), self.ttl);
                    format!("Success (key={key}; timeout={})", self.expires_at())
                }
                Err(e) => {
                    let message = format!("Error: failed to add cache file: {e}");
                    warn!(request_id = %exchange.request_id, field = %field, key = %key, "{message}");
                    message
                }
            };
            outcomes.insert(key, Value::String(outcome));
        }

        exchange
            .context
            .insert(CACHED_FILES_KEY, Value::Object(outcomes));
        Ok(())
    }
}
