//! Outbound HTTP calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::render_headers;
use crate::config::RequestParams;
use crate::context::REQUEST_KEY;
use crate::error::ActionError;
use crate::pipeline::{Action, Exchange, Services};

/// Sends a templated request and stores the reply under `__request__`.
pub struct OutboundRequest {
    params: RequestParams,
    services: Arc<Services>,
}

impl OutboundRequest {
    pub fn new(params: &RequestParams, services: Arc<Services>) -> Self {
        Self {
            params: params.clone(),
            services,
        }
    }

    fn build(&self, exchange: &Exchange) -> Result<reqwest::Request, ActionError> {
        let templates = &self.services.templates;
        let context = &exchange.context;

        let method = templates.render(&self.params.method, context)?;
        let method = reqwest::Method::from_bytes(method.trim().to_uppercase().as_bytes())
            .map_err(|e| ActionError::OutboundBuild(format!("method '{method}': {e}")))?;
        let url = templates.render(&self.params.url, context)?;
        let headers = render_headers(templates, &self.params.headers, context)?;
        let body = templates.render(&self.params.body, context)?;

        let mut builder = self.services.http.request(method, url.trim());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }
        builder
            .build()
            .map_err(|e| ActionError::OutboundBuild(e.to_string()))
    }
}

#[async_trait]
impl Action for OutboundRequest {
    fn name(&self) -> &'static str {
        "request"
    }

    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError> {
        let request = self.build(exchange)?;
        let method = request.method().to_string();
        let url = request.url().to_string();

        if self.params.delay > 0 {
            tokio::time::sleep(Duration::from_millis(self.params.delay)).await;
        }

        info!(request_id = %exchange.request_id, method = %method, url = %url, "sending outbound request");
        let outbound_error = |source| ActionError::Outbound {
            method: method.clone(),
            url: url.clone(),
            source,
        };
        let response = self
            .services
            .http
            .execute(request)
            .await
            .map_err(outbound_error)?;

        let status = response.status().as_u16();
        let headers = headers_to_value(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response.text().await.map_err(outbound_error)?;
        let data = decode(&content_type, &body)?;

        debug!(request_id = %exchange.request_id, status, "outbound response received");
        exchange.context.insert(
            REQUEST_KEY,
            json!({
                "status": status,
                "body": body,
                "data": data,
                "headers": headers,
            }),
        );
        Ok(())
    }
}

fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|value| Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect::<Vec<_>>();
        out.insert(name.as_str().to_string(), Value::Array(values));
    }
    Value::Object(out)
}

/// Decode a reply by its content type essence. Unknown types and empty
/// bodies yield `null`.
fn decode(content_type: &str, body: &str) -> Result<Value, ActionError> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    if essence.contains("json") {
        serde_json::from_str(body).map_err(|e| ActionError::malformed("json", e))
    } else if essence.contains("yaml") {
        serde_yaml::from_str(body).map_err(|e| ActionError::malformed("yaml", e))
    } else {
        Ok(Value::Null)
    }
}
