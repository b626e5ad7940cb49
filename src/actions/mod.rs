//! Built-in pipeline actions.

mod cache;
mod parse;
mod request;
mod response;

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};

use crate::config::{ActionSpec, HeaderEntry};
use crate::context::Context;
use crate::error::ActionError;
use crate::pipeline::{Action, Services};
use crate::template::TemplateEngine;

pub use cache::{CacheFiles, CacheValues};
pub use parse::{BodyFormat, FormFile, FormFileData, MultipartForm, ParseBody, ParseMultipart};
pub use request::OutboundRequest;
pub use response::WriteResponse;

/// Instantiate the action described by `spec`.
///
/// `spec` is expected to have passed endpoint validation.
pub fn build(spec: &ActionSpec, services: &Arc<Services>) -> Box<dyn Action> {
    let services = Arc::clone(services);
    match spec {
        ActionSpec::ParseForm(p) => Box::new(ParseBody::new(BodyFormat::Form, p)),
        ActionSpec::ParseJson(p) => Box::new(ParseBody::new(BodyFormat::Json, p)),
        ActionSpec::ParseYaml(p) => Box::new(ParseBody::new(BodyFormat::Yaml, p)),
        ActionSpec::ParseMultiPartForm(p) => {
            Box::new(ParseMultipart::new(p, services.cache_dir.clone()))
        }
        ActionSpec::Cache(p) => Box::new(CacheValues::new(p, services)),
        ActionSpec::CacheFiles(p) => Box::new(CacheFiles::new(p, services)),
        ActionSpec::Request(p) => Box::new(OutboundRequest::new(p, services)),
        ActionSpec::Response(p) => Box::new(WriteResponse::new(p, services)),
    }
}

/// Render configured header entries into name/value pairs.
fn render_headers(
    templates: &TemplateEngine,
    headers: &[HeaderEntry],
    context: &Context,
) -> Result<Vec<(HeaderName, HeaderValue)>, ActionError> {
    headers
        .iter()
        .map(|entry| {
            let name = templates.render(&entry.name, context)?;
            let value = templates.render(&entry.value, context)?;
            let header_name = HeaderName::try_from(name.as_str()).map_err(|e| {
                ActionError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                }
            })?;
            let header_value =
                HeaderValue::try_from(value).map_err(|e| ActionError::InvalidHeader {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            Ok((header_name, header_value))
        })
        .collect()
}
