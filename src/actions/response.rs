//! The terminal response action.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::render_headers;
use crate::config::{HeaderEntry, ResponseParams, StatusSpec};
use crate::context::Context;
use crate::error::ActionError;
use crate::pipeline::{Action, Exchange, Services};

const CONTENT_TRANSFER_ENCODING: HeaderName = HeaderName::from_static("content-transfer-encoding");

/// Where the response body comes from. Each variant holds a template.
#[derive(Debug, Clone)]
enum BodySource {
    Inline(String),
    LocalFile(String),
    CachedFile(String),
}

/// Writes status, headers and body for the request.
pub struct WriteResponse {
    source: BodySource,
    status: StatusSpec,
    headers: Vec<HeaderEntry>,
    delay: u64,
    services: Arc<Services>,
}

impl WriteResponse {
    pub fn new(params: &ResponseParams, services: Arc<Services>) -> Self {
        let configured = |value: &Option<String>| value.clone().filter(|s| !s.is_empty());
        let source = if let Some(path) = configured(&params.local_file) {
            BodySource::LocalFile(path)
        } else if let Some(key) = configured(&params.cached_file) {
            BodySource::CachedFile(key)
        } else {
            BodySource::Inline(params.body.clone().unwrap_or_default())
        };

        Self {
            source,
            status: params.status.clone(),
            headers: params.headers.clone(),
            delay: params.delay,
            services,
        }
    }

    fn status(&self, context: &Context) -> Result<StatusCode, ActionError> {
        let code = match &self.status {
            StatusSpec::Code(code) => code.to_string(),
            StatusSpec::Template(template) => self.services.templates.render(template, context)?,
        };
        let status = code
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|code| (100..=599).contains(code))
            .and_then(|code| StatusCode::from_u16(code).ok());
        status.ok_or(ActionError::InvalidStatus(code))
    }

    async fn body(&self, context: &Context, headers: &mut HeaderMap) -> Result<Body, ActionError> {
        let templates = &self.services.templates;
        match &self.source {
            BodySource::Inline(template) => Ok(Body::from(templates.render(template, context)?)),
            BodySource::LocalFile(template) => {
                let path = templates.render(template, context)?;
                open_local_file(&path, headers).await
            }
            BodySource::CachedFile(template) => {
                let key = templates.render(template, context)?;
                let file = self
                    .services
                    .files
                    .get(&key)
                    .ok_or_else(|| ActionError::CachedFileNotFound(key.clone()))?;
                file.add_headers(headers);
                file.body()
                    .await
                    .map_err(|source| ActionError::CachedFileRead { key, source })
            }
        }
    }
}

/// Open `path` for download. Default download headers are added unless
/// already configured.
async fn open_local_file(path: &str, headers: &mut HeaderMap) -> Result<Body, ActionError> {
    let local_error = |source| ActionError::LocalFile {
        path: path.to_string(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(local_error)?;
    let len = file.metadata().await.map_err(local_error)?.len();

    let file_name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let defaults = [
        (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
        (
            CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename={file_name}"))
                .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
        ),
        (CONTENT_TRANSFER_ENCODING, HeaderValue::from_static("binary")),
        (CONTENT_LENGTH, HeaderValue::from(len)),
    ];
    for (name, value) in defaults {
        headers.entry(name).or_insert(value);
    }

    Ok(Body::from_stream(ReaderStream::new(file)))
}

#[async_trait]
impl Action for WriteResponse {
    fn name(&self) -> &'static str {
        "response"
    }

    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError> {
        let mut headers = HeaderMap::new();
        for (name, value) in
            render_headers(&self.services.templates, &self.headers, &exchange.context)?
        {
            headers.insert(name, value);
        }
        let status = self.status(&exchange.context)?;
        let body = self.body(&exchange.context, &mut headers).await?;

        if self.delay > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay)).await;
        }

        debug!(request_id = %exchange.request_id, status = status.as_u16(), "writing response");
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        exchange.set_response(response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_file::CacheFile;
    use axum::extract::Request;
    use bytes::Bytes;
    use serde_json::json;

    fn params(body: Option<&str>, local_file: Option<&str>, cached_file: Option<&str>) -> ResponseParams {
        ResponseParams {
            body: body.map(str::to_string),
            local_file: local_file.map(str::to_string),
            cached_file: cached_file.map(str::to_string),
            status: StatusSpec::default(),
            headers: Vec::new(),
            delay: 0,
        }
    }

    fn exchange() -> Exchange {
        let request = Request::builder().uri("/out").body(Body::empty()).unwrap();
        let mut context = Context::with_params([("id", "42")]);
        context.insert("form", json!({"name": "Ada", "code": "201"}));
        Exchange::new("req-response", request, context)
    }

    async fn respond(action: &WriteResponse) -> (StatusCode, HeaderMap, Bytes) {
        let mut exchange = exchange();
        action.execute(&mut exchange).await.unwrap();
        assert!(exchange.has_response());
        let response = exchange.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn services() -> Arc<Services> {
        Arc::new(Services::new(std::env::temp_dir()))
    }

    #[tokio::test]
    async fn test_inline_body_with_templated_status_and_headers() {
        let mut p = params(Some("hello {{.form.name}}"), None, None);
        p.status = StatusSpec::Template("{{form.code}}".to_string());
        p.headers = vec![HeaderEntry {
            name: "X-User".to_string(),
            value: "{{id}}".to_string(),
        }];
        let (status, headers, body) = respond(&WriteResponse::new(&p, services())).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["x-user"], "42");
        assert_eq!(&body[..], b"hello Ada");
    }

    #[tokio::test]
    async fn test_invalid_rendered_status() {
        let mut p = params(Some("x"), None, None);
        p.status = StatusSpec::Template("{{form.name}}".to_string());
        let action = WriteResponse::new(&p, services());

        let err = action.execute(&mut exchange()).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidStatus(code) if code == "Ada"));

        p.status = StatusSpec::Template("700".to_string());
        let action = WriteResponse::new(&p, services());
        let err = action.execute(&mut exchange()).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn test_invalid_rendered_header() {
        let mut p = params(Some("x"), None, None);
        p.headers = vec![HeaderEntry {
            name: "X-Bad".to_string(),
            value: "line\nbreak".to_string(),
        }];
        let err = WriteResponse::new(&p, services())
            .execute(&mut exchange())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidHeader { .. }));
    }

    #[tokio::test]
    async fn test_local_file_download_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.bin");
        std::fs::write(&path, b"\x00\x01binary").unwrap();

        let p = params(None, Some(path.to_str().unwrap()), None);
        let (status, headers, body) = respond(&WriteResponse::new(&p, services())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/octet-stream");
        assert_eq!(headers[CONTENT_DISPOSITION], "attachment; filename=report.bin");
        assert_eq!(headers["content-transfer-encoding"], "binary");
        assert_eq!(headers[CONTENT_LENGTH], "8");
        assert_eq!(&body[..], b"\x00\x01binary");
    }

    #[tokio::test]
    async fn test_configured_headers_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, b"{}").unwrap();

        let mut p = params(None, Some(path.to_str().unwrap()), None);
        p.headers = vec![HeaderEntry {
            name: "Content-Type".to_string(),
            value: "application/json".to_string(),
        }];
        let (_, headers, _) = respond(&WriteResponse::new(&p, services())).await;
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[CONTENT_DISPOSITION], "attachment; filename=data.json");
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let p = params(None, Some("/definitely/not/here.txt"), None);
        let err = WriteResponse::new(&p, services())
            .execute(&mut exchange())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::LocalFile { .. }));
    }

    #[tokio::test]
    async fn test_cached_file_with_captured_headers() {
        let dir = tempfile::tempdir().unwrap();
        let services = services();
        let mut captured = HeaderMap::new();
        captured.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        captured.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("form-data; name=\"file\"; filename=\"a.txt\""),
        );
        let file = CacheFile::create(dir.path(), Bytes::from_static(b"cached"), captured, None)
            .await
            .unwrap();
        services.files.add("upload-42", Arc::new(file), Duration::ZERO);

        let p = params(None, None, Some("upload-{{id}}"));
        let (status, headers, body) = respond(&WriteResponse::new(&p, services)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(
            headers[CONTENT_DISPOSITION],
            "form-data; name=\"file\"; filename=\"a.txt\""
        );
        assert_eq!(&body[..], b"cached");
    }

    #[tokio::test]
    async fn test_missing_cached_file() {
        let p = params(None, None, Some("nope"));
        let err = WriteResponse::new(&p, services())
            .execute(&mut exchange())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::CachedFileNotFound(key) if key == "nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_before_writing() {
        let mut p = params(Some("late"), None, None);
        p.delay = 1500;
        let action = WriteResponse::new(&p, services());

        let start = tokio::time::Instant::now();
        let mut exchange = exchange();
        action.execute(&mut exchange).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert!(exchange.has_response());
    }
}
