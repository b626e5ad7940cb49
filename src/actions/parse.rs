//! Request body parsers.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use bytes::{Bytes, BytesMut};
use serde_json::{json, Map, Value};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cache_file::{temp_file_in, CacheFile};
use crate::config::{MultipartParams, ParseBodyParams};
use crate::error::ActionError;
use crate::pipeline::{Action, Exchange};

/// Encoding a [`ParseBody`] action expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    /// `application/x-www-form-urlencoded`, merged with the query string
    Form,
    Json,
    Yaml,
}

impl BodyFormat {
    fn action_name(self) -> &'static str {
        match self {
            BodyFormat::Form => "parse-form",
            BodyFormat::Json => "parse-json",
            BodyFormat::Yaml => "parse-yaml",
        }
    }

    fn label(self) -> &'static str {
        match self {
            BodyFormat::Form => "form",
            BodyFormat::Json => "json",
            BodyFormat::Yaml => "yaml",
        }
    }
}

/// Reads the whole body and stores the decoded structure in the context.
pub struct ParseBody {
    format: BodyFormat,
    target: String,
}

impl ParseBody {
    pub fn new(format: BodyFormat, params: &ParseBodyParams) -> Self {
        Self {
            format,
            target: params.context_target.clone(),
        }
    }

    fn decode(&self, query: Option<&str>, body: &[u8]) -> Result<Value, ActionError> {
        let value = match self.format {
            BodyFormat::Form => return decode_form(query, body),
            BodyFormat::Json => serde_json::from_slice::<Value>(body)
                .map_err(|e| ActionError::malformed("json", e))?,
            BodyFormat::Yaml => serde_yaml::from_slice::<Value>(body)
                .map_err(|e| ActionError::malformed("yaml", e))?,
        };
        if !value.is_object() {
            return Err(ActionError::malformed(
                self.format.label(),
                "document is not a mapping",
            ));
        }
        Ok(value)
    }
}

#[async_trait]
impl Action for ParseBody {
    fn name(&self) -> &'static str {
        self.format.action_name()
    }

    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError> {
        let body = exchange.take_body()?;
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ActionError::BodyRead(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ActionError::EmptyBody);
        }

        let value = self.decode(exchange.uri.query(), &bytes)?;
        debug!(
            request_id = %exchange.request_id,
            target = %self.target,
            format = self.format.label(),
            "request body parsed"
        );
        exchange.context.insert(self.target.clone(), value);
        Ok(())
    }
}

/// Query pairs first, then body pairs. A name seen once maps to a string,
/// a repeated name to an array.
fn decode_form(query: Option<&str>, body: &[u8]) -> Result<Value, ActionError> {
    let mut pairs: Vec<(String, String)> = match query {
        Some(query) => serde_urlencoded::from_str(query)
            .map_err(|e| ActionError::malformed("form", e))?,
        None => Vec::new(),
    };
    pairs.extend(
        serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
            .map_err(|e| ActionError::malformed("form", e))?,
    );

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in pairs {
        grouped.entry(name).or_default().push(value);
    }

    let form: Map<String, Value> = grouped
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                Value::String(values.remove(0))
            } else {
                Value::from(values)
            };
            (name, value)
        })
        .collect();
    Ok(Value::Object(form))
}

/// One uploaded file of a multipart form.
#[derive(Debug, Clone)]
pub struct FormFile {
    pub file_name: String,
    pub content_type: Option<String>,
    /// Headers of the multipart section, `Content-Disposition` included
    pub headers: HeaderMap,
    pub data: FormFileData,
}

/// Where the contents of an upload ended up while parsing.
#[derive(Debug, Clone)]
pub enum FormFileData {
    Memory(Bytes),
    /// Written to a temporary file once the memory threshold was crossed;
    /// the file is deleted when the last clone of the form drops
    Disk { path: Arc<TempPath>, size: u64 },
}

impl FormFile {
    pub fn len(&self) -> u64 {
        match &self.data {
            FormFileData::Memory(bytes) => bytes.len() as u64,
            FormFileData::Disk { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the upload as a cache file under `dir`.
    pub async fn to_cache_file(&self, dir: &Path) -> io::Result<CacheFile> {
        let file_name = Some(self.file_name.clone());
        match &self.data {
            FormFileData::Memory(bytes) => {
                CacheFile::create(dir, bytes.clone(), self.headers.clone(), file_name).await
            }
            FormFileData::Disk { path, .. } => {
                CacheFile::adopt(dir, path, self.headers.clone(), file_name).await
            }
        }
    }
}

/// A parsed multipart form.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub fields: BTreeMap<String, Vec<String>>,
    pub files: BTreeMap<String, Vec<FormFile>>,
}

impl MultipartForm {
    /// First file uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&FormFile> {
        self.files.get(name)?.first()
    }

    /// Context view of the form; file contents are left out.
    pub fn to_value(&self) -> Value {
        let files: Map<String, Value> = self
            .files
            .iter()
            .map(|(name, files)| {
                let described = files
                    .iter()
                    .map(|file| {
                        json!({
                            "fileName": file.file_name,
                            "contentType": file.content_type,
                            "size": file.len(),
                        })
                    })
                    .collect::<Vec<_>>();
                (name.clone(), Value::from(described))
            })
            .collect();
        json!({
            "fields": self.fields,
            "files": files,
        })
    }
}

/// Extra room granted to non-file fields on top of the memory threshold.
const FIELD_ALLOWANCE: usize = 10 * 1024 * 1024;

const SPILL_PREFIX: &str = "multipart_";

/// Parses a `multipart/form-data` body.
///
/// Uploads are kept in memory until they would cross `max_bytes`, then
/// written to a temporary file under `spill_dir`. Plain fields share the
/// threshold plus another 10 MiB; a form whose fields exceed that is
/// rejected.
pub struct ParseMultipart {
    max_bytes: usize,
    context_key: String,
    spill_dir: PathBuf,
}

impl ParseMultipart {
    pub fn new(params: &MultipartParams, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_bytes: params.max_bytes(),
            context_key: params.context_key.clone(),
            spill_dir: spill_dir.into(),
        }
    }

    async fn read_form(&self, headers: &HeaderMap, body: Body) -> Result<MultipartForm, ActionError> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let boundary = multer::parse_boundary(content_type).map_err(multipart_error)?;
        let mut multipart = multer::Multipart::new(body.into_data_stream(), boundary);

        let mut memory = self.max_bytes.saturating_add(FIELD_ALLOWANCE);
        let mut file_memory = self.max_bytes;
        let mut form = MultipartForm::default();
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            let Some(file_name) = field.file_name().map(str::to_string) else {
                let text = read_text(&mut field, memory).await?;
                memory = memory.saturating_sub(text.len());
                form.fields.entry(name).or_default().push(text);
                continue;
            };

            let content_type = field.content_type().map(|mime| mime.to_string());
            let headers = field.headers().clone();
            let data = self.read_upload(&mut field, file_memory).await?;
            if let FormFileData::Memory(bytes) = &data {
                file_memory -= bytes.len();
                memory = memory.saturating_sub(bytes.len());
            }
            form.files.entry(name).or_default().push(FormFile {
                file_name,
                content_type,
                headers,
                data,
            });
        }
        Ok(form)
    }

    /// Buffer an upload, moving it to disk once it outgrows `limit`.
    async fn read_upload(
        &self,
        field: &mut multer::Field<'_>,
        limit: usize,
    ) -> Result<FormFileData, ActionError> {
        let mut buffered = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            if buffered.len() + chunk.len() > limit {
                return self.spill(field, &buffered, &chunk).await;
            }
            buffered.extend_from_slice(&chunk);
        }
        Ok(FormFileData::Memory(buffered.freeze()))
    }

    async fn spill(
        &self,
        field: &mut multer::Field<'_>,
        buffered: &[u8],
        chunk: &[u8],
    ) -> Result<FormFileData, ActionError> {
        let dir = self.spill_dir.clone();
        let temp = tokio::task::spawn_blocking(move || temp_file_in(&dir, SPILL_PREFIX))
            .await
            .map_err(io::Error::other)
            .and_then(|created| created)
            .map_err(ActionError::Spill)?;
        // the TempPath deletes the partial file on every early return
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        file.write_all(buffered).await.map_err(ActionError::Spill)?;
        file.write_all(chunk).await.map_err(ActionError::Spill)?;
        let mut size = (buffered.len() + chunk.len()) as u64;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            file.write_all(&chunk).await.map_err(ActionError::Spill)?;
            size += chunk.len() as u64;
        }
        file.flush().await.map_err(ActionError::Spill)?;

        Ok(FormFileData::Disk {
            path: Arc::new(path),
            size,
        })
    }
}

/// Read a plain field, failing once it exceeds `limit` bytes.
async fn read_text(field: &mut multer::Field<'_>, limit: usize) -> Result<String, ActionError> {
    let mut buffered = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if buffered.len() + chunk.len() > limit {
            return Err(ActionError::Multipart("message too large".to_string()));
        }
        buffered.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&buffered).into_owned())
}

fn multipart_error(err: multer::Error) -> ActionError {
    ActionError::Multipart(err.to_string())
}

#[async_trait]
impl Action for ParseMultipart {
    fn name(&self) -> &'static str {
        "parse-multi-part-form"
    }

    async fn execute(&self, exchange: &mut Exchange) -> Result<(), ActionError> {
        let body = exchange.take_body()?;
        let form = self.read_form(&exchange.headers, body).await?;

        debug!(
            request_id = %exchange.request_id,
            fields = form.fields.len(),
            files = form.files.len(),
            "multi-part form parsed"
        );
        exchange.context.insert(self.context_key.clone(), form.to_value());
        exchange.multipart = Some(form);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::Context;
    use axum::extract::Request;

    pub(crate) const BOUNDARY: &str = "X-TEST-BOUNDARY";

    /// Build a multipart body; parts with a file name become uploads.
    pub(crate) fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> String {
        let mut body = String::new();
        for (name, file_name, content) in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match file_name {
                Some(file_name) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: text/plain\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    pub(crate) fn multipart_exchange(body: String) -> Exchange {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Exchange::new("req-multipart", request, Context::new())
    }

    fn exchange(uri: &str, body: &'static str) -> Exchange {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        Exchange::new("req-parse", request, Context::new())
    }

    fn parser(format: BodyFormat) -> ParseBody {
        ParseBody::new(
            format,
            &ParseBodyParams {
                context_target: "form".to_string(),
            },
        )
    }

    fn multipart_parser(max_memory: u64, spill_dir: &Path) -> ParseMultipart {
        let params = MultipartParams {
            max_memory,
            context_key: "multi-part".to_string(),
        };
        ParseMultipart::new(&params, spill_dir)
    }

    fn in_memory(file: &FormFile) -> &[u8] {
        match &file.data {
            FormFileData::Memory(bytes) => bytes,
            FormFileData::Disk { path, .. } => panic!("upload spilled to {}", path.display()),
        }
    }

    fn spill_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_parse_json_object() {
        let mut exchange = exchange("/echo", r#"{"name":"Ada","tags":["a"]}"#);
        parser(BodyFormat::Json).execute(&mut exchange).await.unwrap();
        assert_eq!(exchange.context.lookup("form.name"), Some(&json!("Ada")));
        assert_eq!(exchange.context.lookup("form.tags"), Some(&json!(["a"])));
    }

    #[tokio::test]
    async fn test_parse_json_rejects_non_mapping() {
        let mut exchange = exchange("/echo", "[1, 2]");
        let err = parser(BodyFormat::Json).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::Malformed { format: "json", .. }));
    }

    #[tokio::test]
    async fn test_parse_json_malformed() {
        let mut exchange = exchange("/echo", "{not json");
        let err = parser(BodyFormat::Json).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_parse_yaml() {
        let mut exchange = exchange("/echo", "name: Ada\nnested:\n  level: 2\n");
        parser(BodyFormat::Yaml).execute(&mut exchange).await.unwrap();
        assert_eq!(exchange.context.lookup("form.nested.level"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_parse_form_merges_query_and_body() {
        let mut exchange = exchange("/submit?tag=a&page=1", "tag=b&name=Ada+Lovelace");
        parser(BodyFormat::Form).execute(&mut exchange).await.unwrap();
        assert_eq!(
            exchange.context.get("form"),
            Some(&json!({"tag": ["a", "b"], "page": "1", "name": "Ada Lovelace"}))
        );
    }

    #[tokio::test]
    async fn test_empty_body_is_fatal() {
        let mut exchange = exchange("/echo", "");
        let err = parser(BodyFormat::Json).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::EmptyBody));
    }

    #[tokio::test]
    async fn test_second_parse_sees_consumed_body() {
        let mut exchange = exchange("/echo", r#"{"a":1}"#);
        parser(BodyFormat::Json).execute(&mut exchange).await.unwrap();
        let err = parser(BodyFormat::Json).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::BodyConsumed));
    }

    #[tokio::test]
    async fn test_parse_multipart_fields_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let body = multipart_body(&[
            ("title", None, "report"),
            ("file", Some("a.txt"), "hello world"),
        ]);
        let mut exchange = multipart_exchange(body);
        multipart_parser(1, dir.path()).execute(&mut exchange).await.unwrap();

        let form = exchange.multipart.as_ref().unwrap();
        assert_eq!(form.fields["title"], vec!["report".to_string()]);
        let file = form.file("file").unwrap();
        assert_eq!(file.file_name, "a.txt");
        assert_eq!(in_memory(file), b"hello world");
        assert!(file.headers.contains_key("content-disposition"));
        assert_eq!(spill_count(dir.path()), 0);

        assert_eq!(
            exchange.context.lookup("multi-part.files"),
            Some(&json!({"file": [{"fileName": "a.txt", "contentType": "text/plain", "size": 11}]}))
        );
    }

    #[tokio::test]
    async fn test_upload_over_threshold_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let payload = "x".repeat(1024 * 1024 + 10);
        let body = multipart_body(&[
            ("title", None, "big"),
            ("file", Some("big.bin"), payload.as_str()),
        ]);
        let mut exchange = multipart_exchange(body);
        multipart_parser(1, dir.path()).execute(&mut exchange).await.unwrap();

        let form = exchange.multipart.as_ref().unwrap();
        assert_eq!(form.fields["title"], vec!["big".to_string()]);
        let file = form.file("file").unwrap();
        assert_eq!(file.len(), payload.len() as u64);
        let FormFileData::Disk { path, .. } = &file.data else {
            panic!("upload was kept in memory");
        };
        assert!(path.starts_with(dir.path()));
        assert_eq!(std::fs::read(path.to_path_buf()).unwrap(), payload.as_bytes());
        assert_eq!(
            exchange.context.lookup("multi-part.files.file"),
            Some(&json!([{"fileName": "big.bin", "contentType": "text/plain", "size": payload.len()}]))
        );

        drop(exchange);
        assert_eq!(spill_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_threshold_is_shared_across_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let half = "y".repeat(600 * 1024);
        let body = multipart_body(&[
            ("first", Some("a.bin"), half.as_str()),
            ("second", Some("b.bin"), half.as_str()),
        ]);
        let mut exchange = multipart_exchange(body);
        multipart_parser(1, dir.path()).execute(&mut exchange).await.unwrap();

        let form = exchange.multipart.as_ref().unwrap();
        assert!(matches!(form.file("first").unwrap().data, FormFileData::Memory(_)));
        assert!(matches!(form.file("second").unwrap().data, FormFileData::Disk { .. }));
        assert_eq!(spill_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_zero_threshold_spills_every_upload() {
        let dir = tempfile::tempdir().unwrap();
        let body = multipart_body(&[("file", Some("a.txt"), "tiny")]);
        let mut exchange = multipart_exchange(body);
        multipart_parser(0, dir.path()).execute(&mut exchange).await.unwrap();

        let file = exchange.multipart.as_ref().unwrap().file("file").unwrap();
        assert!(matches!(file.data, FormFileData::Disk { size: 4, .. }));
    }

    #[tokio::test]
    async fn test_oversized_plain_field_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let text = "z".repeat(FIELD_ALLOWANCE + 1);
        let body = multipart_body(&[("note", None, text.as_str())]);
        let mut exchange = multipart_exchange(body);
        let err = multipart_parser(0, dir.path()).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::Multipart(ref message) if message == "message too large"));
        assert!(exchange.multipart.is_none());
    }

    #[tokio::test]
    async fn test_unwritable_spill_dir_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("cache");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let body = multipart_body(&[("file", Some("a.txt"), "spilled")]);
        let mut exchange = multipart_exchange(body);
        let err = multipart_parser(0, &blocker).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::Spill(_)));
    }

    #[tokio::test]
    async fn test_parse_multipart_without_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut exchange = exchange("/upload", "plain");
        let err = multipart_parser(1, dir.path()).execute(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ActionError::Multipart(_)));
    }
}
