//! Error types for pipeline compilation and execution.
//!
//! Setup errors are produced while compiling endpoints and abort startup.
//! Action errors abort a single request's pipeline and are answered with a
//! generic server error.

use thiserror::Error;

use crate::template::TemplateError;

/// A pipeline could not be compiled from its endpoint definition.
#[derive(Debug, Error)]
#[error("endpoint [{method}] {url}, action '{action}': {reason}")]
pub struct SetupError {
    /// Endpoint method as configured
    pub method: String,
    /// Endpoint URL pattern as configured
    pub url: String,
    /// Offending action type, or `endpoint` for endpoint-level problems
    pub action: String,
    /// What is wrong
    pub reason: SetupReason,
}

impl SetupError {
    pub(crate) fn endpoint(method: &str, url: &str, reason: SetupReason) -> Self {
        Self::action(method, url, "endpoint", reason)
    }

    pub(crate) fn action(method: &str, url: &str, action: &str, reason: SetupReason) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            action: action.to_string(),
            reason,
        }
    }
}

/// Reasons a pipeline is rejected at startup.
#[derive(Debug, Error)]
pub enum SetupReason {
    #[error("unsupported endpoint method '{0}'")]
    UnsupportedMethod(String),

    #[error("endpoint is defined more than once")]
    DuplicateEndpoint,

    #[error("invalid url pattern: {0}")]
    InvalidUrl(String),

    #[error("route parameters conflict with '{0}'")]
    RouteConflict(String),

    #[error("action requires a POST or PUT endpoint")]
    MethodNotAllowed,

    #[error(
        "must specify exactly one of the following options: body, localFile, cachedFile (found {0})"
    )]
    BodySource(usize),

    #[error("response must be the last action of the endpoint")]
    ResponseNotLast,

    #[error("cache-files requires an earlier parse-multi-part-form action")]
    MultipartRequired,

    #[error("request url cannot be empty")]
    EmptyUrl,

    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("invalid template '{template}': {source}")]
    Template {
        template: String,
        #[source]
        source: TemplateError,
    },
}

/// An action aborted a request's pipeline.
#[derive(Debug, Error)]
#[error("action '{action}' failed: {source}")]
pub struct PipelineError {
    /// Type tag of the failing action
    pub action: &'static str,
    /// Why it failed
    #[source]
    pub source: ActionError,
}

/// A request-fatal failure raised by an action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no request body received")]
    EmptyBody,

    #[error("request body was already consumed by an earlier action")]
    BodyConsumed,

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("malformed {format} content: {message}")]
    Malformed {
        format: &'static str,
        message: String,
    },

    #[error("failed to parse multi-part form: {0}")]
    Multipart(String),

    #[error("failed to buffer multi-part upload on disk: {0}")]
    Spill(#[source] std::io::Error),

    #[error("no parsed multi-part form available, did you forget the parse-multi-part-form action?")]
    MissingMultipart,

    #[error("context path '{0}' does not exist")]
    MissingContextPath(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("invalid status code '{0}'")]
    InvalidStatus(String),

    #[error("invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },

    #[error("error opening local file '{path}': {source}")]
    LocalFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cached file '{0}' not found")]
    CachedFileNotFound(String),

    #[error("error reading cached file '{key}': {source}")]
    CachedFileRead {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid outbound request: {0}")]
    OutboundBuild(String),

    #[error("outbound {method} {url} failed: {source}")]
    Outbound {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ActionError {
    pub(crate) fn malformed(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            format,
            message: err.to_string(),
        }
    }
}
