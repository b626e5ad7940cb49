//! Pipeline Mock Server
//!
//! A declarative mock HTTP server. Every endpoint is an ordered pipeline of
//! actions that parse the request, cache values and uploads, call other
//! services and finally write a templated response.
//!
//! # Features
//!
//! - **Body Parsing**: urlencoded forms, JSON, YAML and multipart uploads
//! - **Value Cache**: keep request data across requests with a TTL
//! - **File Cache**: keep uploaded files on disk and serve them back later
//! - **Outbound Requests**: call another service and template on its reply
//! - **Dynamic Templates**: Handlebars over the per-request context
//! - **Latency Simulation**: fixed delays on outbound calls and responses
//!
//! # Example Configuration
//!
//! ```yaml
//! server:
//!   port: 8080
//! endpoints:
//!   - method: POST
//!     url: /echo
//!     actions:
//!       - type: parse-json
//!       - type: response
//!         params:
//!           body: "{{.form.name}}"
//! ```

pub mod actions;
pub mod cache;
pub mod cache_file;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod route;
pub mod server;
pub mod template;

pub use config::MockServerConfig;
pub use error::{ActionError, PipelineError, SetupError};
pub use pipeline::{Action, Exchange, Pipeline, Services};
pub use server::MockServer;
