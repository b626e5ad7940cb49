//! Per-request context threaded through an endpoint's actions.

use serde::Serialize;
use serde_json::{Map, Value};

/// Reserved key holding a snapshot of the value cache.
pub const CACHE_KEY: &str = "__cache__";
/// Reserved key holding the per-field outcome of a cache-files action.
pub const CACHED_FILES_KEY: &str = "__cached_files__";
/// Reserved key holding the result of the last outbound request.
pub const REQUEST_KEY: &str = "__request__";

/// Mutable key/value state of one request.
///
/// Created fresh for every request and dropped when its pipeline ends.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context with route parameters.
    pub fn with_params<I, K, V>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = params
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Resolve a dotted path (`form.user.name`) through nested objects.
    ///
    /// Only objects are traversed; a segment that lands on a scalar or an
    /// array before the path is exhausted yields `None`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
