//! Request descriptors: what to send and how to merge the result.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DescriptorError;

/// HTTP method of a request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    /// The method as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }

    /// Returns `true` for methods that only read server state.
    ///
    /// The default supersession policy lets read requests join an in-flight
    /// duplicate and makes every other method supersede it.
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a raw response body into partial entities keyed for merging.
pub type TransformFn = dyn Fn(&Value) -> Map<String, Value> + Send + Sync;

/// Merges a partial entity into the current value for one key.
///
/// Called as `merge(current, next)` where `current` is the entity value
/// before the merge (`None` if the key is absent) and `next` is the partial
/// value the transform produced for this key (`None` if the transform output
/// did not contain it). Must be pure: no I/O, no interior state.
pub type MergeFn = dyn Fn(Option<&Value>, Option<&Value>) -> Value + Send + Sync;

/// Produces the speculative value for one key of an optimistic update.
///
/// Receives the current entity value (`None` if absent). Must be pure.
pub type ProduceFn = dyn Fn(Option<&Value>) -> Value + Send + Sync;

/// A single logical network request plus its result-merging behavior.
///
/// Descriptors are immutable once built and cheap to move into the client;
/// the function tables are shared through `Arc`. Two descriptors with the
/// same method, URL, and body are the same logical query regardless of how
/// their merge tables differ: identity is the request, not the reducers.
///
/// # Example
///
/// ```ignore
/// use query_wire::{Method, QueryDescriptor};
/// use serde_json::json;
///
/// let descriptor = QueryDescriptor::builder(Method::Get, "/api/name")
///     .update("name", |_current, next| {
///         next.cloned().unwrap_or(serde_json::Value::Null)
///     })
///     .build()?;
/// ```
#[derive(Clone)]
pub struct QueryDescriptor {
    method: Method,
    url: String,
    body: Option<Value>,
    headers: Vec<(String, String)>,
    transform: Option<Arc<TransformFn>>,
    update: BTreeMap<String, Arc<MergeFn>>,
    optimistic_update: BTreeMap<String, Arc<ProduceFn>>,
}

impl QueryDescriptor {
    /// Start building a descriptor for `method` and `url`.
    pub fn builder(method: Method, url: impl Into<String>) -> QueryDescriptorBuilder {
        QueryDescriptorBuilder {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            transform: None,
            update: BTreeMap::new(),
            optimistic_update: BTreeMap::new(),
        }
    }

    /// The HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Headers to send with the request.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Entity keys this descriptor merges on success.
    pub fn update_keys(&self) -> impl Iterator<Item = &str> {
        self.update.keys().map(String::as_str)
    }

    /// Returns `true` if the descriptor carries an optimistic update table.
    pub fn has_optimistic_update(&self) -> bool {
        !self.optimistic_update.is_empty()
    }

    pub(crate) fn transform(&self) -> Option<&Arc<TransformFn>> {
        self.transform.as_ref()
    }

    pub(crate) fn update(&self) -> &BTreeMap<String, Arc<MergeFn>> {
        &self.update
    }

    pub(crate) fn optimistic_update(&self) -> &BTreeMap<String, Arc<ProduceFn>> {
        &self.optimistic_update
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("transform", &self.transform.is_some())
            .field("update", &self.update.keys().collect::<Vec<_>>())
            .field(
                "optimistic_update",
                &self.optimistic_update.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`QueryDescriptor`].
///
/// Validation happens in [`build`](Self::build): the URL must be non-empty,
/// and optimistic updates are rejected on read methods.
pub struct QueryDescriptorBuilder {
    method: Method,
    url: String,
    body: Option<Value>,
    headers: Vec<(String, String)>,
    transform: Option<Arc<TransformFn>>,
    update: BTreeMap<String, Arc<MergeFn>>,
    optimistic_update: BTreeMap<String, Arc<ProduceFn>>,
}

impl QueryDescriptorBuilder {
    /// Attach a JSON body. The body participates in the query signature.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header. Headers are passed to the transport verbatim and do
    /// not participate in the query signature.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the transform from raw response body to partial entities.
    ///
    /// Without a transform, an object response body is taken as the partial
    /// entity map itself and any other body yields no partial entities.
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Register the merge function for one entity key.
    ///
    /// On successful resolution every registered key is merged exactly once,
    /// whether or not the transform produced a partial value for it.
    pub fn update<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.update.insert(key.into(), Arc::new(f));
        self
    }

    /// Register the speculative producer for one entity key.
    ///
    /// Applied before the network call when the descriptor is dispatched as
    /// an optimistic mutation; rolled back exactly if the call fails or is
    /// cancelled.
    pub fn optimistic<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.optimistic_update.insert(key.into(), Arc::new(f));
        self
    }

    /// Validate and build the descriptor.
    pub fn build(self) -> Result<QueryDescriptor, DescriptorError> {
        if self.url.is_empty() {
            return Err(DescriptorError::EmptyUrl);
        }
        if !self.optimistic_update.is_empty() && self.method.is_read() {
            return Err(DescriptorError::OptimisticOnRead(self.method));
        }
        Ok(QueryDescriptor {
            method: self.method,
            url: self.url,
            body: self.body,
            headers: self.headers,
            transform: self.transform,
            update: self.update,
            optimistic_update: self.optimistic_update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_accessors() {
        let descriptor = QueryDescriptor::builder(Method::Post, "/api/items")
            .body(json!({"label": "a"}))
            .header("x-request-id", "1")
            .update("items", |_, next| {
                next.cloned().unwrap_or(Value::Null)
            })
            .build()
            .unwrap();

        assert_eq!(descriptor.method(), Method::Post);
        assert_eq!(descriptor.url(), "/api/items");
        assert_eq!(descriptor.body(), Some(&json!({"label": "a"})));
        assert_eq!(descriptor.headers().len(), 1);
        assert_eq!(descriptor.update_keys().collect::<Vec<_>>(), vec!["items"]);
        assert!(!descriptor.has_optimistic_update());
    }

    #[test]
    fn test_empty_url_rejected() {
        let result = QueryDescriptor::builder(Method::Get, "").build();
        assert_eq!(result.unwrap_err(), DescriptorError::EmptyUrl);
    }

    #[test]
    fn test_optimistic_on_read_rejected() {
        let result = QueryDescriptor::builder(Method::Get, "/api/name")
            .optimistic("name", |_| json!("speculative"))
            .build();
        assert_eq!(
            result.unwrap_err(),
            DescriptorError::OptimisticOnRead(Method::Get)
        );
    }

    #[test]
    fn test_optimistic_on_mutation_allowed() {
        let descriptor = QueryDescriptor::builder(Method::Post, "/api/name")
            .optimistic("name", |_| json!("speculative"))
            .build()
            .unwrap();
        assert!(descriptor.has_optimistic_update());
    }

    #[test]
    fn test_method_wire_names() {
        assert_eq!(Method::Get.as_str(), "GET");
        assert_eq!(Method::Delete.to_string(), "DELETE");
        assert!(Method::Head.is_read());
        assert!(!Method::Put.is_read());
    }
}
