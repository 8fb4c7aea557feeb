//! The pluggable network boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::Method;

/// An HTTP-like request as handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Request URL.
    pub url: String,
    /// Headers, passed through from the descriptor verbatim.
    pub headers: Vec<(String, String)>,
    /// JSON body, if the descriptor carried one.
    pub body: Option<Value>,
}

/// An HTTP-like response as returned by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body. Use [`Value::Null`] for empty bodies.
    pub body: Value,
}

impl HttpResponse {
    /// Returns `true` for statuses in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues network calls on behalf of the client.
///
/// Orchestration stays in the client, which calls `send` exactly once per
/// issued request. Implementations only move bytes: an error return means
/// the transport failed before producing an HTTP status, and non-2xx
/// statuses are returned as responses, not errors.
/// Cancellation is cooperative: the client stops awaiting the returned
/// future and discards a response that arrives after the abort.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use query_wire::{HttpRequest, HttpResponse, Transport};
///
/// struct HyperTransport { /* connection pool */ }
///
/// #[async_trait]
/// impl Transport for HyperTransport {
///     async fn send(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
///         // Drive the request through the pool and map the response.
///         # unimplemented!()
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and resolve with its response or a transport error.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error>;
}
