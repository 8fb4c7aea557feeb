//! Error types for dispatch and settlement.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::descriptor::Method;
use crate::signature::QuerySignature;

/// Why an in-flight request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// [`QueryClient::cancel`](crate::QueryClient::cancel) was called for the signature.
    Explicit,
    /// A newer dispatch of the same signature replaced this one.
    Superseded,
    /// The client was reset or dropped while the request was in flight.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Explicit => write!(f, "cancelled explicitly"),
            CancelReason::Superseded => write!(f, "superseded by a newer dispatch"),
            CancelReason::Shutdown => write!(f, "client shut down"),
        }
    }
}

/// Errors produced while dispatching and settling queries.
///
/// `Transport` and `Http` settle the owning record as a failure and are
/// surfaced through [`QueryRecord::error`](crate::QueryRecord) and the
/// settlement. `Cancelled` is benign: it marks a deliberate abort, not a
/// failure of the remote resource, and selectors never report it as an
/// error.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The transport failed before producing an HTTP status.
    ///
    /// Wraps the [`anyhow::Error`] returned by the
    /// [`Transport`](crate::Transport) in an `Arc` so the error stays cheap
    /// to clone into records, settlements, and events.
    #[error("transport error: {0}")]
    Transport(Arc<anyhow::Error>),

    /// The server answered with a status outside the 2xx range.
    #[error("http error: status {status}")]
    Http {
        /// The non-success HTTP status code.
        status: u16,
        /// The response body as received.
        body: Value,
    },

    /// The request was aborted deliberately.
    #[error("query cancelled: {0}")]
    Cancelled(CancelReason),

    /// Two distinct requests mapped to one signature.
    ///
    /// This is an internal invariant violation. It is logged at error level
    /// and returned from dispatch; the colliding request is never issued and
    /// never merges into the entity store.
    #[error("signature collision on {signature}: existing {existing}, incoming {incoming}")]
    SignatureCollision {
        /// The signature both requests hashed to.
        signature: QuerySignature,
        /// Rendered request line already registered under the signature.
        existing: String,
        /// Rendered request line of the colliding dispatch.
        incoming: String,
    },
}

impl QueryError {
    /// Wrap a transport-level failure.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        QueryError::Transport(Arc::new(err.into()))
    }

    /// Returns the HTTP status if this is an `Http` error.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            QueryError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for deliberate aborts.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    /// Returns a reference to the inner transport error, if any.
    pub fn transport_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the transport error to a specific type.
    ///
    /// Returns `Some(&E)` if this is a `Transport` error wrapping an error of
    /// type `E`, otherwise `None`.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.transport_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Validation failures from [`QueryDescriptorBuilder::build`](crate::QueryDescriptorBuilder::build).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The URL was empty.
    #[error("descriptor url must not be empty")]
    EmptyUrl,

    /// An optimistic update table was attached to a read method.
    ///
    /// Speculative writes only make sense for requests that mutate server
    /// state; a read has nothing to confirm or roll back.
    #[error("optimistic updates require a mutating method, got {0}")]
    OptimisticOnRead(Method),
}
