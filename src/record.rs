//! Per-signature lifecycle records and settlement outcomes.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{CancelReason, QueryError};
use crate::signature::{QuerySignature, RequestIdentity};

/// Lifecycle state of a query signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No record exists for the signature.
    Idle,
    /// A network call is in flight.
    Pending,
    /// The call resolved with a 2xx status and its merges were applied.
    Success,
    /// The call failed with a transport error or non-2xx status.
    Failure,
    /// The call was aborted deliberately.
    Cancelled,
}

impl QueryStatus {
    /// Returns `true` for terminal states.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            QueryStatus::Success | QueryStatus::Failure | QueryStatus::Cancelled
        )
    }
}

/// Tracked state for one query signature.
///
/// Created when the signature is first issued and updated on every
/// transition. Settled records are retained up to the client's configured
/// bound, then evicted oldest-settled-first; a pending record is never
/// evicted.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    /// The signature this record tracks.
    pub signature: QuerySignature,
    /// Current lifecycle state.
    pub status: QueryStatus,
    /// Whether the in-flight call pre-applied an optimistic update.
    pub is_optimistic: bool,
    /// When the current call was issued.
    pub started_at: Instant,
    /// When the record settled, if it has.
    pub finished_at: Option<Instant>,
    /// HTTP status of the resolution, if one was received.
    pub http_status: Option<u16>,
    /// The failure, if the record settled as one. Cancellation is benign
    /// and never stored here.
    pub error: Option<QueryError>,
    pub(crate) identity: Arc<RequestIdentity>,
    pub(crate) settle_seq: u64,
}

impl QueryRecord {
    pub(crate) fn issued(
        signature: QuerySignature,
        identity: Arc<RequestIdentity>,
        is_optimistic: bool,
        started_at: Instant,
    ) -> Self {
        Self {
            signature,
            status: QueryStatus::Pending,
            is_optimistic,
            started_at,
            finished_at: None,
            http_status: None,
            error: None,
            identity,
            settle_seq: 0,
        }
    }

    /// The HTTP method of the request this record tracks.
    pub fn method(&self) -> crate::Method {
        self.identity.method()
    }

    /// The URL of the request this record tracks.
    pub fn url(&self) -> &str {
        self.identity.url()
    }
}

/// Terminal outcome of one issued network call.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The call resolved with a 2xx status and its merges were applied.
    Success {
        /// The HTTP status of the resolution.
        http_status: u16,
    },
    /// The call failed; any optimistic snapshot was rolled back.
    Failure(QueryError),
    /// The call was aborted; any optimistic snapshot was rolled back.
    Cancelled(CancelReason),
}

/// The exactly-once terminal notification delivered to query handles.
///
/// Every handle on an issued call, whether it dispatched or joined,
/// observes the same settlement, exactly once per network call.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// The signature that settled.
    pub signature: QuerySignature,
    /// How the call ended.
    pub outcome: Outcome,
}

impl Settlement {
    /// Returns `true` if the call resolved successfully.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Returns `true` if the call was aborted deliberately.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Outcome::Cancelled(_))
    }

    /// The failure, if the call settled as one.
    pub fn error(&self) -> Option<&QueryError> {
        match &self.outcome {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// The HTTP status, if the call resolved to one.
    pub fn http_status(&self) -> Option<u16> {
        match &self.outcome {
            Outcome::Success { http_status } => Some(*http_status),
            Outcome::Failure(error) => error.http_status(),
            Outcome::Cancelled(_) => None,
        }
    }

    /// The record status this settlement corresponds to.
    pub fn status(&self) -> QueryStatus {
        match &self.outcome {
            Outcome::Success { .. } => QueryStatus::Success,
            Outcome::Failure(_) => QueryStatus::Failure,
            Outcome::Cancelled(_) => QueryStatus::Cancelled,
        }
    }
}
