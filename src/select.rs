//! Synchronous reads over query and entity state.

use parking_lot::MutexGuard;
use serde_json::Value;

use crate::client::{CoreState, QueryClient};
use crate::error::QueryError;
use crate::record::{QueryRecord, QueryStatus};
use crate::signature::QuerySignature;

/// A consistent view of the client's state.
///
/// Holds the state lock for its lifetime, so every read through one select
/// observes the same instant: a query reported as succeeded has its merged
/// entities visible, an optimistic mutation reported as pending has its
/// speculative values visible, and a rolled-back failure leaves no trace.
///
/// Keep selects short-lived. The lock is not reentrant: dispatching or
/// cancelling while a select is alive on the same thread deadlocks.
///
/// # Example
///
/// ```ignore
/// let select = client.select();
/// if !select.is_pending(&signature) {
///     let name = select.get_entity("name");
///     let error = select.get_error(&signature);
/// }
/// ```
pub struct QuerySelect<'a> {
    state: MutexGuard<'a, CoreState>,
}

impl QuerySelect<'_> {
    /// The lifecycle status for a signature. Unknown signatures are
    /// [`QueryStatus::Idle`].
    pub fn status(&self, signature: &QuerySignature) -> QueryStatus {
        self.state
            .records
            .get(signature)
            .map(|record| record.status)
            .unwrap_or(QueryStatus::Idle)
    }

    /// Returns `true` while a network call for the signature is in flight.
    pub fn is_pending(&self, signature: &QuerySignature) -> bool {
        self.status(signature) == QueryStatus::Pending
    }

    /// The failure error for a signature, if its last call failed.
    ///
    /// Cancellation is benign and never surfaces here.
    pub fn get_error(&self, signature: &QuerySignature) -> Option<QueryError> {
        self.state
            .records
            .get(signature)
            .and_then(|record| record.error.clone())
    }

    /// The HTTP status of the signature's last settled call, when one was
    /// received.
    pub fn http_status(&self, signature: &QuerySignature) -> Option<u16> {
        self.state
            .records
            .get(signature)
            .and_then(|record| record.http_status)
    }

    /// The full tracking record for a signature.
    pub fn record(&self, signature: &QuerySignature) -> Option<QueryRecord> {
        self.state.records.get(signature).cloned()
    }

    /// The current value for an entity key.
    pub fn get_entity(&self, key: &str) -> Option<Value> {
        self.state.entities.get(key)
    }

    /// The write version for an entity key. Versions are monotonic across
    /// the whole store and never reused, even after removal.
    pub fn entity_version(&self, key: &str) -> Option<u64> {
        self.state.entities.version_of(key)
    }

    /// Number of entity keys currently stored.
    pub fn entity_count(&self) -> usize {
        self.state.entities.len()
    }
}

impl QueryClient {
    /// Take a consistent snapshot view of query and entity state.
    pub fn select(&self) -> QuerySelect<'_> {
        QuerySelect {
            state: self.core.state.lock(),
        }
    }

    /// Shorthand for [`QuerySelect::status`].
    pub fn status(&self, signature: &QuerySignature) -> QueryStatus {
        self.select().status(signature)
    }

    /// Shorthand for [`QuerySelect::is_pending`].
    pub fn is_pending(&self, signature: &QuerySignature) -> bool {
        self.select().is_pending(signature)
    }

    /// Shorthand for [`QuerySelect::get_error`].
    pub fn get_error(&self, signature: &QuerySignature) -> Option<QueryError> {
        self.select().get_error(signature)
    }

    /// Shorthand for [`QuerySelect::get_entity`].
    pub fn get_entity(&self, key: &str) -> Option<Value> {
        self.select().get_entity(key)
    }
}
