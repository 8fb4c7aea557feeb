//! Lifecycle notifications for external effect coordination.

use crate::error::{CancelReason, QueryError};
use crate::signature::QuerySignature;

/// A state transition on one query signature.
///
/// Transitions are emitted in the order the client applies them, so a
/// subscriber observes `Issued` before the matching `Succeeded`/`Failed`/
/// `Cancelled`, and `Superseded` before the replacement's `Issued`.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A network call was issued for the signature.
    Issued {
        /// Whether the dispatch was a mutation.
        mutation: bool,
        /// Whether an optimistic update was pre-applied.
        optimistic: bool,
    },
    /// A dispatch attached to an already-pending call instead of issuing.
    Joined,
    /// The pending call was cancelled in favor of a fresh dispatch.
    Superseded,
    /// The call resolved and its merges were applied.
    Succeeded {
        /// HTTP status of the resolution.
        http_status: u16,
    },
    /// The call failed; any optimistic snapshot was rolled back.
    Failed {
        /// The recorded failure.
        error: QueryError,
    },
    /// The call was aborted; any optimistic snapshot was rolled back.
    Cancelled {
        /// Why the call was aborted.
        reason: CancelReason,
    },
}

/// A lifecycle notification: which signature moved, and how.
///
/// Delivered over a [`tokio::sync::broadcast`] channel obtained from
/// [`QueryClient::subscribe`](crate::QueryClient::subscribe). Events are
/// observational only: a slow subscriber lags and misses events rather
/// than backpressuring the client.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// The signature the transition applies to.
    pub signature: QuerySignature,
    /// The transition that occurred.
    pub transition: Transition,
}
