//! Query-Wire: a client-side request and cache manager.
//!
//! Dispatching a [`QueryDescriptor`] through the [`QueryClient`] issues at
//! most one network call per in-flight signature, tracks the call's
//! lifecycle, and merges the response into a normalized entity store.
//!
//! # Key Features
//!
//! - **Deterministic identity**: Equivalent requests collapse to the same
//!   [`QuerySignature`], independent of JSON object key order
//! - **Deduplication**: Concurrent identical reads share one network call;
//!   a duplicate mutation supersedes the stale in-flight one, with the
//!   policy replaceable per client or per dispatch
//! - **Optimistic updates**: Mutations can pre-apply their expected result
//!   and roll it back exactly on failure, never clobbering newer writes
//! - **Cancel wins**: A cancelled call never merges, even when its response
//!   arrives afterwards
//! - **Pluggable transport**: The wire layer is an injected async trait, so
//!   tests script responses instead of standing up a server
//!
//! # Example
//!
//! ```ignore
//! use query_wire::{DispatchOptions, Method, QueryClient, QueryDescriptor};
//! use serde_json::json;
//!
//! let client = QueryClient::new(transport);
//!
//! let descriptor = QueryDescriptor::builder(Method::Post, "/api/name")
//!     .body(json!({ "name": "Alice" }))
//!     .update("name", |_current, next| {
//!         next.cloned().unwrap_or(serde_json::Value::Null)
//!     })
//!     .build()?;
//!
//! let handle = client.dispatch_mutation(descriptor, DispatchOptions::default())?;
//! let settlement = handle.settled().await;
//! assert!(settlement.is_success());
//! assert_eq!(client.get_entity("name"), Some(json!("Alice")));
//! ```
//!
//! # Cancellation
//!
//! [`QueryClient::cancel`] settles the pending call as cancelled and
//! guarantees its response never merges. Cancellation is benign: it never
//! surfaces through [`QuerySelect::get_error`], and every handle on the
//! call observes an [`Outcome::Cancelled`] settlement with the reason.

mod client;
mod descriptor;
mod entity;
mod error;
mod event;
mod record;
mod select;
mod signature;
mod snapshot;
mod transport;

pub use client::{
    DispatchOptions, DuplicateAction, QueryClient, QueryClientBuilder, QueryHandle,
    SupersessionPolicy,
};
pub use descriptor::{
    MergeFn, Method, ProduceFn, QueryDescriptor, QueryDescriptorBuilder, TransformFn,
};
pub use error::{CancelReason, DescriptorError, QueryError};
pub use event::{QueryEvent, Transition};
pub use record::{Outcome, QueryRecord, QueryStatus, Settlement};
pub use select::QuerySelect;
pub use signature::QuerySignature;
pub use transport::{HttpRequest, HttpResponse, Transport};
