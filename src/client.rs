//! The request orchestrator: dispatch, deduplication, cancellation, merging.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, trace};

use crate::descriptor::QueryDescriptor;
use crate::entity::EntityStore;
use crate::error::{CancelReason, QueryError};
use crate::event::{QueryEvent, Transition};
use crate::record::{Outcome, QueryRecord, QueryStatus, Settlement};
use crate::signature::{QuerySignature, RequestIdentity};
use crate::snapshot::Snapshot;
use crate::transport::{HttpRequest, HttpResponse, Transport};

// ============================================================================
// Duplicate handling policy
// ============================================================================

/// What to do with a dispatch whose signature already has a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateAction {
    /// Attach to the pending call and share its settlement. No new network
    /// call is issued.
    Join,
    /// Cancel the pending call, roll back its optimistic snapshot, and issue
    /// a fresh call in its place.
    Supersede,
}

/// Function type deciding how a dispatch treats an in-flight duplicate.
///
/// Used by [`QueryClientBuilder::supersession_policy`] to customize whether
/// a new dispatch joins the pending call for its signature or supersedes it.
/// Receives the incoming descriptor and the in-flight record.
pub type SupersessionPolicy = fn(&QueryDescriptor, &QueryRecord) -> DuplicateAction;

/// Default policy: read requests join an in-flight duplicate, mutating
/// methods supersede it.
fn default_supersession_policy(
    incoming: &QueryDescriptor,
    _in_flight: &QueryRecord,
) -> DuplicateAction {
    if incoming.method().is_read() {
        DuplicateAction::Join
    } else {
        DuplicateAction::Supersede
    }
}

/// Per-dispatch settings.
///
/// # Example
///
/// ```ignore
/// let options = DispatchOptions {
///     optimistic: true,
///     timeout: Some(Duration::from_secs(5)),
///     ..Default::default()
/// };
/// let handle = client.dispatch_mutation(descriptor, options)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Pre-apply the descriptor's optimistic table before the network call.
    /// Honored by [`QueryClient::dispatch_mutation`] only.
    pub optimistic: bool,
    /// Settle the call as a transport failure if no response arrives within
    /// the given duration.
    pub timeout: Option<Duration>,
    /// Override the client's supersession policy for this dispatch.
    pub on_duplicate: Option<DuplicateAction>,
}

// ============================================================================
// Client
// ============================================================================

/// The client owns all query and entity state and orchestrates requests:
/// it deduplicates concurrent identical queries, issues network calls over
/// the injected [`Transport`], applies optimistic updates, merges responses
/// into the entity store, and cancels or supersedes in-flight calls.
///
/// This is cheap to clone - all data is behind `Arc`. There is no implicit
/// global instance: construct one client at startup and use
/// [`reset`](Self::reset) for teardown between tests.
///
/// Dispatch methods spawn onto the ambient tokio runtime, so the client must
/// be used from within one.
///
/// # Example
///
/// ```ignore
/// use query_wire::{Method, QueryClient, QueryDescriptor};
///
/// let client = QueryClient::new(transport);
/// let descriptor = QueryDescriptor::builder(Method::Get, "/api/name")
///     .update("name", |_current, next| {
///         next.cloned().unwrap_or(serde_json::Value::Null)
///     })
///     .build()?;
///
/// let handle = client.dispatch_query(descriptor)?;
/// let settlement = handle.settled().await;
/// assert!(settlement.is_success());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    pub(crate) core: Arc<ClientCore>,
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::builder(transport).build()
    }

    /// Create a builder for customizing the client.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = QueryClient::builder(transport)
    ///     .supersession_policy(|_incoming, _in_flight| DuplicateAction::Join)
    ///     .retain_settled(64)
    ///     .build();
    /// ```
    pub fn builder(transport: impl Transport + 'static) -> QueryClientBuilder {
        QueryClientBuilder::new(Arc::new(transport))
    }

    /// Dispatch a read query.
    ///
    /// If the signature already has a pending call the supersession policy
    /// decides whether this dispatch joins it or supersedes it; the default
    /// policy joins for read methods. Optimistic tables are never applied on
    /// the query path.
    pub fn dispatch_query(&self, descriptor: QueryDescriptor) -> Result<QueryHandle, QueryError> {
        self.dispatch(descriptor, DispatchOptions::default(), false)
    }

    /// Dispatch a read query with per-dispatch settings.
    pub fn dispatch_query_with(
        &self,
        descriptor: QueryDescriptor,
        options: DispatchOptions,
    ) -> Result<QueryHandle, QueryError> {
        self.dispatch(descriptor, options, false)
    }

    /// Dispatch a mutation.
    ///
    /// With `options.optimistic` set, the descriptor's optimistic table is
    /// applied to the entity store before the network call and rolled back
    /// exactly if the call fails or is cancelled. The default policy
    /// supersedes an in-flight duplicate: latest wins.
    pub fn dispatch_mutation(
        &self,
        descriptor: QueryDescriptor,
        options: DispatchOptions,
    ) -> Result<QueryHandle, QueryError> {
        self.dispatch(descriptor, options, true)
    }

    fn dispatch(
        &self,
        descriptor: QueryDescriptor,
        options: DispatchOptions,
        mutation: bool,
    ) -> Result<QueryHandle, QueryError> {
        let descriptor = Arc::new(descriptor);
        let signature = QuerySignature::of(&descriptor);
        let identity = Arc::new(RequestIdentity::of(&descriptor));
        let optimistic = mutation && options.optimistic && descriptor.has_optimistic_update();
        let request = HttpRequest {
            method: descriptor.method(),
            url: descriptor.url().to_string(),
            headers: descriptor.headers().to_vec(),
            body: descriptor.body().cloned(),
        };

        let mut state = self.core.state.lock();

        // The signature is a hash; the retained request fields are what
        // prove two dispatches are the same logical query.
        if let Some(existing) = state.records.get(&signature) {
            if *existing.identity != *identity {
                let collision = QueryError::SignatureCollision {
                    signature,
                    existing: existing.identity.render(),
                    incoming: identity.render(),
                };
                error!(
                    %signature,
                    existing = %existing.identity.render(),
                    incoming = %identity.render(),
                    "signature collision"
                );
                return Err(collision);
            }
        }

        let duplicate = match state.records.get(&signature) {
            Some(record) if record.status == QueryStatus::Pending => Some(
                options
                    .on_duplicate
                    .unwrap_or_else(|| (self.core.policy)(&descriptor, record)),
            ),
            _ => None,
        };

        match duplicate {
            Some(DuplicateAction::Join) => {
                if let Some(handle) = self.core.join_locked(&mut state, signature) {
                    return Ok(handle);
                }
                // No live pending entry after all; issue a fresh call below.
            }
            Some(DuplicateAction::Supersede) => {
                self.core.supersede_locked(&mut state, signature);
            }
            None => {}
        }

        state.epoch_counter += 1;
        let epoch = state.epoch_counter;
        let snapshot = if optimistic {
            Some(Snapshot::capture_and_apply(
                &mut state.entities,
                descriptor.optimistic_update(),
            ))
        } else {
            None
        };
        let (abort_tx, abort_rx) = oneshot::channel();
        let (settle_tx, receiver) = watch::channel(None);
        state.records.insert(
            signature,
            QueryRecord::issued(signature, identity, optimistic, Instant::now()),
        );
        state.pending.insert(
            signature,
            PendingRequest {
                epoch,
                descriptor: descriptor.clone(),
                abort: Some(abort_tx),
                snapshot,
                settle_tx,
                followers: 0,
            },
        );
        debug!(
            %signature,
            method = %descriptor.method(),
            url = descriptor.url(),
            mutation,
            optimistic,
            "issuing request"
        );
        self.core
            .emit(signature, Transition::Issued { mutation, optimistic });
        drop(state);

        self.core
            .clone()
            .spawn_call(signature, epoch, request, options.timeout, abort_rx);
        Ok(QueryHandle {
            signature,
            receiver,
            follower: false,
        })
    }

    /// Cancel the pending call for a signature.
    ///
    /// Fires the abort signal, rolls back any optimistic snapshot, and
    /// settles the record as cancelled. A response that arrives after the
    /// cancellation is discarded and never merges; cancel wins. Returns
    /// `false` if nothing was pending.
    pub fn cancel(&self, signature: &QuerySignature) -> bool {
        let mut state = self.core.state.lock();
        let Some(pending) = state.pending.remove(signature) else {
            debug!(%signature, "cancel requested with no pending call");
            return false;
        };
        let pending = self
            .core
            .abort_pending(&mut state, pending, CancelReason::Explicit);
        self.core.settle_locked(
            &mut state,
            *signature,
            Outcome::Cancelled(CancelReason::Explicit),
            &pending.settle_tx,
        );
        debug!(%signature, "cancelled in-flight request");
        self.core.emit(
            *signature,
            Transition::Cancelled {
                reason: CancelReason::Explicit,
            },
        );
        true
    }

    /// Drop the settled record for a signature.
    ///
    /// Returns `false` if the signature is unknown or still pending; an
    /// in-flight call must be cancelled, not invalidated.
    pub fn invalidate(&self, signature: &QuerySignature) -> bool {
        let mut state = self.core.state.lock();
        let settled = state
            .records
            .get(signature)
            .is_some_and(|record| record.status.is_settled());
        if settled {
            state.records.remove(signature);
            debug!(%signature, "invalidated settled record");
        }
        settled
    }

    /// Abort everything in flight and clear both stores.
    ///
    /// Pending calls settle as cancelled with [`CancelReason::Shutdown`].
    /// This is the teardown hook for test isolation.
    pub fn reset(&self) {
        let mut state = self.core.state.lock();
        let pending: Vec<(QuerySignature, PendingRequest)> = state.pending.drain().collect();
        for (signature, mut pending) in pending {
            if let Some(abort) = pending.abort.take() {
                let _ = abort.send(CancelReason::Shutdown);
            }
            let _ = pending.settle_tx.send(Some(Settlement {
                signature,
                outcome: Outcome::Cancelled(CancelReason::Shutdown),
            }));
            self.core.emit(
                signature,
                Transition::Cancelled {
                    reason: CancelReason::Shutdown,
                },
            );
        }
        state.records.clear();
        state.settled_order.clear();
        state.entities.clear();
        debug!("client state reset");
    }

    /// Subscribe to lifecycle events.
    ///
    /// Events are emitted in transition order. The channel is lossy: a
    /// subscriber that falls behind lags rather than backpressuring the
    /// client.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.core.events.subscribe()
    }
}

// ============================================================================
// Core state and completion
// ============================================================================

pub(crate) struct ClientCore {
    transport: Arc<dyn Transport>,
    policy: SupersessionPolicy,
    retain_settled: usize,
    events: broadcast::Sender<QueryEvent>,
    pub(crate) state: Mutex<CoreState>,
}

pub(crate) struct CoreState {
    pub(crate) entities: EntityStore,
    pub(crate) records: HashMap<QuerySignature, QueryRecord, ahash::RandomState>,
    pending: HashMap<QuerySignature, PendingRequest, ahash::RandomState>,
    settled_order: VecDeque<(QuerySignature, u64)>,
    epoch_counter: u64,
    settle_seq: u64,
}

impl CoreState {
    fn new() -> Self {
        Self {
            entities: EntityStore::new(),
            records: HashMap::with_hasher(ahash::RandomState::new()),
            pending: HashMap::with_hasher(ahash::RandomState::new()),
            settled_order: VecDeque::new(),
            epoch_counter: 0,
            settle_seq: 0,
        }
    }
}

/// Runtime-only bookkeeping for one issued network call.
///
/// Owned exclusively by the client; dropped when the call settles or is
/// replaced. The epoch ties completions to this exact call.
struct PendingRequest {
    epoch: u64,
    descriptor: Arc<QueryDescriptor>,
    abort: Option<oneshot::Sender<CancelReason>>,
    snapshot: Option<Snapshot>,
    settle_tx: watch::Sender<Option<Settlement>>,
    followers: usize,
}

impl ClientCore {
    fn emit(&self, signature: QuerySignature, transition: Transition) {
        let _ = self.events.send(QueryEvent {
            signature,
            transition,
        });
    }

    fn join_locked(
        &self,
        state: &mut CoreState,
        signature: QuerySignature,
    ) -> Option<QueryHandle> {
        let pending = state.pending.get_mut(&signature)?;
        pending.followers += 1;
        let receiver = pending.settle_tx.subscribe();
        debug!(%signature, followers = pending.followers, "joined in-flight request");
        self.emit(signature, Transition::Joined);
        Some(QueryHandle {
            signature,
            receiver,
            follower: true,
        })
    }

    /// Cancel the pending call so a fresh dispatch can replace it.
    ///
    /// The old call's followers observe a cancelled settlement; its record
    /// is overwritten by the replacement immediately after, so it never
    /// settles on its own.
    fn supersede_locked(&self, state: &mut CoreState, signature: QuerySignature) {
        let Some(pending) = state.pending.remove(&signature) else {
            return;
        };
        let pending = self.abort_pending(state, pending, CancelReason::Superseded);
        let _ = pending.settle_tx.send(Some(Settlement {
            signature,
            outcome: Outcome::Cancelled(CancelReason::Superseded),
        }));
        debug!(%signature, "superseded in-flight request");
        self.emit(signature, Transition::Superseded);
    }

    /// Fire the abort signal and roll back the optimistic snapshot.
    fn abort_pending(
        &self,
        state: &mut CoreState,
        mut pending: PendingRequest,
        reason: CancelReason,
    ) -> PendingRequest {
        if let Some(abort) = pending.abort.take() {
            let _ = abort.send(reason);
        }
        if let Some(snapshot) = pending.snapshot.take() {
            snapshot.rollback(&mut state.entities);
        }
        pending
    }

    fn spawn_call(
        self: Arc<Self>,
        signature: QuerySignature,
        epoch: u64,
        request: HttpRequest,
        timeout: Option<Duration>,
        abort_rx: oneshot::Receiver<CancelReason>,
    ) {
        tokio::spawn(async move {
            let transport = self.transport.clone();
            let call = async {
                match timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, transport.send(request)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(anyhow::anyhow!("request timed out after {:?}", limit)),
                        }
                    }
                    None => transport.send(request).await,
                }
            };
            tokio::select! {
                biased;
                // The state transition already happened when the abort
                // fired; only the transport future is left to drop.
                _ = abort_rx => {}
                outcome = call => self.complete(signature, epoch, outcome),
            }
        });
    }

    /// Apply the outcome of an issued call.
    ///
    /// The epoch ties the outcome to the exact call that produced it: if
    /// the signature was cancelled or superseded in the meantime, the entry
    /// is gone or carries a newer epoch and the outcome is discarded without
    /// touching the entity store.
    fn complete(
        &self,
        signature: QuerySignature,
        epoch: u64,
        outcome: Result<HttpResponse, anyhow::Error>,
    ) {
        let mut state = self.state.lock();
        let pending = match state.pending.entry(signature) {
            Entry::Occupied(entry) if entry.get().epoch == epoch => entry.remove(),
            _ => {
                trace!(%signature, epoch, "discarding outcome of replaced or cancelled call");
                return;
            }
        };
        match outcome {
            Ok(response) if response.is_success() => {
                self.resolve_success(&mut state, signature, pending, response);
            }
            Ok(response) => {
                let error = QueryError::Http {
                    status: response.status,
                    body: response.body,
                };
                self.resolve_failure(&mut state, signature, pending, error);
            }
            Err(err) => {
                self.resolve_failure(&mut state, signature, pending, QueryError::transport(err));
            }
        }
    }

    fn resolve_success(
        &self,
        state: &mut CoreState,
        signature: QuerySignature,
        pending: PendingRequest,
        response: HttpResponse,
    ) {
        let partials = match pending.descriptor.transform() {
            Some(transform) => transform(&response.body),
            None => match &response.body {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            },
        };
        // Every registered key merges exactly once, in completion order
        // relative to other resolutions touching the same keys.
        for (key, merge) in pending.descriptor.update() {
            let next = partials.get(key.as_str());
            state.entities.write_with(key, |current| merge(current, next));
            trace!(%signature, key, "merged entity");
        }
        if let Some(snapshot) = pending.snapshot {
            snapshot.commit();
        }
        let http_status = response.status;
        self.settle_locked(
            state,
            signature,
            Outcome::Success { http_status },
            &pending.settle_tx,
        );
        debug!(%signature, http_status, "request succeeded");
        self.emit(signature, Transition::Succeeded { http_status });
    }

    fn resolve_failure(
        &self,
        state: &mut CoreState,
        signature: QuerySignature,
        pending: PendingRequest,
        error: QueryError,
    ) {
        if let Some(snapshot) = pending.snapshot {
            snapshot.rollback(&mut state.entities);
        }
        self.settle_locked(
            state,
            signature,
            Outcome::Failure(error.clone()),
            &pending.settle_tx,
        );
        debug!(%signature, %error, "request failed");
        self.emit(signature, Transition::Failed { error });
    }

    /// Settle the record for a signature and notify every handle.
    fn settle_locked(
        &self,
        state: &mut CoreState,
        signature: QuerySignature,
        outcome: Outcome,
        settle_tx: &watch::Sender<Option<Settlement>>,
    ) {
        state.settle_seq += 1;
        let seq = state.settle_seq;
        let settlement = Settlement { signature, outcome };
        if let Some(record) = state.records.get_mut(&signature) {
            record.status = settlement.status();
            record.finished_at = Some(Instant::now());
            record.http_status = settlement.http_status();
            record.error = settlement.error().cloned();
            record.settle_seq = seq;
        }
        state.settled_order.push_back((signature, seq));
        self.evict_locked(state);
        let _ = settle_tx.send(Some(settlement));
    }

    /// Evict oldest-settled records past the retention bound.
    ///
    /// Entries whose signature settled again since being queued are stale
    /// and are skipped; a pending record is never evicted.
    fn evict_locked(&self, state: &mut CoreState) {
        while state.settled_order.len() > self.retain_settled {
            let Some((signature, seq)) = state.settled_order.pop_front() else {
                break;
            };
            let evict = state.records.get(&signature).is_some_and(|record| {
                record.settle_seq == seq && record.status.is_settled()
            });
            if evict {
                state.records.remove(&signature);
                debug!(%signature, "evicted settled record");
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// A subscription to the settlement of one issued call.
///
/// Returned by the dispatch methods. Both the dispatching handle and every
/// joined follower observe the same settlement, exactly once per network
/// call. Dropping a handle does not cancel the call; use
/// [`QueryClient::cancel`].
#[derive(Debug)]
pub struct QueryHandle {
    signature: QuerySignature,
    receiver: watch::Receiver<Option<Settlement>>,
    follower: bool,
}

impl QueryHandle {
    /// The signature of the dispatched query.
    pub fn signature(&self) -> QuerySignature {
        self.signature
    }

    /// Returns `true` if this handle joined an already-pending call rather
    /// than issuing one.
    pub fn is_follower(&self) -> bool {
        self.follower
    }

    /// Wait for the call to settle.
    ///
    /// Resolves as soon as the settlement is published, even if it was
    /// published before this is awaited. If the client is dropped while the
    /// call is in flight, resolves as cancelled with
    /// [`CancelReason::Shutdown`].
    pub async fn settled(mut self) -> Settlement {
        loop {
            let current = self.receiver.borrow_and_update().clone();
            if let Some(settlement) = current {
                return settlement;
            }
            if self.receiver.changed().await.is_err() {
                return Settlement {
                    signature: self.signature,
                    outcome: Outcome::Cancelled(CancelReason::Shutdown),
                };
            }
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`QueryClient`] with customizable settings.
///
/// # Example
///
/// ```ignore
/// use query_wire::{DuplicateAction, QueryClient};
///
/// // Mutations queue behind an in-flight duplicate instead of replacing it.
/// let client = QueryClient::builder(transport)
///     .supersession_policy(|_incoming, _in_flight| DuplicateAction::Join)
///     .build();
/// ```
pub struct QueryClientBuilder {
    transport: Arc<dyn Transport>,
    policy: SupersessionPolicy,
    retain_settled: usize,
    event_capacity: usize,
}

impl QueryClientBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            policy: default_supersession_policy,
            retain_settled: 256,
            event_capacity: 64,
        }
    }

    /// Set the policy deciding whether a dispatch joins or supersedes an
    /// in-flight duplicate. [`DispatchOptions::on_duplicate`] overrides it
    /// per dispatch.
    ///
    /// The default joins read methods and supersedes everything else.
    pub fn supersession_policy(mut self, policy: SupersessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how many settled records to retain before evicting
    /// oldest-settled-first. Pending records are never evicted.
    ///
    /// Defaults to 256.
    pub fn retain_settled(mut self, limit: usize) -> Self {
        self.retain_settled = limit;
        self
    }

    /// Set the lifecycle event channel capacity.
    ///
    /// Defaults to 64.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Build the client with the configured settings.
    pub fn build(self) -> QueryClient {
        let (events, _) = broadcast::channel(self.event_capacity);
        QueryClient {
            core: Arc::new(ClientCore {
                transport: self.transport,
                policy: self.policy,
                retain_settled: self.retain_settled,
                events,
                state: Mutex::new(CoreState::new()),
            }),
        }
    }
}
