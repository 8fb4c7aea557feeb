//! Scripted transport and small helpers shared across the test suite.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use query_wire::{HttpRequest, HttpResponse, Method, Transport};
use serde_json::Value;
use tokio::sync::oneshot;

/// One scripted reply for a method + url.
pub enum Reply {
    /// Respond as soon as the call arrives.
    Now(Result<HttpResponse, String>),
    /// Hold the response until the paired gate sender fires.
    Gated(oneshot::Receiver<Result<HttpResponse, String>>),
    /// Never respond.
    Hang,
}

/// Transport that serves queued replies keyed by `"METHOD url"` and counts
/// every call it receives.
///
/// Replies for the same method + url are consumed in FIFO order. A call with
/// no scripted reply fails with a transport error naming the request, which
/// keeps a mis-scripted test loud instead of hanging.
#[derive(Clone, Default)]
pub struct MockTransport {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: Method, url: &str) -> String {
        format!("{method} {url}")
    }

    /// Queue a reply.
    pub fn script(&self, method: Method, url: &str, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(Self::key(method, url))
            .or_default()
            .push_back(reply);
    }

    /// Queue a gated reply and return the sender that releases it.
    pub fn gate(&self, method: Method, url: &str) -> oneshot::Sender<Result<HttpResponse, String>> {
        let (tx, rx) = oneshot::channel();
        self.script(method, url, Reply::Gated(rx));
        tx
    }

    /// Total calls issued through this transport.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(request.method, &request.url);
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match reply {
            Some(Reply::Now(Ok(response))) => Ok(response),
            Some(Reply::Now(Err(message))) => Err(anyhow::anyhow!(message)),
            Some(Reply::Gated(rx)) => match rx.await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(message)) => Err(anyhow::anyhow!(message)),
                // Gate dropped: behave like a hung connection.
                Err(_) => std::future::pending().await,
            },
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(anyhow::anyhow!("no scripted reply for {key}")),
        }
    }
}

/// A 200 reply carrying the given JSON body.
pub fn ok(body: Value) -> Reply {
    Reply::Now(Ok(HttpResponse { status: 200, body }))
}

/// A reply with an explicit HTTP status.
pub fn status(status: u16, body: Value) -> Reply {
    Reply::Now(Ok(HttpResponse { status, body }))
}

/// A transport-level failure.
pub fn fail(message: &str) -> Reply {
    Reply::Now(Err(message.to_string()))
}

/// Merge function that takes the incoming value wholesale.
pub fn replace(_current: Option<&Value>, next: Option<&Value>) -> Value {
    next.cloned().unwrap_or(Value::Null)
}

/// Let spawned request tasks run until they park.
///
/// The suite runs on the current-thread runtime, so task progress only
/// happens at await points in the test itself.
pub async fn yield_to_tasks() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
