// Correlation of in-flight requests with their responses.
//
// One table per connection. The receive loop delivers every inbound message
// here; callers hold a `PendingRequest` (and optionally an intermediate-response
// stream) for each request they sent.

use crate::error::{LdapError, Result};
use crate::message::{LdapMessage, MAX_MESSAGE_ID};
use crate::metrics::ClientMetrics;
use crate::protocol::is_final_response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

pub type ResponseResult = Result<LdapMessage>;

struct Entry {
    response_tx: oneshot::Sender<ResponseResult>,
    intermediate_tx: Option<mpsc::UnboundedSender<LdapMessage>>,
    timer: Option<AbortHandle>,
    registered_at: Instant,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<i32, Entry>,
    /// Set once the connection has failed; later registrations are refused.
    closed: Option<String>,
    last_activity: Option<Instant>,
}

pub struct PendingTable {
    endpoint: String,
    state: Mutex<TableState>,
    next_id: AtomicI32,
    timeouts: AtomicU64,
    metrics: Option<Arc<ClientMetrics>>,
}

impl PendingTable {
    pub fn new(endpoint: impl Into<String>) -> Arc<Self> {
        Self::with_metrics(endpoint, None)
    }

    pub fn with_metrics(endpoint: impl Into<String>, metrics: Option<Arc<ClientMetrics>>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            state: Mutex::new(TableState::default()),
            next_id: AtomicI32::new(1),
            timeouts: AtomicU64::new(0),
            metrics,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // a panic while holding the lock cannot leave the map half-updated
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next id in 1..=i32::MAX, wrapping back to 1.
    pub fn next_message_id(&self) -> i32 {
        let previous = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id >= MAX_MESSAGE_ID { 1 } else { id + 1 })
            })
            .unwrap_or(1);
        previous.max(1)
    }

    /// Register a request under a caller-chosen id.
    pub fn register(self: &Arc<Self>, message_id: i32) -> Result<PendingRequest> {
        let mut state = self.lock();
        self.ensure_open(&state)?;
        if state.entries.contains_key(&message_id) {
            return Err(LdapError::DuplicateMessageId(message_id));
        }
        Ok(self.insert(&mut state, message_id, None))
    }

    /// Allocate a fresh id and register it, skipping ids still outstanding
    /// after wraparound.
    pub fn register_next(self: &Arc<Self>) -> Result<PendingRequest> {
        let mut state = self.lock();
        self.ensure_open(&state)?;
        let id = self.free_id(&state);
        Ok(self.insert(&mut state, id, None))
    }

    /// Like `register_next`, also routing intermediate responses to a stream.
    pub fn register_streaming(self: &Arc<Self>) -> Result<(PendingRequest, IntermediateStream)> {
        let mut state = self.lock();
        self.ensure_open(&state)?;
        let id = self.free_id(&state);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = self.insert(&mut state, id, Some(tx));
        Ok((pending, IntermediateStream { rx }))
    }

    fn ensure_open(&self, state: &TableState) -> Result<()> {
        match &state.closed {
            Some(reason) => Err(LdapError::ConnectionClosed {
                endpoint: self.endpoint.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn free_id(&self, state: &TableState) -> i32 {
        loop {
            let id = self.next_message_id();
            if !state.entries.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(
        self: &Arc<Self>,
        state: &mut TableState,
        message_id: i32,
        intermediate_tx: Option<mpsc::UnboundedSender<LdapMessage>>,
    ) -> PendingRequest {
        let (response_tx, response_rx) = oneshot::channel();
        let now = Instant::now();
        if state.entries.is_empty() {
            state.last_activity = Some(now);
        }
        state.entries.insert(
            message_id,
            Entry {
                response_tx,
                intermediate_tx,
                timer: None,
                registered_at: now,
            },
        );
        PendingRequest {
            message_id,
            response_rx,
            table: Arc::downgrade(self),
        }
    }

    /// Fail the request with `Timeout` unless it completes within `after`.
    pub fn arm_timeout(self: &Arc<Self>, message_id: i32, after: Duration) {
        let weak = Arc::downgrade(self);
        let endpoint = self.endpoint.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(table) = weak.upgrade() else {
                return;
            };
            let entry = table.lock().entries.remove(&message_id);
            if let Some(entry) = entry {
                debug!(endpoint = %endpoint, message_id, ?after, "request timed out");
                table.timeouts.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &table.metrics {
                    metrics.inc_timeout();
                }
                let _ = entry.response_tx.send(Err(LdapError::Timeout {
                    endpoint,
                    message_id,
                    after,
                }));
            }
        });
        let handle = timer.abort_handle();
        let mut state = self.lock();
        match state.entries.get_mut(&message_id) {
            Some(entry) => entry.timer = Some(handle),
            None => handle.abort(),
        }
    }

    /// Complete a request. Returns how long it was outstanding, or `None` when
    /// the id is unknown (late, duplicate or already cancelled).
    pub fn fulfill(&self, message_id: i32, result: ResponseResult) -> Option<Duration> {
        let entry = {
            let mut state = self.lock();
            state.last_activity = Some(Instant::now());
            state.entries.remove(&message_id)
        };
        let Some(entry) = entry else {
            debug!(endpoint = %self.endpoint, message_id, "discarding response for unknown message id");
            return None;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        if entry.response_tx.send(result).is_err() {
            trace!(endpoint = %self.endpoint, message_id, "requester went away before response");
        }
        Some(entry.registered_at.elapsed())
    }

    /// Route one inbound message. Non-final responses go to the request's
    /// intermediate stream (dropped if it has none); final ones complete it.
    pub fn deliver(&self, message: LdapMessage) -> Option<Duration> {
        let message_id = message.message_id;
        if is_final_response(message.op_tag()) {
            return self.fulfill(message_id, Ok(message));
        }
        let tag = message.op_tag();
        let receiver_gone = {
            let mut state = self.lock();
            state.last_activity = Some(Instant::now());
            let sent = match state.entries.get(&message_id) {
                None => None,
                Some(entry) => Some(match &entry.intermediate_tx {
                    Some(tx) => tx.send(message).is_ok(),
                    None => true,
                }),
            };
            match sent {
                None => {
                    debug!(endpoint = %self.endpoint, message_id, %tag, "discarding intermediate response for unknown message id");
                    return None;
                }
                // stream receiver dropped: the caller gave up on this request
                Some(false) => state.entries.remove(&message_id),
                Some(true) => None,
            }
        };
        if let Some(timer) = receiver_gone.and_then(|entry| entry.timer) {
            timer.abort();
        }
        None
    }

    /// Remove a request without completing it. Its waiter observes `Cancelled`.
    pub fn cancel(&self, message_id: i32) -> bool {
        let entry = self.lock().entries.remove(&message_id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(i32, Entry)> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (message_id, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.response_tx.send(Err(LdapError::ConnectionClosed {
                endpoint: self.endpoint.clone(),
                reason: reason.to_string(),
            }));
            trace!(endpoint = %self.endpoint, message_id, "failed outstanding request");
        }
        if count > 0 {
            debug!(endpoint = %self.endpoint, count, reason, "failed all outstanding requests");
        }
        count
    }

    /// Requests failed by their deadline so far.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn contains(&self, message_id: i32) -> bool {
        self.lock().entries.contains_key(&message_id)
    }

    /// How long requests have been outstanding without any inbound traffic.
    /// `None` when nothing is outstanding.
    pub fn stalled_for(&self) -> Option<Duration> {
        let state = self.lock();
        if state.entries.is_empty() {
            return None;
        }
        state.last_activity.map(|t| t.elapsed())
    }
}

/// Caller's half of an outstanding request. Dropping it before the response
/// arrives removes the request from the table.
#[derive(Debug)]
pub struct PendingRequest {
    message_id: i32,
    response_rx: oneshot::Receiver<ResponseResult>,
    table: Weak<PendingTable>,
}

impl PendingRequest {
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Wait for the final response (or the error that replaced it).
    pub async fn wait(mut self) -> Result<LdapMessage> {
        match (&mut self.response_rx).await {
            Ok(result) => result,
            Err(_) => Err(LdapError::Cancelled {
                message_id: self.message_id,
            }),
        }
    }

    /// Stop waiting; a late response is discarded. Nothing is sent to the server.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        // only an entry still waiting is ours; a settled id may already be reused
        if !matches!(self.response_rx.try_recv(), Err(TryRecvError::Empty)) {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            if table.cancel(self.message_id) {
                trace!(endpoint = %table.endpoint, message_id = self.message_id, "request handle dropped");
            }
        }
    }
}

/// Intermediate responses (search entries, references, intermediate
/// responses) for a streaming request, in arrival order.
#[derive(Debug)]
pub struct IntermediateStream {
    rx: mpsc::UnboundedReceiver<LdapMessage>,
}

impl IntermediateStream {
    /// Next intermediate response; `None` once the request has completed.
    pub async fn next(&mut self) -> Option<LdapMessage> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<LdapMessage> {
        self.rx.try_recv().ok()
    }
}
