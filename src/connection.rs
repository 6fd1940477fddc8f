//! A single LDAP connection.
//!
//! Each connection owns one transport, a pending-request table and a spawned
//! receive loop. Requests may be issued concurrently from any number of tasks;
//! writes are serialized so every envelope goes out whole, and responses are
//! routed back by message id in whatever order the server sends them.
//!
//! ```text
//! Disconnected -> Connecting -> Established -> Bound
//!                     |             |  \         |
//!                     v             |   ClosingByPeer / ClosingByClient
//!                   Closed <--------+------------+---> Closed
//! ```

use crate::ber::{DecodeLimits, Element};
use crate::debug::DebugHandle;
use crate::error::{ConnectPhase, LdapError, Result};
use crate::message::{self, Control, LdapMessage};
use crate::metrics::{ClientMetrics, ConnectionStatistics, ConnectionStatisticsSnapshot};
use crate::pending::{IntermediateStream, PendingRequest, PendingTable};
use crate::protocol::{
    self, is_final_response, operation_name, BindRequest, BindResponse, ExtendedRequest,
    ExtendedResponse, FromElement, ResultCode, ToElement, NOTICE_OF_DISCONNECTION_OID,
    UNSOLICITED_MESSAGE_ID,
};
use crate::sasl::{self, SaslMechanism, DEFAULT_MAX_SASL_ROUNDS};
use crate::stream::ElementReader;
use crate::tls::TlsSettings;
use crate::transport::{self, ServerEndpoint, Transport};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the best-effort unbind during `close`.
const UNBIND_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on resolve + TCP connect + ldaps handshake, and on a StartTLS handshake.
    pub connect_timeout: Duration,
    /// Deadline applied to requests that do not set their own.
    pub response_timeout: Option<Duration>,
    /// Fail the connection when requests are outstanding and nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    pub decode_limits: DecodeLimits,
    pub max_sasl_rounds: u32,
    pub debug: DebugHandle,
    /// Shared traffic counters, usually owned by a server set.
    pub metrics: Option<Arc<ClientMetrics>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: None,
            idle_timeout: None,
            decode_limits: DecodeLimits::default(),
            max_sasl_rounds: DEFAULT_MAX_SASL_ROUNDS,
            debug: DebugHandle::default(),
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Established,
    Bound,
    ClosingByPeer,
    ClosingByClient,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Established)
                | (Connecting, Closed)
                | (Established, Bound)
                | (Established, ClosingByPeer)
                | (Established, ClosingByClient)
                // failed transport upgrade
                | (Established, Closed)
                | (Bound, ClosingByPeer)
                | (Bound, ClosingByClient)
                | (ClosingByPeer, Closed)
                | (ClosingByClient, Closed)
        )
    }

    /// Requests may be sent.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::Bound)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::Bound => "bound",
            ConnectionState::ClosingByPeer => "closing (peer)",
            ConnectionState::ClosingByClient => "closing (client)",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

type Reader = ElementReader<ReadHalf<Transport>>;
type Writer = WriteHalf<Transport>;

enum ReaderCommand {
    /// Stop reading and hand the reader back.
    Pause(oneshot::Sender<Reader>),
}

struct ReaderControl {
    commands: mpsc::UnboundedSender<ReaderCommand>,
    task: JoinHandle<()>,
}

enum WriterCommand {
    /// One whole encoded envelope.
    Write {
        bytes: Bytes,
        operation: &'static str,
        done: oneshot::Sender<Result<()>>,
    },
    /// Hand the write half over and park until a replacement arrives.
    Suspend {
        handover: oneshot::Sender<Writer>,
        resume: oneshot::Receiver<Writer>,
    },
    /// Write the unbind, then shut the stream down.
    Shutdown { bytes: Bytes, done: oneshot::Sender<()> },
}

struct WriterControl {
    commands: mpsc::UnboundedSender<WriterCommand>,
    task: JoinHandle<()>,
}

enum LoopStep {
    Pause(oneshot::Sender<Reader>),
    Stop,
    Read(Result<Option<Element>>),
}

struct Shared {
    id: u64,
    endpoint: ServerEndpoint,
    label: String,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    pending: Arc<PendingTable>,
    writer: Mutex<Option<WriterControl>>,
    reader: Mutex<Option<ReaderControl>>,
    secure: AtomicBool,
    close_reason: Mutex<Option<String>>,
    bound_as: Mutex<Option<String>>,
    statistics: ConnectionStatistics,
    created_at: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            debug!(conn = self.id, endpoint = %self.label, from = %*state, to = %next, "ignoring state transition");
            return false;
        }
        debug!(conn = self.id, endpoint = %self.label, from = %*state, to = %next, "state transition");
        *state = next;
        true
    }

    fn closed_error(&self) -> LdapError {
        LdapError::ConnectionClosed {
            endpoint: self.label.clone(),
            reason: lock(&self.close_reason)
                .clone()
                .unwrap_or_else(|| "not connected".to_string()),
        }
    }

    fn spawn_reader(shared: &Arc<Shared>, reader: Reader) {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(receive_loop(Arc::clone(shared), reader, rx));
        *lock(&shared.reader) = Some(ReaderControl { commands, task });
    }

    async fn pause_reader(&self) -> Result<Reader> {
        let control = lock(&self.reader).take().ok_or_else(|| self.closed_error())?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if control.commands.send(ReaderCommand::Pause(reply_tx)).is_err() {
            return Err(self.closed_error());
        }
        reply_rx.await.map_err(|_| self.closed_error())
    }

    fn stop_reader(&self) {
        if let Some(control) = lock(&self.reader).take() {
            control.task.abort();
        }
    }

    fn spawn_writer(shared: &Arc<Shared>, stream: Writer) {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(Arc::clone(shared), stream, rx));
        *lock(&shared.writer) = Some(WriterControl { commands, task });
    }

    fn enqueue(&self, command: WriterCommand) -> Result<()> {
        let queued = match lock(&self.writer).as_ref() {
            Some(control) => control.commands.send(command).is_ok(),
            None => false,
        };
        if queued {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn release_writer(&self) {
        if let Some(control) = lock(&self.writer).take() {
            control.task.abort();
        }
    }

    /// Connection-fatal failure: fail every outstanding request, then close.
    fn fail(&self, error: LdapError, via: Option<ConnectionState>) {
        let reason = error.to_string();
        if let Some(closing) = via {
            self.transition(closing);
        }
        warn!(conn = self.id, endpoint = %self.label, error = %reason, "connection failed");
        self.options.debug.exception(&self.label, &error);
        lock(&self.close_reason).get_or_insert_with(|| reason.clone());
        self.pending.fail_all(&reason);
        self.transition(ConnectionState::Closed);
        self.stop_reader();
        self.release_writer();
    }

    fn arm_deadline(&self, message_id: i32, timeout: Option<Duration>) {
        if let Some(after) = timeout.or(self.options.response_timeout) {
            self.pending.arm_timeout(message_id, after);
        }
    }

    /// Queue one envelope and wait until it is on the wire. Dropping the
    /// returned future does not cut the envelope short.
    async fn write_message(&self, message: &LdapMessage) -> Result<()> {
        let element = message.to_element();
        self.options.debug.message_sent(&self.label, message);
        self.options.debug.asn1(&self.label, "write", &element);
        let (done, written) = oneshot::channel();
        self.enqueue(WriterCommand::Write {
            bytes: element.encode(),
            operation: operation_name(message.op_tag()),
            done,
        })?;
        written.await.unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// Route one inbound element. An error return is connection-fatal.
    fn dispatch(&self, element: Element) -> Result<()> {
        self.options.debug.asn1(&self.label, "read", &element);
        self.statistics.inc_bytes_received(element.encoded_len());
        match message::unframe(element) {
            Ok(message) => {
                self.options.debug.message_received(&self.label, &message);
                if message.message_id == UNSOLICITED_MESSAGE_ID {
                    return self.handle_unsolicited(message);
                }
                let tag = message.op_tag();
                if !is_final_response(tag) {
                    self.statistics.inc_intermediate();
                }
                if let Some(elapsed) = self.pending.deliver(message) {
                    self.statistics.observe_response(elapsed);
                    if let Some(metrics) = &self.options.metrics {
                        metrics.observe_duration(operation_name(tag), elapsed);
                    }
                }
                Ok(())
            }
            Err(LdapError::Decoding {
                message_id: Some(id),
                reason,
            }) => {
                warn!(conn = self.id, endpoint = %self.label, message_id = id, %reason, "undecodable response");
                if let Some(metrics) = &self.options.metrics {
                    metrics.inc_decode_error();
                }
                self.pending.fulfill(
                    id,
                    Err(LdapError::Decoding {
                        message_id: Some(id),
                        reason,
                    }),
                );
                Ok(())
            }
            Err(e) => {
                if let Some(metrics) = &self.options.metrics {
                    metrics.inc_decode_error();
                }
                Err(e)
            }
        }
    }

    fn handle_unsolicited(&self, message: LdapMessage) -> Result<()> {
        self.statistics.inc_unsolicited();
        match ExtendedResponse::from_element(&message.protocol_op) {
            Ok(notice) if notice.oid.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) => {
                warn!(
                    conn = self.id,
                    endpoint = %self.label,
                    result_code = %notice.result.result_code,
                    diagnostic = %notice.result.diagnostic_message,
                    "server sent notice of disconnection"
                );
                Err(LdapError::ConnectionClosed {
                    endpoint: self.label.clone(),
                    reason: format!(
                        "notice of disconnection: {} {}",
                        notice.result.result_code, notice.result.diagnostic_message
                    ),
                })
            }
            Ok(notice) => {
                info!(conn = self.id, endpoint = %self.label, oid = ?notice.oid, "unsolicited notification");
                self.options.debug.other(&self.label, "unsolicited notification ignored");
                Ok(())
            }
            Err(e) => {
                warn!(conn = self.id, endpoint = %self.label, error = %e, "ignoring unparseable unsolicited notification");
                Ok(())
            }
        }
    }
}

async fn read_next(shared: &Shared, reader: &mut Reader) -> Result<Option<Element>> {
    let Some(idle) = shared.options.idle_timeout else {
        return reader.read_element().await;
    };
    loop {
        let wait = match shared.pending.stalled_for() {
            Some(stalled) if stalled >= idle => {
                return Err(LdapError::IdleTimeout {
                    endpoint: shared.label.clone(),
                    after: idle,
                })
            }
            Some(stalled) => idle - stalled,
            None => idle,
        };
        // read_element is cancel-safe, so timing out loses nothing
        if let Ok(result) = tokio::time::timeout(wait, reader.read_element()).await {
            return result;
        }
    }
}

/// Sole owner of the write half. Envelopes go out whole and in queue order
/// whatever happens to the tasks that queued them.
async fn write_loop(shared: Arc<Shared>, mut stream: Writer, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Write { bytes, operation, done } => {
                let result = async {
                    stream.write_all(&bytes).await?;
                    stream.flush().await
                }
                .await;
                match result {
                    Ok(()) => {
                        shared.statistics.inc_request(bytes.len());
                        if let Some(metrics) = &shared.options.metrics {
                            metrics.inc_request(&shared.label, operation);
                        }
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = done.send(Err(LdapError::ConnectionClosed {
                            endpoint: shared.label.clone(),
                            reason: format!("write failed: {}", e),
                        }));
                        shared.fail(LdapError::Io(e), Some(ConnectionState::ClosingByPeer));
                        return;
                    }
                }
            }
            WriterCommand::Suspend { handover, resume } => {
                if handover.send(stream).is_err() {
                    return;
                }
                match resume.await {
                    Ok(next) => stream = next,
                    Err(_) => {
                        shared.fail(
                            LdapError::ConnectionClosed {
                                endpoint: shared.label.clone(),
                                reason: "transport upgrade abandoned".to_string(),
                            },
                            None,
                        );
                        return;
                    }
                }
            }
            WriterCommand::Shutdown { bytes, done } => {
                let _ = stream.write_all(&bytes).await;
                let _ = stream.shutdown().await;
                let _ = done.send(());
                return;
            }
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: Reader,
    mut commands: mpsc::UnboundedReceiver<ReaderCommand>,
) {
    loop {
        let step = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(ReaderCommand::Pause(reply)) => LoopStep::Pause(reply),
                None => LoopStep::Stop,
            },
            read = read_next(&shared, &mut reader) => LoopStep::Read(read),
        };
        match step {
            LoopStep::Pause(reply) => {
                let _ = reply.send(reader);
                return;
            }
            LoopStep::Stop => return,
            LoopStep::Read(Ok(Some(element))) => {
                if let Err(e) = shared.dispatch(element) {
                    shared.fail(e, Some(ConnectionState::ClosingByPeer));
                    return;
                }
            }
            LoopStep::Read(Ok(None)) => {
                info!(conn = shared.id, endpoint = %shared.label, "server closed the connection");
                shared.fail(
                    LdapError::ConnectionClosed {
                        endpoint: shared.label.clone(),
                        reason: "connection closed by server".to_string(),
                    },
                    Some(ConnectionState::ClosingByPeer),
                );
                return;
            }
            LoopStep::Read(Err(e)) => {
                shared.fail(e, Some(ConnectionState::ClosingByPeer));
                return;
            }
        }
    }
}

/// Handle to one connection. Dropping it without `close` terminates the
/// connection and fails its outstanding requests.
pub struct LdapConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapConnection")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.label)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl LdapConnection {
    /// Dial `endpoint` and start the receive loop. ldaps:// endpoints complete
    /// their TLS handshake here; StartTLS is a separate step (`start_tls`).
    pub async fn connect(endpoint: ServerEndpoint, options: ConnectionOptions) -> Result<Self> {
        let label = endpoint.to_string();
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            pending: PendingTable::with_metrics(label.clone(), options.metrics.clone()),
            endpoint,
            label,
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            secure: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            bound_as: Mutex::new(None),
            statistics: ConnectionStatistics::new(),
            created_at: Instant::now(),
        });
        shared.transition(ConnectionState::Connecting);
        shared.options.debug.connect(&shared.label, "connecting");

        let stream = match transport::dial(&shared.endpoint, shared.options.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                shared.transition(ConnectionState::Closed);
                *lock(&shared.close_reason) = Some(e.to_string());
                if let Some(metrics) = &shared.options.metrics {
                    metrics.inc_connect_failure();
                }
                shared.options.debug.exception(&shared.label, &e);
                return Err(e);
            }
        };
        let secure = stream.is_tls();
        let (read_half, write_half) = tokio::io::split(stream);
        shared.secure.store(secure, Ordering::Relaxed);
        shared.transition(ConnectionState::Established);
        Shared::spawn_writer(&shared, write_half);
        Shared::spawn_reader(
            &shared,
            ElementReader::new(read_half, shared.options.decode_limits),
        );

        if let Some(metrics) = &shared.options.metrics {
            metrics.inc_connections();
        }
        info!(conn = shared.id, endpoint = %shared.label, tls = secure, "connection established");
        shared.options.debug.connect(&shared.label, "established");
        Ok(Self { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_usable(&self) -> bool {
        self.state().is_usable()
    }

    pub fn is_secure(&self) -> bool {
        self.shared.secure.load(Ordering::Relaxed)
    }

    /// DN (or mechanism) of the last successful bind.
    pub fn bound_as(&self) -> Option<String> {
        lock(&self.shared.bound_as).clone()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.shared.close_reason).clone()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn age(&self) -> Duration {
        self.shared.created_at.elapsed()
    }

    pub fn statistics(&self) -> ConnectionStatisticsSnapshot {
        let mut snapshot = self.shared.statistics.snapshot();
        snapshot.timeouts = self.shared.pending.timeouts();
        snapshot
    }

    fn ensure_usable(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if !state.is_usable() {
            return Err(LdapError::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Send a request and return as soon as it is written. `timeout` (or the
    /// connection's default response timeout) bounds the wait for the final
    /// response; intermediate responses are discarded.
    pub async fn send_async(
        &self,
        protocol_op: Element,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<PendingRequest> {
        self.ensure_usable("send")?;
        let pending = self.shared.pending.register_next()?;
        self.write_registered(pending.message_id(), protocol_op, controls, timeout)
            .await?;
        Ok(pending)
    }

    /// Like `send_async`, with intermediate responses (search entries,
    /// references, intermediate responses) delivered on a stream.
    pub async fn send_streaming(
        &self,
        protocol_op: Element,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<(PendingRequest, IntermediateStream)> {
        self.ensure_usable("send")?;
        let (pending, stream) = self.shared.pending.register_streaming()?;
        self.write_registered(pending.message_id(), protocol_op, controls, timeout)
            .await?;
        Ok((pending, stream))
    }

    async fn write_registered(
        &self,
        message_id: i32,
        protocol_op: Element,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.shared.arm_deadline(message_id, timeout);
        let message = LdapMessage::new(message_id, protocol_op).with_controls(controls);
        if let Err(e) = self.shared.write_message(&message).await {
            self.shared.pending.cancel(message_id);
            return Err(e);
        }
        Ok(())
    }

    /// Send a request and wait for its final response.
    pub async fn send(&self, protocol_op: Element, controls: Vec<Control>) -> Result<LdapMessage> {
        self.send_with_timeout(protocol_op, controls, None).await
    }

    pub async fn send_with_timeout(
        &self,
        protocol_op: Element,
        controls: Vec<Control>,
        timeout: Option<Duration>,
    ) -> Result<LdapMessage> {
        let op = operation_name(protocol_op.tag());
        let result = match self.send_async(protocol_op, controls, timeout).await {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        if let (Err(_), Some(metrics)) = (&result, &self.shared.options.metrics) {
            metrics.inc_error(op);
        }
        result
    }

    /// Stop waiting for `message_id` and tell the server to abandon it. The
    /// server sends no response to an abandon.
    pub async fn abandon(&self, message_id: i32) -> Result<()> {
        self.ensure_usable("abandon")?;
        self.shared.pending.cancel(message_id);
        let id = self.shared.pending.next_message_id();
        let message = LdapMessage::new(id, protocol::abandon_request(message_id));
        self.shared.write_message(&message).await
    }

    /// Stop waiting for `message_id`. Nothing is sent; the server may still
    /// process the request.
    pub fn cancel(&self, message_id: i32) -> bool {
        self.shared.pending.cancel(message_id)
    }

    /// Ask the server to cancel `message_id` (cancel extended operation). The
    /// cancelled request itself completes with result code `canceled`.
    pub async fn cancel_operation(&self, message_id: i32) -> Result<ResultCode> {
        let response = self.extended(ExtendedRequest::cancel(message_id)).await?;
        Ok(response.result.result_code)
    }

    pub async fn extended(&self, request: ExtendedRequest) -> Result<ExtendedResponse> {
        let message = self.send(request.to_element(), Vec::new()).await?;
        ExtendedResponse::from_element(&message.protocol_op)
    }

    /// "Who am I?" extended operation; returns the authorization identity.
    pub async fn who_am_i(&self) -> Result<String> {
        let response = self.extended(ExtendedRequest::who_am_i()).await?;
        if !response.result.result_code.is_success() {
            return Err(LdapError::OperationFailed {
                operation: "who am I",
                result_code: response.result.result_code.0,
                diagnostic: response.result.diagnostic_message,
            });
        }
        Ok(response.authz_id().unwrap_or_default())
    }

    async fn bind_round_trip(&self, request: BindRequest) -> Result<BindResponse> {
        let message = self.send(request.to_element(), Vec::new()).await?;
        BindResponse::from_element(&message.protocol_op)
    }

    fn mark_bound(&self, identity: String) {
        if self.state() == ConnectionState::Established {
            self.shared.transition(ConnectionState::Bound);
        }
        info!(conn = self.shared.id, endpoint = %self.shared.label, identity = %identity, "bound");
        *lock(&self.shared.bound_as) = Some(identity);
    }

    /// Simple bind. A non-success result code is an authentication rejection.
    pub async fn bind_simple(&self, dn: &str, password: &str) -> Result<BindResponse> {
        let request = BindRequest::simple(dn, Bytes::copy_from_slice(password.as_bytes()));
        let response = self.bind_round_trip(request).await?;
        if !response.result.result_code.is_success() {
            return Err(LdapError::AuthenticationRejected {
                endpoint: self.shared.label.clone(),
                mechanism: "SIMPLE".to_string(),
                result_code: response.result.result_code.0,
                diagnostic: response.result.diagnostic_message,
            });
        }
        self.mark_bound(dn.to_string());
        Ok(response)
    }

    /// Multi-round SASL bind, bounded by `max_sasl_rounds`.
    pub async fn bind_sasl(
        &self,
        bind_dn: &str,
        mechanism: &mut dyn SaslMechanism,
    ) -> Result<BindResponse> {
        let label = self.shared.label.clone();
        let max_rounds = self.shared.options.max_sasl_rounds;
        let name = mechanism.name().to_string();
        let response = sasl::run_exchange(mechanism, bind_dn, max_rounds, &label, |request| {
            self.bind_round_trip(request)
        })
        .await?;
        let identity = if bind_dn.is_empty() {
            format!("SASL/{}", name)
        } else {
            bind_dn.to_string()
        };
        self.mark_bound(identity);
        Ok(response)
    }

    /// StartTLS extended operation followed by the transport upgrade.
    pub async fn start_tls(&self, tls: &TlsSettings) -> Result<()> {
        if self.is_secure() {
            return Err(LdapError::InvalidState {
                operation: "start_tls",
                state: "already using TLS".to_string(),
            });
        }
        let state = self.state();
        if state != ConnectionState::Established {
            return Err(LdapError::InvalidState {
                operation: "start_tls",
                state: state.to_string(),
            });
        }
        let response = self.extended(ExtendedRequest::start_tls()).await?;
        if !response.result.result_code.is_success() {
            return Err(LdapError::Connect {
                endpoint: self.shared.label.clone(),
                phase: ConnectPhase::StartTls,
                reason: format!(
                    "server refused StartTLS: {} {}",
                    response.result.result_code, response.result.diagnostic_message
                ),
            });
        }
        self.upgrade_transport(tls).await
    }

    /// Replace the plain transport with TLS in place. Outstanding requests
    /// keep their message ids and complete over the new transport. Only valid
    /// in `Established`; on failure the connection is closed.
    pub async fn upgrade_transport(&self, tls: &TlsSettings) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Established || self.is_secure() {
            return Err(LdapError::InvalidState {
                operation: "upgrade_transport",
                state: if self.is_secure() {
                    "already using TLS".to_string()
                } else {
                    state.to_string()
                },
            });
        }
        let shared = &self.shared;
        let tls_error = |reason: String| LdapError::Tls {
            endpoint: shared.label.clone(),
            reason,
        };

        // the writer task parks until it gets the new write half, so requests
        // queued meanwhile go out over TLS
        let (handover, write_half) = oneshot::channel();
        let (resume, resume_rx) = oneshot::channel();
        shared.enqueue(WriterCommand::Suspend {
            handover,
            resume: resume_rx,
        })?;
        let write_half = write_half.await.map_err(|_| shared.closed_error())?;
        let reader = shared.pause_reader().await?;
        if !reader.is_idle() {
            let reason = "server sent data before the TLS handshake".to_string();
            shared.fail(tls_error(reason.clone()), None);
            return Err(tls_error(reason));
        }
        let (read_half, _) = reader.into_parts();

        let tcp = match read_half.unsplit(write_half) {
            Transport::Tcp(tcp) => tcp,
            Transport::Tls(_) => {
                let reason = "transport is already TLS".to_string();
                shared.fail(tls_error(reason.clone()), None);
                return Err(tls_error(reason));
            }
        };

        let handshake = tokio::time::timeout(
            shared.options.connect_timeout,
            transport::tls_handshake(&shared.endpoint, tls, tcp),
        )
        .await;
        match handshake {
            Ok(Ok(stream)) => {
                let (read_half, write_half) = tokio::io::split(Transport::Tls(stream));
                if resume.send(write_half).is_err() {
                    return Err(shared.closed_error());
                }
                shared.secure.store(true, Ordering::Relaxed);
                Shared::spawn_reader(
                    shared,
                    ElementReader::new(read_half, shared.options.decode_limits),
                );
                info!(conn = shared.id, endpoint = %shared.label, "transport upgraded to TLS");
                Ok(())
            }
            Ok(Err(reason)) => {
                shared.fail(tls_error(reason.clone()), None);
                Err(tls_error(reason))
            }
            Err(_) => {
                let reason = format!("TLS handshake timed out after {:?}", shared.options.connect_timeout);
                shared.fail(tls_error(reason.clone()), None);
                Err(tls_error(reason))
            }
        }
    }

    /// Graceful close: best-effort unbind, then fail anything still
    /// outstanding and release the transport.
    pub async fn close(&self) {
        let shared = &self.shared;
        if !shared.transition(ConnectionState::ClosingByClient) {
            if shared.state() != ConnectionState::Closed {
                self.terminate("connection closed by client");
            }
            return;
        }
        let unbind = LdapMessage::new(shared.pending.next_message_id(), protocol::unbind_request());
        let (done, flushed) = oneshot::channel();
        let shutdown = WriterCommand::Shutdown {
            bytes: unbind.encode(),
            done,
        };
        if shared.enqueue(shutdown).is_ok() {
            // queued writes ahead of the unbind share this bound
            let _ = tokio::time::timeout(UNBIND_TIMEOUT, flushed).await;
        }
        shared.release_writer();
        shared.stop_reader();
        lock(&shared.close_reason).get_or_insert_with(|| "connection closed by client".to_string());
        shared.pending.fail_all("connection closed by client");
        shared.transition(ConnectionState::Closed);
        info!(conn = shared.id, endpoint = %shared.label, "connection closed");
        shared.options.debug.connect(&shared.label, "closed by client");
    }

    /// Immediate close without unbind. Usable from synchronous contexts.
    pub fn terminate(&self, reason: &str) {
        let shared = &self.shared;
        if shared.state() == ConnectionState::Closed {
            return;
        }
        shared.transition(ConnectionState::ClosingByClient);
        shared.stop_reader();
        lock(&shared.close_reason).get_or_insert_with(|| reason.to_string());
        shared.pending.fail_all(reason);
        shared.transition(ConnectionState::Closed);
        shared.release_writer();
        debug!(conn = shared.id, endpoint = %shared.label, reason, "connection terminated");
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        self.terminate("connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Established));
        assert!(Established.can_transition_to(Bound));
        assert!(Established.can_transition_to(Closed));
        assert!(Bound.can_transition_to(ClosingByPeer));
        assert!(ClosingByClient.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Established));
        assert!(!Bound.can_transition_to(Established));
        assert!(!ClosingByPeer.can_transition_to(ClosingByClient));
        assert!(!Disconnected.can_transition_to(Bound));
    }

    #[test]
    fn test_usable_states() {
        assert!(ConnectionState::Established.is_usable());
        assert!(ConnectionState::Bound.is_usable());
        assert!(!ConnectionState::ClosingByClient.is_usable());
        assert!(!ConnectionState::Closed.is_usable());
    }

    #[tokio::test]
    async fn test_connect_failure_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = LdapConnection::connect(ServerEndpoint::new("127.0.0.1", port), ConnectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Connect { .. }));
    }
}
