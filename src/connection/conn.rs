//! Core connection type
//!
//! A [`Connection`] is a cheap handle onto a worker task that exclusively owns the
//! channel. The worker runs the startup handshake, then serves queued queries one at
//! a time: write the query frame, race its response against the query timeout,
//! transport failures and local close, settle the caller, repeat. While ready and
//! idle it closes itself once the idle timeout elapses.

use super::config::ConnectionConfig;
use super::state::ConnectionState;
use super::transport::{BoxChannel, TransportProvider};
use crate::metrics::labels::{STATUS_ERROR, STATUS_OK, STATUS_TIMEOUT};
use crate::protocol::constants::{PROTOCOL_VERSION, SESSION_QUERY_ID};
use crate::protocol::{
    decode_message, encode_message, AuthenticationMessage, BackendMessage, FrontendMessage,
};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

/// One result record: column name to value, in server order
pub type Row = serde_json::Map<String, Value>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reasons recorded when a connection closes
mod close_reason {
    pub const LOCAL: &str = "local";
    pub const IDLE: &str = "idle";
    pub const REMOTE: &str = "remote";
    pub const TRANSPORT: &str = "transport";
    pub const PROTOCOL: &str = "protocol";
    pub const SERVER: &str = "server_error";
    pub const STARTUP: &str = "startup_failed";
    pub const TIMEOUT: &str = "write_timeout";
}

/// Query waiting for the worker
struct Request {
    sql: String,
    values: Vec<Value>,
    reply: oneshot::Sender<Result<Vec<Row>>>,
}

/// Handle to one server connection
///
/// Clones share the same connection. The connection closes when [`close`](Self::close)
/// is called or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    requests: mpsc::UnboundedSender<Request>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConnectionState>,
    /// Handshake failure, kept for every `ready()` caller
    failure: Arc<Mutex<Option<String>>>,
}

impl Connection {
    /// Start connecting in the background.
    ///
    /// Returns immediately in `Connecting`. Queries submitted before the handshake
    /// completes are queued and run in order once ready.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the configuration is invalid; nothing touches the network.
    pub fn open(
        config: impl Into<Arc<ConnectionConfig>>,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        let config = config.into();
        config.validate()?;

        let id = ConnectionId::next();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let failure = Arc::new(Mutex::new(None));

        let span = tracing::debug_span!(
            "connection",
            id = %id,
            host = %config.host(),
            port = config.port()
        );
        let worker = Worker {
            id,
            config,
            provider,
            requests: requests_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            failure: failure.clone(),
            last_query_id: 0,
        };
        tokio::spawn(worker.run().instrument(span));

        Ok(Self {
            id,
            requests: requests_tx,
            shutdown: Arc::new(shutdown_tx),
            state: state_rx,
            failure,
        })
    }

    /// Open a connection and wait for the handshake.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid configuration, `Error::Connect` if the channel
    /// cannot be opened, the server rejects the startup or the connect timeout elapses.
    pub async fn connect(
        config: impl Into<Arc<ConnectionConfig>>,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        let conn = Self::open(config, provider)?;
        conn.ready().await?;
        Ok(conn)
    }

    /// Connection identity
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection still accepts queries
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Wait until the handshake has completed.
    ///
    /// # Errors
    ///
    /// The handshake failure (`Error::Connect`), or `Error::ConnectionClosed` if the
    /// connection was closed before it became ready.
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s);

        match reached {
            Ok(ConnectionState::Ready) | Ok(ConnectionState::Busy) => Ok(()),
            _ => Err(match self.failure.lock().as_ref() {
                Some(message) => Error::connect(message.clone()),
                None => Error::ConnectionClosed,
            }),
        }
    }

    /// Run a query and collect its rows.
    ///
    /// `values` are bound to `$n` markers by the server; pass an empty vector for
    /// literal SQL. Calls on the same connection run one at a time in submission
    /// order.
    ///
    /// # Errors
    ///
    /// * `Error::Query` for empty SQL, a server error, a malformed response or a
    ///   transport failure mid-query
    /// * `Error::QueryTimeout` if no response arrives within the query timeout; the
    ///   connection stays usable
    /// * `Error::ConnectionClosed` if the connection is closing or closes while the
    ///   query is in flight
    /// * `Error::Connect` if the query was queued behind a handshake that failed
    pub async fn execute(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Row>> {
        if sql.trim().is_empty() {
            return Err(Error::query("query must not be empty"));
        }
        if sql.contains('\0') {
            return Err(Error::query("query must not contain a NUL byte"));
        }
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request {
                sql: sql.to_string(),
                values,
                reply,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        response.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Run literal SQL with no bound values
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.execute(sql, Vec::new()).await
    }

    /// Close the connection and wait until it is `Closed`.
    ///
    /// An in-flight query and anything queued fail with `Error::ConnectionClosed`.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once close was requested or every handle is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

/// Channel plus read buffer
struct Wire {
    channel: BoxChannel,
    read_buf: BytesMut,
}

impl Wire {
    /// Open the channel and run the startup handshake
    async fn establish(config: &ConnectionConfig, provider: &dyn TransportProvider) -> Result<Self> {
        let channel = match config.tls() {
            Some(tls) => {
                provider
                    .open_secure_channel(config.host(), config.port(), tls)
                    .await
            }
            None => provider.open_channel(config.host(), config.port()).await,
        }
        .map_err(|e| {
            Error::connect_with(
                format!(
                    "failed to open channel to {}:{}",
                    config.host(),
                    config.port()
                ),
                e,
            )
        })?;

        let mut wire = Wire {
            channel,
            read_buf: BytesMut::with_capacity(8192),
        };

        wire.startup(config)
            .instrument(tracing::info_span!(
                "startup",
                user = %config.user(),
                database = %config.database()
            ))
            .await
            .map_err(|e| match e {
                Error::Connect { .. } => e,
                other => Error::connect_with("startup handshake failed", other),
            })?;

        Ok(wire)
    }

    async fn startup(&mut self, config: &ConnectionConfig) -> Result<()> {
        let mut params = vec![
            ("user".to_string(), config.user().to_string()),
            ("database".to_string(), config.database().to_string()),
        ];
        if let Some(app_name) = config.application_name() {
            params.push(("application_name".to_string(), app_name.to_string()));
        }

        self.send(&FrontendMessage::Startup {
            version: PROTOCOL_VERSION,
            params,
        })
        .await?;

        loop {
            let msg = self.receive().await?.ok_or_else(|| {
                Error::connect("server closed the connection during startup")
            })?;

            match msg {
                BackendMessage::Authentication(AuthenticationMessage::Ok) => {
                    tracing::debug!("authentication successful");
                }
                BackendMessage::Authentication(AuthenticationMessage::CleartextPassword) => {
                    tracing::debug!("server requested cleartext password");
                    let password = config
                        .password()
                        .ok_or_else(|| Error::connect("server requires a password"))?;
                    self.send(&FrontendMessage::Password(password.to_string()))
                        .await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::debug!("parameter status: {} = {}", name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice: {}", notice);
                }
                BackendMessage::ErrorResponse { fields, .. } => {
                    return Err(Error::connect(format!("server rejected startup: {}", fields)));
                }
                BackendMessage::ReadyForQuery { .. } => {
                    tracing::debug!("startup complete");
                    return Ok(());
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Encode and write one frame
    async fn send(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg)?;
        self.write_frame(&buf).await
    }

    async fn write_frame(&mut self, buf: &[u8]) -> Result<()> {
        self.channel.write_all(buf).await?;
        self.channel.flush().await?;
        Ok(())
    }

    /// Next backend frame, `None` once the server closed the channel.
    ///
    /// Cancel safe: bytes already read stay buffered.
    async fn receive(&mut self) -> Result<Option<BackendMessage>> {
        loop {
            if let Some((msg, consumed)) =
                decode_message(&self.read_buf).map_err(|e| Error::Protocol(e.to_string()))?
            {
                self.read_buf.advance(consumed);
                return Ok(Some(msg));
            }

            let n = self.channel.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Best-effort terminate and shutdown, bounded by `limit`
    async fn terminate(mut self, limit: Duration) {
        let goodbye = async {
            let _ = self.send(&FrontendMessage::Terminate).await;
            let _ = self.channel.shutdown().await;
        };
        if tokio::time::timeout(limit, goodbye).await.is_err() {
            tracing::debug!("terminate timed out");
        }
    }
}

/// What the worker does after an event
enum Flow {
    Continue,
    Close(&'static str),
}

/// Event observed while ready
enum Idle {
    Shutdown,
    Request(Request),
    Frame(Result<Option<BackendMessage>>),
    Expired,
}

/// Event observed while a query is in flight
enum InFlight {
    Shutdown,
    Frame(Result<Option<BackendMessage>>),
    Timeout,
}

/// Background task owning the channel
struct Worker {
    id: ConnectionId,
    config: Arc<ConnectionConfig>,
    provider: Arc<dyn TransportProvider>,
    requests: mpsc::UnboundedReceiver<Request>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
    failure: Arc<Mutex<Option<String>>>,
    last_query_id: u32,
}

impl Worker {
    async fn run(mut self) {
        let establish = tokio::time::timeout(
            self.config.connect_timeout(),
            Wire::establish(&self.config, self.provider.as_ref()),
        );

        let established = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => None,
            result = establish => Some(result),
        };

        let wire = match established {
            None => {
                tracing::debug!("closed before startup completed");
                self.finish(None, close_reason::LOCAL, || Error::ConnectionClosed)
                    .await;
                return;
            }
            Some(Ok(Ok(wire))) => wire,
            Some(Ok(Err(e))) => return self.fail_startup(e).await,
            Some(Err(_)) => {
                let e = Error::connect(format!(
                    "timed out after {:?} establishing connection",
                    self.config.connect_timeout()
                ));
                return self.fail_startup(e).await;
            }
        };

        self.transition(ConnectionState::Ready);
        crate::metrics::counters::connection_opened(self.config.tls().is_some());
        tracing::info!(
            user = %self.config.user(),
            database = %self.config.database(),
            "connection established"
        );

        self.serve(wire).await;
    }

    async fn fail_startup(mut self, e: Error) {
        tracing::warn!(error = %e, "connection failed");
        crate::metrics::counters::error(e.category());

        let message = match &e {
            Error::Connect {
                message,
                source: Some(source),
            } => format!("{}: {}", message, source),
            Error::Connect { message, .. } => message.clone(),
            other => other.to_string(),
        };
        *self.failure.lock() = Some(message.clone());

        self.finish(None, close_reason::STARTUP, || Error::connect(message.clone()))
            .await;
    }

    /// Main loop while the channel is up
    async fn serve(mut self, mut wire: Wire) {
        let idle_timeout = self.config.idle_timeout();
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => Idle::Shutdown,
                request = self.requests.recv() => match request {
                    Some(request) => Idle::Request(request),
                    None => Idle::Shutdown,
                },
                frame = wire.receive() => Idle::Frame(frame),
                _ = &mut idle => Idle::Expired,
            };

            let flow = match event {
                Idle::Shutdown => Flow::Close(close_reason::LOCAL),
                Idle::Expired => {
                    tracing::debug!(idle_timeout = ?idle_timeout, "idle timeout elapsed");
                    Flow::Close(close_reason::IDLE)
                }
                Idle::Frame(frame) => self.unsolicited(frame),
                Idle::Request(request) => {
                    if request.reply.is_closed() {
                        // Caller gave up while queued
                        Flow::Continue
                    } else {
                        let flow = self.run_query(&mut wire, request).await;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        flow
                    }
                }
            };

            if let Flow::Close(reason) = flow {
                break reason;
            }
        };

        let wire = match reason {
            close_reason::REMOTE | close_reason::TRANSPORT | close_reason::TIMEOUT => None,
            _ => Some(wire),
        };
        self.finish(wire, reason, || Error::ConnectionClosed).await;
    }

    /// A frame (or EOF) that arrived with no query in flight
    fn unsolicited(&self, frame: Result<Option<BackendMessage>>) -> Flow {
        match frame {
            Ok(None) => {
                tracing::debug!("server closed the connection");
                Flow::Close(close_reason::REMOTE)
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport error on idle connection");
                match e {
                    Error::Protocol(_) => Flow::Close(close_reason::PROTOCOL),
                    _ => Flow::Close(close_reason::TRANSPORT),
                }
            }
            Ok(Some(BackendMessage::ErrorResponse {
                query_id: SESSION_QUERY_ID,
                fields,
            })) => {
                tracing::warn!(error = %fields, "session error from server");
                Flow::Close(close_reason::SERVER)
            }
            Ok(Some(BackendMessage::DataRows { query_id, .. }))
            | Ok(Some(BackendMessage::ErrorResponse { query_id, .. })) => {
                tracing::debug!(query_id, "discarding response for an earlier query");
                Flow::Continue
            }
            Ok(Some(BackendMessage::NoticeResponse(notice))) => {
                tracing::debug!("notice: {}", notice);
                Flow::Continue
            }
            Ok(Some(BackendMessage::ParameterStatus { name, value })) => {
                tracing::debug!("parameter status: {} = {}", name, value);
                Flow::Continue
            }
            Ok(Some(other)) => {
                tracing::warn!("unexpected message on idle connection: {:?}", other);
                Flow::Close(close_reason::PROTOCOL)
            }
        }
    }

    fn next_query_id(&mut self) -> u32 {
        self.last_query_id = self.last_query_id.wrapping_add(1);
        if self.last_query_id == SESSION_QUERY_ID {
            self.last_query_id = 1;
        }
        self.last_query_id
    }

    /// Write one query, race its settlement and answer the caller
    async fn run_query(&mut self, wire: &mut Wire, request: Request) -> Flow {
        let Request { sql, values, reply } = request;
        let query_id = self.next_query_id();
        let query_timeout = self.config.query_timeout();
        let started = Instant::now();
        let deadline = started + query_timeout;

        let span = tracing::debug_span!("query", connection = %self.id, query_id);
        let (result, flow) = async {
            let frame = match encode_message(&FrontendMessage::Query {
                id: query_id,
                sql,
                values,
            }) {
                Ok(frame) => frame,
                Err(e) => {
                    return (
                        Err(Error::query_with("failed to encode query", e.into())),
                        Flow::Continue,
                    )
                }
            };

            self.transition(ConnectionState::Busy);

            match tokio::time::timeout_at(deadline, wire.write_frame(&frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to send query");
                    return (
                        Err(Error::query_with("failed to send query", e)),
                        Flow::Close(close_reason::TRANSPORT),
                    );
                }
                // A partial frame may be on the wire
                Err(_) => {
                    return (
                        Err(Error::QueryTimeout(query_timeout)),
                        Flow::Close(close_reason::TIMEOUT),
                    )
                }
            }

            self.await_response(wire, query_id, query_timeout, deadline)
                .await
        }
        .instrument(span)
        .await;

        let status = match &result {
            Ok(_) => STATUS_OK,
            Err(Error::QueryTimeout(_)) => STATUS_TIMEOUT,
            Err(_) => STATUS_ERROR,
        };
        crate::metrics::counters::query_completed(status);
        crate::metrics::histograms::query_duration(started.elapsed().as_millis() as u64);
        if let Err(e) = &result {
            crate::metrics::counters::error(e.category());
        }

        // State is settled before the caller observes the result
        match flow {
            Flow::Continue => {
                if self.current_state() == ConnectionState::Busy {
                    self.transition(ConnectionState::Ready);
                }
            }
            Flow::Close(_) => self.transition(ConnectionState::Closing),
        }
        let _ = reply.send(result);

        flow
    }

    async fn await_response(
        &mut self,
        wire: &mut Wire,
        query_id: u32,
        query_timeout: Duration,
        deadline: Instant,
    ) -> (Result<Vec<Row>>, Flow) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => InFlight::Shutdown,
                frame = wire.receive() => InFlight::Frame(frame),
                _ = tokio::time::sleep_until(deadline) => InFlight::Timeout,
            };

            let msg = match event {
                InFlight::Shutdown => {
                    tracing::debug!("closed with query in flight");
                    return (Err(Error::ConnectionClosed), Flow::Close(close_reason::LOCAL));
                }
                InFlight::Timeout => {
                    tracing::debug!(timeout = ?query_timeout, "query timed out");
                    return (Err(Error::QueryTimeout(query_timeout)), Flow::Continue);
                }
                InFlight::Frame(Ok(None)) => {
                    tracing::debug!("server closed the connection mid-query");
                    return (Err(Error::ConnectionClosed), Flow::Close(close_reason::REMOTE));
                }
                InFlight::Frame(Err(e)) => {
                    tracing::warn!(error = %e, "transport error during query");
                    let reason = match e {
                        Error::Protocol(_) => close_reason::PROTOCOL,
                        _ => close_reason::TRANSPORT,
                    };
                    return (
                        Err(Error::query_with("transport error during query", e)),
                        Flow::Close(reason),
                    );
                }
                InFlight::Frame(Ok(Some(msg))) => msg,
            };

            match msg {
                BackendMessage::DataRows {
                    query_id: id,
                    payload,
                } if id == query_id => {
                    let rows = serde_json::from_slice::<Vec<Row>>(&payload)
                        .map_err(|e| Error::query(format!("malformed response: {}", e)));
                    return (rows, Flow::Continue);
                }
                BackendMessage::ErrorResponse {
                    query_id: id,
                    fields,
                } if id == query_id => {
                    return (
                        Err(Error::query(format!("server error: {}", fields))),
                        Flow::Continue,
                    );
                }
                BackendMessage::ErrorResponse {
                    query_id: SESSION_QUERY_ID,
                    fields,
                } => {
                    tracing::warn!(error = %fields, "session error from server");
                    return (
                        Err(Error::query(format!("server error: {}", fields))),
                        Flow::Close(close_reason::SERVER),
                    );
                }
                BackendMessage::DataRows { query_id: stale, .. }
                | BackendMessage::ErrorResponse {
                    query_id: stale, ..
                } => {
                    tracing::debug!(stale, "discarding response for an earlier query");
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice: {}", notice);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::debug!("parameter status: {} = {}", name, value);
                }
                other => {
                    return (
                        Err(Error::query_with(
                            "unexpected response",
                            Error::Protocol(format!("unexpected message: {:?}", other)),
                        )),
                        Flow::Close(close_reason::PROTOCOL),
                    );
                }
            }
        }
    }

    /// Fail queued work, say goodbye and reach `Closed`
    async fn finish(
        &mut self,
        wire: Option<Wire>,
        reason: &'static str,
        pending_error: impl Fn() -> Error,
    ) {
        if self.current_state() != ConnectionState::Closing {
            self.transition(ConnectionState::Closing);
        }

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(pending_error()));
        }

        if let Some(wire) = wire {
            wire.terminate(self.config.connect_timeout()).await;
        }

        self.transition(ConnectionState::Closed);
        crate::metrics::counters::connection_closed(reason);
        if reason == close_reason::IDLE {
            tracing::debug!(reason, "connection closed");
        } else {
            tracing::info!(reason, "connection closed");
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Apply a transition; illegal ones are logged and ignored
    fn transition(&self, next: ConnectionState) {
        let mut rejected = None;
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(()) => true,
            Err(e) => {
                rejected = Some(e);
                false
            }
        });
        if let Some(e) = rejected {
            tracing::warn!(connection = %self.id, error = %e, "rejected state transition");
        }
    }
}
