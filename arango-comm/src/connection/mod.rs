//! Connections to a single ArangoDB host.
//!
//! An [`ArangoConnection`] owns at most one transport session at a time.
//! A session is a socket plus a reader task and a writer task, it never resurrects once its transport has failed.
//! Instead the next request sent through the connection transparently opens a replacement session.

use crate::auth::AuthenticationMethod;
use crate::codec::vst::VstMessage;
use crate::codec::{self, CodecReadError, CodecWriteError};
use crate::config::{ArangoProtocol, ConnectionConfig, ContentType};
use crate::error::ConnectionError;
use crate::host::HostDescription;
use crate::observability;
use crate::request::{ArangoRequest, ArangoResponse};
use arc_swap::ArcSwapOption;
use atomic_enum::atomic_enum;
use bytes::Bytes;
use message_store::MessageStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

mod http;
pub mod message_store;
mod vst;

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

pub(crate) fn read_error(err: CodecReadError) -> ConnectionError {
    match err {
        CodecReadError::Parser(err) => ConnectionError::MessageDecode(Arc::new(err)),
        CodecReadError::Io(err) => err.into(),
    }
}

pub(crate) fn write_error(err: CodecWriteError) -> ConnectionError {
    match err {
        CodecWriteError::Encoder(err) => ConnectionError::MessageEncode(Arc::new(err)),
        CodecWriteError::Io(err) => err.into(),
    }
}

enum Outgoing {
    Vst {
        tx: mpsc::UnboundedSender<VstMessage>,
        content_type: ContentType,
    },
    Http {
        tx: mpsc::UnboundedSender<(u64, ::http::Request<Bytes>)>,
        content_type: ContentType,
        authorization: Option<String>,
    },
}

/// A single transport session, shared between the connection and its reader/writer tasks.
pub(crate) struct Session {
    host: HostDescription,
    /// Only ever `Connected` or `Disconnected`.
    state: Arc<AtomicConnectionState>,
    store: MessageStore,
    /// Count of responses read off the transport.
    received: Arc<AtomicU64>,
    outgoing: Outgoing,
    shutdown_tx: watch::Sender<bool>,
}

/// The parts of a session that its reader and writer tasks hold on to.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    state: Arc<AtomicConnectionState>,
    store: MessageStore,
    received: Arc<AtomicU64>,
}

impl SessionHandle {
    pub(crate) fn resolve(&self, message_id: u64, response: ArangoResponse) {
        self.received.fetch_add(1, Ordering::Release);
        self.store.resolve(message_id, response);
    }

    /// The transport failed, every outstanding request fails with `cause` and the session is never used again.
    pub(crate) fn fail(&self, cause: ConnectionError) {
        if self.state.swap(ConnectionState::Disconnected, Ordering::AcqRel)
            == ConnectionState::Connected
        {
            tracing::debug!("connection lost: {cause}");
        }
        self.store.clear(cause);
    }
}

impl Session {
    fn new(host: HostDescription, outgoing: Outgoing) -> (Self, SessionHandle, watch::Receiver<bool>) {
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Connected));
        let store = MessageStore::new();
        let received = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = SessionHandle {
            state: state.clone(),
            store: store.clone(),
            received: received.clone(),
        };
        (
            Session {
                host,
                state,
                store,
                received,
                outgoing,
                shutdown_tx,
            },
            handle,
            shutdown_rx,
        )
    }

    fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == ConnectionState::Connected
    }

    fn send(&self, message_id: u64, request: &ArangoRequest) -> Result<(), ConnectionError> {
        let sent = match &self.outgoing {
            Outgoing::Vst { tx, content_type } => tx
                .send(VstMessage {
                    message_id,
                    payload: codec::vst::encode_request(request, *content_type),
                })
                .is_ok(),
            Outgoing::Http {
                tx,
                content_type,
                authorization,
            } => {
                let http_request = codec::http::build_request(
                    request,
                    &self.host,
                    *content_type,
                    authorization.as_deref(),
                )
                .map_err(|err| ConnectionError::MessageEncode(Arc::new(err)))?;
                tx.send((message_id, http_request)).is_ok()
            }
        };
        if sent {
            Ok(())
        } else {
            Err(ConnectionError::OtherSideClosed)
        }
    }

    async fn execute(
        &self,
        message_id: u64,
        request: &ArangoRequest,
        request_timeout: Duration,
    ) -> Result<ArangoResponse, ConnectionError> {
        let pending = self.store.add_request(message_id)?;
        let received_before = self.received.load(Ordering::Acquire);
        self.send(message_id, request)?;
        match tokio::time::timeout(request_timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                // a late response will find no entry and be dropped
                self.store.cancel(message_id);
                if self.received.load(Ordering::Acquire) == received_before {
                    self.fail_stalled(request_timeout);
                }
                Err(ConnectionError::Timeout(request_timeout))
            }
        }
    }

    /// Nothing was read off the transport for a whole request timeout, so the socket is treated as dead.
    /// A session that is still delivering other responses only times out the one request.
    fn fail_stalled(&self, request_timeout: Duration) {
        if self
            .state
            .swap(ConnectionState::Disconnected, Ordering::AcqRel)
            == ConnectionState::Connected
        {
            tracing::debug!("no response received for {request_timeout:?}, dropping the session");
        }
        self.store.clear(ConnectionError::Timeout(request_timeout));
        self.shutdown_tx.send(true).ok();
    }

    fn close(&self) {
        self.state
            .store(ConnectionState::Disconnected, Ordering::Release);
        self.store.clear(ConnectionError::Closed);
        self.shutdown_tx.send(true).ok();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection to a single host, reconnecting on demand.
pub struct ArangoConnection {
    host: HostDescription,
    config: ConnectionConfig,
    authentication: Option<AuthenticationMethod>,
    /// Tracks the states that exist without a live session: Created, Connecting, Disconnected and Closed.
    lifecycle: AtomicConnectionState,
    session: ArcSwapOption<Session>,
    connect_lock: tokio::sync::Mutex<()>,
    next_message_id: AtomicU64,
    closed: AtomicBool,
    span: tracing::Span,
}

impl ArangoConnection {
    pub fn new(
        host: HostDescription,
        config: ConnectionConfig,
        authentication: Option<AuthenticationMethod>,
    ) -> Self {
        let span = tracing::debug_span!("connection", host = %host);
        ArangoConnection {
            host,
            config,
            authentication,
            lifecycle: AtomicConnectionState::new(ConnectionState::Created),
            session: ArcSwapOption::empty(),
            connect_lock: tokio::sync::Mutex::new(()),
            next_message_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            span,
        }
    }

    pub fn host(&self) -> &HostDescription {
        &self.host
    }

    pub fn protocol(&self) -> ArangoProtocol {
        self.config.protocol
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            return ConnectionState::Closed;
        }
        match self.lifecycle.load(Ordering::Acquire) {
            ConnectionState::Connecting => ConnectionState::Connecting,
            lifecycle => match &*self.session.load() {
                Some(session) if session.is_connected() => ConnectionState::Connected,
                Some(_) => ConnectionState::Disconnected,
                None => lifecycle,
            },
        }
    }

    /// Opens a session if there is no connected one.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connected_session().await.map(|_| ())
    }

    /// Sends `request` and waits up to the configured timeout for its response.
    /// A disconnected connection is reconnected first.
    pub async fn execute(&self, request: &ArangoRequest) -> Result<ArangoResponse, ConnectionError> {
        let session = self.connected_session().await?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = session
            .execute(message_id, request, self.config.timeout)
            .instrument(self.span.clone())
            .await;
        observability::request_latency(self.config.protocol).record(start.elapsed());
        if result.is_err() {
            observability::failed_requests(&self.host).increment(1);
        }
        result
    }

    /// Closes the connection for good, outstanding requests fail with [`ConnectionError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lifecycle.store(ConnectionState::Closed, Ordering::Release);
        if let Some(session) = self.session.swap(None) {
            session.close();
        }
        let _entered = self.span.enter();
        tracing::debug!("connection closed");
    }

    async fn connected_session(&self) -> Result<Arc<Session>, ConnectionError> {
        if let Some(session) = self.live_session()? {
            return Ok(session);
        }

        // concurrent callers wait for a single connection attempt
        let _guard = self.connect_lock.lock().await;
        if let Some(session) = self.live_session()? {
            return Ok(session);
        }

        let reconnect = self.session.load().is_some();
        self.lifecycle
            .store(ConnectionState::Connecting, Ordering::Release);
        let result = self.open_session().instrument(self.span.clone()).await;
        match result {
            Ok(session) => {
                let session = Arc::new(session);
                self.session.store(Some(session.clone()));
                self.lifecycle
                    .store(ConnectionState::Connected, Ordering::Release);
                if self.closed.load(Ordering::Acquire) {
                    // close() raced with this connection attempt
                    if let Some(session) = self.session.swap(None) {
                        session.close();
                    }
                    return Err(ConnectionError::Closed);
                }
                if reconnect {
                    observability::reconnections(&self.host).increment(1);
                }
                Ok(session)
            }
            Err(err) => {
                self.lifecycle
                    .store(ConnectionState::Disconnected, Ordering::Release);
                Err(err)
            }
        }
    }

    fn live_session(&self) -> Result<Option<Arc<Session>>, ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        Ok(self
            .session
            .load_full()
            .filter(|session| session.is_connected()))
    }

    async fn open_session(&self) -> Result<Session, ConnectionError> {
        tracing::debug!("opening {:?} session", self.config.protocol);
        match self.config.protocol {
            ArangoProtocol::Vst => {
                vst::connect(
                    &self.host,
                    &self.config,
                    self.authentication.as_ref(),
                    &self.next_message_id,
                )
                .await
            }
            ArangoProtocol::Http => {
                http::connect(
                    &self.host,
                    &self.config,
                    self.authentication.as_ref(),
                    &self.next_message_id,
                )
                .await
            }
        }
    }
}

impl Drop for ArangoConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ArangoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArangoConnection")
            .field("host", &self.host)
            .field("protocol", &self.config.protocol)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Creates connections that all share the same settings and credentials.
#[derive(Clone, Debug)]
pub struct ConnectionFactory {
    config: ConnectionConfig,
    authentication: Option<AuthenticationMethod>,
}

impl ConnectionFactory {
    pub fn new(config: ConnectionConfig, authentication: Option<AuthenticationMethod>) -> Self {
        ConnectionFactory {
            config,
            authentication,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Builds a connection without connecting it, it will connect on first use.
    pub fn build(&self, host: HostDescription) -> Arc<ArangoConnection> {
        Arc::new(ArangoConnection::new(
            host,
            self.config.clone(),
            self.authentication.clone(),
        ))
    }

    /// Builds a connection and completes the connection handshake, including authentication.
    pub async fn create(
        &self,
        host: HostDescription,
    ) -> Result<Arc<ArangoConnection>, ConnectionError> {
        let connection = self.build(host);
        connection.connect().await?;
        Ok(connection)
    }
}
