//! Session lifecycle: pairing, credential persistence, reconnection and the
//! outbound send queue.
//!
//! [`SessionManager`] owns the one live connection to the network. A driver
//! task pumps the connection's event stream into a bounded queue (taken once
//! via [`SessionManager::events`]) and reconnects with [`Backoff`] when the
//! stream ends. Sends are funnelled through a single sender task so they
//! reach the network in submission order.

pub mod backoff;
pub mod credential;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::network::{
    Ack, AuthError, Connected, NetworkClient, NetworkError, NetworkEvent, OutboundPayload,
    PairingSink, SessionHandle,
};

pub use self::backoff::Backoff;
pub use self::credential::{CredentialError, CredentialStore};

/// Connection state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session and none being established.
    Disconnected,
    /// Waiting for the operator to scan a pairing code.
    Pairing,
    /// Live session; sends are accepted.
    Connected,
    /// Connection lost; re-establishing with backoff.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name for logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Authentication failed terminally.
    #[error("authentication failed: {0}")]
    Auth(AuthError),

    /// No live session.
    #[error("not connected")]
    NotConnected,

    /// The network refused or failed a send.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The inbound event queue has already been handed out.
    #[error("event stream already taken")]
    EventsTaken,

    /// Credential persistence failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// How a connection's event stream ended.
enum StreamEnd {
    /// Transport loss; reconnect. `delivered` is `true` if any event got through.
    Dropped { delivered: bool },
    /// The device was unlinked remotely; reconnecting cannot help.
    LoggedOut(Option<String>),
}

/// One queued outbound unit.
struct SendRequest {
    to: String,
    payload: OutboundPayload,
    reply: oneshot::Sender<Result<Ack, NetworkError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the network session.
pub struct SessionManager {
    client: Arc<dyn NetworkClient>,
    credentials: CredentialStore,
    config: SessionConfig,
    state_tx: watch::Sender<ConnectionState>,
    handle: Arc<RwLock<Option<SessionHandle>>>,
    pairing_tx: PairingSink,
    pairing_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    event_tx: mpsc::Sender<NetworkEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
    send_tx: mpsc::Sender<SendRequest>,
    send_rx: Mutex<Option<mpsc::Receiver<SendRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    auth_failure: Mutex<Option<AuthError>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("credentials", &self.credentials.path())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create an idle manager. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(
        client: Arc<dyn NetworkClient>,
        credentials: CredentialStore,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (pairing_tx, pairing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (send_tx, send_rx) = mpsc::channel(config.send_queue.max(1));
        Arc::new(Self {
            client,
            credentials,
            config,
            state_tx,
            handle: Arc::new(RwLock::new(None)),
            pairing_tx,
            pairing_rx: Mutex::new(Some(pairing_rx)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            auth_failure: Mutex::new(None),
        })
    }

    /// Establish the session, pairing first if no credential is stored,
    /// then keep it alive in the background.
    ///
    /// Returns once the first connection is up. Transient failures are
    /// retried with backoff; calling again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Auth`] after `max_auth_attempts` terminal
    /// authentication failures, or [`SessionError::Credential`] if the
    /// credential file is unreadable.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("connect called on a running session");
            return Ok(());
        }
        let handle = match self.establish().await {
            Ok(handle) => handle,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.install(handle).await;
        self.spawn_sender();

        let this = Arc::clone(self);
        let driver = tokio::spawn(async move { this.drive().await });
        lock(&self.tasks).push(driver);
        Ok(())
    }

    /// Queue one outbound unit and wait for the network's acknowledgement.
    ///
    /// Units are transmitted in the order they were queued.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Auth`] once the session was lost for good
    /// (device limit, revocation, remote logout), [`SessionError::NotConnected`]
    /// while no session is live (no implicit queueing), or
    /// [`SessionError::Network`] if the network rejects the unit.
    pub async fn send(&self, to: &str, payload: OutboundPayload) -> Result<Ack, SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(match self.auth_failure() {
                Some(e) => SessionError::Auth(e),
                None => SessionError::NotConnected,
            });
        }
        let (reply, rx) = oneshot::channel();
        let request = SendRequest {
            to: to.to_owned(),
            payload,
            reply,
        };
        self.send_tx
            .send(request)
            .await
            .map_err(|_| SessionError::NotConnected)?;
        match rx.await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(NetworkError::SessionClosed)) | Err(_) => Err(SessionError::NotConnected),
            Ok(Err(e)) => Err(SessionError::Network(e)),
        }
    }

    /// Take the inbound event queue. Exactly one consumer may hold it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EventsTaken`] on the second call.
    pub fn events(&self) -> Result<mpsc::Receiver<NetworkEvent>, SessionError> {
        lock(&self.event_rx).take().ok_or(SessionError::EventsTaken)
    }

    /// Take the pairing code stream (QR payloads), if nobody has yet.
    pub fn pairing_codes(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.pairing_rx).take()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The authentication failure that ended the session, if any. Cleared
    /// by the next successful [`connect`](Self::connect).
    pub fn auth_failure(&self) -> Option<AuthError> {
        lock(&self.auth_failure).clone()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// JID of the linked device while connected.
    pub async fn device_jid(&self) -> Option<String> {
        self.handle
            .read()
            .await
            .as_ref()
            .and_then(|h| h.device_jid.clone())
    }

    /// Remove the stored credential; the next connect pairs afresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn wipe_credentials(&self) -> Result<bool, SessionError> {
        Ok(self.credentials.wipe()?)
    }

    /// Stop the driver and sender tasks and drop the session. Final: the
    /// manager does not accept sends afterwards.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        *self.handle.write().await = None;
        self.started.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        info!("session shut down");
    }

    // -- internals ----------------------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "session state changed");
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        )
    }

    async fn install(&self, handle: SessionHandle) {
        info!(session = %handle.id, device = ?handle.device_jid, "session established");
        *lock(&self.auth_failure) = None;
        *self.handle.write().await = Some(handle);
        self.set_state(ConnectionState::Connected);
    }

    /// Record an unrecoverable authentication loss and go idle.
    fn give_up(&self, error: AuthError) {
        error!(error = %error, "session lost for good, re-pairing or operator action needed");
        *lock(&self.auth_failure) = Some(error);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Connect until a session is up or authentication fails terminally.
    async fn establish(&self) -> Result<SessionHandle, SessionError> {
        let mut backoff = self.backoff();
        let mut terminal_failures: u32 = 0;
        let mut skip_stored = false;

        loop {
            let credential = if skip_stored {
                None
            } else {
                match self.credentials.load_async().await {
                    Ok(credential) => credential,
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(e.into());
                    }
                }
            };
            if credential.is_none() {
                self.set_state(ConnectionState::Pairing);
            }

            match self
                .client
                .connect(credential.as_ref(), &self.pairing_tx)
                .await
            {
                Ok(Connected {
                    handle,
                    credential: fresh,
                }) => {
                    if let Some(fresh) = fresh {
                        if let Err(e) = self.credentials.save_async(fresh).await {
                            warn!(error = %e, "failed to persist credential; next start will pair again");
                        }
                    }
                    return Ok(handle);
                }
                Err(AuthError::InvalidCredential) if credential.is_some() => {
                    warn!("stored credential rejected, pairing a new device");
                    skip_stored = true;
                }
                Err(e) if e.is_terminal() || e == AuthError::InvalidCredential => {
                    terminal_failures = terminal_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        attempt = terminal_failures,
                        max = self.config.max_auth_attempts,
                        "authentication failed"
                    );
                    if terminal_failures >= self.config.max_auth_attempts {
                        self.give_up(e.clone());
                        return Err(SessionError::Auth(e));
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis(), "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Keep the session alive: pump events, reconnect when the stream ends.
    async fn drive(self: Arc<Self>) {
        let mut backoff = self.backoff();
        loop {
            let Some(handle) = self.handle.read().await.clone() else {
                break;
            };
            match self.pump(&handle).await {
                StreamEnd::Dropped { delivered: true } => backoff.reset(),
                StreamEnd::Dropped { delivered: false } => {}
                StreamEnd::LoggedOut(reason) => {
                    *self.handle.write().await = None;
                    self.give_up(AuthError::Revoked(
                        reason.unwrap_or_else(|| "logged out".to_owned()),
                    ));
                    break;
                }
            }
            *self.handle.write().await = None;
            self.set_state(ConnectionState::Reconnecting);

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis(), "connection lost, reconnecting");
            tokio::time::sleep(delay).await;

            match self.establish().await {
                Ok(handle) => self.install(handle).await,
                // `establish` already recorded the failure.
                Err(SessionError::Auth(_)) => break,
                Err(e) => {
                    error!(error = %e, "giving up on session");
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
            }
        }
        self.started.store(false, Ordering::SeqCst);
        debug!("session driver stopped");
    }

    /// Forward one connection's events until the stream ends.
    async fn pump(&self, handle: &SessionHandle) -> StreamEnd {
        let mut stream = match self.client.events(handle).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to open event stream");
                return StreamEnd::Dropped { delivered: false };
            }
        };
        let mut delivered = false;
        while let Some(event) = stream.next().await {
            let end = match &event {
                NetworkEvent::CredentialsRotated { credential } => {
                    if let Err(e) = self.credentials.save_async(credential.clone()).await {
                        warn!(error = %e, "failed to persist rotated credential");
                    }
                    continue;
                }
                NetworkEvent::LoggedOut { reason } => {
                    warn!(reason = ?reason, "device logged out remotely");
                    Some(StreamEnd::LoggedOut(reason.clone()))
                }
                NetworkEvent::Disconnected { reason } => {
                    info!(reason = ?reason, "network reported disconnect");
                    Some(StreamEnd::Dropped { delivered: true })
                }
                _ => None,
            };
            if self.event_tx.send(event).await.is_err() {
                debug!("event consumer gone, dropping event");
            } else {
                delivered = true;
            }
            if let Some(end) = end {
                return match end {
                    StreamEnd::Dropped { .. } => StreamEnd::Dropped { delivered },
                    logged_out => logged_out,
                };
            }
        }
        StreamEnd::Dropped { delivered }
    }

    fn spawn_sender(&self) {
        let Some(mut rx) = lock(&self.send_rx).take() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let handle = Arc::clone(&self.handle);
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let current = handle.read().await.clone();
                let result = match current {
                    Some(session) => {
                        debug!(
                            to = %request.to,
                            kind = request.payload.label(),
                            "transmitting"
                        );
                        client.send(&session, &request.to, &request.payload).await
                    }
                    None => Err(NetworkError::SessionClosed),
                };
                // The requester may have timed out; the outcome is theirs to lose.
                let _ = request.reply.send(result);
            }
        });
        lock(&self.tasks).push(task);
    }
}
