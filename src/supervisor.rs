// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! The supervisor owns the transport connection and the channel built on top of it.
//! A single background task drives the lifecycle:
//!
//! ```text
//! Disconnected ──start──> Connecting ──dial ok──> Initializing ──topology ok──> Ready
//!                            ^   │                    ^   │                        │
//!                            │   └─ dial failed,      │   └─ init failed,          │
//!                            │      reconnect_delay   │      reinit_delay          │
//!                            │                        └──── channel closed ────────┤
//!                            └───────────── connection closed / reconnect ─────────┘
//!
//! any state ──shutdown──> Closing ──> Closed
//! ```
//!
//! Publishers and consumers never keep a channel across a reconnect. They read the
//! current [`Session`] snapshot, which the loop swaps atomically through a watch cell,
//! and compare generation tokens to detect that a session they hold went stale.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    channel::Endpoint,
    errors::AmqpError,
    signal::{bounded, shutdown_requested, sleep_or_shutdown},
    topology::{ensure_topology, Topology},
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex, Notify, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// When reconnecting to the server after connection failure
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// When setting up the channel after a channel exception
pub const DEFAULT_REINIT_DELAY: Duration = Duration::from_secs(2);
/// Upper bound of a single dial attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound of a single channel setup or teardown step
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle states of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Closing,
    Closed,
}

/// What the channel is used for. Producers put the channel in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Producer,
    Consumer,
}

/// Timing knobs of the reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reinit_delay: Duration,
    pub channel_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reinit_delay: DEFAULT_REINIT_DELAY,
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
        }
    }
}

impl SupervisorSettings {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_reinit_delay(mut self, delay: Duration) -> Self {
        self.reinit_delay = delay;
        self
    }

    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }
}

/// A live connection/channel pair produced by one successful initialization.
///
/// Sessions are immutable. A reconnect or re-initialization always produces a new
/// session with a higher generation.
pub struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    confirms: Arc<Mutex<()>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Session {
    pub fn new(
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) -> Session {
        Session {
            generation,
            connection,
            channel,
            confirms: Arc::new(Mutex::new(())),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Ready iff neither the connection nor the channel reported a close.
    pub fn is_ready(&self) -> bool {
        !self.connection.close_signal().is_closed() && !self.channel.close_signal().is_closed()
    }

    /// Claims the single confirmation slot of this channel.
    ///
    /// Holding the guard from publish until the confirmation resolves keeps at
    /// most one unconfirmed publish in flight per channel.
    pub(crate) async fn confirm_slot(&self) -> OwnedMutexGuard<()> {
        self.confirms.clone().lock_owned().await
    }
}

/// Why the supervisor left the `Ready` state.
#[derive(Debug)]
enum ReadyExit {
    Shutdown,
    ConnectionClosed(String),
    ChannelClosed(String),
    ReconnectRequested,
}

struct Inner {
    endpoint: Endpoint,
    topology: Topology,
    role: ChannelRole,
    settings: SupervisorSettings,
    connector: Arc<dyn Connector>,
    session: watch::Sender<Option<Arc<Session>>>,
    state: watch::Sender<SupervisorState>,
    shutdown: watch::Sender<bool>,
    reconnect: Notify,
    reconnect_generation: AtomicU64,
    generation: AtomicU64,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// Keeps one connection and one channel alive for a client.
///
/// Cloning is cheap and every clone drives the same state machine.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor in the `Disconnected` state.
    ///
    /// The topology is validated here so configuration errors surface before any
    /// broker work starts.
    pub fn new(
        endpoint: Endpoint,
        topology: Topology,
        role: ChannelRole,
        settings: SupervisorSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<ConnectionSupervisor, AmqpError> {
        topology.validate()?;

        let (session, _) = watch::channel(None);
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Ok(ConnectionSupervisor {
            inner: Arc::new(Inner {
                endpoint,
                topology,
                role,
                settings,
                connector,
                session,
                state,
                shutdown,
                reconnect: Notify::new(),
                reconnect_generation: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                task: StdMutex::new(None),
            }),
        })
    }

    /// Spawns the reconnect loop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), AmqpError> {
        let mut task = self
            .inner
            .task
            .lock()
            .map_err(|_| AmqpError::InternalError)?;

        if *self.inner.shutdown.borrow() {
            return Err(AmqpError::AlreadyClosed);
        }

        if task.is_some() {
            return Err(AmqpError::AlreadyStarted);
        }

        *task = Some(tokio::spawn(run(self.inner.clone())));
        Ok(())
    }

    /// Stops the loop, releases the channel then the connection, and wakes every
    /// caller blocked on this supervisor with [`AmqpError::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        if self.inner.shutdown.send_replace(true) {
            return Err(AmqpError::AlreadyClosed);
        }

        let handle = self
            .inner
            .task
            .lock()
            .map_err(|_| AmqpError::InternalError)?
            .take();

        match handle {
            Some(handle) => {
                if let Err(err) = handle.await {
                    error!(error = err.to_string(), "supervisor task failure");
                    return Err(AmqpError::InternalError);
                }
            }
            None => {
                self.inner.set_state(SupervisorState::Closing);
                self.inner.session.send_replace(None);
                self.inner.set_state(SupervisorState::Closed);
            }
        }

        Ok(())
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// The current session if it is ready.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner
            .session
            .borrow()
            .clone()
            .filter(|session| session.is_ready())
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    /// The current ready session, without waiting.
    pub fn ready_session(&self) -> Result<Arc<Session>, AmqpError> {
        if self.is_shutting_down() {
            return Err(AmqpError::Shutdown);
        }

        self.current().ok_or(AmqpError::NotConnected)
    }

    /// Waits for a ready session.
    pub async fn wait_ready(&self) -> Result<Arc<Session>, AmqpError> {
        self.wait_ready_after(0).await
    }

    /// Waits for a ready session whose generation is newer than `generation`.
    pub async fn wait_ready_after(&self, generation: u64) -> Result<Arc<Session>, AmqpError> {
        let mut sessions = self.inner.session.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                return Err(AmqpError::Shutdown);
            }

            let candidate = sessions
                .borrow_and_update()
                .clone()
                .filter(|session| session.generation > generation && session.is_ready());
            if let Some(session) = candidate {
                return Ok(session);
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Err(AmqpError::Shutdown),
                changed = sessions.changed() => {
                    if changed.is_err() {
                        return Err(AmqpError::Shutdown);
                    }
                }
            }
        }
    }

    /// Asks the loop to drop the session of `generation` and dial again.
    ///
    /// Requests naming an older generation are ignored, so a late caller can never
    /// tear down a session that already replaced the one it saw failing.
    pub fn request_reconnect(&self, generation: u64) {
        debug!(generation, "reconnect requested");
        self.inner
            .reconnect_generation
            .store(generation, Ordering::SeqCst);
        self.inner.reconnect.notify_one();
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }
}

impl Inner {
    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "supervisor state changed");
        }
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        match tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.endpoint),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AmqpError::ConnectTimeout),
        }
    }

    /// Opens a channel, installs the topology and enables confirms for producers.
    ///
    /// Each step is bounded by `channel_timeout`.
    async fn init(&self, connection: &Arc<dyn BrokerConnection>) -> Result<Arc<Session>, AmqpError> {
        let limit = self.settings.channel_timeout;
        let channel = bounded(limit, connection.open_channel()).await?;

        let prepared = async {
            bounded(limit, ensure_topology(channel.as_ref(), &self.topology)).await?;
            if self.role == ChannelRole::Producer {
                bounded(limit, channel.confirm_select()).await?;
            }
            Ok::<(), AmqpError>(())
        }
        .await;

        if let Err(err) = prepared {
            release(Some(channel), None, limit).await;
            return Err(err);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(Session::new(generation, connection.clone(), channel)))
    }

    async fn wait_ready_exit(
        &self,
        session: &Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadyExit {
        let mut connection_closed = session.connection.close_signal();
        let mut channel_closed = session.channel.close_signal();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return ReadyExit::Shutdown,
                reason = connection_closed.closed() => return ReadyExit::ConnectionClosed(reason),
                reason = channel_closed.closed() => return ReadyExit::ChannelClosed(reason),
                _ = self.reconnect.notified() => {
                    if self.reconnect_generation.load(Ordering::SeqCst) == session.generation {
                        return ReadyExit::ReconnectRequested;
                    }
                    debug!(generation = session.generation, "ignoring stale reconnect request");
                }
            }
        }
    }
}

async fn release(
    channel: Option<Arc<dyn BrokerChannel>>,
    connection: Option<Arc<dyn BrokerConnection>>,
    limit: Duration,
) {
    if let Some(channel) = channel {
        if let Err(err) = bounded(limit, channel.close()).await {
            debug!(error = err.to_string(), "failure to release channel");
        }
    }

    if let Some(connection) = connection {
        if let Err(err) = bounded(limit, connection.close()).await {
            debug!(error = err.to_string(), "failure to release connection");
        }
    }
}

/// The reconnect loop. Only this task writes the session cell.
async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let queue = inner.topology.queue_name();
    let limit = inner.settings.channel_timeout;
    let mut live_connection: Option<Arc<dyn BrokerConnection>> = None;
    let mut live_channel: Option<Arc<dyn BrokerChannel>> = None;

    'connect: loop {
        release(live_channel.take(), live_connection.take(), limit).await;

        if *shutdown.borrow() {
            break;
        }

        inner.set_state(SupervisorState::Connecting);
        info!(endpoint = %inner.endpoint, queue, "attempting to connect...");

        let connected = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break 'connect,
            connected = inner.connect() => connected,
        };
        let connection = match connected {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = err.to_string(), queue, "failed to connect. retrying...");
                if sleep_or_shutdown(inner.settings.reconnect_delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        info!(queue, "rmq connected successful!");
        live_connection = Some(connection.clone());

        loop {
            inner.set_state(SupervisorState::Initializing);

            if let Some(reason) = connection.close_signal().reason() {
                warn!(%reason, "connection closed during init. reconnecting...");
                continue 'connect;
            }

            let mut connection_closed = connection.close_signal();
            let initialized = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break 'connect,
                reason = connection_closed.closed() => {
                    warn!(%reason, "connection closed during init. reconnecting...");
                    continue 'connect;
                }
                initialized = inner.init(&connection) => initialized,
            };

            let session = match initialized {
                Ok(session) => session,
                Err(err) => {
                    error!(error = err.to_string(), queue, "failed to init channel. retrying...");
                    if sleep_or_shutdown(inner.settings.reinit_delay, &mut shutdown).await {
                        break 'connect;
                    }
                    continue;
                }
            };

            live_channel = Some(session.channel.clone());
            inner.session.send_replace(Some(session.clone()));
            inner.set_state(SupervisorState::Ready);
            info!(queue, generation = session.generation, "rmq setup successful!");

            let exit = inner.wait_ready_exit(&session, &mut shutdown).await;
            inner.session.send_replace(None);

            match exit {
                ReadyExit::Shutdown => break 'connect,
                ReadyExit::ConnectionClosed(reason) => {
                    warn!(%reason, "connection closed. reconnecting...");
                    continue 'connect;
                }
                ReadyExit::ReconnectRequested => {
                    info!(generation = session.generation, "reconnecting on request...");
                    continue 'connect;
                }
                ReadyExit::ChannelClosed(reason) => {
                    warn!(%reason, queue, "channel closed. re-running init...");
                    release(live_channel.take(), None, limit).await;
                }
            }
        }
    }

    inner.set_state(SupervisorState::Closing);
    inner.session.send_replace(None);
    release(live_channel.take(), live_connection.take(), limit).await;
    inner.set_state(SupervisorState::Closed);
    info!(queue, "supervisor closed");
}
