use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::api::SnapshotApi;
use crate::config::UpstreamConfig;
use crate::protocol::{MatchUpdate, UpstreamEvent};

use super::backoff::ReconnectBackoff;
use super::state::ConnectionState;
use super::transport::{self, WsStream};

const COMMAND_BUFFER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    Resume,
}

/// How a live connection session ended.
enum SessionEnd {
    /// Shutdown signal received; the run loop must exit.
    Shutdown,
    /// Operator called `disconnect()`; park until told to connect again.
    Stopped,
    /// Transport dropped, server closed, or the watchdog forced a teardown.
    Lost(String),
}

/// Why a connect cycle stopped before producing a connection.
enum EstablishEnd {
    Connected(Box<WsStream>),
    /// All handshake attempts of this cycle failed.
    Exhausted(String),
    Stopped,
    Shutdown,
}

enum PollEnd {
    Reconnected(Box<WsStream>),
    Stopped,
    Shutdown,
}

enum Wait {
    Elapsed,
    Resume,
    Stopped,
    Shutdown,
}

/// Cloneable handle for controlling the manager and observing its state.
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ManagerHandle {
    /// Ask the manager to establish the upstream connection. Idempotent:
    /// a connected manager ignores it.
    pub async fn connect(&self) {
        let _ = self.commands.send(Command::Connect).await;
    }

    /// Close the connection and cancel every pending reconnect timer.
    /// Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect).await;
    }

    /// Host-visibility hint: if a reconnect is pending, retry now instead
    /// of waiting out the backoff. Does not restart a manager stopped by
    /// an explicit `disconnect()`.
    pub async fn resume(&self) {
        let _ = self.commands.send(Command::Resume).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Human-readable status string for UI surfaces.
    pub fn status(&self) -> String {
        self.state.borrow().to_string()
    }

    /// Watch receiver for state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Owns the single upstream push connection.
///
/// Retry policy is two-tier: each connect cycle makes a bounded series of
/// handshake attempts with capped exponential backoff (transport tier);
/// exhausted cycles are counted, and crossing `max_reconnect_attempts`
/// drops the manager into HTTP polling fallback until a handshake lands
/// again (application tier).
pub struct ConnectionManager {
    config: UpstreamConfig,
    api: Arc<dyn SnapshotApi>,
    events: mpsc::Sender<UpstreamEvent>,
    state_tx: watch::Sender<ConnectionState>,
    commands_rx: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
    backoff: ReconnectBackoff,
    /// Consecutive exhausted connect cycles since the last session.
    reconnect_attempts: u32,
    /// False after an explicit disconnect; the manager parks instead of
    /// retrying.
    wants_connection: bool,
}

impl ConnectionManager {
    pub fn new(
        config: UpstreamConfig,
        api: Arc<dyn SnapshotApi>,
        events: mpsc::Sender<UpstreamEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, ManagerHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initializing);

        let backoff = ReconnectBackoff::from_config(&config);
        let manager = Self {
            config,
            api,
            events,
            state_tx,
            commands_rx,
            shutdown,
            backoff,
            reconnect_attempts: 0,
            wants_connection: true,
        };

        let handle = ManagerHandle {
            commands: commands_tx,
            state: state_rx,
        };

        (manager, handle)
    }

    /// Run the connection loop until shutdown. All timers (backoff sleeps,
    /// idle watchdog, polling interval) live inside this call and cannot
    /// outlive it.
    pub async fn run(mut self) {
        tracing::info!(url = %self.config.url, "Connection manager started");

        loop {
            if !self.wants_connection {
                match self.wait_while_parked().await {
                    Wait::Resume | Wait::Elapsed => {}
                    Wait::Stopped => continue,
                    Wait::Shutdown => break,
                }
                self.wants_connection = true;
                continue;
            }

            match self.establish().await {
                EstablishEnd::Connected(stream) => match self.session(*stream).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Stopped => {
                        self.wants_connection = false;
                        self.set_state(ConnectionState::Disconnected {
                            reason: "client disconnect".to_string(),
                        });
                    }
                    SessionEnd::Lost(reason) => {
                        self.set_state(ConnectionState::Disconnected { reason });
                    }
                },
                EstablishEnd::Exhausted(message) => {
                    self.reconnect_attempts += 1;

                    if self.reconnect_attempts > self.config.max_reconnect_attempts {
                        match self.poll_until_reconnected().await {
                            PollEnd::Reconnected(stream) => match self.session(*stream).await {
                                SessionEnd::Shutdown => break,
                                SessionEnd::Stopped => {
                                    self.wants_connection = false;
                                    self.set_state(ConnectionState::Disconnected {
                                        reason: "client disconnect".to_string(),
                                    });
                                }
                                SessionEnd::Lost(reason) => {
                                    self.set_state(ConnectionState::Disconnected { reason });
                                }
                            },
                            PollEnd::Stopped => {
                                self.wants_connection = false;
                                self.set_state(ConnectionState::Disconnected {
                                    reason: "client disconnect".to_string(),
                                });
                            }
                            PollEnd::Shutdown => break,
                        }
                    } else {
                        tracing::warn!(
                            attempts = self.reconnect_attempts,
                            max_attempts = self.config.max_reconnect_attempts,
                            error = %message,
                            "Connect cycle exhausted, scheduling retry"
                        );
                        self.set_state(ConnectionState::Error { message });

                        let delay = self.backoff.next_delay();
                        match self.interruptible_sleep(delay).await {
                            Wait::Elapsed | Wait::Resume => {}
                            Wait::Stopped => {
                                self.wants_connection = false;
                            }
                            Wait::Shutdown => break,
                        }
                    }
                }
                EstablishEnd::Stopped => {
                    self.wants_connection = false;
                    self.set_state(ConnectionState::Disconnected {
                        reason: "client disconnect".to_string(),
                    });
                }
                EstablishEnd::Shutdown => break,
            }
        }

        tracing::info!("Connection manager stopped");
    }

    /// One transport-tier connect cycle: bounded handshake attempts with
    /// backoff between them.
    async fn establish(&mut self) -> EstablishEnd {
        let mut last_error = String::from("no connection attempt made");

        for attempt in 1..=self.config.transport_retry_attempts.max(1) {
            match transport::connect(&self.config.url, self.config.connect_timeout()).await {
                Ok(stream) => return EstablishEnd::Connected(Box::new(stream)),
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        attempt = attempt,
                        url = %self.config.url,
                        error = %last_error,
                        "Upstream connect failed"
                    );
                }
            }

            if attempt < self.config.transport_retry_attempts {
                let delay = self.backoff.next_delay();
                match self.interruptible_sleep(delay).await {
                    // A resume hint skips the rest of the wait.
                    Wait::Elapsed | Wait::Resume => {}
                    Wait::Stopped => return EstablishEnd::Stopped,
                    Wait::Shutdown => return EstablishEnd::Shutdown,
                }
            }
        }

        EstablishEnd::Exhausted(last_error)
    }

    /// Drive one live connection until it ends.
    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        self.reconnect_attempts = 0;
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);

        let (mut sink, mut source) = stream.split();
        let mut last_inbound = Instant::now();
        let mut watchdog = tokio::time::interval(self.config.idle_check_interval());
        // Skip immediate first tick
        watchdog.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands_rx.recv() => match command {
                    Some(Command::Disconnect) => {
                        let _ = sink.close().await;
                        return SessionEnd::Stopped;
                    }
                    // Already connected: connect() and resume() are no-ops.
                    Some(Command::Connect) | Some(Command::Resume) => {}
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = watchdog.tick() => {
                    let idle = last_inbound.elapsed();
                    if idle >= self.config.idle_timeout() {
                        tracing::warn!(
                            idle_secs = idle.as_secs(),
                            "No inbound traffic within idle window, forcing reconnect"
                        );
                        let _ = sink.close().await;
                        return SessionEnd::Lost("idle timeout".to_string());
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Lost("server closed connection".to_string());
                    }
                    Some(Ok(message)) => {
                        // Any frame counts as liveness, including protocol pings.
                        last_inbound = Instant::now();
                        if let Some(event) = transport::decode_frame(&message) {
                            if self.events.send(event).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return SessionEnd::Lost(e.to_string());
                    }
                    None => {
                        return SessionEnd::Lost("stream ended".to_string());
                    }
                },
            }
        }
    }

    /// Application-tier fallback: pull snapshots over HTTP on a fixed
    /// cadence and opportunistically retry the push connection every
    /// cycle. Returns when a handshake succeeds or the manager is told to
    /// stop.
    async fn poll_until_reconnected(&mut self) -> PollEnd {
        self.set_state(ConnectionState::PollingFallback);
        tracing::warn!(
            interval_secs = self.config.polling_interval_secs,
            "Reconnect budget exhausted, entering HTTP polling fallback"
        );

        let mut interval = tokio::time::interval(self.config.polling_interval());

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return PollEnd::Shutdown,
                command = self.commands_rx.recv() => match command {
                    Some(Command::Disconnect) => return PollEnd::Stopped,
                    Some(Command::Connect) | Some(Command::Resume) => {
                        if let Ok(stream) =
                            transport::connect(&self.config.url, self.config.connect_timeout()).await
                        {
                            return PollEnd::Reconnected(Box::new(stream));
                        }
                    }
                    None => return PollEnd::Shutdown,
                },
                _ = interval.tick() => {
                    self.pull_once().await;

                    match transport::connect(&self.config.url, self.config.connect_timeout()).await {
                        Ok(stream) => {
                            tracing::info!("Push connection re-established, leaving polling fallback");
                            return PollEnd::Reconnected(Box::new(stream));
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Reconnect attempt during polling failed");
                        }
                    }
                }
            }
        }
    }

    /// One fallback pull: fetch the current match and feed it through the
    /// normal event path. Polled data carries no upstream sequence, so it
    /// is emitted timestamp-less.
    async fn pull_once(&mut self) {
        match self.api.current_match().await {
            Ok(current) => {
                let event = UpstreamEvent::MatchUpdate(MatchUpdate {
                    current,
                    timestamp: None,
                });
                let _ = self.events.send(event).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fallback poll failed");
            }
        }
    }

    /// Sleep that can be cut short by commands or shutdown.
    async fn interruptible_sleep(&mut self, delay: Duration) -> Wait {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Wait::Elapsed,
            _ = self.shutdown.recv() => Wait::Shutdown,
            command = self.commands_rx.recv() => match command {
                Some(Command::Resume) | Some(Command::Connect) => Wait::Resume,
                Some(Command::Disconnect) => Wait::Stopped,
                None => Wait::Shutdown,
            },
        }
    }

    /// Wait for orders while explicitly disconnected. A resume hint does
    /// not override an operator stop; only `connect()` does.
    async fn wait_while_parked(&mut self) -> Wait {
        tokio::select! {
            _ = self.shutdown.recv() => Wait::Shutdown,
            command = self.commands_rx.recv() => match command {
                Some(Command::Connect) => Wait::Elapsed,
                Some(Command::Resume) | Some(Command::Disconnect) => Wait::Stopped,
                None => Wait::Shutdown,
            },
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            tracing::info!(state = %state, "Connection state changed");
            let _ = self.state_tx.send(state);
        }
    }
}
