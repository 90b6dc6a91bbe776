//! Connection lifecycle
//!
//! `ConnectionManager` owns the connection fields of the machine state. It
//! opens transports through a `TransportFactory`, attaches them to the
//! dispatcher, polls status while connected and retries failed or dropped
//! connections with a bounded number of attempts.

use jogkit_core::event_bus::{ConnectionChanged, ConnectionFailed};
use jogkit_core::{
    ConnectionError, ConnectionState, ConnectionStatus, Error, EventBus, MachineStateHandle,
    MachineStatus, Priority, Result,
};
use jogkit_settings::ConnectionSettings;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::communication::TransportFactory;
use crate::dispatcher::{Command, CommandDispatcher};
use crate::firmware::grbl::commands::STATUS_QUERY;

/// Tag carried by status poll commands
pub const STATUS_POLL_TAG: &str = "status-poll";

struct Inner {
    settings: ConnectionSettings,
    state: MachineStateHandle,
    bus: Arc<EventBus>,
    dispatcher: CommandDispatcher,
    factory: Arc<dyn TransportFactory>,
    lifecycle: tokio::sync::Mutex<()>,
    retry: Mutex<Option<JoinHandle<()>>>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

/// Connection lifecycle manager
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager and register it for transport failures
    pub fn new(
        settings: ConnectionSettings,
        state: MachineStateHandle,
        bus: Arc<EventBus>,
        dispatcher: CommandDispatcher,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let inner = Arc::new(Inner {
            settings,
            state,
            bus,
            dispatcher,
            factory,
            lifecycle: tokio::sync::Mutex::new(()),
            retry: Mutex::new(None),
            poll: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner
            .dispatcher
            .set_failure_handler(Arc::new(move |reason: &str| {
                if let Some(inner) = weak.upgrade() {
                    let manager = ConnectionManager { inner };
                    let reason = reason.to_string();
                    tokio::spawn(async move { manager.handle_link_lost(reason).await });
                }
            }));

        Self { inner }
    }

    /// Settings in use
    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Snapshot of the connection fields
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read(|s| s.connection.clone())
    }

    /// Check if the transport is usable
    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    /// Check if a retry is scheduled or running
    pub fn is_retrying(&self) -> bool {
        self.inner
            .retry
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Open `port` and attach it to the dispatcher
    ///
    /// Returns the first failure; retries continue in the background when
    /// automatic reconnection is enabled.
    pub async fn connect(&self, port: &str, baud_rate: u32) -> Result<()> {
        if port.trim().is_empty() {
            return Err(ConnectionError::InvalidParameters {
                reason: "port name is empty".to_string(),
            }
            .into());
        }
        if baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be positive".to_string(),
            }
            .into());
        }

        let busy = self.inner.state.read(|s| {
            (s.connection.status == ConnectionStatus::Connecting)
                .then(|| s.connection.port.clone().unwrap_or_default())
        });
        if let Some(port) = busy {
            return Err(ConnectionError::AlreadyConnected { port }.into());
        }

        self.abort_retry();
        let _lifecycle = self.inner.lifecycle.lock().await;

        let current = self.inner.state.read(|s| {
            s.is_connected()
                .then(|| s.connection.port.clone().unwrap_or_default())
        });
        if let Some(port) = current {
            return Err(ConnectionError::AlreadyConnected { port }.into());
        }

        tracing::info!("Connecting to {} at {} baud", port, baud_rate);
        self.begin_attempt(port, baud_rate);
        match self.open_and_attach(port, baud_rate).await {
            Ok(()) => {
                self.on_connected(port);
                Ok(())
            }
            Err(e) => {
                if self.on_attempt_failed(port, &e, 0) {
                    self.schedule_retry(port.to_string(), baud_rate);
                }
                Err(e.into())
            }
        }
    }

    /// Close the connection and reset the machine state
    ///
    /// Safe to call in any state, any number of times.
    pub async fn disconnect(&self) -> Result<()> {
        self.abort_retry();
        self.stop_polling();
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.abort_retry();

        if let Some(mut transport) = self.inner.dispatcher.detach().await {
            if let Err(e) = transport.close().await {
                tracing::warn!("Error closing {}: {}", transport.port(), e);
            }
        }

        let (previous, port, changed) = self.inner.state.update(|s| {
            let previous = s.connection.status;
            let changed = s.reset_for_disconnect();
            (previous, s.connection.port.clone(), changed)
        });

        if previous != ConnectionStatus::Disconnected {
            tracing::info!("Disconnected from {}", port.as_deref().unwrap_or("<none>"));
            self.inner.bus.emit(ConnectionChanged {
                is_connected: false,
                port,
            });
        }
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        Ok(())
    }

    fn begin_attempt(&self, port: &str, baud_rate: u32) {
        self.inner.state.update(|s| {
            s.connection.status = ConnectionStatus::Connecting;
            s.connection.port = Some(port.to_string());
            s.connection.baud_rate = baud_rate;
            s.touch();
        });
        self.inner.bus.emit(ConnectionChanged {
            is_connected: false,
            port: Some(port.to_string()),
        });
    }

    async fn open_and_attach(&self, port: &str, baud_rate: u32) -> std::result::Result<(), ConnectionError> {
        let timeout = self.inner.settings.connect_timeout();
        let transport = match tokio::time::timeout(timeout, self.inner.factory.open(port, baud_rate)).await {
            Ok(opened) => opened?,
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    port: port.to_string(),
                    timeout_ms: self.inner.settings.connect_timeout_ms,
                })
            }
        };
        self.inner.dispatcher.attach(transport).await;
        Ok(())
    }

    fn on_connected(&self, port: &str) {
        let changed = self.inner.state.update(|s| {
            s.connection.status = ConnectionStatus::Connected;
            s.connection.reconnect_attempts = 0;
            s.connection.last_error = None;
            s.set_status(Some(MachineStatus::Idle))
        });

        tracing::info!("Connected to {}", port);
        self.inner.bus.emit(ConnectionChanged {
            is_connected: true,
            port: Some(port.to_string()),
        });
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        self.start_polling();
    }

    /// Record a failed attempt; returns whether another attempt will follow
    fn on_attempt_failed(&self, port: &str, error: &ConnectionError, attempt: u32) -> bool {
        let settings = &self.inner.settings;
        let will_retry = self.inner.state.update(|s| {
            s.connection.status = ConnectionStatus::Error;
            s.connection.last_error = Some(error.to_string());
            s.touch();
            settings.auto_reconnect
                && s.connection.reconnect_attempts < settings.max_reconnect_attempts
        });

        tracing::warn!(
            "Connection to {} failed (attempt {}): {}",
            port,
            attempt,
            error
        );
        self.inner.bus.emit(ConnectionChanged {
            is_connected: false,
            port: Some(port.to_string()),
        });
        self.inner.bus.emit(ConnectionFailed {
            port: port.to_string(),
            message: error.to_string(),
            attempt,
            will_retry,
        });

        if !will_retry {
            self.inner.state.update(|s| {
                s.connection.status = ConnectionStatus::Disconnected;
                s.touch();
            });
            tracing::warn!("Giving up on {}", port);
            self.inner.bus.emit(ConnectionChanged {
                is_connected: false,
                port: Some(port.to_string()),
            });
        }
        will_retry
    }

    fn schedule_retry(&self, port: String, baud_rate: u32) {
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.retry_loop(port, baud_rate).await });
        if let Some(previous) = self.inner.retry.lock().replace(task) {
            previous.abort();
        }
    }

    async fn retry_loop(&self, port: String, baud_rate: u32) {
        loop {
            let attempt = self.inner.state.update(|s| {
                s.connection.reconnect_attempts += 1;
                s.connection.reconnect_attempts
            });
            let delay = self.inner.settings.retry_delay(attempt);
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                port,
                delay,
                attempt,
                self.inner.settings.max_reconnect_attempts
            );
            tokio::time::sleep(delay).await;

            let _lifecycle = self.inner.lifecycle.lock().await;
            self.begin_attempt(&port, baud_rate);
            match self.open_and_attach(&port, baud_rate).await {
                Ok(()) => {
                    self.on_connected(&port);
                    return;
                }
                Err(e) => {
                    if !self.on_attempt_failed(&port, &e, attempt) {
                        return;
                    }
                }
            }
        }
    }

    fn abort_retry(&self) {
        if let Some(task) = self.inner.retry.lock().take() {
            task.abort();
        }
    }

    async fn handle_link_lost(&self, reason: String) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.state.is_connected() {
            return;
        }
        self.stop_polling();

        let (port, baud_rate, changed) = self.inner.state.update(|s| {
            s.connection.status = ConnectionStatus::Error;
            s.active_operation = None;
            s.continuous_axes.clear();
            let changed = s.set_status(None);
            (
                s.connection.port.clone().unwrap_or_default(),
                s.connection.baud_rate,
                changed,
            )
        });

        tracing::error!("Connection to {} lost: {}", port, reason);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }

        let error = ConnectionError::ConnectionLost { reason };
        if self.on_attempt_failed(&port, &error, 0) {
            self.schedule_retry(port, baud_rate);
        }
    }

    fn start_polling(&self) {
        let Some(interval) = self.inner.settings.poll_interval() else {
            return;
        };
        let dispatcher = self.inner.dispatcher.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if dispatcher.has_tag(STATUS_POLL_TAG) {
                    continue;
                }
                let query = Command::realtime(STATUS_QUERY)
                    .priority(Priority::Low)
                    .tag(STATUS_POLL_TAG);
                match dispatcher.enqueue(query) {
                    Ok(_) => {}
                    Err(Error::Connection(_)) => break,
                    Err(e) => tracing::debug!("Status poll skipped: {}", e),
                }
            }
        });
        if let Some(previous) = self.inner.poll.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_polling(&self) {
        if let Some(task) = self.inner.poll.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection", &self.connection_state())
            .finish_non_exhaustive()
    }
}
