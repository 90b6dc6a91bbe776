//! # Command Dispatcher
//!
//! Serializes every command sent to the controller.
//!
//! Commands are queued by priority and drained by a single worker task per
//! attached transport. The worker writes one command, waits for its
//! acknowledgment (or the command timeout) and resolves it before taking
//! the next one, so exactly one command is in flight at any time.
//!
//! - `error:n` and timeouts fail only that command; the acknowledgment a
//!   timed-out line still owes is discarded when it arrives late
//! - a transport I/O failure is fatal: the queue is failed, the transport
//!   dropped and the registered failure handler called
//! - status reports and `ALARM:n` lines are forwarded to the
//!   `DeviceListener` as they are read

mod command;
mod queue;

pub use command::{Command, CommandCallback, CommandId, CommandPayload, CommandResponse};
pub use queue::CommandQueue;

use jogkit_core::{CommandError, ConnectionError, Error, Priority, Result};
use jogkit_settings::DispatcherSettings;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::communication::Transport;
use crate::firmware::grbl::commands::STATUS_QUERY;
use crate::firmware::grbl::error_decoder::decode_error;
use crate::firmware::grbl::response_parser::{parse_response, GrblResponse, StatusReport};

/// Receives unsolicited controller output observed by the dispatcher
pub trait DeviceListener: Send + Sync {
    /// A status report was read
    fn on_status_report(&self, report: &StatusReport);

    /// An `ALARM:n` line was read
    fn on_alarm(&self, code: u8);
}

/// Pending outcome of a submitted command
#[derive(Debug)]
pub struct Completion {
    id: CommandId,
    rx: oneshot::Receiver<Result<CommandResponse>>,
}

impl Completion {
    /// Id of the submitted command
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Wait for the outcome
    ///
    /// A command dropped without being resolved reports `ConnectionClosed`.
    pub async fn wait(self) -> Result<CommandResponse> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ConnectionError::ConnectionClosed.into()))
    }
}

/// Called once with the failure reason when the transport is lost
pub type FailureHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: CommandId,
    tag: Option<&'static str>,
}

struct Shared {
    settings: DispatcherSettings,
    queue: Mutex<CommandQueue>,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    attached: AtomicBool,
    paused: AtomicBool,
    wake: Notify,
    next_id: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    listener: RwLock<Option<Weak<dyn DeviceListener>>>,
    on_failure: RwLock<Option<FailureHandler>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn listener(&self) -> Option<Arc<dyn DeviceListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    /// Take the next command unless paused; `Emergency` ignores the pause
    fn next_command(&self) -> Option<Command> {
        let mut queue = self.queue.lock();
        if self.paused.load(Ordering::SeqCst) && queue.peek_priority() != Some(Priority::Emergency)
        {
            return None;
        }
        let command = queue.pop()?;
        *self.in_flight.lock() = Some(InFlight {
            id: command.id,
            tag: command.tag,
        });
        Some(command)
    }
}

/// Handle to the command dispatcher
///
/// Cheap to clone; every clone drives the same queue.
#[derive(Clone)]
pub struct CommandDispatcher {
    shared: Arc<Shared>,
}

impl CommandDispatcher {
    /// Create a detached dispatcher
    pub fn new(settings: DispatcherSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                queue: Mutex::new(CommandQueue::new()),
                transport: tokio::sync::Mutex::new(None),
                attached: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                wake: Notify::new(),
                next_id: AtomicU64::new(1),
                in_flight: Mutex::new(None),
                listener: RwLock::new(None),
                on_failure: RwLock::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &DispatcherSettings {
        &self.shared.settings
    }

    /// Register the receiver of status reports and alarms
    pub fn set_listener(&self, listener: Weak<dyn DeviceListener>) {
        *self.shared.listener.write() = Some(listener);
    }

    /// Register the transport-loss handler
    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self.shared.on_failure.write() = Some(handler);
    }

    /// Check if a transport is attached
    pub fn is_attached(&self) -> bool {
        self.shared.attached.load(Ordering::SeqCst)
    }

    /// Number of queued commands, excluding the one in flight
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if draining is paused
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn validate(&self, payload: &CommandPayload) -> Result<()> {
        let CommandPayload::Line(line) = payload else {
            return Ok(());
        };
        if line.trim().is_empty() {
            return Err(Error::malformed("command is empty"));
        }
        if line.contains(['\n', '\r']) {
            return Err(Error::malformed("command must be a single line"));
        }
        if line.len() > self.shared.settings.max_line_length {
            return Err(Error::malformed(format!(
                "command is {} bytes, limit is {}",
                line.len(),
                self.shared.settings.max_line_length
            )));
        }
        Ok(())
    }

    /// Queue a command without waiting for it
    ///
    /// Its callback, if any, receives the outcome. A rejected command is
    /// dropped without running its callback.
    pub fn enqueue(&self, mut command: Command) -> Result<CommandId> {
        self.validate(&command.payload)?;

        let id = {
            let mut queue = self.shared.queue.lock();
            if !self.shared.attached.load(Ordering::SeqCst) {
                return Err(ConnectionError::ConnectionClosed.into());
            }
            let capacity = self.shared.settings.queue_capacity;
            if command.priority != Priority::Emergency && queue.len() >= capacity {
                tracing::warn!("Command queue full, rejecting '{}'", command.payload);
                return Err(CommandError::QueueFull { capacity }.into());
            }
            let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
            command.id = id;
            command.enqueued_at = Some(tokio::time::Instant::now());
            tracing::debug!(
                "Queued #{} '{}' ({}), {} pending",
                id,
                command.payload,
                command.priority,
                queue.len() + 1
            );
            queue.push(command);
            id
        };

        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Queue a command and return a handle to its outcome
    ///
    /// Enqueue failures are returned immediately, before anything awaits.
    pub fn submit(&self, command: Command) -> Result<Completion> {
        let (tx, rx) = oneshot::channel();
        let id = self.enqueue(command.with_waiter(tx))?;
        Ok(Completion { id, rx })
    }

    /// Queue a command and wait for its outcome
    pub async fn send(&self, command: Command) -> Result<CommandResponse> {
        self.submit(command)?.wait().await
    }

    /// Send a command line at `priority` and wait for its outcome
    pub async fn send_line(&self, text: &str, priority: Priority) -> Result<CommandResponse> {
        self.send(Command::line(text).priority(priority)).await
    }

    /// Hold draining; the queue keeps accepting commands
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        tracing::debug!("Dispatch paused");
    }

    /// Release draining
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        tracing::debug!("Dispatch resumed");
        self.shared.wake.notify_one();
    }

    /// Fail every queued non-emergency command with `Cancelled`
    pub fn cancel_pending(&self, reason: &str) -> usize {
        let removed = self
            .shared
            .queue
            .lock()
            .drain_where(|c| c.priority != Priority::Emergency);
        Self::cancel_all(removed, reason)
    }

    /// Fail every queued command carrying `tag` with `Cancelled`
    pub fn cancel_tagged(&self, tag: &str, reason: &str) -> usize {
        let removed = self
            .shared
            .queue
            .lock()
            .drain_where(|c| c.tag == Some(tag));
        Self::cancel_all(removed, reason)
    }

    fn cancel_all(commands: Vec<Command>, reason: &str) -> usize {
        let count = commands.len();
        for command in commands {
            let text = command.text();
            command.complete(Err(CommandError::Cancelled {
                command: text,
                reason: reason.to_string(),
            }
            .into()));
        }
        if count > 0 {
            tracing::debug!("Cancelled {} queued commands: {}", count, reason);
        }
        count
    }

    /// Check if a command with `tag` is queued or in flight
    pub fn has_tag(&self, tag: &str) -> bool {
        let in_flight = self
            .shared
            .in_flight
            .lock()
            .is_some_and(|current| current.tag == Some(tag));
        in_flight || self.shared.queue.lock().contains_tag(tag)
    }

    /// Id of the command being executed
    pub fn in_flight(&self) -> Option<CommandId> {
        self.shared.in_flight.lock().map(|current| current.id)
    }

    /// Attach a transport and start draining
    ///
    /// A transport that is still attached is detached and closed first.
    pub async fn attach(&self, transport: Box<dyn Transport>) {
        if let Some(mut previous) = self.detach().await {
            if let Err(e) = previous.close().await {
                tracing::warn!("Failed to close replaced transport: {}", e);
            }
        }

        tracing::debug!("Attaching transport {}", transport.port());
        *self.shared.transport.lock().await = Some(transport);
        {
            let _queue = self.shared.queue.lock();
            self.shared.attached.store(true, Ordering::SeqCst);
        }
        let worker = tokio::spawn(run_worker(self.shared.clone()));
        *self.shared.worker.lock() = Some(worker);
    }

    /// Stop draining and hand back the transport
    ///
    /// Queued commands fail with `ConnectionClosed`. The in-flight command
    /// finishes first.
    pub async fn detach(&self) -> Option<Box<dyn Transport>> {
        let pending = {
            let mut queue = self.shared.queue.lock();
            self.shared.attached.store(false, Ordering::SeqCst);
            queue.drain_all()
        };
        for command in pending {
            command.complete(Err(ConnectionError::ConnectionClosed.into()));
        }

        self.shared.wake.notify_one();
        let worker = self.shared.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("Dispatcher worker ended abnormally: {}", e);
            }
        }

        self.shared.transport.lock().await.take()
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("attached", &self.is_attached())
            .field("paused", &self.is_paused())
            .field("queued", &self.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Reply {
    messages: Vec<String>,
    status: Option<StatusReport>,
    rejected: Option<u8>,
}

async fn run_worker(shared: Arc<Shared>) {
    tracing::debug!("Dispatcher worker started");
    // Acknowledgments owed by lines that timed out
    let mut owed_acks = 0usize;
    loop {
        if !shared.attached.load(Ordering::SeqCst) {
            break;
        }
        let Some(command) = shared.next_command() else {
            shared.wake.notified().await;
            continue;
        };

        let timeout = shared.settings.command_timeout();
        let listener = shared.listener();
        let outcome = {
            let mut transport = shared.transport.lock().await;
            match transport.as_mut() {
                Some(transport) => {
                    tokio::time::timeout(
                        timeout,
                        exchange(
                            transport.as_mut(),
                            &command.payload,
                            listener,
                            &mut owed_acks,
                        ),
                    )
                    .await
                }
                None => Ok(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no transport attached",
                ))),
            }
        };

        let text = command.text();
        match outcome {
            Ok(Ok(reply)) => {
                let result = match reply.rejected {
                    Some(code) => {
                        tracing::warn!("Controller rejected '{}': error:{}", text, code);
                        Err(CommandError::Rejected {
                            command: text,
                            code,
                            message: decode_error(code),
                        }
                        .into())
                    }
                    None => Ok(CommandResponse {
                        id: command.id,
                        command: text,
                        messages: reply.messages,
                        status: reply.status,
                    }),
                };
                command.complete(result);
            }
            Ok(Err(e)) => {
                fail_transport(&shared, command, e).await;
                break;
            }
            Err(_) => {
                tracing::warn!("Command '{}' timed out after {:?}", text, timeout);
                if matches!(command.payload, CommandPayload::Line(_)) {
                    owed_acks += 1;
                }
                command.complete(Err(CommandError::Timeout {
                    command: text,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into()));
            }
        }
        *shared.in_flight.lock() = None;
    }
    tracing::debug!("Dispatcher worker stopped");
}

async fn fail_transport(shared: &Shared, command: Command, error: io::Error) {
    let reason = error.to_string();
    tracing::error!("Transport failed during '{}': {}", command.payload, reason);

    let fatal = || Error::Fatal {
        reason: reason.clone(),
    };
    command.complete(Err(fatal()));
    let remaining = {
        let mut queue = shared.queue.lock();
        shared.attached.store(false, Ordering::SeqCst);
        queue.drain_all()
    };
    for pending in remaining {
        pending.complete(Err(fatal()));
    }
    *shared.in_flight.lock() = None;

    if let Some(mut transport) = shared.transport.lock().await.take() {
        let _ = transport.close().await;
    }

    let handler = shared.on_failure.read().clone();
    if let Some(handler) = handler {
        handler(&reason);
    }
}

/// Write one payload and read until it is acknowledged
///
/// The first `owed_acks` acknowledgments read belong to earlier lines that
/// timed out and are skipped.
async fn exchange(
    transport: &mut dyn Transport,
    payload: &CommandPayload,
    listener: Option<Arc<dyn DeviceListener>>,
    owed_acks: &mut usize,
) -> io::Result<Reply> {
    let wants_status = *payload == CommandPayload::Realtime(STATUS_QUERY);
    match payload {
        CommandPayload::Line(line) => transport.write_line(line).await?,
        CommandPayload::Realtime(byte) => {
            transport.write_realtime(*byte).await?;
            if !wants_status {
                return Ok(Reply::default());
            }
        }
    }

    let mut reply = Reply::default();
    loop {
        let line = transport.read_line().await?;
        let Some(response) = parse_response(&line) else {
            continue;
        };
        match response {
            GrblResponse::Ok | GrblResponse::Error(_) if *owed_acks > 0 => {
                *owed_acks -= 1;
                tracing::debug!("Discarded late acknowledgment '{}'", line);
            }
            GrblResponse::Ok if !wants_status => return Ok(reply),
            GrblResponse::Error(code) if !wants_status => {
                reply.rejected = Some(code);
                return Ok(reply);
            }
            GrblResponse::Status(report) => {
                if let Some(listener) = &listener {
                    listener.on_status_report(&report);
                }
                let done = wants_status;
                reply.status = Some(report);
                if done {
                    return Ok(reply);
                }
            }
            GrblResponse::Alarm(code) => {
                tracing::warn!("Controller raised ALARM:{}", code);
                if let Some(listener) = &listener {
                    listener.on_alarm(code);
                }
                reply.messages.push(line);
            }
            _ => reply.messages.push(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{MockDevice, TransportFactory};

    async fn attached() -> (MockDevice, CommandDispatcher) {
        let device = MockDevice::new();
        let dispatcher = CommandDispatcher::new(DispatcherSettings::default());
        let transport = device.factory().open("mock", 115200).await.unwrap();
        dispatcher.attach(transport).await;
        (device, dispatcher)
    }

    #[tokio::test]
    async fn test_rejects_before_attach() {
        let dispatcher = CommandDispatcher::new(DispatcherSettings::default());
        let err = dispatcher.enqueue(Command::line("G0 X1")).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_lines() {
        let (_device, dispatcher) = attached().await;
        let long = "G".repeat(81);
        for bad in ["", "   ", "G0 X1\nG0 X2", long.as_str()] {
            let err = dispatcher.enqueue(Command::line(bad)).unwrap_err();
            assert!(
                matches!(err, Error::Command(CommandError::Malformed { .. })),
                "{:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_send_and_rejection() {
        let (device, dispatcher) = attached().await;

        let response = dispatcher.send_line("G0 X1", Priority::Normal).await.unwrap();
        assert_eq!(response.command, "G0 X1");

        device.reject_next("G1", 22);
        let err = dispatcher.send_line("G1 X1", Priority::Normal).await.unwrap_err();
        match err {
            Error::Command(CommandError::Rejected { code, .. }) => assert_eq!(code, 22),
            other => panic!("unexpected error: {:?}", other),
        }

        // The queue keeps draining after a rejection
        assert!(dispatcher.send_line("G0 X2", Priority::Normal).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_query_returns_report() {
        let (device, dispatcher) = attached().await;
        device.set_position(jogkit_core::Position::new(1.0, 2.0, 3.0));

        let response = dispatcher
            .send(Command::realtime(STATUS_QUERY))
            .await
            .unwrap();
        let report = response.status.unwrap();
        assert_eq!(
            report.machine_position,
            Some(jogkit_core::Position::new(1.0, 2.0, 3.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_only_that_command() {
        let (device, dispatcher) = attached().await;
        device.ignore_next_lines(1);

        let err = dispatcher.send_line("G4 P1", Priority::Normal).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(dispatcher.send_line("G0 X1", Priority::Normal).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_is_not_taken_by_next_command() {
        let (device, dispatcher) = attached().await;
        device.ignore_next_lines(1);

        let err = dispatcher.send_line("G4 P20", Priority::Normal).await.unwrap_err();
        assert!(err.is_timeout());

        // The dwell finishes after the timeout
        device.push_line("ok");
        device.reject_next("G1", 22);
        let err = dispatcher.send_line("G1 X1", Priority::Normal).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Command(CommandError::Rejected { code: 22, .. })
        ));
        assert!(dispatcher.send_line("G0 X2", Priority::Normal).await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_fails_queued_commands() {
        let (_device, dispatcher) = attached().await;
        dispatcher.pause();
        let pending = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.send_line("G0 X1", Priority::Normal).await })
        };
        tokio::task::yield_now().await;
        while dispatcher.is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(dispatcher.detach().await.is_some());
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectionClosed)
        ));
        assert!(!dispatcher.is_attached());
    }
}
