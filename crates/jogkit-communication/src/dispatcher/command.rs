//! Commands and their results

use jogkit_core::{Priority, Result};
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::firmware::grbl::commands::realtime_name;
use crate::firmware::grbl::response_parser::StatusReport;

/// Identifier assigned at enqueue time
pub type CommandId = u64;

/// Completion callback; runs on the dispatcher worker before the next
/// command is dispatched
pub type CommandCallback = Box<dyn FnOnce(&Result<CommandResponse>) + Send>;

/// What goes on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    /// A command line, terminator excluded
    Line(String),
    /// A single real-time byte
    Realtime(u8),
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandPayload::Line(line) => f.write_str(line),
            CommandPayload::Realtime(byte) => f.write_str(&realtime_name(*byte)),
        }
    }
}

/// Result of a successful exchange
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Command id
    pub id: CommandId,
    /// Command text
    pub command: String,
    /// Informational lines received before the acknowledgment
    pub messages: Vec<String>,
    /// Status report, for status queries
    pub status: Option<StatusReport>,
}

/// A queued unit of work for the controller
pub struct Command {
    pub(crate) id: CommandId,
    pub(crate) payload: CommandPayload,
    pub(crate) priority: Priority,
    pub(crate) tag: Option<&'static str>,
    pub(crate) enqueued_at: Option<Instant>,
    callback: Option<CommandCallback>,
    waiter: Option<oneshot::Sender<Result<CommandResponse>>>,
}

impl Command {
    fn new(payload: CommandPayload) -> Self {
        Self {
            id: 0,
            payload,
            priority: Priority::Normal,
            tag: None,
            enqueued_at: None,
            callback: None,
            waiter: None,
        }
    }

    /// A command line at `Normal` priority
    pub fn line(text: impl Into<String>) -> Self {
        Self::new(CommandPayload::Line(text.into()))
    }

    /// A real-time byte at `Normal` priority
    pub fn realtime(byte: u8) -> Self {
        Self::new(CommandPayload::Realtime(byte))
    }

    /// Set the priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Label the command so it can be found or cancelled as a group
    pub fn tag(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Run `callback` with the outcome
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Result<CommandResponse>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn with_waiter(mut self, waiter: oneshot::Sender<Result<CommandResponse>>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    /// Assigned id; 0 until enqueued
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Payload
    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    /// Priority tier
    pub fn priority_level(&self) -> Priority {
        self.priority
    }

    /// Tag, if any
    pub fn tag_name(&self) -> Option<&'static str> {
        self.tag
    }

    /// When the command entered the queue
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    /// Printable command text
    pub fn text(&self) -> String {
        self.payload.to_string()
    }

    /// Resolve the command: callback first, then any waiter
    pub(crate) fn complete(mut self, result: Result<CommandResponse>) {
        if let Err(e) = &result {
            tracing::debug!("Command #{} '{}' failed: {}", self.id, self.payload, e);
        }
        if let Some(callback) = self.callback.take() {
            callback(&result);
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}
