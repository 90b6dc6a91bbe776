//! Event Bus implementation.
//!
//! Provides the EventBus struct owned by the machine controller. There is
//! no global instance; every component receives the bus it publishes on.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{BusEvent, EventKind, MachineEvent};

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only specific event kinds
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these kinds.
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &MachineEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&event.kind()),
        }
    }
}

type EventHandler = Arc<dyn Fn(&MachineEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
}

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for broadcast.
    pub channel_capacity: usize,
    /// Whether to keep event history.
    pub enable_history: bool,
    /// Maximum number of events to retain in history.
    pub max_history_size: usize,
    /// How long to retain events in history.
    pub history_retention: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            enable_history: false,
            max_history_size: 1000,
            history_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct TimestampedEvent {
    event: MachineEvent,
    timestamp: Instant,
}

/// Publish/subscribe hub for machine events
///
/// Handlers are invoked synchronously on the publishing thread, in
/// registration order, after the registry lock has been released. A
/// handler that panics is logged and skipped; the others still run.
pub struct EventBus {
    sender: broadcast::Sender<MachineEvent>,
    handlers: RwLock<Vec<Subscription>>,
    history: RwLock<VecDeque<TimestampedEvent>>,
    config: EventBusConfig,
}

impl EventBus {
    /// Create a new event bus with default configuration
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create a new event bus with custom configuration
    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            config,
        }
    }

    /// Publish a typed payload
    pub fn emit<E: BusEvent>(&self, payload: E) -> usize {
        self.publish(payload.into_event())
    }

    /// Publish an event to every matching handler and async receiver
    ///
    /// Returns the number of handlers and receivers the event reached.
    pub fn publish(&self, event: MachineEvent) -> usize {
        tracing::debug!("event: {}", event.description());

        if self.config.enable_history {
            self.add_to_history(&event);
        }

        let matching: Vec<(SubscriptionId, EventHandler)> = self
            .handlers
            .read()
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in matching {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(
                        "Event handler {} panicked on {}: {}",
                        id,
                        event.kind(),
                        message
                    );
                }
            }
        }

        delivered + self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to one payload type
    ///
    /// The handler receives the payload struct itself, so it can only be
    /// registered for an event of that shape.
    pub fn on<E, F>(&self, handler: F) -> SubscriptionId
    where
        E: BusEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(
            EventFilter::Kinds(vec![E::KIND]),
            Arc::new(move |event: &MachineEvent| {
                if let Some(payload) = E::from_event(event) {
                    handler(payload);
                }
            }),
        )
    }

    /// Subscribe to every event accepted by `filter`
    pub fn on_any<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&MachineEvent) + Send + Sync + 'static,
    {
        self.register(filter, Arc::new(handler))
    }

    fn register(&self, filter: EventFilter, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.handlers.write().push(Subscription {
            id,
            filter,
            handler,
        });
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Unsubscribe a handler
    ///
    /// Returns true if the subscription was found and removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|s| s.id != id);
        let removed = handlers.len() != before;
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Get a receiver for async consumers
    pub fn receiver(&self) -> broadcast::Receiver<MachineEvent> {
        self.sender.subscribe()
    }

    /// Get the number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Get recent event history (if enabled)
    ///
    /// Returns events since the given instant, or all history if None.
    pub fn history(&self, since: Option<Instant>) -> Vec<MachineEvent> {
        if !self.config.enable_history {
            return Vec::new();
        }

        let history = self.history.read();
        history
            .iter()
            .filter(|e| since.is_none_or(|since| e.timestamp >= since))
            .map(|e| e.event.clone())
            .collect()
    }

    /// Clear event history
    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    /// Get the current configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    fn add_to_history(&self, event: &MachineEvent) {
        let mut history = self.history.write();
        let now = Instant::now();

        history.push_back(TimestampedEvent {
            event: event.clone(),
            timestamp: now,
        });

        let retention = self.config.history_retention;
        while history
            .front()
            .is_some_and(|e| now.duration_since(e.timestamp) > retention)
        {
            history.pop_front();
        }

        while history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::events::{AlarmsCleared, EmergencyStop, JogStopped};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();

        let id = bus.on_any(EventFilter::All, |_| {});
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.off(id));
        assert_eq!(bus.subscriber_count(), 0);

        // Double unsubscribe should return false
        assert!(!bus.off(id));
    }

    #[test]
    fn test_typed_delivery() {
        let bus = EventBus::new();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();

        bus.on(move |e: &JogStopped| sink.lock().push(e.reason.clone()));

        bus.emit(EmergencyStop { active: true });
        bus.emit(JogStopped {
            reason: "operator".to_string(),
        });

        assert_eq!(*reasons.lock(), vec!["operator".to_string()]);
    }

    #[test]
    fn test_kind_filtering() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        bus.on_any(
            EventFilter::Kinds(vec![EventKind::AlarmsCleared, EventKind::EmergencyStop]),
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.emit(AlarmsCleared);
        bus.emit(EmergencyStop { active: false });
        bus.emit(JogStopped {
            reason: "x".to_string(),
        });

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(|_: &AlarmsCleared| panic!("handler failure"));
        let c = count.clone();
        bus.on(move |_: &AlarmsCleared| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(AlarmsCleared), 1);
        assert_eq!(bus.emit(AlarmsCleared), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&bus);
        let own = slot.clone();
        let id = bus.on(move |_: &AlarmsCleared| {
            if let (Some(bus), Some(id)) = (weak.upgrade(), *own.lock()) {
                bus.off(id);
            }
        });
        *slot.lock() = Some(id);

        bus.emit(AlarmsCleared);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_history_max_size() {
        let bus = EventBus::with_config(EventBusConfig {
            enable_history: true,
            max_history_size: 5,
            ..Default::default()
        });

        for i in 0..10 {
            bus.emit(EmergencyStop { active: i % 2 == 0 });
        }

        assert_eq!(bus.history(None).len(), 5);
        bus.clear_history();
        assert!(bus.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_async_receiver() {
        let bus = EventBus::new();
        let mut receiver = bus.receiver();

        bus.emit(EmergencyStop { active: true });

        match receiver.recv().await {
            Ok(MachineEvent::EmergencyStop(e)) => assert!(e.active),
            other => panic!("Wrong event received: {:?}", other),
        }
    }
}
