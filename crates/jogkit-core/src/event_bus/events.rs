//! Event type definitions for the event bus.
//!
//! Every event is a payload struct. `MachineEvent` wraps them for
//! broadcast and history, `EventKind` names them for filtering, and
//! `BusEvent` ties a payload to its kind so typed subscriptions can be
//! checked at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Alarm, Axis, MachineStatus, Position, WcsSlot};

/// A payload type that can travel over the event bus
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// Kind used for filtering
    const KIND: EventKind;

    /// Wrap this payload in the event enum
    fn into_event(self) -> MachineEvent;

    /// Borrow this payload back out of the event enum
    fn from_event(event: &MachineEvent) -> Option<&Self>;
}

macro_rules! machine_events {
    ($( $(#[$doc:meta])* $variant:ident => $name:literal ),* $(,)?) => {
        /// Root event enum for everything published on the bus
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "type", content = "payload")]
        pub enum MachineEvent {
            $( $(#[$doc])* #[serde(rename = $name)] $variant($variant), )*
        }

        /// Event kind for filtering
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventKind {
            $( $(#[$doc])* #[serde(rename = $name)] $variant, )*
        }

        impl EventKind {
            /// Every kind, in declaration order
            pub const ALL: &'static [EventKind] = &[$(EventKind::$variant),*];

            /// Wire name of this kind (`jog_completed`, ...)
            pub fn name(&self) -> &'static str {
                match self {
                    $( EventKind::$variant => $name, )*
                }
            }
        }

        impl MachineEvent {
            /// Get the kind of this event
            pub fn kind(&self) -> EventKind {
                match self {
                    $( MachineEvent::$variant(_) => EventKind::$variant, )*
                }
            }
        }

        $(
            impl BusEvent for $variant {
                const KIND: EventKind = EventKind::$variant;

                fn into_event(self) -> MachineEvent {
                    MachineEvent::$variant(self)
                }

                fn from_event(event: &MachineEvent) -> Option<&Self> {
                    match event {
                        MachineEvent::$variant(payload) => Some(payload),
                        _ => None,
                    }
                }
            }

            impl From<$variant> for MachineEvent {
                fn from(payload: $variant) -> Self {
                    MachineEvent::$variant(payload)
                }
            }
        )*
    };
}

machine_events! {
    /// Connectivity changed
    ConnectionChanged => "connection_changed",
    /// A connection attempt failed or the link dropped
    ConnectionFailed => "connection_error",
    /// Controller status changed
    StateChanged => "state_changed",
    /// Position moved past the broadcast threshold
    PositionChanged => "position_changed",
    /// A jog was dispatched
    JogStarted => "jog_started",
    /// An incremental jog reached its target
    JogCompleted => "jog_completed",
    /// Jogging was stopped
    JogStopped => "jog_stopped",
    /// A homing sequence began
    HomingStarted => "homing_started",
    /// One axis finished homing
    AxisHomed => "axis_homed",
    /// A homing sequence finished
    HomingCompleted => "homing_completed",
    /// Active work coordinate system or its offset changed
    CoordinateSystemChanged => "coordinate_system_changed",
    /// A target hit or crossed a soft limit
    SoftLimitTriggered => "soft_limit_triggered",
    /// An alarm was raised
    AlarmTriggered => "alarm_triggered",
    /// All alarms were cleared
    AlarmsCleared => "alarms_cleared",
    /// Emergency stop engaged or released
    EmergencyStop => "emergency_stop",
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Connectivity transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionChanged {
    /// Whether the transport is usable.
    pub is_connected: bool,
    /// Port of the connection.
    pub port: Option<String>,
}

/// Connection attempt failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFailed {
    /// Port that failed.
    pub port: String,
    /// Error message.
    pub message: String,
    /// Attempt number, 0 for the caller's own attempt.
    pub attempt: u32,
    /// Whether another attempt is scheduled.
    pub will_retry: bool,
}

/// Status transition; `None` while disconnected
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    /// Previous status.
    pub old_state: Option<MachineStatus>,
    /// New status.
    pub new_state: Option<MachineStatus>,
}

/// Position broadcast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionChanged {
    /// Machine-frame position.
    pub position: Position,
    /// Position in the active work coordinate system.
    pub work_position: Position,
    /// When the position was recorded.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JogStarted {
    /// Command text sent to the controller.
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JogCompleted {
    /// Command text that completed.
    pub command: String,
    /// Machine position after the jog.
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JogStopped {
    /// Why jogging stopped.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomingStarted {
    /// Order in which axes are homed.
    pub sequence: Vec<Axis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisHomed {
    /// Axis that reached home.
    pub axis: Axis,
    /// Machine position after homing the axis.
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomingCompleted {
    /// Whether every axis homed.
    pub success: bool,
    /// Machine position at the end of the sequence.
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystemChanged {
    /// Active slot.
    pub system: WcsSlot,
    /// Offset of the active slot.
    pub offset: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimitTriggered {
    /// Axis at the limit.
    pub axis: Axis,
    /// The limit value.
    pub limit: f64,
    /// Requested target.
    pub target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmTriggered {
    /// The new alarm.
    pub alarm: Alarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AlarmsCleared;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStop {
    /// Whether the emergency stop is engaged.
    pub active: bool,
}

impl MachineEvent {
    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            MachineEvent::ConnectionChanged(e) => format!(
                "{} {}",
                if e.is_connected {
                    "Connected to"
                } else {
                    "Disconnected from"
                },
                e.port.as_deref().unwrap_or("<none>")
            ),
            MachineEvent::ConnectionFailed(e) => format!(
                "Connection to {} failed (attempt {}, retry: {}): {}",
                e.port, e.attempt, e.will_retry, e.message
            ),
            MachineEvent::StateChanged(e) => {
                format!("State: {:?} -> {:?}", e.old_state, e.new_state)
            }
            MachineEvent::PositionChanged(e) => format!("Position: {}", e.position),
            MachineEvent::JogStarted(e) => format!("Jog started: {}", e.command),
            MachineEvent::JogCompleted(e) => {
                format!("Jog completed at {}: {}", e.position, e.command)
            }
            MachineEvent::JogStopped(e) => format!("Jog stopped: {}", e.reason),
            MachineEvent::HomingStarted(e) => format!("Homing {:?}", e.sequence),
            MachineEvent::AxisHomed(e) => format!("{} homed", e.axis),
            MachineEvent::HomingCompleted(e) => format!(
                "Homing {}",
                if e.success { "complete" } else { "failed" }
            ),
            MachineEvent::CoordinateSystemChanged(e) => {
                format!("WCS {} offset {}", e.system, e.offset)
            }
            MachineEvent::SoftLimitTriggered(e) => format!(
                "Soft limit on {}: target {:.3}, limit {:.3}",
                e.axis, e.target, e.limit
            ),
            MachineEvent::AlarmTriggered(e) => e.alarm.to_string(),
            MachineEvent::AlarmsCleared(_) => "Alarms cleared".to_string(),
            MachineEvent::EmergencyStop(e) => format!(
                "Emergency stop {}",
                if e.active { "engaged" } else { "released" }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::ConnectionFailed.name(), "connection_error");
        assert_eq!(EventKind::JogCompleted.to_string(), "jog_completed");
        assert_eq!(EventKind::ALL.len(), 15);
    }

    #[test]
    fn test_typed_round_trip() {
        let event = JogStopped {
            reason: "user".to_string(),
        }
        .into_event();
        assert_eq!(event.kind(), EventKind::JogStopped);
        assert_eq!(JogStopped::from_event(&event).map(|e| e.reason.as_str()), Some("user"));
        assert!(JogCompleted::from_event(&event).is_none());
    }

    #[test]
    fn test_event_serialization() {
        let event = MachineEvent::from(EmergencyStop { active: true });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"emergency_stop\""));
        let back: MachineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
