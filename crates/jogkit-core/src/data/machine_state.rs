//! Canonical machine state and its shared handle

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{
    Alarm, Axis, ConnectionState, ConnectionStatus, CoordinateSystems, MachineStatus, Operation,
    Position, SoftLimits, Units,
};
use crate::event_bus::StateChanged;
use crate::{Error, Result};

/// Everything the core knows about the machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    /// Connection fields
    pub connection: ConnectionState,
    /// Controller status; `None` while disconnected
    pub status: Option<MachineStatus>,
    /// Machine-frame position
    pub position: Position,
    /// Position in the active work coordinate system
    pub work_position: Position,
    /// Machine-wide unit flag
    pub units: Units,
    /// G54-G59
    pub coordinate_systems: CoordinateSystems,
    /// Travel limits
    pub soft_limits: SoftLimits,
    /// Uncleared alarms, oldest first
    pub alarms: Vec<Alarm>,
    /// Motion operation owning the machine
    pub active_operation: Option<Operation>,
    /// Axes currently jogging continuously
    pub continuous_axes: BTreeSet<Axis>,
    /// Emergency stop engaged and not yet reset
    pub emergency_stop_active: bool,
    /// Time of the last mutation
    pub updated_at: DateTime<Utc>,
}

impl MachineState {
    /// Fresh state: disconnected, at the origin, `G54` active
    pub fn new(soft_limits: SoftLimits, units: Units) -> Self {
        Self {
            connection: ConnectionState::default(),
            status: None,
            position: Position::ORIGIN,
            work_position: Position::ORIGIN,
            units,
            coordinate_systems: CoordinateSystems::new(),
            soft_limits,
            alarms: Vec::new(),
            active_operation: None,
            continuous_axes: BTreeSet::new(),
            emergency_stop_active: false,
            updated_at: Utc::now(),
        }
    }

    /// Record a mutation
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check if the transport is usable
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Check if the machine is in alarm
    pub fn in_alarm(&self) -> bool {
        self.status == Some(MachineStatus::Alarm)
    }

    /// Replace the machine position and recompute the work position
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
        self.recompute_work_position();
        self.touch();
    }

    /// Recompute `work_position` from the active offset
    pub fn recompute_work_position(&mut self) {
        self.work_position = self.coordinate_systems.to_work(&self.position);
    }

    /// Set the status unconditionally
    ///
    /// Returns the change to publish, or `None` if the status did not change.
    pub fn set_status(&mut self, status: Option<MachineStatus>) -> Option<StateChanged> {
        if self.status == status {
            return None;
        }
        let old_state = self.status;
        self.status = status;
        self.touch();
        Some(StateChanged {
            old_state,
            new_state: status,
        })
    }

    /// Move the status along the transition table
    ///
    /// An invalid transition leaves the state untouched and is reported as
    /// `MachineNotReady`.
    pub fn transition(&mut self, to: MachineStatus) -> Result<Option<StateChanged>> {
        match self.status {
            Some(from) if !from.can_transition_to(to) => Err(Error::not_ready(format!(
                "cannot move from {} to {}",
                from, to
            ))),
            None => Err(Error::not_ready("not connected")),
            _ => Ok(self.set_status(Some(to))),
        }
    }

    /// Check that a new motion operation may start
    ///
    /// Connection and alarm checks come first, then the operation guard.
    pub fn ensure_ready_for_motion(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::not_ready("not connected"));
        }
        if self.emergency_stop_active {
            return Err(Error::not_ready("emergency stop active"));
        }
        match self.status {
            Some(MachineStatus::Alarm) => return Err(Error::not_ready("machine in alarm")),
            None => return Err(Error::not_ready("no controller status")),
            _ => {}
        }
        if let Some(operation) = self.active_operation {
            return Err(Error::OperationInProgress { operation });
        }
        match self.status {
            Some(status) if status.accepts_motion() => Ok(()),
            Some(status) => Err(Error::not_ready(format!("machine is {}", status))),
            None => Err(Error::not_ready("no controller status")),
        }
    }

    /// Raise an alarm and force the `Alarm` status
    pub fn raise_alarm(&mut self, alarm: Alarm) -> Option<StateChanged> {
        self.alarms.push(alarm);
        self.active_operation = None;
        self.continuous_axes.clear();
        self.set_status(Some(MachineStatus::Alarm))
    }

    /// Return to defaults after a disconnect
    ///
    /// Offsets, limits, units and the retry counter survive; position,
    /// status, alarms and transient flags do not.
    pub fn reset_for_disconnect(&mut self) -> Option<StateChanged> {
        let changed = self.set_status(None);
        self.connection.status = ConnectionStatus::Disconnected;
        self.position = Position::ORIGIN;
        self.recompute_work_position();
        self.alarms.clear();
        self.active_operation = None;
        self.continuous_axes.clear();
        self.emergency_stop_active = false;
        self.touch();
        changed
    }

    /// Sample of the current position
    pub fn sample(&self) -> PositionSample {
        PositionSample {
            position: self.position,
            work_position: self.work_position,
            timestamp: self.updated_at,
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new(SoftLimits::default(), Units::default())
    }
}

/// One entry of the position history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Machine-frame position
    pub position: Position,
    /// Work-frame position
    pub work_position: Position,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

/// Shared handle to the single `MachineState`
///
/// Closures passed to `read`/`update` run under the lock and must not
/// await or publish events.
#[derive(Debug, Clone, Default)]
pub struct MachineStateHandle {
    inner: Arc<RwLock<MachineState>>,
}

impl MachineStateHandle {
    /// Wrap a state
    pub fn new(state: MachineState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Owned clone of the current state
    pub fn snapshot(&self) -> MachineState {
        self.inner.read().clone()
    }

    /// Read under the shared lock
    pub fn read<R>(&self, f: impl FnOnce(&MachineState) -> R) -> R {
        f(&self.inner.read())
    }

    /// Mutate under the exclusive lock
    pub fn update<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Current controller status
    pub fn status(&self) -> Option<MachineStatus> {
        self.inner.read().status
    }

    /// Current machine position
    pub fn position(&self) -> Position {
        self.inner.read().position
    }

    /// Check if the transport is usable
    pub fn is_connected(&self) -> bool {
        self.inner.read().is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AlarmSeverity, WcsSlot};
    use crate::ErrorKind;

    fn connected_idle() -> MachineState {
        let mut state = MachineState::default();
        state.connection.status = ConnectionStatus::Connected;
        state.status = Some(MachineStatus::Idle);
        state
    }

    #[test]
    fn test_transition_reports_change() {
        let mut state = connected_idle();
        let change = state.transition(MachineStatus::Jog).unwrap().unwrap();
        assert_eq!(change.old_state, Some(MachineStatus::Idle));
        assert_eq!(change.new_state, Some(MachineStatus::Jog));
        assert!(state.transition(MachineStatus::Jog).unwrap().is_none());
    }

    #[test]
    fn test_alarm_blocks_motion() {
        let mut state = connected_idle();
        state.raise_alarm(Alarm::new(1, "hard limit", AlarmSeverity::Critical));
        assert!(state.in_alarm());
        assert_eq!(
            state.ensure_ready_for_motion().unwrap_err().kind(),
            ErrorKind::MachineNotReady
        );
        assert!(state.transition(MachineStatus::Jog).is_err());
        assert!(state.transition(MachineStatus::Idle).is_ok());
    }

    #[test]
    fn test_operation_guard() {
        let mut state = connected_idle();
        state.active_operation = Some(Operation::Homing);
        assert_eq!(
            state.ensure_ready_for_motion().unwrap_err().kind(),
            ErrorKind::OperationInProgress
        );
    }

    #[test]
    fn test_disconnect_reset_preserves_configuration() {
        let mut state = connected_idle();
        state
            .coordinate_systems
            .set_offset(WcsSlot::G55, Position::new(1.0, 2.0, 3.0));
        state.coordinate_systems.activate(WcsSlot::G55);
        state.connection.reconnect_attempts = 2;
        state.set_position(Position::new(10.0, 10.0, 10.0));
        state.alarms.push(Alarm::new(2, "x", AlarmSeverity::Error));

        let change = state.reset_for_disconnect().unwrap();
        assert_eq!(change.new_state, None);
        assert_eq!(state.position, Position::ORIGIN);
        assert_eq!(state.work_position, Position::new(-1.0, -2.0, -3.0));
        assert!(state.alarms.is_empty());
        assert_eq!(state.connection.reconnect_attempts, 2);
        assert_eq!(state.coordinate_systems.active_slot(), WcsSlot::G55);
    }

    #[test]
    fn test_handle_snapshot_is_detached() {
        let handle = MachineStateHandle::default();
        let snapshot = handle.snapshot();
        handle.update(|s| s.set_position(Position::new(5.0, 0.0, 0.0)));
        assert_eq!(snapshot.position, Position::ORIGIN);
        assert_eq!(handle.position().x, 5.0);
    }
}
