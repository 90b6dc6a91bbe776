//! # Positioning Engine
//!
//! Owns the motion side of the machine state: position, jog and homing
//! operations, work coordinate systems, soft limits and alarms.
//!
//! Every request is validated against a single write of the state. Valid
//! requests go to the dispatcher as GRBL commands whose completion
//! callbacks commit the result; rejections return before anything is
//! queued. Events are published once the state lock is released.

mod coordinates;
mod homing;
mod jog;

use jogkit_communication::firmware::grbl::commands::{SOFT_RESET, UNLOCK};
use jogkit_communication::firmware::grbl::{alarm_severity, decode_alarm};
use jogkit_communication::{
    Command, CommandDispatcher, CommandResponse, Completion, DeviceListener, StatusReport,
};
use jogkit_core::event_bus::{
    AlarmTriggered, AlarmsCleared, EmergencyStop, PositionChanged, SoftLimitTriggered,
};
use jogkit_core::{
    Alarm, AlarmSeverity, Axis, BoundsError, Error, EventBus, MachineStateHandle, MachineStatus,
    Position, PositionSample, Priority, Result, SoftLimits, EMERGENCY_STOP_ALARM,
};
use jogkit_settings::MachineSettings;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// Tag of incremental jog commands
pub const JOG_TAG: &str = "jog";
/// Tag of homing commands
pub const HOMING_TAG: &str = "homing";

/// Alarm code recorded when a status report shows `Alarm` without an
/// `ALARM:n` line
const REPORTED_ALARM: u8 = 0;

pub(crate) struct Inner {
    settings: MachineSettings,
    state: MachineStateHandle,
    bus: Arc<EventBus>,
    dispatcher: CommandDispatcher,
    generation: AtomicU64,
    last_broadcast: Mutex<Position>,
    history: Mutex<VecDeque<PositionSample>>,
    continuous: Mutex<HashMap<Axis, JoinHandle<()>>>,
}

impl Inner {
    /// Start a new operation generation; older completions are ignored
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, token: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == token
    }

    /// Queue `command`; `on_complete` runs on the dispatcher worker
    fn submit_with<F>(self: &Arc<Self>, command: Command, on_complete: F) -> Result<Completion>
    where
        F: FnOnce(&Inner, &Result<CommandResponse>) + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.dispatcher.submit(command.on_complete(move |result| {
            if let Some(inner) = weak.upgrade() {
                on_complete(&inner, result);
            }
        }))
    }

    /// History and broadcast for a committed position
    ///
    /// Changes below the threshold, measured from the last broadcast
    /// position, are neither recorded nor broadcast.
    fn record(&self, sample: PositionSample) {
        let significant = {
            let mut last = self.last_broadcast.lock();
            if sample.position.max_axis_delta(&last) >= self.settings.position_change_threshold {
                *last = sample.position;
                true
            } else {
                false
            }
        };
        if significant {
            {
                let mut history = self.history.lock();
                history.push_back(sample);
                while history.len() > self.settings.position_history_size {
                    history.pop_front();
                }
            }
            self.bus.emit(PositionChanged {
                position: sample.position,
                work_position: sample.work_position,
                timestamp: sample.timestamp,
            });
        }
    }

    /// Commit a single-axis move
    fn commit_axis(&self, axis: Axis, value: f64) -> PositionSample {
        let sample = self.state.update(|s| {
            s.set_position(s.position.with(axis, value));
            s.sample()
        });
        self.record(sample);
        sample
    }

    fn report_bounds(&self, error: &Error) {
        if let Error::Bounds(BoundsError {
            axis,
            target,
            limit,
            ..
        }) = error
        {
            tracing::warn!("Soft limit on {}: {:.3} beyond {:.3}", axis, target, limit);
            self.bus.emit(SoftLimitTriggered {
                axis: *axis,
                limit: *limit,
                target: *target,
            });
        }
    }

    fn abort_continuous(&self) {
        for (axis, task) in self.continuous.lock().drain() {
            tracing::debug!("Aborting continuous jog on {}", axis);
            task.abort();
        }
    }

    fn raise(&self, alarm: Alarm) {
        tracing::warn!("{}", alarm);
        let changed = self.state.update(|s| s.raise_alarm(alarm.clone()));
        self.bus.emit(AlarmTriggered { alarm });
        if let Some(changed) = changed {
            self.bus.emit(changed);
        }
    }
}

impl DeviceListener for Inner {
    fn on_status_report(&self, report: &StatusReport) {
        let position = report.resolved_machine_position();
        let (sample, changed, fault) = self.state.update(|s| {
            let sample = match position {
                Some(p) if p.is_finite() && p != s.position => {
                    s.set_position(p);
                    Some(s.sample())
                }
                _ => None,
            };

            let mut changed = None;
            let mut fault = false;
            match (s.status, report.status) {
                (Some(MachineStatus::Alarm), _) | (None, _) | (_, None) => {}
                (Some(_), Some(MachineStatus::Alarm)) => fault = true,
                (Some(current), Some(next)) => {
                    let idle_owner =
                        s.active_operation.is_none() && s.continuous_axes.is_empty();
                    let reportable = matches!(
                        next,
                        MachineStatus::Idle
                            | MachineStatus::Run
                            | MachineStatus::Hold
                            | MachineStatus::Door
                            | MachineStatus::Check
                            | MachineStatus::Sleep
                    );
                    if idle_owner && reportable && current.can_transition_to(next) {
                        changed = s.set_status(Some(next));
                    }
                }
            }
            (sample, changed, fault)
        });

        if let Some(sample) = sample {
            self.record(sample);
        }
        if let Some(changed) = changed {
            self.bus.emit(changed);
        }
        if fault {
            self.abort_continuous();
            self.raise(Alarm::new(
                REPORTED_ALARM,
                "Controller reported alarm state",
                AlarmSeverity::Error,
            ));
        }
    }

    fn on_alarm(&self, code: u8) {
        self.abort_continuous();
        self.raise(Alarm::new(code, decode_alarm(code), alarm_severity(code)));
    }
}

/// Motion front end over the shared machine state
#[derive(Clone)]
pub struct PositioningEngine {
    inner: Arc<Inner>,
}

impl PositioningEngine {
    /// Create an engine and register it for controller output
    pub fn new(
        settings: MachineSettings,
        state: MachineStateHandle,
        bus: Arc<EventBus>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        let inner = Arc::new(Inner {
            settings,
            state,
            bus,
            dispatcher,
            generation: AtomicU64::new(0),
            last_broadcast: Mutex::new(Position::ORIGIN),
            history: Mutex::new(VecDeque::new()),
            continuous: Mutex::new(HashMap::new()),
        });
        let listener: Weak<dyn DeviceListener> = Arc::downgrade(&inner) as Weak<Inner>;
        inner.dispatcher.set_listener(listener);
        Self { inner }
    }

    /// Settings in use
    pub fn settings(&self) -> &MachineSettings {
        &self.inner.settings
    }

    /// Recorded positions, oldest first
    pub fn position_history(&self) -> Vec<PositionSample> {
        self.inner.history.lock().iter().copied().collect()
    }

    /// Replace the soft limits
    pub fn set_soft_limits(&self, limits: SoftLimits) -> Result<()> {
        if !limits.is_consistent() {
            return Err(Error::config("soft limit minimum exceeds maximum"));
        }
        if !limits.min.is_finite() || !limits.max.is_finite() {
            return Err(Error::config("soft limits must be finite"));
        }
        self.inner.state.update(|s| {
            s.soft_limits = limits;
            s.touch();
        });
        tracing::info!(
            "Soft limits {} ({} .. {})",
            if limits.enabled { "enabled" } else { "disabled" },
            limits.min,
            limits.max
        );
        Ok(())
    }

    /// Halt everything and lock the machine in `Alarm`
    ///
    /// The state change and the soft reset are committed before this
    /// returns; nothing here awaits.
    pub fn emergency_stop(&self) -> Result<()> {
        if !self.inner.state.is_connected() {
            return Err(Error::not_ready("not connected"));
        }

        self.inner.next_generation();
        self.inner.abort_continuous();

        let alarm = Alarm::new(
            EMERGENCY_STOP_ALARM,
            decode_alarm(EMERGENCY_STOP_ALARM),
            AlarmSeverity::Critical,
        );
        let changed = self.inner.state.update(|s| {
            s.emergency_stop_active = true;
            s.raise_alarm(alarm.clone())
        });

        let cancelled = self.inner.dispatcher.cancel_pending("emergency stop");
        let sent = self
            .inner
            .dispatcher
            .enqueue(Command::realtime(SOFT_RESET).priority(Priority::Emergency));
        tracing::error!("Emergency stop ({} queued commands cancelled)", cancelled);

        self.inner.bus.emit(EmergencyStop { active: true });
        self.inner.bus.emit(AlarmTriggered { alarm });
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        sent.map(|_| ())
    }

    /// Unlock the controller and clear alarms
    pub async fn reset(&self) -> Result<()> {
        if !self.inner.state.is_connected() {
            return Err(Error::not_ready("not connected"));
        }

        self.inner
            .dispatcher
            .send(Command::line(UNLOCK).priority(Priority::High))
            .await?;

        let (changed, was_stopped) = self.inner.state.update(|s| {
            s.alarms.clear();
            let was_stopped = std::mem::replace(&mut s.emergency_stop_active, false);
            let changed = if s.in_alarm() {
                s.set_status(Some(MachineStatus::Idle))
            } else {
                None
            };
            (changed, was_stopped)
        });

        tracing::info!("Alarms cleared");
        self.inner.bus.emit(AlarmsCleared);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        if was_stopped {
            self.inner.bus.emit(EmergencyStop { active: false });
        }
        Ok(())
    }

    /// Drop transient motion state after the connection closed
    pub fn on_disconnected(&self) {
        self.inner.next_generation();
        self.inner.abort_continuous();
        *self.inner.last_broadcast.lock() = Position::ORIGIN;
    }
}

impl std::fmt::Debug for PositioningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositioningEngine")
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .field("history", &self.inner.history.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jogkit_communication::firmware::grbl::response_parser::parse_status_report;
    use jogkit_core::{ConnectionStatus, EventKind, MachineEvent};
    use jogkit_settings::DispatcherSettings;

    fn engine(settings: MachineSettings) -> (PositioningEngine, MachineStateHandle, Arc<EventBus>) {
        let state = MachineStateHandle::default();
        state.update(|s| {
            s.connection.status = ConnectionStatus::Connected;
            s.status = Some(MachineStatus::Idle);
        });
        let bus = Arc::new(EventBus::new());
        let engine = PositioningEngine::new(
            settings,
            state.clone(),
            bus.clone(),
            CommandDispatcher::new(DispatcherSettings::default()),
        );
        (engine, state, bus)
    }

    fn kinds(rx: &mut tokio::sync::broadcast::Receiver<MachineEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[test]
    fn test_threshold_broadcast() {
        let (engine, _state, bus) = engine(MachineSettings {
            position_change_threshold: 0.5,
            ..MachineSettings::default()
        });
        let mut rx = bus.receiver();

        engine.inner.commit_axis(Axis::X, 0.2);
        assert!(kinds(&mut rx).is_empty());
        engine.inner.commit_axis(Axis::X, 0.6);
        assert_eq!(kinds(&mut rx), vec![EventKind::PositionChanged]);
        engine.inner.commit_axis(Axis::X, 0.9);
        assert!(kinds(&mut rx).is_empty());
        assert_eq!(engine.position_history().len(), 1);
    }

    #[test]
    fn test_small_moves_skip_history() {
        let (engine, state, _bus) = engine(MachineSettings {
            position_change_threshold: 0.5,
            ..MachineSettings::default()
        });
        for x in [0.1, 0.2, 0.3] {
            engine.inner.commit_axis(Axis::X, x);
        }
        assert!(engine.position_history().is_empty());
        assert_eq!(state.position().x, 0.3);
    }

    #[test]
    fn test_history_is_bounded() {
        let (engine, _state, _bus) = engine(MachineSettings {
            position_history_size: 4,
            ..MachineSettings::default()
        });
        for i in 0..10 {
            engine.inner.commit_axis(Axis::Y, i as f64);
        }
        let history = engine.position_history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].position.y, 6.0);
    }

    #[test]
    fn test_status_report_updates_position_but_not_alarm() {
        let (engine, state, _bus) = engine(MachineSettings::default());
        let report = parse_status_report("Hold:0|MPos:1,2,3|FS:0,0").unwrap();
        engine.inner.on_status_report(&report);
        assert_eq!(state.position(), Position::new(1.0, 2.0, 3.0));
        assert_eq!(state.status(), Some(MachineStatus::Hold));

        state.update(|s| s.set_status(Some(MachineStatus::Alarm)));
        let report = parse_status_report("Idle|MPos:1,2,3").unwrap();
        engine.inner.on_status_report(&report);
        assert_eq!(state.status(), Some(MachineStatus::Alarm));
    }

    #[test]
    fn test_reported_alarm_raises_fault() {
        let (engine, state, bus) = engine(MachineSettings::default());
        let mut rx = bus.receiver();
        let report = parse_status_report("Alarm|MPos:0,0,0").unwrap();
        engine.inner.on_status_report(&report);

        assert!(state.read(|s| s.in_alarm() && s.alarms.len() == 1));
        assert!(kinds(&mut rx).contains(&EventKind::AlarmTriggered));
    }

    #[test]
    fn test_alarm_line_decoded() {
        let (engine, state, _bus) = engine(MachineSettings::default());
        engine.inner.on_alarm(1);
        let alarm = state.read(|s| s.alarms[0].clone());
        assert_eq!(alarm.code, 1);
        assert_eq!(alarm.severity, AlarmSeverity::Critical);
    }

    #[test]
    fn test_inconsistent_soft_limits_rejected() {
        let (engine, state, _bus) = engine(MachineSettings::default());
        let bad = SoftLimits::new(Position::new(10.0, 0.0, 0.0), Position::new(0.0, 10.0, 10.0));
        assert!(engine.set_soft_limits(bad).is_err());
        assert_eq!(state.read(|s| s.soft_limits), SoftLimits::default());
    }

    #[test]
    fn test_emergency_stop_requires_connection() {
        let (engine, state, _bus) = engine(MachineSettings::default());
        state.update(|s| s.connection.status = ConnectionStatus::Disconnected);
        assert!(engine.emergency_stop().is_err());
        assert!(!state.read(|s| s.emergency_stop_active));
    }
}
