//! Incremental and continuous jogging

use jogkit_communication::firmware::grbl::commands::{jog_to, JOG_CANCEL};
use jogkit_communication::{Command, CommandResponse};
use jogkit_core::event_bus::{JogCompleted, JogStarted, JogStopped, SoftLimitTriggered, StateChanged};
use jogkit_core::{
    Axis, BoundSide, BoundsError, CommandError, Direction, Error, MachineStatus, Operation,
    Position, Priority, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::{Inner, PositioningEngine, JOG_TAG};

/// Tag of the step commands of one continuously jogging axis
pub(crate) fn continuous_tag(axis: Axis) -> &'static str {
    match axis {
        Axis::X => "jog-x",
        Axis::Y => "jog-y",
        Axis::Z => "jog-z",
    }
}

fn validate_feed_rate(feed_rate: f64) -> Result<()> {
    if !feed_rate.is_finite() || feed_rate <= 0.0 {
        return Err(Error::malformed(format!(
            "feed rate must be positive, got {}",
            feed_rate
        )));
    }
    Ok(())
}

enum Step {
    Continue,
    LimitReached,
    Stopped,
}

impl Inner {
    /// Leave the jog state; returns the status change, if any
    fn end_jog(&self, operation: Operation) -> Option<StateChanged> {
        self.state.update(|s| {
            if s.active_operation == Some(operation) {
                s.active_operation = None;
            }
            if s.status == Some(MachineStatus::Jog) {
                s.set_status(Some(MachineStatus::Idle))
            } else {
                None
            }
        })
    }

    fn finish_incremental(
        &self,
        token: u64,
        command: String,
        axis: Axis,
        target: Position,
        result: &Result<CommandResponse>,
    ) -> bool {
        if !self.is_current(token) {
            tracing::debug!("Ignoring superseded jog completion '{}'", command);
            return false;
        }

        match result {
            Ok(_) => {
                let (sample, changed) = self.state.update(|s| {
                    s.active_operation = None;
                    s.set_position(s.position.with(axis, target.get(axis)));
                    let changed = if s.status == Some(MachineStatus::Jog) {
                        s.set_status(Some(MachineStatus::Idle))
                    } else {
                        None
                    };
                    (s.sample(), changed)
                });
                self.record(sample);
                if let Some(changed) = changed {
                    self.bus.emit(changed);
                }
                self.bus.emit(JogCompleted {
                    command,
                    position: sample.position,
                });
                true
            }
            Err(e) => {
                tracing::warn!("Jog '{}' failed: {}", command, e);
                if let Some(changed) = self.end_jog(Operation::IncrementalJog) {
                    self.bus.emit(changed);
                }
                self.bus.emit(JogStopped {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Send one step of a continuous jog and wait for it
    async fn continuous_step(
        self: &Arc<Self>,
        axis: Axis,
        direction: Direction,
        feed_rate: f64,
        step: f64,
    ) -> Result<Step> {
        let plan = self.state.read(|s| {
            if !s.continuous_axes.contains(&axis) {
                return None;
            }
            let requested = s.position.get(axis) + direction.sign() * step;
            let limit = s.soft_limits.limit_towards(axis, direction);
            let target = match limit {
                Some(limit) if (requested - limit) * direction.sign() >= 0.0 => limit,
                _ => requested,
            };
            Some((s.position.with(axis, target), requested, limit, s.units))
        });
        let Some((target, requested, limit, units)) = plan else {
            return Ok(Step::Stopped);
        };

        let value = target.get(axis);
        let command = Command::line(jog_to(&[axis], &target, feed_rate, units))
            .tag(continuous_tag(axis));
        let completion = self.submit_with(command, move |inner, result| {
            let jogging = inner.state.read(|s| s.continuous_axes.contains(&axis));
            if result.is_ok() && jogging {
                inner.commit_axis(axis, value);
            }
        })?;

        match completion.wait().await {
            Ok(_) => {}
            Err(Error::Command(CommandError::Cancelled { .. })) => return Ok(Step::Stopped),
            Err(e) => return Err(e),
        }

        match limit {
            Some(limit) if value == limit => {
                tracing::info!("Continuous jog on {} reached the soft limit {:.3}", axis, limit);
                self.bus.emit(SoftLimitTriggered {
                    axis,
                    limit,
                    target: requested,
                });
                Ok(Step::LimitReached)
            }
            _ => Ok(Step::Continue),
        }
    }

    /// Remove `axis` from the jogging set; the last one out ends the jog
    fn release_axis(&self, axis: Axis, reason: &str) {
        let (stopped, changed) = self.state.update(|s| {
            if !s.continuous_axes.remove(&axis) || !s.continuous_axes.is_empty() {
                return (false, None);
            }
            if s.active_operation == Some(Operation::ContinuousJog) {
                s.active_operation = None;
            }
            let changed = if s.status == Some(MachineStatus::Jog) {
                s.set_status(Some(MachineStatus::Idle))
            } else {
                None
            };
            (true, changed)
        });

        if stopped {
            if let Some(changed) = changed {
                self.bus.emit(changed);
            }
            self.bus.emit(JogStopped {
                reason: reason.to_string(),
            });
        }
    }
}

async fn run_continuous(
    engine: Weak<Inner>,
    axis: Axis,
    direction: Direction,
    feed_rate: f64,
    interval: Duration,
) {
    let step = feed_rate / 60.0 * interval.as_secs_f64();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        ticker.tick().await;
        let Some(inner) = engine.upgrade() else {
            return;
        };
        match inner.continuous_step(axis, direction, feed_rate, step).await {
            Ok(Step::Continue) => {}
            Ok(Step::LimitReached) => break "soft limit reached".to_string(),
            Ok(Step::Stopped) => return,
            Err(e) => {
                tracing::warn!("Continuous jog on {} failed: {}", axis, e);
                break e.to_string();
            }
        }
    };

    if let Some(inner) = engine.upgrade() {
        inner.continuous.lock().remove(&axis);
        inner.release_axis(axis, &reason);
    }
}

impl PositioningEngine {
    /// Jog one axis by a fixed distance
    ///
    /// Distance and feed rate default to the configured jog settings.
    /// Resolves with the new machine position once the controller has
    /// acknowledged the move. A jog superseded by `stop_jog` or an
    /// emergency stop before its acknowledgment fails with `Cancelled`.
    pub async fn jog_incremental(
        &self,
        axis: Axis,
        direction: Direction,
        distance: Option<f64>,
        feed_rate: Option<f64>,
    ) -> Result<Position> {
        let distance = distance.unwrap_or(self.inner.settings.jog_distance);
        let feed_rate = feed_rate.unwrap_or(self.inner.settings.jog_feed_rate);
        if !distance.is_finite() || distance <= 0.0 {
            return Err(Error::malformed(format!(
                "jog distance must be positive, got {}",
                distance
            )));
        }
        validate_feed_rate(feed_rate)?;

        let prepared = self.inner.state.update(|s| {
            s.ensure_ready_for_motion()?;
            let target = s
                .position
                .with(axis, s.position.get(axis) + direction.sign() * distance);
            s.soft_limits.check_axis(axis, target.get(axis))?;
            let changed = s.transition(MachineStatus::Jog)?;
            s.active_operation = Some(Operation::IncrementalJog);
            Ok::<_, Error>((target, s.units, changed))
        });
        let (target, units, changed) = prepared.inspect_err(|e| self.inner.report_bounds(e))?;

        let token = self.inner.next_generation();
        let text = jog_to(&[axis], &target, feed_rate, units);
        tracing::debug!("Jog {}{} {:.3}: {}", axis, direction, distance, text);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        self.inner.bus.emit(JogStarted {
            command: text.clone(),
        });

        let committed = Arc::new(AtomicBool::new(false));
        let command_text = text.clone();
        let submitted = {
            let committed = committed.clone();
            let command_text = command_text.clone();
            self.inner.submit_with(
                Command::line(text).tag(JOG_TAG),
                move |inner, result| {
                    let done =
                        inner.finish_incremental(token, command_text, axis, target, result);
                    committed.store(done, Ordering::SeqCst);
                },
            )
        };
        let completion = match submitted {
            Ok(completion) => completion,
            Err(e) => {
                if let Some(changed) = self.inner.end_jog(Operation::IncrementalJog) {
                    self.inner.bus.emit(changed);
                }
                self.inner.bus.emit(JogStopped {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        completion.wait().await?;
        if !committed.load(Ordering::SeqCst) {
            return Err(CommandError::Cancelled {
                command: command_text,
                reason: "jog was stopped before it completed".to_string(),
            }
            .into());
        }
        Ok(target)
    }

    /// Jog one axis until stopped or the soft limit is reached
    ///
    /// Several axes may jog at once. Returns as soon as the jog has started.
    pub fn jog_continuous(
        &self,
        axis: Axis,
        direction: Direction,
        feed_rate: Option<f64>,
    ) -> Result<()> {
        let feed_rate = feed_rate.unwrap_or(self.inner.settings.jog_feed_rate);
        validate_feed_rate(feed_rate)?;
        let interval = Duration::from_millis(self.inner.settings.jog_step_interval_ms.max(1));
        let step = feed_rate / 60.0 * interval.as_secs_f64();

        let prepared = self.inner.state.update(|s| {
            if s.continuous_axes.contains(&axis) {
                return Err(Error::OperationInProgress {
                    operation: Operation::ContinuousJog,
                });
            }
            if s.active_operation != Some(Operation::ContinuousJog) {
                s.ensure_ready_for_motion()?;
            }
            if let Some(limit) = s.soft_limits.limit_towards(axis, direction) {
                let current = s.position.get(axis);
                if (limit - current) * direction.sign() <= 0.0 {
                    return Err(BoundsError {
                        axis,
                        bound: match direction {
                            Direction::Positive => BoundSide::Max,
                            Direction::Negative => BoundSide::Min,
                        },
                        target: current + direction.sign() * step,
                        limit,
                    }
                    .into());
                }
            }
            let changed = s.transition(MachineStatus::Jog)?;
            s.active_operation = Some(Operation::ContinuousJog);
            s.continuous_axes.insert(axis);
            s.touch();
            Ok(changed)
        });
        let changed = prepared.inspect_err(|e| self.inner.report_bounds(e))?;

        {
            let mut tasks = self.inner.continuous.lock();
            let task = tokio::spawn(run_continuous(
                Arc::downgrade(&self.inner),
                axis,
                direction,
                feed_rate,
                interval,
            ));
            if let Some(previous) = tasks.insert(axis, task) {
                previous.abort();
            }
        }

        tracing::info!("Continuous jog {}{} at F{}", axis, direction, feed_rate);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        self.inner.bus.emit(JogStarted {
            command: format!("continuous {}{} F{}", axis, direction, feed_rate),
        });
        Ok(())
    }

    /// Stop every jog
    ///
    /// Continuous jog tasks are aborted, queued jog commands cancelled and
    /// the jog-cancel byte sent. Calling it while nothing jogs is a no-op.
    pub fn stop_jog(&self, reason: Option<&str>) -> Result<()> {
        let reason = reason.unwrap_or("stopped by operator");

        if self
            .inner
            .state
            .read(|s| s.active_operation == Some(Operation::IncrementalJog))
        {
            self.inner.next_generation();
        }
        self.inner.abort_continuous();
        self.inner.dispatcher.cancel_tagged(JOG_TAG, reason);
        for axis in Axis::ALL {
            self.inner.dispatcher.cancel_tagged(continuous_tag(axis), reason);
        }

        let (was_jogging, changed) = self.inner.state.update(|s| {
            let jog_operation = matches!(
                s.active_operation,
                Some(Operation::IncrementalJog | Operation::ContinuousJog)
            );
            let was_jogging = jog_operation
                || !s.continuous_axes.is_empty()
                || s.status == Some(MachineStatus::Jog);
            if !was_jogging {
                return (false, None);
            }
            if jog_operation {
                s.active_operation = None;
            }
            s.continuous_axes.clear();
            let changed = if s.status == Some(MachineStatus::Jog) {
                s.set_status(Some(MachineStatus::Idle))
            } else {
                None
            };
            (true, changed)
        });
        if !was_jogging {
            return Ok(());
        }

        self.send_jog_cancel();
        tracing::info!("Jog stopped: {}", reason);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        self.inner.bus.emit(JogStopped {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Stop the continuous jog of one axis; other axes keep jogging
    pub fn stop_axis(&self, axis: Axis) -> Result<()> {
        if let Some(task) = self.inner.continuous.lock().remove(&axis) {
            task.abort();
        }
        self.inner
            .dispatcher
            .cancel_tagged(continuous_tag(axis), "axis stopped");

        let last = self
            .inner
            .state
            .read(|s| s.continuous_axes.len() == 1 && s.continuous_axes.contains(&axis));
        if last {
            self.send_jog_cancel();
        }
        self.inner.release_axis(axis, "stopped by operator");
        Ok(())
    }

    fn send_jog_cancel(&self) {
        let cancel = Command::realtime(JOG_CANCEL).priority(Priority::High);
        if let Err(e) = self.inner.dispatcher.enqueue(cancel) {
            tracing::debug!("Jog cancel not sent: {}", e);
        }
    }
}
