use jogkit_communication::firmware::grbl::commands::{home_axis, jog_to};
use jogkit_communication::firmware::grbl::{alarm_severity, decode_alarm};
use jogkit_communication::Command;
use jogkit_core::event_bus::{AxisHomed, HomingCompleted, HomingStarted};
use jogkit_core::{
    Alarm, Axis, Error, MachineStatus, Operation, Position, Result, HOMING_FAILED_ALARM,
};

use super::{Inner, PositioningEngine, HOMING_TAG};

fn validate_sequence(sequence: &[Axis]) -> Result<()> {
    if sequence.is_empty() {
        return Err(Error::malformed("homing sequence is empty"));
    }
    for (i, axis) in sequence.iter().enumerate() {
        if sequence[..i].contains(axis) {
            return Err(Error::malformed(format!(
                "axis {} appears twice in the homing sequence",
                axis
            )));
        }
    }
    Ok(())
}

impl Inner {
    /// Abort a homing cycle and hand back the error that caused it
    fn fail_homing(&self, token: u64, error: Error) -> Error {
        tracing::error!("Homing failed: {}", error);

        let needs_alarm = self.is_current(token)
            && self.state.read(|s| s.is_connected() && !s.in_alarm());
        if needs_alarm {
            self.raise(Alarm::new(
                HOMING_FAILED_ALARM,
                decode_alarm(HOMING_FAILED_ALARM),
                alarm_severity(HOMING_FAILED_ALARM),
            ));
        }

        let position = self.state.update(|s| {
            if s.active_operation == Some(Operation::Homing) {
                s.active_operation = None;
            }
            s.position
        });
        self.bus.emit(HomingCompleted {
            success: false,
            position,
        });
        error
    }
}

impl PositioningEngine {
    /// Home the given axes in order, or the configured sequence
    ///
    /// Each homed axis reads 0 afterwards. A non-zero `homing_retract`
    /// moves the machine off the switches once every axis is homed.
    pub async fn home_axes(&self, sequence: Option<Vec<Axis>>) -> Result<Position> {
        let sequence = sequence.unwrap_or_else(|| self.inner.settings.homing_sequence.clone());
        validate_sequence(&sequence)?;

        let changed = self.inner.state.update(|s| {
            s.ensure_ready_for_motion()?;
            let changed = s.transition(MachineStatus::Home)?;
            s.active_operation = Some(Operation::Homing);
            Ok::<_, Error>(changed)
        })?;
        let token = self.inner.next_generation();

        tracing::info!("Homing {:?}", sequence);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        self.inner.bus.emit(HomingStarted {
            sequence: sequence.clone(),
        });

        for axis in sequence {
            let command = Command::line(home_axis(axis)).tag(HOMING_TAG);
            let submitted = self.inner.submit_with(command, move |inner, result| {
                if result.is_ok() && inner.is_current(token) {
                    let sample = inner.commit_axis(axis, 0.0);
                    tracing::info!("Axis {} homed", axis);
                    inner.bus.emit(AxisHomed {
                        axis,
                        position: sample.position,
                    });
                }
            });
            let outcome = match submitted {
                Ok(completion) => completion.wait().await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                return Err(self.inner.fail_homing(token, e));
            }
            if !self.inner.is_current(token) {
                return Err(self
                    .inner
                    .fail_homing(token, Error::not_ready("homing interrupted")));
            }
        }

        self.retract(token).await?;
        if !self.inner.is_current(token) {
            return Err(self
                .inner
                .fail_homing(token, Error::not_ready("homing interrupted")));
        }

        let (changed, position) = self.inner.state.update(|s| {
            s.active_operation = None;
            let changed = if s.status == Some(MachineStatus::Home) {
                s.set_status(Some(MachineStatus::Idle))
            } else {
                None
            };
            (changed, s.position)
        });
        tracing::info!("Homing complete at {}", position);
        if let Some(changed) = changed {
            self.inner.bus.emit(changed);
        }
        self.inner.bus.emit(HomingCompleted {
            success: true,
            position,
        });
        Ok(position)
    }

    async fn retract(&self, token: u64) -> Result<()> {
        let retract = self.inner.settings.homing_retract;
        if retract.is_origin() {
            return Ok(());
        }

        let (target, units, bounds) = self.inner.state.read(|s| {
            let target = s.position.add(&retract);
            (target, s.units, s.soft_limits.check(&target))
        });
        if let Err(e) = bounds {
            // The cycle itself succeeded; only the move off the switches is dropped.
            self.inner.report_bounds(&e.into());
            return Ok(());
        }

        let axes: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|a| retract.get(*a) != 0.0)
            .collect();
        let command = Command::line(jog_to(&axes, &target, self.inner.settings.jog_feed_rate, units))
            .tag(HOMING_TAG);
        let submitted = self.inner.submit_with(command, move |inner, result| {
            if result.is_ok() && inner.is_current(token) {
                let sample = inner.state.update(|s| {
                    s.set_position(target);
                    s.sample()
                });
                inner.record(sample);
            }
        });
        let outcome = match submitted {
            Ok(completion) => completion.wait().await,
            Err(e) => Err(e),
        };
        outcome
            .map(|_| ())
            .map_err(|e| self.inner.fail_homing(token, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_validation() {
        assert!(validate_sequence(&[Axis::Z, Axis::X, Axis::Y]).is_ok());
        assert!(validate_sequence(&[]).is_err());
        let err = validate_sequence(&[Axis::X, Axis::Z, Axis::X]).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }
}
