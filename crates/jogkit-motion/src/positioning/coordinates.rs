use jogkit_communication::firmware::grbl::commands::{select_wcs, set_wcs_offset, zero_wcs_axes};
use jogkit_communication::Command;
use jogkit_core::event_bus::CoordinateSystemChanged;
use jogkit_core::{Axis, Error, Position, Result, WcsSlot};

use super::{Inner, PositioningEngine};

impl Inner {
    fn ensure_connected(&self) -> Result<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(Error::not_ready("not connected"))
        }
    }

    /// Store `offset` for `slot`, activating it when `activate` is set
    fn apply_wcs(&self, slot: WcsSlot, offset: Option<Position>, activate: bool) {
        let active = self.state.update(|s| {
            if let Some(offset) = offset {
                s.coordinate_systems.set_offset(slot, offset);
            }
            if activate {
                s.coordinate_systems.activate(slot);
            }
            s.recompute_work_position();
            s.touch();
            s.coordinate_systems.active_slot() == slot
        });

        if active {
            let offset = self.state.read(|s| s.coordinate_systems.active_offset());
            tracing::info!("Work coordinates {} offset {}", slot, offset);
            self.bus.emit(CoordinateSystemChanged {
                system: slot,
                offset,
            });
        }
    }
}

impl PositioningEngine {
    /// Make `slot` the active work coordinate system
    pub async fn set_coordinate_system(&self, slot: WcsSlot) -> Result<()> {
        self.inner.ensure_connected()?;
        let completion = self
            .inner
            .submit_with(Command::line(select_wcs(slot)), move |inner, result| {
                if result.is_ok() {
                    inner.apply_wcs(slot, None, true);
                }
            })?;
        completion.wait().await.map(|_| ())
    }

    /// Write the offset of `slot`
    pub async fn set_coordinate_offset(&self, slot: WcsSlot, offset: Position) -> Result<()> {
        if !offset.is_finite() {
            return Err(Error::malformed("work offset must be finite"));
        }
        self.inner.ensure_connected()?;
        let completion = self.inner.submit_with(
            Command::line(set_wcs_offset(slot, &offset)),
            move |inner, result| {
                if result.is_ok() {
                    inner.apply_wcs(slot, Some(offset), false);
                }
            },
        )?;
        completion.wait().await.map(|_| ())
    }

    /// Make the current machine position the work zero of `axes` in the
    /// active system
    pub async fn zero_work_axes(&self, axes: &[Axis]) -> Result<()> {
        if axes.is_empty() {
            return Err(Error::malformed("no axes to zero"));
        }
        let mut unique: Vec<Axis> = Vec::with_capacity(axes.len());
        for axis in axes {
            if !unique.contains(axis) {
                unique.push(*axis);
            }
        }
        self.inner.ensure_connected()?;

        let slot = self
            .inner
            .state
            .read(|s| s.coordinate_systems.active_slot());
        let text = zero_wcs_axes(slot, &unique);
        let completion = self
            .inner
            .submit_with(Command::line(text), move |inner, result| {
                if result.is_err() {
                    return;
                }
                let offset = inner.state.read(|s| {
                    let mut offset = s.coordinate_systems.get(slot).offset;
                    for axis in &unique {
                        offset.set(*axis, s.position.get(*axis));
                    }
                    offset
                });
                inner.apply_wcs(slot, Some(offset), false);
            })?;
        completion.wait().await.map(|_| ())
    }
}
