//! Work coordinate systems (G54-G59)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Position;

/// One of the six work coordinate system slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum WcsSlot {
    #[default]
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
}

impl WcsSlot {
    /// All slots in order
    pub const ALL: [WcsSlot; 6] = [
        WcsSlot::G54,
        WcsSlot::G55,
        WcsSlot::G56,
        WcsSlot::G57,
        WcsSlot::G58,
        WcsSlot::G59,
    ];

    /// 1-based slot number used by `G10 L2 Pn`
    pub fn number(&self) -> u8 {
        match self {
            WcsSlot::G54 => 1,
            WcsSlot::G55 => 2,
            WcsSlot::G56 => 3,
            WcsSlot::G57 => 4,
            WcsSlot::G58 => 5,
            WcsSlot::G59 => 6,
        }
    }

    /// Slot from its 1-based number
    pub fn from_number(n: u8) -> Option<Self> {
        n.checked_sub(1)
            .and_then(|i| Self::ALL.get(i as usize))
            .copied()
    }

    /// G-code word selecting this slot
    pub fn gcode(&self) -> &'static str {
        match self {
            WcsSlot::G54 => "G54",
            WcsSlot::G55 => "G55",
            WcsSlot::G56 => "G56",
            WcsSlot::G57 => "G57",
            WcsSlot::G58 => "G58",
            WcsSlot::G59 => "G59",
        }
    }
}

impl fmt::Display for WcsSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.gcode())
    }
}

impl FromStr for WcsSlot {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_number(n)
                .ok_or_else(|| crate::Error::malformed(format!("no work coordinate system {}", n)));
        }
        Self::ALL
            .iter()
            .find(|slot| slot.gcode().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| crate::Error::malformed(format!("unknown coordinate system '{}'", s)))
    }
}

/// A work coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystem {
    /// Slot name
    pub name: WcsSlot,
    /// Offset from machine zero
    pub offset: Position,
    /// Whether this is the active system
    pub active: bool,
}

/// All six coordinate systems, exactly one active
///
/// The slots are private so the single-active invariant can only change
/// through `activate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystems {
    systems: [CoordinateSystem; 6],
}

impl CoordinateSystems {
    /// Create the table with `G54` active and zero offsets
    pub fn new() -> Self {
        let systems = WcsSlot::ALL.map(|name| CoordinateSystem {
            name,
            offset: Position::ORIGIN,
            active: name == WcsSlot::G54,
        });
        Self { systems }
    }

    fn index(slot: WcsSlot) -> usize {
        slot.number() as usize - 1
    }

    /// The active system
    pub fn active(&self) -> &CoordinateSystem {
        self.systems
            .iter()
            .find(|s| s.active)
            .unwrap_or(&self.systems[0])
    }

    /// The active slot
    pub fn active_slot(&self) -> WcsSlot {
        self.active().name
    }

    /// Offset of the active system
    pub fn active_offset(&self) -> Position {
        self.active().offset
    }

    /// Look up one system
    pub fn get(&self, slot: WcsSlot) -> &CoordinateSystem {
        &self.systems[Self::index(slot)]
    }

    /// Make `slot` the only active system
    pub fn activate(&mut self, slot: WcsSlot) {
        for system in &mut self.systems {
            system.active = system.name == slot;
        }
    }

    /// Replace the offset of one slot
    pub fn set_offset(&mut self, slot: WcsSlot, offset: Position) {
        self.systems[Self::index(slot)].offset = offset;
    }

    /// Convert a machine position to the active work frame
    pub fn to_work(&self, machine: &Position) -> Position {
        machine.subtract(&self.active_offset())
    }

    /// Convert a work position in the active frame to the machine frame
    pub fn to_machine(&self, work: &Position) -> Position {
        work.add(&self.active_offset())
    }

    /// Iterate over all six systems
    pub fn iter(&self) -> impl Iterator<Item = &CoordinateSystem> {
        self.systems.iter()
    }
}

impl Default for CoordinateSystems {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_g54_active() {
        let wcs = CoordinateSystems::new();
        assert_eq!(wcs.active_slot(), WcsSlot::G54);
        assert_eq!(wcs.iter().filter(|s| s.active).count(), 1);
    }

    #[test]
    fn test_activate_keeps_single_active() {
        let mut wcs = CoordinateSystems::new();
        wcs.activate(WcsSlot::G57);
        wcs.activate(WcsSlot::G55);
        assert_eq!(wcs.active_slot(), WcsSlot::G55);
        assert_eq!(wcs.iter().filter(|s| s.active).count(), 1);
    }

    #[test]
    fn test_work_transform() {
        let mut wcs = CoordinateSystems::new();
        wcs.set_offset(WcsSlot::G55, Position::new(10.0, 20.0, -5.0));
        let machine = Position::new(50.0, 50.0, 0.0);

        assert_eq!(wcs.to_work(&machine), machine);
        wcs.activate(WcsSlot::G55);
        assert_eq!(wcs.to_work(&machine), Position::new(40.0, 30.0, 5.0));
        assert_eq!(wcs.to_machine(&wcs.to_work(&machine)), machine);
    }

    #[test]
    fn test_slot_parsing() {
        assert_eq!("g56".parse::<WcsSlot>().unwrap(), WcsSlot::G56);
        assert_eq!("6".parse::<WcsSlot>().unwrap(), WcsSlot::G59);
        assert!("7".parse::<WcsSlot>().is_err());
        assert!("0".parse::<WcsSlot>().is_err());
    }
}
