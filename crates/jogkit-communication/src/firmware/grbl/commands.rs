//! GRBL command builders and real-time bytes

use jogkit_core::{Axis, Position, Units, WcsSlot};

/// Real-time status query
pub const STATUS_QUERY: u8 = b'?';
/// Real-time soft reset (Ctrl-X)
pub const SOFT_RESET: u8 = 0x18;
/// Real-time jog cancel
pub const JOG_CANCEL: u8 = 0x85;
/// Real-time feed hold
pub const FEED_HOLD: u8 = b'!';
/// Real-time cycle start / resume
pub const CYCLE_START: u8 = b'~';

/// Alarm unlock
pub const UNLOCK: &str = "$X";

/// Printable name of a real-time byte
pub fn realtime_name(byte: u8) -> String {
    match byte {
        STATUS_QUERY => "?".to_string(),
        SOFT_RESET => "<soft-reset>".to_string(),
        JOG_CANCEL => "<jog-cancel>".to_string(),
        FEED_HOLD => "!".to_string(),
        CYCLE_START => "~".to_string(),
        other => format!("0x{:02X}", other),
    }
}

/// Absolute machine-frame jog to `target` on the given axes
///
/// `$J=G53 G21 X10.000 F1000`
pub fn jog_to(axes: &[Axis], target: &Position, feed_rate: f64, units: Units) -> String {
    let words: String = axes
        .iter()
        .map(|axis| format!(" {}{:.3}", axis.letter(), target.get(*axis)))
        .collect();
    format!(
        "$J=G53 {}{} F{}",
        units.gcode(),
        words,
        format_number(feed_rate)
    )
}

/// Home a single axis (`$HX`)
pub fn home_axis(axis: Axis) -> String {
    format!("$H{}", axis.letter())
}

/// Select a work coordinate system
pub fn select_wcs(slot: WcsSlot) -> String {
    slot.gcode().to_string()
}

/// Store an offset for a slot (`G10 L2 P1 X.. Y.. Z..`)
pub fn set_wcs_offset(slot: WcsSlot, offset: &Position) -> String {
    format!(
        "G10 L2 P{} X{:.3} Y{:.3} Z{:.3}",
        slot.number(),
        offset.x,
        offset.y,
        offset.z
    )
}

/// Make the current position the work zero of `axes` (`G10 L20 P1 X0 Y0`)
pub fn zero_wcs_axes(slot: WcsSlot, axes: &[Axis]) -> String {
    let words: String = axes
        .iter()
        .map(|axis| format!(" {}0", axis.letter()))
        .collect();
    format!("G10 L20 P{}{}", slot.number(), words)
}

/// Shortest decimal form with at most three fractional digits
fn format_number(value: f64) -> String {
    let s = format!("{:.3}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
