//! Data models for positions, status, and machine information
//!
//! This module provides:
//! - Axis, direction and position types (machine or work frame)
//! - Controller status state machine
//! - Connection state tracking
//! - Alarms, soft limits and command priorities
//! - Work coordinate systems and the canonical machine state

pub mod coordinates;
pub mod machine_state;

pub use coordinates::{CoordinateSystem, CoordinateSystems, WcsSlot};
pub use machine_state::{MachineState, MachineStateHandle, PositionSample};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    /// Millimeters (metric)
    #[default]
    Millimeters,
    /// Inches (imperial)
    Inches,
}

impl Units {
    /// G-code word selecting this unit
    pub fn gcode(&self) -> &'static str {
        match self {
            Units::Millimeters => "G21",
            Units::Inches => "G20",
        }
    }

    /// Convert a value from one unit to another
    pub fn convert(value: f64, from: Units, to: Units) -> f64 {
        match (from, to) {
            (Units::Millimeters, Units::Inches) => value / 25.4,
            (Units::Inches, Units::Millimeters) => value * 25.4,
            _ => value,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Millimeters => write!(f, "mm"),
            Units::Inches => write!(f, "in"),
        }
    }
}

/// Axis identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// X-axis (typically left-right).
    X,
    /// Y-axis (typically front-back).
    Y,
    /// Z-axis (typically up-down).
    Z,
}

impl Axis {
    /// All axes in X, Y, Z order
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// G-code axis letter
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x" | "X" => Ok(Axis::X),
            "y" | "Y" => Ok(Axis::Y),
            "z" | "Z" => Ok(Axis::Z),
            other => Err(crate::Error::malformed(format!("unknown axis '{}'", other))),
        }
    }
}

impl TryFrom<char> for Axis {
    type Error = crate::Error;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        c.to_string().parse()
    }
}

/// Direction of travel along an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Positive direction (toward max limit).
    Positive,
    /// Negative direction (toward min limit).
    Negative,
}

impl Direction {
    /// Multiplier for distances
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

impl TryFrom<i32> for Direction {
    type Error = crate::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value.signum() {
            1 => Ok(Direction::Positive),
            -1 => Ok(Direction::Negative),
            _ => Err(crate::Error::malformed("direction must be non-zero")),
        }
    }
}

impl FromStr for Direction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "+" | "+1" | "1" | "pos" | "positive" => Ok(Direction::Positive),
            "-" | "-1" | "neg" | "negative" => Ok(Direction::Negative),
            other => Err(crate::Error::malformed(format!(
                "unknown direction '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Positive => write!(f, "+"),
            Direction::Negative => write!(f, "-"),
        }
    }
}

/// Which side of a soft limit was crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundSide {
    /// Below the minimum.
    Min,
    /// Above the maximum.
    Max,
}

impl fmt::Display for BoundSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundSide::Min => write!(f, "min"),
            BoundSide::Max => write!(f, "max"),
        }
    }
}

/// Position in 3D space
///
/// Always interpreted relative to a frame (machine or work).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
}

impl Position {
    /// The origin
    pub const ORIGIN: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Create a new position with X, Y, Z coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate of one axis
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Set the coordinate of one axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    /// Copy of this position with one axis replaced
    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        self.set(axis, value);
        self
    }

    /// Add another position (component-wise)
    pub fn add(&self, other: &Position) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    /// Subtract another position (component-wise)
    pub fn subtract(&self, other: &Position) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Euclidean distance to another position
    pub fn distance_to(&self, other: &Position) -> f64 {
        let d = self.subtract(other);
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    /// Largest single-axis difference to another position
    pub fn max_axis_delta(&self, other: &Position) -> f64 {
        Axis::ALL
            .iter()
            .map(|a| (self.get(*a) - other.get(*a)).abs())
            .fold(0.0, f64::max)
    }

    /// Whether every axis is zero
    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }

    /// Whether every coordinate is finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// Controller status state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    /// Connected and idle, ready for commands
    Idle,
    /// Executing a program
    Run,
    /// Paused, awaiting resume
    Hold,
    /// Manual jog in progress
    Jog,
    /// Alarm state (requires reset)
    Alarm,
    /// Safety door interlock triggered
    Door,
    /// Check mode (dry-run without machine movement)
    Check,
    /// Homing cycle in progress
    Home,
    /// Low-power sleep state
    Sleep,
}

impl MachineStatus {
    /// Parse the state word of a controller status report (`Hold:0` → `Hold`)
    pub fn from_report(word: &str) -> Option<Self> {
        let base = word.split(':').next().unwrap_or(word).trim();
        match base {
            "Idle" => Some(Self::Idle),
            "Run" => Some(Self::Run),
            "Hold" => Some(Self::Hold),
            "Jog" => Some(Self::Jog),
            "Alarm" => Some(Self::Alarm),
            "Door" => Some(Self::Door),
            "Check" => Some(Self::Check),
            "Home" => Some(Self::Home),
            "Sleep" => Some(Self::Sleep),
            _ => None,
        }
    }

    /// Check if this state accepts new motion requests
    pub fn accepts_motion(&self) -> bool {
        matches!(self, MachineStatus::Idle | MachineStatus::Jog)
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            MachineStatus::Run | MachineStatus::Jog | MachineStatus::Home
        )
    }

    /// Check if a transition from this state to `target` is valid.
    ///
    /// - Any state can enter Alarm
    /// - Alarm only leaves to Idle (explicit reset)
    /// - Jog and Home only start from Idle and complete to Idle
    pub fn can_transition_to(&self, target: MachineStatus) -> bool {
        use MachineStatus::*;
        if *self == target {
            return true;
        }
        match (self, target) {
            (_, Alarm) => true,
            (Alarm, Idle) => true,
            (Alarm, _) => false,
            (Idle, _) => true,
            (Jog, Idle | Hold | Door) => true,
            (Home, Idle) => true,
            (Run, Hold | Idle | Door | Check) => true,
            (Hold, Run | Idle | Door) => true,
            (Door, Hold | Idle) => true,
            (Check, Idle) => true,
            (Sleep, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Alarm => "Alarm",
            Self::Door => "Door",
            Self::Check => "Check",
            Self::Home => "Home",
            Self::Sleep => "Sleep",
        };
        write!(f, "{}", name)
    }
}

/// State of the connection to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Connection not established or closed
    #[default]
    Disconnected,
    /// Attempting to establish connection
    Connecting,
    /// Connection active
    Connected,
    /// Last attempt failed or the link dropped
    Error,
}

impl ConnectionStatus {
    /// Check if a transition from this state to `target` is valid.
    ///
    /// - Disconnected → Connecting
    /// - Connecting → Connected, Error, Disconnected
    /// - Connected → Error, Disconnected
    /// - Error → Connecting, Disconnected
    pub fn can_transition_to(&self, target: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if *self == target {
            return true;
        }
        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Disconnected)
                | (Connected, Error | Disconnected)
                | (Error, Connecting | Disconnected)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Connection fields of the machine state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current connection status
    pub status: ConnectionStatus,
    /// Port of the current or last connection
    pub port: Option<String>,
    /// Baud rate of the current or last connection
    pub baud_rate: u32,
    /// Failed attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Message of the last failure
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// Check if the transport is usable
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Command priority tiers, lowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Priority {
    /// Background traffic such as status polls.
    Low,
    /// Regular commands.
    #[default]
    Normal,
    /// Operator commands that should overtake regular traffic.
    High,
    /// Safety commands; dispatched ahead of everything queued.
    Emergency,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Alarm severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmSeverity {
    /// Informational; motion may continue after reset.
    Warning,
    /// Fault that requires reset.
    Error,
    /// Safety-critical fault (emergency stop, hard limit).
    Critical,
}

/// Alarm code used for operator emergency stops
pub const EMERGENCY_STOP_ALARM: u8 = 12;
/// Alarm code used for homing failures
pub const HOMING_FAILED_ALARM: u8 = 9;

/// A fault that blocks motion until `reset()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Alarm code
    pub code: u8,
    /// Human-readable message
    pub message: String,
    /// Severity
    pub severity: AlarmSeverity,
    /// When the alarm was raised
    pub timestamp: DateTime<Utc>,
}

impl Alarm {
    /// Create an alarm stamped with the current time
    pub fn new(code: u8, message: impl Into<String>, severity: AlarmSeverity) -> Self {
        Self {
            code,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ALARM:{} ({:?}) {}", self.code, self.severity, self.message)
    }
}

/// Software travel limits in the machine frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    /// Limits enabled
    pub enabled: bool,
    /// Minimum per axis
    pub min: Position,
    /// Maximum per axis
    pub max: Position,
}

impl SoftLimits {
    /// Create enabled limits
    pub fn new(min: Position, max: Position) -> Self {
        Self {
            enabled: true,
            min,
            max,
        }
    }

    /// Limits that accept every position
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Check that min <= max on every axis
    pub fn is_consistent(&self) -> bool {
        Axis::ALL
            .iter()
            .all(|a| self.min.get(*a) <= self.max.get(*a))
    }

    /// Validate a single-axis coordinate
    pub fn check_axis(&self, axis: Axis, value: f64) -> Result<(), crate::BoundsError> {
        if !self.enabled {
            return Ok(());
        }
        let (min, max) = (self.min.get(axis), self.max.get(axis));
        if value < min {
            return Err(crate::BoundsError {
                axis,
                bound: BoundSide::Min,
                target: value,
                limit: min,
            });
        }
        if value > max {
            return Err(crate::BoundsError {
                axis,
                bound: BoundSide::Max,
                target: value,
                limit: max,
            });
        }
        Ok(())
    }

    /// Validate a position componentwise, reporting the first offending axis
    pub fn check(&self, position: &Position) -> Result<(), crate::BoundsError> {
        Axis::ALL
            .iter()
            .try_for_each(|a| self.check_axis(*a, position.get(*a)))
    }

    /// The limit reached when travelling along `axis` in `direction`
    pub fn limit_towards(&self, axis: Axis, direction: Direction) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        Some(match direction {
            Direction::Positive => self.max.get(axis),
            Direction::Negative => self.min.get(axis),
        })
    }
}

impl Default for SoftLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            min: Position::new(0.0, 0.0, -100.0),
            max: Position::new(300.0, 300.0, 100.0),
        }
    }
}

/// Motion operation that currently owns the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A single-step jog.
    IncrementalJog,
    /// One or more axes jogging until stopped.
    ContinuousJog,
    /// Homing sequence.
    Homing,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::IncrementalJog => write!(f, "incremental jog"),
            Operation::ContinuousJog => write!(f, "continuous jog"),
            Operation::Homing => write!(f, "homing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_parsing() {
        assert_eq!("x".parse::<Axis>().unwrap(), Axis::X);
        assert_eq!("Z".parse::<Axis>().unwrap(), Axis::Z);
        assert!("w".parse::<Axis>().is_err());
        assert_eq!(Axis::try_from('y').unwrap(), Axis::Y);
    }

    #[test]
    fn test_direction_from_sign() {
        assert_eq!(Direction::try_from(1).unwrap(), Direction::Positive);
        assert_eq!(Direction::try_from(-5).unwrap(), Direction::Negative);
        assert!(Direction::try_from(0).is_err());
    }

    #[test]
    fn test_position_axis_access() {
        let mut p = Position::new(1.0, 2.0, 3.0);
        p.set(Axis::Y, 7.5);
        assert_eq!(p.get(Axis::Y), 7.5);
        assert_eq!(p.with(Axis::Z, 0.0), Position::new(1.0, 7.5, 0.0));
        assert_eq!(
            Position::new(1.0, 1.0, 1.0).max_axis_delta(&Position::new(1.0, 3.0, 0.5)),
            2.0
        );
    }

    #[test]
    fn test_status_transitions() {
        use MachineStatus::*;
        assert!(Idle.can_transition_to(Jog));
        assert!(Jog.can_transition_to(Idle));
        assert!(Home.can_transition_to(Alarm));
        assert!(Alarm.can_transition_to(Idle));
        assert!(!Alarm.can_transition_to(Jog));
        assert!(!Alarm.can_transition_to(Home));
        assert!(!Jog.can_transition_to(Home));
    }

    #[test]
    fn test_status_from_report() {
        assert_eq!(MachineStatus::from_report("Hold:0"), Some(MachineStatus::Hold));
        assert_eq!(MachineStatus::from_report("Idle"), Some(MachineStatus::Idle));
        assert_eq!(MachineStatus::from_report("Bogus"), None);
    }

    #[test]
    fn test_connection_transitions() {
        use ConnectionStatus::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn test_soft_limits_check() {
        let limits = SoftLimits::new(Position::ORIGIN, Position::new(300.0, 200.0, 50.0));
        assert!(limits.check(&Position::new(10.0, 10.0, 10.0)).is_ok());

        let err = limits.check(&Position::new(305.0, 0.0, 0.0)).unwrap_err();
        assert_eq!(err.axis, Axis::X);
        assert_eq!(err.bound, BoundSide::Max);

        let err = limits.check(&Position::new(0.0, 0.0, -1.0)).unwrap_err();
        assert_eq!(err.axis, Axis::Z);
        assert_eq!(err.bound, BoundSide::Min);

        assert!(SoftLimits::disabled()
            .check(&Position::new(1e6, -1e6, 0.0))
            .is_ok());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Emergency > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
