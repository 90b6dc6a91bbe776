//! # JogKit Core
//!
//! Data model, error taxonomy and event bus shared by every JogKit crate.
//! This crate performs no I/O.

pub mod data;
pub mod error;
pub mod event_bus;

pub use data::{
    Alarm, AlarmSeverity, Axis, BoundSide, ConnectionState, ConnectionStatus, CoordinateSystem,
    CoordinateSystems, Direction, MachineState, MachineStateHandle, MachineStatus, Operation,
    Position, PositionSample, Priority, SoftLimits, Units, WcsSlot, EMERGENCY_STOP_ALARM,
    HOMING_FAILED_ALARM,
};

pub use error::{BoundsError, CommandError, ConnectionError, Error, ErrorKind, Result};

pub use event_bus::{
    BusEvent, EventBus, EventBusConfig, EventFilter, EventKind, MachineEvent, SubscriptionId,
};
