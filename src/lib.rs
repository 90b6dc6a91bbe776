//! # JogKit
//!
//! Control core for jogging a GRBL CNC machine:
//! - Connection lifecycle with bounded automatic reconnect
//! - Prioritized command dispatch with emergency bypass
//! - Incremental and continuous jogging inside soft limits
//! - Homing, work coordinate systems, alarms and emergency stop
//! - Typed event bus for presentation layers
//!
//! ## Architecture
//!
//! 1. **jogkit-core** - data model, errors, event bus
//! 2. **jogkit-settings** - configuration files
//! 3. **jogkit-communication** - transports, GRBL protocol, dispatcher, connection manager
//! 4. **jogkit-motion** - positioning engine and the `MachineController` facade
//! 5. **jogkit** - this crate: re-exports, logging setup and the console binary

pub use jogkit_communication::{
    list_ports, CommandResponse, MockDevice, SerialPortInfo, StatusReport, Transport,
    TransportFactory,
};
pub use jogkit_core::event_bus;
pub use jogkit_core::{
    Alarm, Axis, ConnectionStatus, Direction, Error, ErrorKind, EventFilter, EventKind,
    MachineEvent, MachineState, MachineStatus, Position, PositionSample, Priority, Result,
    SoftLimits, SubscriptionId, Units, WcsSlot,
};
pub use jogkit_motion::MachineController;
pub use jogkit_settings::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default configuration
///
/// Pretty console output filtered by `RUST_LOG`, `info` when unset.
/// Logs go to stderr so they do not interleave with console replies.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
