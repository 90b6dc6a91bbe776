//! Machine controller facade
//!
//! Wires one shared state, event bus, dispatcher, connection manager and
//! positioning engine together. A presentation layer talks to the machine
//! only through [`MachineController`] and the events it publishes.

use jogkit_communication::firmware::grbl::commands::STATUS_QUERY;
use jogkit_communication::{
    Command, CommandDispatcher, CommandResponse, ConnectionManager, SerialTransportFactory,
    StatusReport, TransportFactory,
};
use jogkit_core::{
    Axis, BusEvent, Direction, Error, EventBus, EventFilter, MachineEvent, MachineState,
    MachineStateHandle, Position, PositionSample, Priority, Result, SoftLimits, SubscriptionId,
    WcsSlot,
};
use jogkit_settings::Config;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::PositioningEngine;

/// Single entry point for driving one machine
#[derive(Clone)]
pub struct MachineController {
    config: Arc<Config>,
    state: MachineStateHandle,
    bus: Arc<EventBus>,
    dispatcher: CommandDispatcher,
    connection: ConnectionManager,
    engine: PositioningEngine,
}

impl MachineController {
    /// Build a controller that opens ports through `factory`
    pub fn new(config: Config, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;

        let state = MachineStateHandle::new(MachineState::new(
            config.machine.soft_limits,
            config.machine.units,
        ));
        let bus = Arc::new(EventBus::with_config(config.event_bus.to_bus_config()));
        let dispatcher = CommandDispatcher::new(config.dispatcher.clone());
        let connection = ConnectionManager::new(
            config.connection.clone(),
            state.clone(),
            bus.clone(),
            dispatcher.clone(),
            factory,
        );
        let engine = PositioningEngine::new(
            config.machine.clone(),
            state.clone(),
            bus.clone(),
            dispatcher.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            state,
            bus,
            dispatcher,
            connection,
            engine,
        })
    }

    /// Build a controller for real serial ports
    pub fn with_serial(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(SerialTransportFactory))
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open `port` at `baud_rate`
    pub async fn connect(&self, port: &str, baud_rate: u32) -> Result<()> {
        self.connection.connect(port, baud_rate).await
    }

    /// Open the port named in the configuration
    pub async fn connect_default(&self) -> Result<()> {
        let settings = self.connection.settings();
        self.connection
            .connect(&settings.port, settings.baud_rate)
            .await
    }

    /// Close the connection; safe to call when already closed
    pub async fn disconnect(&self) -> Result<()> {
        self.engine.on_disconnected();
        self.connection.disconnect().await
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Send a raw line and wait for its reply
    pub async fn send_command(&self, text: &str, priority: Priority) -> Result<CommandResponse> {
        self.dispatcher.send_line(text, priority).await
    }

    /// Ask the controller for a status report and wait for it
    ///
    /// The report is applied to the machine state before this returns.
    pub async fn query_status(&self) -> Result<StatusReport> {
        let response = self
            .dispatcher
            .send(Command::realtime(STATUS_QUERY).priority(Priority::High))
            .await?;
        response
            .status
            .ok_or_else(|| Error::malformed("status query answered without a report"))
    }

    /// See [`PositioningEngine::jog_incremental`]
    pub async fn jog_incremental(
        &self,
        axis: Axis,
        direction: Direction,
        distance: Option<f64>,
        feed_rate: Option<f64>,
    ) -> Result<Position> {
        self.engine
            .jog_incremental(axis, direction, distance, feed_rate)
            .await
    }

    /// See [`PositioningEngine::jog_continuous`]
    pub fn jog_continuous(
        &self,
        axis: Axis,
        direction: Direction,
        feed_rate: Option<f64>,
    ) -> Result<()> {
        self.engine.jog_continuous(axis, direction, feed_rate)
    }

    /// See [`PositioningEngine::stop_jog`]
    pub fn stop_jog(&self, reason: Option<&str>) -> Result<()> {
        self.engine.stop_jog(reason)
    }

    /// Stop the continuous jog of one axis
    pub fn stop_axis(&self, axis: Axis) -> Result<()> {
        self.engine.stop_axis(axis)
    }

    /// See [`PositioningEngine::home_axes`]
    pub async fn home_axes(&self, sequence: Option<Vec<Axis>>) -> Result<Position> {
        self.engine.home_axes(sequence).await
    }

    /// Halt the machine immediately
    ///
    /// Synchronous so that it completes even if the caller is cancelled.
    pub fn emergency_stop(&self) -> Result<()> {
        self.engine.emergency_stop()
    }

    /// Clear alarms and the emergency stop; see [`PositioningEngine::reset`]
    pub async fn reset(&self) -> Result<()> {
        self.engine.reset().await
    }

    /// Activate a work coordinate system
    pub async fn set_coordinate_system(&self, slot: WcsSlot) -> Result<()> {
        self.engine.set_coordinate_system(slot).await
    }

    /// Store the offset of `slot`
    pub async fn set_coordinate_offset(&self, slot: WcsSlot, offset: Position) -> Result<()> {
        self.engine.set_coordinate_offset(slot, offset).await
    }

    /// See [`PositioningEngine::zero_work_axes`]
    pub async fn zero_work_axes(&self, axes: &[Axis]) -> Result<()> {
        self.engine.zero_work_axes(axes).await
    }

    /// Replace the soft limits
    pub fn set_soft_limits(&self, limits: SoftLimits) -> Result<()> {
        self.engine.set_soft_limits(limits)
    }

    /// Hold queued commands; emergency commands still go out
    pub fn pause_dispatch(&self) {
        self.dispatcher.pause();
    }

    /// Release held commands
    pub fn resume_dispatch(&self) {
        self.dispatcher.resume();
    }

    /// Owned snapshot of the machine state
    pub fn get_state(&self) -> MachineState {
        self.state.snapshot()
    }

    /// Recorded positions, oldest first
    pub fn position_history(&self) -> Vec<PositionSample> {
        self.engine.position_history()
    }

    /// Subscribe to one event type
    pub fn on<E, F>(&self, handler: F) -> SubscriptionId
    where
        E: BusEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.bus.on(handler)
    }

    /// Subscribe to every event accepted by `filter`
    pub fn on_any<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&MachineEvent) + Send + Sync + 'static,
    {
        self.bus.on_any(filter, handler)
    }

    /// Remove a subscription; false if it was already gone
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.bus.off(id)
    }

    /// Stream of every event published from now on
    pub fn events(&self) -> broadcast::Receiver<MachineEvent> {
        self.bus.receiver()
    }

    /// The shared event bus
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl std::fmt::Debug for MachineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineController")
            .field("connection", &self.connection)
            .field("dispatcher", &self.dispatcher)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
