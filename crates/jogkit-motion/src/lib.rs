//! # JogKit Motion
//!
//! Jogging, homing, work coordinates and the [`MachineController`] facade
//! built on top of `jogkit-communication`.

pub mod controller;
pub mod positioning;

pub use controller::MachineController;
pub use positioning::{PositioningEngine, HOMING_TAG, JOG_TAG};
