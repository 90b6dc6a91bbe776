//! # Event Bus Module
//!
//! Publish/subscribe for machine events.
//!
//! - Publishers emit payload structs after committing state changes
//! - Subscribers register for a single payload type or filter by kind
//! - Async consumers read a broadcast receiver
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jogkit_core::event_bus::{EventBus, JogCompleted};
//!
//! let bus = EventBus::new();
//! let id = bus.on(|e: &JogCompleted| println!("jog done at {}", e.position));
//! bus.off(id);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
