//! SDI-12 bus master for pulse-train peripherals.
//!
//! SDI-12 runs at 1200 baud with inverted logic and 7E1 framing, which most
//! UARTs cannot produce directly. This crate instead generates and decodes
//! the wire format as raw `(level, duration)` pulse sequences, so any
//! timer/capture peripheral (RMT channels, capture-compare units, a
//! software-timed GPIO) can drive the bus through the [`PulseLine`] trait.
//!
//! [`Sdi12Bus`] owns one physical line and serializes command/response
//! transactions on it; [`Sdi12Device`] binds an address to a bus and offers
//! the protocol verbs (measurements, data reads, identification, ...).

#![no_std]

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod common;
pub mod device;

pub use bus::link::{Level, LineDirection, Pulse, PulseLine};
pub use bus::Sdi12Bus;
pub use common::address::Sdi12Addr;
pub use common::command::Command;
pub use common::error::Sdi12Error;
pub use common::timing::BusTiming;
pub use device::{Identification, Sdi12Device, Sdi12Version};
