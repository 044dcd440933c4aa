//! Hardware capability traits and mock devices.
//!
//! Real drivers live outside this crate and plug in through `capabilities`.

pub mod capabilities;
pub mod mock;

pub use capabilities::{CounterMode, DigitalOutput, InputDevice, Motor, Relay, Triggerable};
