//! Joy-Con bilateral stimulation kernel
//!
//! Drives a left and a right Nintendo Joy-Con over HID so that they vibrate
//! alternately with configurable pulse length, pause, strength and cycle
//! count.
//!
//! * [`rumble`] encodes rumble packets
//! * [`device`] owns the HID sessions of both sides
//! * [`stimulation`] runs the alternating pulse schedule
//! * [`control`] tracks connection and vibration state and exposes the actions

pub mod config;
pub mod control;
pub mod device;
pub mod events;
pub mod persistence;
pub mod rumble;
pub mod stimulation;

pub use control::{ControlError, ControllerHandle, ControllerSettings, StatusSnapshot};
pub use device::{DeviceError, Side};
pub use rumble::{encode, RumblePacket};
pub use stimulation::{StimulationConfig, StimulationRequest};
