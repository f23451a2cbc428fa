//! Joy-Con device layer
//!
//! Everything that touches a physical (or simulated) controller lives here:
//! the side model, the HID wire constants, the transport and discovery seams,
//! the per-device session typestate and the dual-device manager.
//!
//! # Architecture
//!
//! ```text
//! DeviceDiscovery ──► Box<dyn HidTransport> ──► DeviceSession<Ready>
//!                                                     │
//!                          DualDeviceManager ◄── SessionSlots ──► StimulationScheduler
//! ```
//!
//! Two transports are provided: [`hid`] talks to real hardware through
//! `hidapi`, [`memory`] records reports in memory for simulation and tests.

pub mod error;
pub mod hid;
pub mod manager;
pub mod memory;
pub mod session;
pub mod watcher;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::DeviceError;
pub use manager::{ConnectOutcome, Connectivity, DualDeviceManager, SessionLink, SessionSlots};
pub use session::{open_session, DeviceSession};

/// Nintendo USB vendor id
pub const VENDOR_ID: u16 = 0x057E;
/// Product id of a left Joy-Con
pub const LEFT_PRODUCT_ID: u16 = 0x2006;
/// Product id of a right Joy-Con
pub const RIGHT_PRODUCT_ID: u16 = 0x2007;

/// Report id for subcommand reports (mode entry, vibration enable)
pub const SUBCOMMAND_REPORT_ID: u8 = 0x01;
/// Report id for rumble-only reports
pub const RUMBLE_REPORT_ID: u8 = 0x10;

/// Switches the controller to full standard input-report mode
pub const MODE_ENTRY_PAYLOAD: [u8; 11] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0x03, 0x30];

/// Turns on the vibration subsystem (neutral rumble block + subcommand 0x48)
pub const VIBRATION_ENABLE_PAYLOAD: [u8; 11] = [
    0x00, 0x00, 0x01, 0x40, 0x40, 0x00, 0x01, 0x40, 0x40, 0x48, 0x01,
];

/// Physical controller side, fixed by the product id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Both sides in cycle order
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn product_id(self) -> u16 {
        match self {
            Side::Left => LEFT_PRODUCT_ID,
            Side::Right => RIGHT_PRODUCT_ID,
        }
    }

    /// Maps a product id back to its side; foreign products have none
    pub fn from_product_id(product_id: u16) -> Option<Side> {
        match product_id {
            LEFT_PRODUCT_ID => Some(Side::Left),
            RIGHT_PRODUCT_ID => Some(Side::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "Left"),
            Side::Right => write!(f, "Right"),
        }
    }
}

/// Stable identity of a raw device handle
///
/// For `hidapi` this is the platform path; the memory backend uses free-form
/// names. Used to match external disconnect notifications against sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Vendor/product pair a discovery request is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub fn for_side(side: Side) -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: side.product_id(),
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// One raw HID handle
///
/// Writes are synchronous and short; a session owns its transport exclusively,
/// so calls on one handle never overlap.
pub trait HidTransport: Send {
    /// Identity used to match external disconnect notifications
    fn id(&self) -> &DeviceId;

    /// USB product id reported by the device
    fn product_id(&self) -> u16;

    fn open(&mut self) -> Result<(), DeviceError>;

    /// Writes `payload` as an output report with the given report id
    fn send_report(&mut self, report_id: u8, payload: &[u8]) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Source of device handles and presence information
pub trait DeviceDiscovery: Send + Sync {
    /// Returns openable (not yet opened) handles matching any of `filters`
    ///
    /// An empty result is a normal outcome (the user dismissed the picker).
    fn request_devices(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Vec<Box<dyn HidTransport>>, DeviceError>;

    /// Ids of every Joy-Con currently attached to the host
    fn present_devices(&self) -> Result<Vec<DeviceId>, DeviceError>;
}
