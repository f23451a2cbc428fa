use super::Side;
use thiserror::Error;

/// Failures raised by the device layer
///
/// Every variant is `Clone` so it can be forwarded through the control event
/// channel without losing the original message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Discovery returned nothing usable for the requested side
    ///
    /// The user dismissed the picker or the returned device carries a foreign
    /// product id. Not an error state; connectivity simply stays as it was.
    #[error("No device selected for {0}")]
    NoDeviceSelected(Side),

    /// A session for this side is already live
    #[error("{0} Joy-Con is already connected")]
    AlreadyConnected(Side),

    /// The handle could not be opened or rejected the handshake reports
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    /// An output report could not be written
    #[error("Failed to write report: {0}")]
    ReportWriteFailed(String),

    /// The platform HID layer could not be enumerated
    #[error("Device discovery failed: {0}")]
    DiscoveryFailed(String),
}

impl DeviceError {
    /// True for the silent "user cancelled" outcome
    pub fn is_cancelled_selection(&self) -> bool {
        matches!(self, DeviceError::NoDeviceSelected(_))
    }
}
