//! Per-controller session with statum typestates
//!
//! ```text
//! Closed ──open()──► ReportMode ──enable_vibration()──► Ready ──close()──► (dropped)
//! ```
//!
//! Only a `DeviceSession<Ready>` can send rumble packets. A handshake failure
//! consumes the session and closes the handle, so a half-initialised device
//! can never be retained by the caller.

use super::{
    DeviceError, DeviceId, HidTransport, Side, MODE_ENTRY_PAYLOAD, RUMBLE_REPORT_ID,
    SUBCOMMAND_REPORT_ID, VIBRATION_ENABLE_PAYLOAD,
};
use crate::rumble::RumblePacket;
use statum::{machine, state};
use tracing::{debug, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Closed,     // Handle obtained, not opened
    ReportMode, // Opened, full input-report mode requested
    Ready,      // Vibration enabled, accepts rumble packets
}

#[machine]
pub struct DeviceSession<S: SessionPhase> {
    device: Box<dyn HidTransport>,
    side: Side,
}

impl<S: SessionPhase> DeviceSession<S> {
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn device_id(&self) -> &DeviceId {
        self.device.id()
    }

    // Best-effort teardown after a failed handshake step
    fn abandon(mut self, cause: DeviceError) -> DeviceError {
        if let Err(e) = self.device.close() {
            warn!(side = %self.side, "Close after failed handshake also failed: {}", e);
        }
        match cause {
            DeviceError::ReportWriteFailed(msg) => DeviceError::DeviceOpenFailed(msg),
            other => other,
        }
    }
}

impl DeviceSession<Closed> {
    pub fn create(device: Box<dyn HidTransport>, side: Side) -> Self {
        debug!(side = %side, device = %device.id(), "Creating device session");
        Self::new(device, side)
    }

    /// Opens the handle and requests full standard input-report mode
    pub fn open(mut self) -> Result<DeviceSession<ReportMode>, DeviceError> {
        self.device.open()?;

        match self
            .device
            .send_report(SUBCOMMAND_REPORT_ID, &MODE_ENTRY_PAYLOAD)
        {
            Ok(()) => {
                debug!(side = %self.side, "Input report mode set");
                Ok(self.transition())
            }
            Err(e) => Err(self.abandon(e)),
        }
    }
}

impl DeviceSession<ReportMode> {
    pub fn enable_vibration(mut self) -> Result<DeviceSession<Ready>, DeviceError> {
        match self
            .device
            .send_report(SUBCOMMAND_REPORT_ID, &VIBRATION_ENABLE_PAYLOAD)
        {
            Ok(()) => {
                info!(side = %self.side, device = %self.device.id(), "Joy-Con ready for rumble");
                Ok(self.transition())
            }
            Err(e) => Err(self.abandon(e)),
        }
    }
}

impl DeviceSession<Ready> {
    /// Writes one rumble report; failures are returned, never dropped
    pub fn send(&mut self, packet: &RumblePacket) -> Result<(), DeviceError> {
        self.device.send_report(RUMBLE_REPORT_ID, packet.as_ref())
    }

    /// Closes the handle, logging and swallowing any failure
    pub fn close(mut self) {
        match self.device.close() {
            Ok(()) => info!(side = %self.side, "Joy-Con closed"),
            Err(e) => warn!(side = %self.side, "Ignoring close failure: {}", e),
        }
    }
}

/// Full connect handshake: open, enter report mode, enable vibration
pub fn open_session(
    device: Box<dyn HidTransport>,
    side: Side,
) -> Result<DeviceSession<Ready>, DeviceError> {
    DeviceSession::create(device, side)
        .open()?
        .enable_vibration()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::{MemoryDevice, ReportLog};

    #[test]
    fn handshake_sends_mode_then_vibration_enable() {
        let log = ReportLog::default();
        let device = MemoryDevice::left("left-1").into_transport(log.clone());

        let session = open_session(device, Side::Left).expect("handshake");
        assert_eq!(session.side(), Side::Left);

        let reports = log.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].report_id, SUBCOMMAND_REPORT_ID);
        assert_eq!(reports[0].payload, MODE_ENTRY_PAYLOAD.to_vec());
        assert_eq!(reports[1].report_id, SUBCOMMAND_REPORT_ID);
        assert_eq!(reports[1].payload, VIBRATION_ENABLE_PAYLOAD.to_vec());
    }

    #[test]
    fn rumble_goes_out_under_report_0x10() {
        let log = ReportLog::default();
        let device = MemoryDevice::right("right-1").into_transport(log.clone());
        let mut session = open_session(device, Side::Right).expect("handshake");

        session.send(&RumblePacket::stop()).expect("send");

        let last = log.reports().pop().expect("report");
        assert_eq!(last.report_id, RUMBLE_REPORT_ID);
        assert_eq!(last.payload, RumblePacket::stop().as_bytes().to_vec());
    }

    #[test]
    fn failed_open_is_reported() {
        let log = ReportLog::default();
        let device = MemoryDevice::left("left-1")
            .failing_open()
            .into_transport(log.clone());

        let err = open_session(device, Side::Left).err();
        assert!(matches!(err, Some(DeviceError::DeviceOpenFailed(_))));
        assert!(log.reports().is_empty());
    }

    #[test]
    fn failed_vibration_enable_closes_the_handle() {
        let log = ReportLog::default();
        let device = MemoryDevice::left("left-1")
            .failing_writes_after(1)
            .into_transport(log.clone());

        let err = open_session(device, Side::Left).err();
        assert!(matches!(err, Some(DeviceError::DeviceOpenFailed(_))));
        assert_eq!(log.reports().len(), 1);
        assert_eq!(log.closed(), vec![DeviceId::new("left-1")]);
    }

    #[test]
    fn close_failure_is_swallowed() {
        let log = ReportLog::default();
        let device = MemoryDevice::left("left-1")
            .failing_close()
            .into_transport(log.clone());
        let session = open_session(device, Side::Left).expect("handshake");

        session.close();
        assert!(log.closed().is_empty());
    }
}
