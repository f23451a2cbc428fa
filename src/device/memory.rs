//! In-memory device backend
//!
//! Backs the `--simulate` mode of the binary and every test. Each transport
//! appends its traffic to a shared [`ReportLog`]; faults can be injected per
//! device (open failure, write failure after N writes, close failure).

use super::{DeviceDiscovery, DeviceError, DeviceFilter, DeviceId, HidTransport, Side, VENDOR_ID};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// One output report as it left a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReport {
    pub device: DeviceId,
    pub report_id: u8,
    pub payload: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct LogInner {
    reports: Vec<SentReport>,
    // Device plus the number of reports logged when it closed
    closed: Vec<(DeviceId, usize)>,
}

/// Shared, append-only record of device traffic
#[derive(Debug, Clone, Default)]
pub struct ReportLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ReportLog {
    fn lock(&self) -> MutexGuard<'_, LogInner> {
        // A panicked writer cannot leave the log half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reports(&self) -> Vec<SentReport> {
        self.lock().reports.clone()
    }

    /// Reports written to one device
    pub fn reports_for(&self, device: &DeviceId) -> Vec<SentReport> {
        self.lock()
            .reports
            .iter()
            .filter(|r| &r.device == device)
            .cloned()
            .collect()
    }

    /// Devices closed successfully, in order
    pub fn closed(&self) -> Vec<DeviceId> {
        self.lock().closed.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Reports a device received before its last successful close
    ///
    /// `None` if the device was never closed.
    pub fn reports_before_close(&self, device: &DeviceId) -> Option<Vec<SentReport>> {
        let inner = self.lock();
        let (_, logged) = inner.closed.iter().rev().find(|(id, _)| id == device)?;
        Some(
            inner.reports[..*logged]
                .iter()
                .filter(|r| &r.device == device)
                .cloned()
                .collect(),
        )
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.reports.clear();
        inner.closed.clear();
    }

    fn record(&self, report: SentReport) {
        self.lock().reports.push(report);
    }

    fn record_close(&self, device: DeviceId) {
        let mut inner = self.lock();
        let logged = inner.reports.len();
        inner.closed.push((device, logged));
    }
}

/// Description of a simulated controller
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    id: DeviceId,
    vendor_id: u16,
    product_id: u16,
    fail_open: bool,
    fail_writes_after: Option<usize>,
    fail_close: bool,
}

impl MemoryDevice {
    pub fn new(id: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            id: DeviceId::new(id),
            vendor_id,
            product_id,
            fail_open: false,
            fail_writes_after: None,
            fail_close: false,
        }
    }

    pub fn left(id: impl Into<String>) -> Self {
        Self::new(id, VENDOR_ID, Side::Left.product_id())
    }

    pub fn right(id: impl Into<String>) -> Self {
        Self::new(id, VENDOR_ID, Side::Right.product_id())
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Lets `n` writes through, then fails every following write
    pub fn failing_writes_after(mut self, n: usize) -> Self {
        self.fail_writes_after = Some(n);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn into_transport(self, log: ReportLog) -> Box<dyn HidTransport> {
        Box::new(MemoryTransport {
            spec: self,
            log,
            opened: false,
            writes: 0,
        })
    }
}

pub struct MemoryTransport {
    spec: MemoryDevice,
    log: ReportLog,
    opened: bool,
    writes: usize,
}

impl HidTransport for MemoryTransport {
    fn id(&self) -> &DeviceId {
        &self.spec.id
    }

    fn product_id(&self) -> u16 {
        self.spec.product_id
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if self.spec.fail_open {
            return Err(DeviceError::DeviceOpenFailed(format!(
                "{} refused to open",
                self.spec.id
            )));
        }
        self.opened = true;
        Ok(())
    }

    fn send_report(&mut self, report_id: u8, payload: &[u8]) -> Result<(), DeviceError> {
        if !self.opened {
            return Err(DeviceError::ReportWriteFailed(format!(
                "{} is not open",
                self.spec.id
            )));
        }
        if let Some(limit) = self.spec.fail_writes_after {
            if self.writes >= limit {
                return Err(DeviceError::ReportWriteFailed(format!(
                    "{} stopped accepting reports",
                    self.spec.id
                )));
            }
        }
        self.writes += 1;
        self.log.record(SentReport {
            device: self.spec.id.clone(),
            report_id,
            payload: payload.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.opened = false;
        if self.spec.fail_close {
            return Err(DeviceError::DeviceOpenFailed(format!(
                "{} failed to close",
                self.spec.id
            )));
        }
        self.log.record_close(self.spec.id.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DiscoveryInner {
    attached: Vec<MemoryDevice>,
}

/// Simulated host: devices can be plugged and unplugged at runtime
///
/// `request_devices` behaves like a picker that selects every attached device
/// matching the filters.
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscovery {
    inner: Arc<Mutex<DiscoveryInner>>,
    log: ReportLog,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host with one healthy left and right Joy-Con attached
    pub fn with_pair() -> Self {
        let discovery = Self::new();
        discovery.plug(MemoryDevice::left("joycon-left"));
        discovery.plug(MemoryDevice::right("joycon-right"));
        discovery
    }

    fn lock(&self) -> MutexGuard<'_, DiscoveryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log(&self) -> ReportLog {
        self.log.clone()
    }

    pub fn plug(&self, device: MemoryDevice) {
        debug!(device = %device.id, "Simulated device plugged");
        let mut inner = self.lock();
        inner.attached.retain(|d| d.id != device.id);
        inner.attached.push(device);
    }

    /// Removes a device from the host; returns whether it was attached
    pub fn unplug(&self, id: &DeviceId) -> bool {
        let mut inner = self.lock();
        let before = inner.attached.len();
        inner.attached.retain(|d| &d.id != id);
        let removed = inner.attached.len() != before;
        if removed {
            debug!(device = %id, "Simulated device unplugged");
        }
        removed
    }
}

impl DeviceDiscovery for MemoryDiscovery {
    fn request_devices(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Vec<Box<dyn HidTransport>>, DeviceError> {
        let inner = self.lock();
        Ok(inner
            .attached
            .iter()
            .filter(|d| filters.iter().any(|f| f.matches(d.vendor_id, d.product_id)))
            .map(|d| d.clone().into_transport(self.log.clone()))
            .collect())
    }

    fn present_devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        Ok(self.lock().attached.iter().map(|d| d.id.clone()).collect())
    }
}
