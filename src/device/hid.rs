//! Real hardware backend on top of `hidapi`
//!
//! Discovery has no interactive picker here: every attached device matching
//! the filters is offered, in enumeration order. Device identity is the
//! platform path, which is what the presence watcher compares.

use super::{DeviceDiscovery, DeviceError, DeviceFilter, DeviceId, HidTransport, Side, VENDOR_ID};
use hidapi::{HidApi, HidDevice};
use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

type SharedApi = Arc<Mutex<HidApi>>;

fn lock(api: &SharedApi) -> MutexGuard<'_, HidApi> {
    api.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct HidapiDiscovery {
    api: SharedApi,
}

impl HidapiDiscovery {
    pub fn new() -> Result<Self, DeviceError> {
        let api = HidApi::new().map_err(|e| DeviceError::DiscoveryFailed(e.to_string()))?;
        info!("HID API initialized");
        Ok(Self {
            api: Arc::new(Mutex::new(api)),
        })
    }

    fn refreshed(&self) -> Result<MutexGuard<'_, HidApi>, DeviceError> {
        let mut api = lock(&self.api);
        api.refresh_devices()
            .map_err(|e| DeviceError::DiscoveryFailed(e.to_string()))?;
        Ok(api)
    }
}

impl DeviceDiscovery for HidapiDiscovery {
    fn request_devices(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Vec<Box<dyn HidTransport>>, DeviceError> {
        let api = self.refreshed()?;
        let mut found: Vec<Box<dyn HidTransport>> = Vec::new();

        for info in api.device_list() {
            if !filters
                .iter()
                .any(|f| f.matches(info.vendor_id(), info.product_id()))
            {
                continue;
            }
            let path = info.path().to_owned();
            let id = DeviceId::new(path.to_string_lossy());
            // Multi-interface devices show up once per interface
            if found.iter().any(|d| d.id() == &id) {
                continue;
            }
            debug!(
                device = %id,
                product = info.product_string().unwrap_or("unknown"),
                "Found Joy-Con"
            );
            found.push(Box::new(HidapiTransport {
                api: self.api.clone(),
                id,
                product_id: info.product_id(),
                path,
                device: None,
            }));
        }
        Ok(found)
    }

    fn present_devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        let api = self.refreshed()?;
        Ok(api
            .device_list()
            .filter(|info| {
                info.vendor_id() == VENDOR_ID && Side::from_product_id(info.product_id()).is_some()
            })
            .map(|info| DeviceId::new(info.path().to_string_lossy()))
            .collect())
    }
}

pub struct HidapiTransport {
    api: SharedApi,
    id: DeviceId,
    product_id: u16,
    path: CString,
    device: Option<HidDevice>,
}

impl HidTransport for HidapiTransport {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        let device = lock(&self.api)
            .open_path(&self.path)
            .map_err(|e| DeviceError::DeviceOpenFailed(e.to_string()))?;
        self.device = Some(device);
        Ok(())
    }

    fn send_report(&mut self, report_id: u8, payload: &[u8]) -> Result<(), DeviceError> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| DeviceError::ReportWriteFailed(format!("{} is not open", self.id)))?;

        let mut report = Vec::with_capacity(payload.len() + 1);
        report.push(report_id);
        report.extend_from_slice(payload);

        let written = device
            .write(&report)
            .map_err(|e| DeviceError::ReportWriteFailed(e.to_string()))?;
        if written < report.len() {
            return Err(DeviceError::ReportWriteFailed(format!(
                "short write: {} of {} bytes",
                written,
                report.len()
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        // hidapi closes the handle on drop
        self.device.take();
        Ok(())
    }
}
