//! Dual device manager
//!
//! Owns the left and right session slots. Connects with toggle semantics,
//! tears sessions down on explicit or external disconnects and reports every
//! connectivity change on the control event channel.
//!
//! The scheduler borrows the same slots through [`SessionLink`]s to write
//! reports; it never installs or closes a session.

use super::session::Ready;
use super::{
    open_session, DeviceDiscovery, DeviceError, DeviceFilter, DeviceId, DeviceSession,
    HidTransport, Side,
};
use crate::events::{DeviceEvent, EventSink};
use crate::rumble::RumblePacket;
use crate::stimulation::StimulationScheduler;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Slot = Arc<Mutex<Option<DeviceSession<Ready>>>>;

/// Shared storage for at most one live session per side
#[derive(Clone, Default)]
pub struct SessionSlots {
    left: Slot,
    right: Slot,
}

impl SessionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, side: Side) -> &Slot {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Write access to one side for the scheduler
    pub fn link(&self, side: Side) -> SessionLink {
        SessionLink {
            side,
            slot: self.slot(side).clone(),
        }
    }

    pub async fn is_present(&self, side: Side) -> bool {
        self.slot(side).lock().await.is_some()
    }

    /// Current connectivity, read from the slots on every call
    pub async fn connectivity(&self) -> Connectivity {
        Connectivity {
            left_present: self.is_present(Side::Left).await,
            right_present: self.is_present(Side::Right).await,
        }
    }

    pub(crate) async fn install(&self, session: DeviceSession<Ready>) -> Option<DeviceSession<Ready>> {
        self.slot(session.side()).lock().await.replace(session)
    }

    async fn take(&self, side: Side) -> Option<DeviceSession<Ready>> {
        self.slot(side).lock().await.take()
    }

    async fn owner_of(&self, id: &DeviceId) -> Option<Side> {
        for side in Side::BOTH {
            if let Some(session) = self.slot(side).lock().await.as_ref() {
                if session.device_id() == id {
                    return Some(side);
                }
            }
        }
        None
    }

    async fn take_matching(&self, id: &DeviceId) -> Option<DeviceSession<Ready>> {
        for side in Side::BOTH {
            let mut guard = self.slot(side).lock().await;
            if guard.as_ref().is_some_and(|s| s.device_id() == id) {
                return guard.take();
            }
        }
        None
    }
}

/// Borrowed handle the scheduler writes one side through
#[derive(Clone)]
pub struct SessionLink {
    side: Side,
    slot: Slot,
}

impl SessionLink {
    pub fn side(&self) -> Side {
        self.side
    }

    pub async fn is_present(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Sends a packet if the side has a session
    ///
    /// Returns `Ok(false)` when there is nothing to write to. The slot lock is
    /// held for the duration of the write, so writes to one side never overlap.
    /// Writes stay inline; a rumble report is one short interrupt transfer.
    pub async fn send(&self, packet: &RumblePacket) -> Result<bool, DeviceError> {
        let mut guard = self.slot.lock().await;
        match guard.as_mut() {
            Some(session) => {
                session.send(packet)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Which sides currently have a live session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub left_present: bool,
    pub right_present: bool,
}

impl Connectivity {
    pub fn is_present(&self, side: Side) -> bool {
        match side {
            Side::Left => self.left_present,
            Side::Right => self.right_present,
        }
    }

    pub fn both(&self) -> bool {
        self.left_present && self.right_present
    }

    pub fn any(&self) -> bool {
        self.left_present || self.right_present
    }

    /// Human readable name of the attached controller(s)
    pub fn device_name(&self) -> &'static str {
        match (self.left_present, self.right_present) {
            (true, true) => "Left Joy-Con, Right Joy-Con",
            (true, false) => "Left Joy-Con",
            (false, true) => "Right Joy-Con",
            (false, false) => "Joy-Con",
        }
    }
}

/// Result of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Attached(Side),
    AttachedBoth,
    /// The side was already connected, so the request toggled it off
    Detached(Side),
}

/// Runs the blocking open/handshake on the blocking pool
async fn handshake(
    device: Box<dyn HidTransport>,
    side: Side,
) -> Result<DeviceSession<Ready>, DeviceError> {
    tokio::task::spawn_blocking(move || open_session(device, side))
        .await
        .map_err(|e| DeviceError::DeviceOpenFailed(e.to_string()))?
}

pub struct DualDeviceManager {
    discovery: Arc<dyn DeviceDiscovery>,
    slots: SessionSlots,
    scheduler: Arc<StimulationScheduler>,
    events: EventSink,
}

impl DualDeviceManager {
    pub fn new(
        discovery: Arc<dyn DeviceDiscovery>,
        slots: SessionSlots,
        scheduler: Arc<StimulationScheduler>,
        events: EventSink,
    ) -> Self {
        Self {
            discovery,
            slots,
            scheduler,
            events,
        }
    }

    pub async fn connectivity(&self) -> Connectivity {
        self.slots.connectivity().await
    }

    /// Connects `side`, or disconnects it when a session already exists
    pub async fn connect(&self, side: Side) -> Result<ConnectOutcome, DeviceError> {
        if self.slots.is_present(side).await {
            debug!(side = %side, "Side already connected, toggling off");
            self.disconnect(side).await;
            return Ok(ConnectOutcome::Detached(side));
        }

        let devices = self.request(vec![DeviceFilter::for_side(side)]).await?;
        let Some(device) = devices.into_iter().next() else {
            info!(side = %side, "No device selected");
            return Err(DeviceError::NoDeviceSelected(side));
        };
        if device.product_id() != side.product_id() {
            warn!(
                side = %side,
                "Selected device has product id {:#06x}, expected {:#06x}",
                device.product_id(),
                side.product_id()
            );
            return Err(DeviceError::NoDeviceSelected(side));
        }

        let session = handshake(device, side).await?;
        self.install(session).await;
        self.events.emit(DeviceEvent::Attached(side));
        Ok(ConnectOutcome::Attached(side))
    }

    /// Connects both sides from a single discovery request
    ///
    /// Devices are handshaken one by one; if any of them fails, every session
    /// opened by this request is closed again before the error is returned.
    pub async fn connect_both(&self) -> Result<ConnectOutcome, DeviceError> {
        for side in Side::BOTH {
            if self.slots.is_present(side).await {
                return Err(DeviceError::AlreadyConnected(side));
            }
        }

        let devices = self
            .request(vec![
                DeviceFilter::for_side(Side::Left),
                DeviceFilter::for_side(Side::Right),
            ])
            .await?;

        let mut picked: Vec<(Side, Box<dyn HidTransport>)> = Vec::with_capacity(2);
        for device in devices {
            match Side::from_product_id(device.product_id()) {
                Some(side) if !picked.iter().any(|(s, _)| *s == side) => {
                    picked.push((side, device))
                }
                _ => debug!(device = %device.id(), "Ignoring extra device"),
            }
        }
        if picked.is_empty() {
            info!("No device selected");
            return Err(DeviceError::NoDeviceSelected(Side::Left));
        }

        let mut opened = Vec::with_capacity(picked.len());
        for (side, device) in picked {
            match handshake(device, side).await {
                Ok(session) => opened.push(session),
                Err(e) => {
                    for session in opened {
                        session.close();
                    }
                    return Err(e);
                }
            }
        }

        let sides: Vec<Side> = opened.iter().map(|s| s.side()).collect();
        for session in opened {
            self.install(session).await;
        }

        match sides.as_slice() {
            [side] => {
                self.events.emit(DeviceEvent::Attached(*side));
                Ok(ConnectOutcome::Attached(*side))
            }
            _ => {
                self.events.emit(DeviceEvent::AttachedBoth);
                Ok(ConnectOutcome::AttachedBoth)
            }
        }
    }

    async fn request(
        &self,
        filters: Vec<DeviceFilter>,
    ) -> Result<Vec<Box<dyn HidTransport>>, DeviceError> {
        let discovery = self.discovery.clone();
        tokio::task::spawn_blocking(move || discovery.request_devices(&filters))
            .await
            .map_err(|e| DeviceError::DiscoveryFailed(e.to_string()))?
    }

    async fn install(&self, session: DeviceSession<Ready>) {
        let side = session.side();
        info!(side = %side, device = %session.device_id(), "Joy-Con connected");
        if let Some(stale) = self.slots.install(session).await {
            warn!(side = %side, "Replacing a session that was still installed");
            stale.close();
        }
    }

    /// Stops any active run, then closes and drops the session for `side`
    ///
    /// Returns whether a session existed.
    pub async fn disconnect(&self, side: Side) -> bool {
        if !self.slots.is_present(side).await {
            return false;
        }

        self.scheduler.halt().await;

        match self.slots.take(side).await {
            Some(session) => {
                session.close();
                info!(side = %side, "Joy-Con disconnected");
                self.events.emit(DeviceEvent::Detached(side));
                true
            }
            None => false,
        }
    }

    /// Stops any active run and closes both sessions
    pub async fn disconnect_all(&self) {
        self.scheduler.halt().await;

        let mut closed = 0;
        for side in Side::BOTH {
            if let Some(session) = self.slots.take(side).await {
                session.close();
                closed += 1;
            }
        }
        if closed > 0 {
            info!("All Joy-Cons disconnected");
            self.events.emit(DeviceEvent::DetachedBoth);
        }
    }

    /// Drops the session whose handle went away, if any
    ///
    /// Unknown handles are ignored and leave connectivity untouched.
    pub async fn handle_external_disconnect(&self, id: &DeviceId) -> Option<Side> {
        let Some(side) = self.slots.owner_of(id).await else {
            debug!(device = %id, "Ignoring disconnect of an untracked device");
            return None;
        };

        self.scheduler.halt().await;

        let session = self.slots.take_matching(id).await?;
        warn!(side = %side, device = %id, "Joy-Con went away");
        // The handle is gone already; close only releases our side of it
        session.close();
        self.events.emit(DeviceEvent::Detached(side));
        Some(side)
    }
}
