//! Presence watcher
//!
//! `hidapi` offers no hot-unplug callback, so presence is polled. Every id that
//! was present on the previous poll and is gone now is reported as
//! [`ControlEvent::ExternalDisconnect`]; the controller decides whether it
//! belongs to a session.

use super::{DeviceDiscovery, DeviceId};
use crate::events::{ControlEvent, EventSink};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn spawn_presence_watcher(
    discovery: Arc<dyn DeviceDiscovery>,
    events: EventSink,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Presence watcher polling every {:?}", period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut known: Option<BTreeSet<DeviceId>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Presence watcher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let source = discovery.clone();
            let present = match tokio::task::spawn_blocking(move || source.present_devices()).await {
                Ok(Ok(ids)) => ids.into_iter().collect::<BTreeSet<_>>(),
                Ok(Err(e)) => {
                    warn!("Presence poll failed: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Presence poll task failed: {}", e);
                    continue;
                }
            };

            if let Some(previous) = &known {
                for gone in previous.difference(&present) {
                    debug!(device = %gone, "Device no longer present");
                    events.emit(ControlEvent::ExternalDisconnect(gone.clone()));
                }
            }
            known = Some(present);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryDiscovery;

    #[tokio::test]
    async fn vanished_device_is_reported() {
        let discovery = MemoryDiscovery::with_pair();
        let (sink, mut events) = EventSink::channel();
        let shutdown = CancellationToken::new();
        let watcher = spawn_presence_watcher(
            Arc::new(discovery.clone()),
            sink,
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        discovery.unplug(&DeviceId::new("joycon-right"));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(ControlEvent::ExternalDisconnect(DeviceId::new("joycon-right")))
        );

        shutdown.cancel();
        watcher.await.unwrap();
    }
}
