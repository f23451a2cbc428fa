//! Control event channel
//!
//! The device manager, the scheduler and the presence watcher never mutate
//! the connection state directly. They publish [`ControlEvent`]s into one
//! unbounded channel whose only consumer is the controller actor.
//!
//! ```text
//! DualDeviceManager ──DeviceEvent──┐
//! StimulationScheduler ──RunEvent──┼──► EventSink ──► ControllerHandle actor
//! presence watcher ──ExternalDisconnect──┘
//! ```

use crate::device::{DeviceId, Side};
use crate::stimulation::StimulationConfig;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Connectivity changes performed by the device manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(Side),
    AttachedBoth,
    Detached(Side),
    DetachedBoth,
}

/// Monotonic identifier of one scheduler run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Counted run reached its repeat count
    Completed { cycles: u32 },
    /// Cancelled by stop, supersession or disconnect
    Cancelled { cycles: u32 },
    /// A report write failed mid-cycle
    Failed { cycles: u32, reason: String },
}

impl RunOutcome {
    pub fn cycles(&self) -> u32 {
        match self {
            RunOutcome::Completed { cycles }
            | RunOutcome::Cancelled { cycles }
            | RunOutcome::Failed { cycles, .. } => *cycles,
        }
    }
}

/// Progress of a scheduler run
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started {
        run: RunId,
        config: StimulationConfig,
    },
    /// Side currently buzzing, `None` between pulses
    SideChanged { run: RunId, side: Option<Side> },
    /// Cycles left in a counted run
    Remaining { run: RunId, remaining: u32 },
    /// Emitted exactly once per run, after the final stop burst
    Finished { run: RunId, outcome: RunOutcome },
}

impl RunEvent {
    pub fn run(&self) -> RunId {
        match self {
            RunEvent::Started { run, .. }
            | RunEvent::SideChanged { run, .. }
            | RunEvent::Remaining { run, .. }
            | RunEvent::Finished { run, .. } => *run,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Device(DeviceEvent),
    Run(RunEvent),
    /// A raw handle went away; it may or may not belong to a session
    ExternalDisconnect(DeviceId),
    /// The error display window opened at `epoch` has elapsed
    ErrorExpired { epoch: u64 },
}

impl From<DeviceEvent> for ControlEvent {
    fn from(event: DeviceEvent) -> Self {
        ControlEvent::Device(event)
    }
}

impl From<RunEvent> for ControlEvent {
    fn from(event: RunEvent) -> Self {
        ControlEvent::Run(event)
    }
}

/// Cloneable producer side of the control event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publishes an event; a closed channel only means nobody listens anymore
    pub fn emit(&self, event: impl Into<ControlEvent>) {
        let event = event.into();
        if let Err(e) = self.tx.send(event) {
            debug!("Dropping control event, receiver closed: {:?}", e.0);
        }
    }
}
