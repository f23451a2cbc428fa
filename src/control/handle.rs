//! Controller handle - action surface for front ends
//!
//! Spawns one actor task that owns the device manager, the scheduler handle
//! and the connection state machine. Front ends talk to it through
//! [`ControllerHandle`] and observe it through a `watch` channel of
//! [`StatusSnapshot`]s.
//!
//! # Task Layout
//!
//! ```text
//! ControllerHandle ─[ControlCommand]→ ┌──────────────┐ ─[StatusSnapshot]→ watch subscribers
//!                                     │ actor task   │
//! EventSink ───────[ControlEvent]───→ └──────────────┘
//!   ▲  ▲  ▲
//!   │  │  └── presence watcher
//!   │  └───── StimulationScheduler run tasks
//!   └──────── DualDeviceManager
//! ```
//!
//! Events are handled before commands, and every command drains the events it
//! caused before replying, so a caller that awaited an action sees its effect
//! in [`ControllerHandle::status`].

use super::machine::{ConnectionMachine, ConnectionState, Transition};
use super::status::StatusSnapshot;
use crate::device::{
    ConnectOutcome, DeviceDiscovery, DeviceError, DeviceId, DualDeviceManager, SessionSlots, Side,
};
use crate::events::{ControlEvent, DeviceEvent, EventSink, RunEvent, RunId, RunOutcome};
use crate::stimulation::{SchedulerTiming, StimulationConfig, StimulationScheduler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Tunables of the controller subsystem
///
/// # Examples
///
/// ```rust
/// use tapendos::control::ControllerSettings;
///
/// let snappy = ControllerSettings {
///     error_display_ms: 1000,
///     ..ControllerSettings::default()
/// };
/// assert_eq!(snappy.stop_burst_len, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// How long a transport error stays on screen before the state resyncs
    pub error_display_ms: u64,

    /// Spacing of repeated stop packets after a pulse
    pub stop_repeat_interval_ms: u64,

    /// Stop packets sent per burst (at least one)
    pub stop_burst_len: u32,

    /// Capacity of the command queue
    pub command_buffer: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            error_display_ms: 2000,
            stop_repeat_interval_ms: 5,
            stop_burst_len: 4,
            command_buffer: 32,
        }
    }
}

impl ControllerSettings {
    fn timing(&self) -> SchedulerTiming {
        SchedulerTiming {
            stop_interval: Duration::from_millis(self.stop_repeat_interval_ms),
            stop_burst: self.stop_burst_len.max(1),
        }
    }
}

/// Errors returned by the action surface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Stimulation needs both Joy-Cons
    #[error("Both Joy-Cons must be connected")]
    NotConnected,

    /// A run is already active; use a live config change instead
    #[error("Stimulation is already running")]
    AlreadyVibrating,

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The controller task has shut down
    #[error("Controller is not running")]
    Unavailable,
}

#[derive(Debug)]
enum ControlCommand {
    Connect {
        side: Side,
        response_tx: oneshot::Sender<Result<ConnectOutcome, ControlError>>,
    },
    ConnectBoth {
        response_tx: oneshot::Sender<Result<ConnectOutcome, ControlError>>,
    },
    Disconnect {
        side: Side,
        response_tx: oneshot::Sender<bool>,
    },
    DisconnectAll {
        response_tx: oneshot::Sender<()>,
    },
    StartVibration {
        config: StimulationConfig,
        response_tx: oneshot::Sender<Result<RunId, ControlError>>,
    },
    Stop {
        response_tx: oneshot::Sender<bool>,
    },
    ApplyLiveConfig {
        config: StimulationConfig,
        response_tx: oneshot::Sender<Option<RunId>>,
    },
    ClearError {
        response_tx: oneshot::Sender<()>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Caller dropped before the response was sent");
        }
    };
}

/// Cloneable handle to the controller actor
///
/// Dropping every handle shuts the actor down: the active run is halted and
/// both Joy-Cons are closed.
#[derive(Clone)]
pub struct ControllerHandle {
    command_tx: mpsc::Sender<ControlCommand>,
    status_rx: watch::Receiver<StatusSnapshot>,
    events: EventSink,
}

impl ControllerHandle {
    /// Spawns the controller actor on the current tokio runtime
    pub fn spawn(
        discovery: Arc<dyn DeviceDiscovery>,
        settings: Option<ControllerSettings>,
    ) -> Self {
        let settings = settings.unwrap_or_default();
        info!("Initializing controller with settings: {:?}", settings);

        let (events, event_rx) = EventSink::channel();
        let (command_tx, command_rx) = mpsc::channel(settings.command_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());

        let slots = SessionSlots::new();
        let scheduler = Arc::new(StimulationScheduler::new(
            slots.clone(),
            events.clone(),
            settings.timing(),
        ));
        let manager = DualDeviceManager::new(discovery, slots, scheduler.clone(), events.clone());

        let actor = ControllerActor {
            manager,
            scheduler,
            machine: ConnectionMachine::new(),
            events: events.clone(),
            status_tx,
            error_display: Duration::from_millis(settings.error_display_ms),
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        debug!("Controller actor spawned");

        Self {
            command_tx,
            status_rx,
            events,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, ControlError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(command(response_tx))
            .await
            .map_err(|_| ControlError::Unavailable)?;
        response_rx.await.map_err(|_| ControlError::Unavailable)
    }

    /// Connects `side`, or disconnects it if it is already connected
    pub async fn connect(&self, side: Side) -> Result<ConnectOutcome, ControlError> {
        self.request(|response_tx| ControlCommand::Connect { side, response_tx })
            .await?
    }

    pub async fn connect_both(&self) -> Result<ConnectOutcome, ControlError> {
        self.request(|response_tx| ControlCommand::ConnectBoth { response_tx })
            .await?
    }

    /// Returns whether `side` had a session
    pub async fn disconnect(&self, side: Side) -> Result<bool, ControlError> {
        self.request(|response_tx| ControlCommand::Disconnect { side, response_tx })
            .await
    }

    pub async fn disconnect_all(&self) -> Result<(), ControlError> {
        self.request(|response_tx| ControlCommand::DisconnectAll { response_tx })
            .await
    }

    /// Starts stimulation; both sides must be connected and no run active
    pub async fn start_vibration(
        &self,
        config: impl Into<StimulationConfig>,
    ) -> Result<RunId, ControlError> {
        let config = config.into();
        self.request(|response_tx| ControlCommand::StartVibration {
            config,
            response_tx,
        })
        .await?
    }

    /// Returns whether a run was active
    pub async fn stop(&self) -> Result<bool, ControlError> {
        self.request(|response_tx| ControlCommand::Stop { response_tx })
            .await
    }

    /// Restarts the active run with `config`; `None` if nothing was running
    pub async fn apply_live_config(
        &self,
        config: impl Into<StimulationConfig>,
    ) -> Result<Option<RunId>, ControlError> {
        let config = config.into();
        self.request(|response_tx| ControlCommand::ApplyLiveConfig {
            config,
            response_tx,
        })
        .await
    }

    pub async fn clear_error(&self) -> Result<(), ControlError> {
        self.request(|response_tx| ControlCommand::ClearError { response_tx })
            .await
    }

    /// Halts any run, closes both Joy-Cons and stops the actor
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(|response_tx| ControlCommand::Shutdown { response_tx })
            .await
    }

    /// Entry point for platform disconnect notifications
    pub fn handle_external_disconnect(&self, id: DeviceId) {
        self.events.emit(ControlEvent::ExternalDisconnect(id));
    }

    /// Sink for additional event sources such as the presence watcher
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        debug!("New subscriber to controller status");
        self.status_rx.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }
}

enum Step {
    Event(ControlEvent),
    Command(Option<ControlCommand>),
}

struct ControllerActor {
    manager: DualDeviceManager,
    scheduler: Arc<StimulationScheduler>,
    machine: ConnectionMachine,
    events: EventSink,
    status_tx: watch::Sender<StatusSnapshot>,
    error_display: Duration,
}

impl ControllerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControlCommand>,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        info!("Controller actor running");
        self.publish();

        loop {
            let step = tokio::select! {
                biased;
                Some(event) = events.recv() => Step::Event(event),
                command = commands.recv() => Step::Command(command),
            };

            match step {
                Step::Event(event) => {
                    self.handle_event(event).await;
                    self.publish();
                }
                Step::Command(Some(ControlCommand::Shutdown { response_tx })) => {
                    self.shutdown(&mut events).await;
                    respond!(response_tx, ());
                    break;
                }
                Step::Command(Some(command)) => self.handle_command(command, &mut events).await,
                Step::Command(None) => {
                    debug!("All controller handles dropped");
                    self.shutdown(&mut events).await;
                    break;
                }
            }
        }
        info!("Controller actor stopped");
    }

    async fn handle_command(
        &mut self,
        command: ControlCommand,
        events: &mut mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        match command {
            ControlCommand::Connect { side, response_tx } => {
                let result = self.manager.connect(side).await;
                let result = self.absorb(result).await;
                self.settle(events).await;
                respond!(response_tx, result);
            }
            ControlCommand::ConnectBoth { response_tx } => {
                let result = self.manager.connect_both().await;
                let result = self.absorb(result).await;
                self.settle(events).await;
                respond!(response_tx, result);
            }
            ControlCommand::Disconnect { side, response_tx } => {
                let existed = self.manager.disconnect(side).await;
                self.settle(events).await;
                respond!(response_tx, existed);
            }
            ControlCommand::DisconnectAll { response_tx } => {
                self.manager.disconnect_all().await;
                self.settle(events).await;
                respond!(response_tx, ());
            }
            ControlCommand::StartVibration {
                config,
                response_tx,
            } => {
                let result = self.start_vibration(config).await;
                self.settle(events).await;
                respond!(response_tx, result);
            }
            ControlCommand::Stop { response_tx } => {
                let stopped = self.scheduler.stop().await;
                self.machine.end_vibration();
                self.settle(events).await;
                respond!(response_tx, stopped);
            }
            ControlCommand::ApplyLiveConfig {
                config,
                response_tx,
            } => {
                let restarted = if self.machine.is_vibrating() {
                    self.scheduler.apply_live_config(config).await
                } else {
                    None
                };
                self.settle(events).await;
                respond!(response_tx, restarted);
            }
            ControlCommand::ClearError { response_tx } => {
                let connectivity = self.manager.connectivity().await;
                self.machine.apply(Transition::ClearError(connectivity));
                self.settle(events).await;
                respond!(response_tx, ());
            }
            ControlCommand::Shutdown { response_tx } => {
                // The run loop intercepts shutdown before dispatch
                warn!("Shutdown reached the command dispatcher");
                respond!(response_tx, ());
            }
        }
    }

    async fn start_vibration(&mut self, config: StimulationConfig) -> Result<RunId, ControlError> {
        if !self.machine.can_vibrate() {
            debug!(state = ?self.machine.state(), "Rejecting vibration start");
            return Err(ControlError::NotConnected);
        }
        if self.machine.is_vibrating() || self.scheduler.is_running().await {
            return Err(ControlError::AlreadyVibrating);
        }
        Ok(self.scheduler.start(config).await)
    }

    /// Turns a device failure into the matching state change
    async fn absorb<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, ControlError> {
        if let Err(e) = &result {
            match e {
                DeviceError::NoDeviceSelected(_) => {
                    let connectivity = self.manager.connectivity().await;
                    self.machine.apply(Transition::Resync(connectivity));
                }
                DeviceError::AlreadyConnected(_) => {}
                other => {
                    error!("Device failure: {}", other);
                    self.fail(other.to_string());
                }
            }
        }
        result.map_err(ControlError::from)
    }

    /// Enters Error and schedules the end of the display window
    fn fail(&mut self, message: String) {
        self.machine.apply(Transition::Fail(message));
        let epoch = self.machine.error_epoch();
        let events = self.events.clone();
        let display = self.error_display;
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            events.emit(ControlEvent::ErrorExpired { epoch });
        });
    }

    async fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Device(event) => {
                let transition = match event {
                    DeviceEvent::Attached(side) => Transition::connect(side),
                    DeviceEvent::AttachedBoth => Transition::ConnectBoth,
                    DeviceEvent::Detached(side) => Transition::disconnect(side),
                    DeviceEvent::DetachedBoth => Transition::DisconnectBoth,
                };
                let was_vibrating = self.machine.is_vibrating();
                self.machine.apply(transition);
                if was_vibrating && !self.machine.is_vibrating() {
                    self.scheduler.stop().await;
                }
            }
            ControlEvent::Run(event) => {
                let current = self.machine.active_run() == Some(event.run());
                self.machine.on_run_event(&event);
                if let RunEvent::Finished {
                    outcome: RunOutcome::Failed { reason, .. },
                    ..
                } = event
                {
                    if current {
                        self.fail(reason);
                    }
                }
            }
            ControlEvent::ExternalDisconnect(id) => {
                if self.manager.handle_external_disconnect(&id).await.is_none() {
                    debug!(device = %id, "Disconnect did not match a session");
                }
            }
            ControlEvent::ErrorExpired { epoch } => {
                if self.machine.state() == ConnectionState::Error
                    && self.machine.error_epoch() == epoch
                {
                    let connectivity = self.manager.connectivity().await;
                    self.machine.apply(Transition::ClearError(connectivity));
                    debug!("Error display window elapsed");
                }
            }
        }
    }

    // Folds in every event already queued, then publishes once
    async fn settle(&mut self, events: &mut mpsc::UnboundedReceiver<ControlEvent>) {
        while let Ok(event) = events.try_recv() {
            self.handle_event(event).await;
        }
        self.publish();
    }

    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<ControlEvent>) {
        info!("Shutting down controller");
        self.scheduler.halt().await;
        self.manager.disconnect_all().await;
        self.settle(events).await;
        if self.machine.state() != ConnectionState::Disconnected {
            warn!(state = ?self.machine.state(), "Controller stopped in a connected state");
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.machine.snapshot());
    }
}
