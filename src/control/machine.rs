//! Connection and vibration state machine
//!
//! Pure and synchronous; the controller actor is its only owner and feeds it
//! device transitions and run events.
//!
//! ```text
//!                 connectLeft            connectRight
//! Disconnected ───────────────► LeftConnected ─────────────► Connected
//!      │  ▲   connectRight                                    ▲  │
//!      │  │ ─────────────────► RightConnected ──connectLeft───┘  │
//!      │  └──────────────── disconnectBoth ──────────────────────┘
//!      │
//!      └─── any state ──fail──► Error ──connect* / clear──► (from flags)
//! ```
//!
//! Vibration is an orthogonal flag that can only be set while `Connected` and
//! is dropped whenever the machine leaves `Connected`.

use super::status::{status_for, Status, StatusSnapshot};
use crate::device::{Connectivity, Side};
use crate::events::{RunEvent, RunId};
use chrono::Local;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    LeftConnected,
    RightConnected,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    ConnectLeft,
    ConnectRight,
    ConnectBoth,
    DisconnectLeft,
    DisconnectRight,
    DisconnectBoth,
    Fail(String),
    /// Leaves `Error` once the display window is over
    ClearError(Connectivity),
    /// Re-reads connectivity without touching an error
    Resync(Connectivity),
}

impl Transition {
    pub fn connect(side: Side) -> Self {
        match side {
            Side::Left => Transition::ConnectLeft,
            Side::Right => Transition::ConnectRight,
        }
    }

    pub fn disconnect(side: Side) -> Self {
        match side {
            Side::Left => Transition::DisconnectLeft,
            Side::Right => Transition::DisconnectRight,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    left: bool,
    right: bool,
    error_message: Option<String>,
    error_epoch: u64,
    vibrating: bool,
    run: Option<RunId>,
    vibrating_side: Option<Side>,
    remaining: Option<u32>,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Incremented on every failure; identifies the current error window
    pub fn error_epoch(&self) -> u64 {
        self.error_epoch
    }

    pub fn is_vibrating(&self) -> bool {
        self.vibrating
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.run
    }

    pub fn connectivity(&self) -> Connectivity {
        Connectivity {
            left_present: self.left,
            right_present: self.right,
        }
    }

    /// Guard for starting a run: both sides present
    pub fn can_vibrate(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn apply(&mut self, transition: Transition) {
        let before = self.state;

        match transition {
            Transition::ConnectLeft => {
                self.left = true;
                self.leave_error();
            }
            Transition::ConnectRight => {
                self.right = true;
                self.leave_error();
            }
            Transition::ConnectBoth => {
                self.left = true;
                self.right = true;
                self.leave_error();
            }
            Transition::DisconnectLeft => self.left = false,
            Transition::DisconnectRight => self.right = false,
            Transition::DisconnectBoth => {
                self.left = false;
                self.right = false;
                self.leave_error();
            }
            Transition::Fail(message) => {
                self.error_epoch += 1;
                self.error_message = Some(message);
                self.state = ConnectionState::Error;
            }
            Transition::ClearError(connectivity) => {
                self.set_connectivity(connectivity);
                self.leave_error();
            }
            Transition::Resync(connectivity) => self.set_connectivity(connectivity),
        }

        if self.state != ConnectionState::Error {
            self.state = self.state_from_flags();
        }
        if self.state != ConnectionState::Connected {
            self.end_vibration();
        }

        if before != self.state {
            debug!(from = ?before, to = ?self.state, "Connection state changed");
        }
    }

    /// Folds a scheduler event into the vibration substate
    ///
    /// Events of runs other than the current one are ignored.
    pub fn on_run_event(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Started { run, .. } => {
                if !self.can_vibrate() {
                    debug!(run = %run, state = ?self.state, "Ignoring run start outside Connected");
                    return;
                }
                self.vibrating = true;
                self.run = Some(*run);
                self.vibrating_side = None;
                self.remaining = None;
            }
            RunEvent::SideChanged { run, side } if self.run == Some(*run) => {
                self.vibrating_side = *side;
            }
            RunEvent::Remaining { run, remaining } if self.run == Some(*run) => {
                self.remaining = Some(*remaining);
            }
            RunEvent::Finished { run, .. } if self.run == Some(*run) => self.end_vibration(),
            _ => {}
        }
    }

    pub fn end_vibration(&mut self) {
        self.vibrating = false;
        self.run = None;
        self.vibrating_side = None;
        self.remaining = None;
    }

    pub fn status(&self) -> Status {
        status_for(self.state, self.error_message())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connection_state: self.state,
            status: self.status(),
            left_present: self.left,
            right_present: self.right,
            vibrating: self.vibrating,
            vibrating_side: self.vibrating_side,
            remaining_count: self.remaining,
            updated_at: Local::now(),
        }
    }

    fn set_connectivity(&mut self, connectivity: Connectivity) {
        self.left = connectivity.left_present;
        self.right = connectivity.right_present;
    }

    fn leave_error(&mut self) {
        self.error_message = None;
        if self.state == ConnectionState::Error {
            self.state = self.state_from_flags();
        }
    }

    fn state_from_flags(&self) -> ConnectionState {
        match (self.left, self.right) {
            (false, false) => ConnectionState::Disconnected,
            (true, false) => ConnectionState::LeftConnected,
            (false, true) => ConnectionState::RightConnected,
            (true, true) => ConnectionState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunOutcome;
    use crate::stimulation::StimulationConfig;

    fn started(run: u64) -> RunEvent {
        RunEvent::Started {
            run: RunId(run),
            config: StimulationConfig::default(),
        }
    }

    fn connected() -> ConnectionMachine {
        let mut machine = ConnectionMachine::new();
        machine.apply(Transition::ConnectBoth);
        machine
    }

    #[test]
    fn connect_left_from_disconnected() {
        let mut machine = ConnectionMachine::new();
        machine.apply(Transition::ConnectLeft);
        assert_eq!(machine.state(), ConnectionState::LeftConnected);
        assert!(!machine.can_vibrate());
    }

    #[test]
    fn both_sides_reach_connected_in_either_order() {
        let mut machine = ConnectionMachine::new();
        machine.apply(Transition::ConnectRight);
        assert_eq!(machine.state(), ConnectionState::RightConnected);
        machine.apply(Transition::ConnectLeft);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(machine.can_vibrate());
    }

    #[test]
    fn disconnects_step_back_down() {
        let mut machine = connected();
        machine.apply(Transition::DisconnectLeft);
        assert_eq!(machine.state(), ConnectionState::RightConnected);
        machine.apply(Transition::DisconnectRight);
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        let mut machine = connected();
        machine.apply(Transition::DisconnectBoth);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn run_start_is_ignored_unless_connected() {
        let mut machine = ConnectionMachine::new();
        machine.apply(Transition::ConnectLeft);
        machine.on_run_event(&started(1));
        assert!(!machine.is_vibrating());
        assert_eq!(machine.state(), ConnectionState::LeftConnected);
    }

    #[test]
    fn run_progress_is_tracked_for_current_run_only() {
        let mut machine = connected();
        machine.on_run_event(&started(1));
        machine.on_run_event(&RunEvent::Remaining {
            run: RunId(1),
            remaining: 2,
        });
        machine.on_run_event(&RunEvent::SideChanged {
            run: RunId(1),
            side: Some(Side::Left),
        });

        machine.on_run_event(&started(2));
        machine.on_run_event(&RunEvent::Finished {
            run: RunId(1),
            outcome: RunOutcome::Cancelled { cycles: 0 },
        });
        assert!(machine.is_vibrating());
        assert_eq!(machine.active_run(), Some(RunId(2)));

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.remaining_count, None);
        assert_eq!(snapshot.vibrating_side, None);

        machine.on_run_event(&RunEvent::Remaining {
            run: RunId(2),
            remaining: 0,
        });
        assert_eq!(machine.snapshot().remaining_count, Some(0));

        machine.on_run_event(&RunEvent::Finished {
            run: RunId(2),
            outcome: RunOutcome::Completed { cycles: 1 },
        });
        let snapshot = machine.snapshot();
        assert!(!snapshot.vibrating);
        assert_eq!(snapshot.remaining_count, None);
    }

    #[test]
    fn leaving_connected_drops_vibration() {
        let mut machine = connected();
        machine.on_run_event(&started(7));
        machine.apply(Transition::DisconnectRight);
        assert!(!machine.is_vibrating());
        assert_eq!(machine.active_run(), None);
    }

    #[test]
    fn error_carries_message_until_recovered() {
        let mut machine = ConnectionMachine::new();
        machine.apply(Transition::ConnectLeft);
        machine.apply(Transition::Fail("Failed to open device: busy".into()));
        assert_eq!(machine.state(), ConnectionState::Error);
        assert_eq!(machine.status().text, "Failed to open device: busy");
        assert_eq!(machine.error_epoch(), 1);

        // Still in Error after a resync
        machine.apply(Transition::Resync(Connectivity {
            left_present: true,
            right_present: false,
        }));
        assert_eq!(machine.state(), ConnectionState::Error);

        machine.apply(Transition::ConnectRight);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.error_message(), None);
    }

    #[test]
    fn clear_error_restores_state_from_connectivity() {
        let mut machine = connected();
        machine.apply(Transition::Fail("Failed to write report: gone".into()));
        machine.apply(Transition::ClearError(Connectivity {
            left_present: false,
            right_present: true,
        }));
        assert_eq!(machine.state(), ConnectionState::RightConnected);
        assert_eq!(machine.status().text, "left joy-con not connected");
    }

    #[test]
    fn disconnect_both_leaves_error() {
        let mut machine = connected();
        machine.apply(Transition::Fail("boom".into()));
        machine.apply(Transition::DisconnectLeft);
        assert_eq!(machine.state(), ConnectionState::Error);
        machine.apply(Transition::DisconnectBoth);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.error_message(), None);
    }
}
