//! Bilateral stimulation scheduler
//!
//! Runs the alternating cycle against whichever sides have a session:
//!
//! ```text
//! ┌─► left pulse ─► stop ─► pause ─► right pulse ─► stop ─► pause* ─┐
//! └─────────────────────────────────────────────────────────────────┘
//!                                       * only if another cycle follows
//! ```
//!
//! At most one run is active. Each run owns a fresh `CancellationToken`;
//! starting a new run cancels the previous token and the new task waits for
//! the old task's cleanup before sending anything. Every termination path
//! ends with a bounded burst of stop packets to every connected side.

use crate::device::{SessionLink, SessionSlots, Side};
use crate::events::{EventSink, RunEvent, RunId, RunOutcome};
use crate::rumble::RumblePacket;
use crate::stimulation::StimulationConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stop packet repetition after each pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTiming {
    /// Spacing between repeated stop packets
    pub stop_interval: Duration,
    /// Stop packets per burst, including the immediate one
    pub stop_burst: u32,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            stop_interval: Duration::from_millis(5),
            stop_burst: 4,
        }
    }
}

struct ActiveRun {
    id: RunId,
    token: CancellationToken,
    task: JoinHandle<RunOutcome>,
}

#[derive(Default)]
struct SchedulerState {
    active: Option<ActiveRun>,
    // Cancelled run whose cleanup may still be in flight
    draining: Option<JoinHandle<RunOutcome>>,
}

pub struct StimulationScheduler {
    slots: SessionSlots,
    events: EventSink,
    timing: SchedulerTiming,
    state: Mutex<SchedulerState>,
    next_run: AtomicU64,
}

impl StimulationScheduler {
    pub fn new(slots: SessionSlots, events: EventSink, timing: SchedulerTiming) -> Self {
        Self {
            slots,
            events,
            timing,
            state: Mutex::new(SchedulerState::default()),
            next_run: AtomicU64::new(1),
        }
    }

    /// Starts a run, superseding any run in progress
    ///
    /// `RunEvent::Started` is published before this returns, ahead of the
    /// first report.
    pub async fn start(&self, config: StimulationConfig) -> RunId {
        let mut state = self.state.lock().await;

        let previous = match state.active.take() {
            Some(run) => {
                debug!(run = %run.id, "Superseding active run");
                run.token.cancel();
                Some(run.task)
            }
            None => state.draining.take(),
        };

        let id = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        info!(
            run = %id,
            pulse_ms = config.pulse_duration_ms(),
            pause_ms = config.pause_duration_ms(),
            amplitude = config.amplitude(),
            "Starting stimulation"
        );
        self.events.emit(RunEvent::Started {
            run: id,
            config: config.clone(),
        });

        let cycle = CycleRun {
            id,
            packet: config.rumble_packet(),
            config,
            left: self.slots.link(Side::Left),
            right: self.slots.link(Side::Right),
            events: self.events.clone(),
            timing: self.timing,
            token: token.clone(),
        };

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    error!("Superseded run terminated abnormally: {}", e);
                }
            }
            cycle.execute().await
        });

        state.active = Some(ActiveRun { id, token, task });
        id
    }

    /// Cancels the active run without waiting for its cleanup
    ///
    /// Returns whether a run was active. The cleanup still runs to completion
    /// in the background.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.active.take() {
            Some(run) => {
                info!(run = %run.id, "Stopping stimulation");
                run.token.cancel();
                state.draining = Some(run.task);
                true
            }
            None => false,
        }
    }

    /// Cancels the active run and waits until its stop burst has been sent
    pub async fn halt(&self) -> Option<RunOutcome> {
        let (active, draining) = {
            let mut state = self.state.lock().await;
            (state.active.take(), state.draining.take())
        };

        let task = match active {
            Some(run) => {
                debug!(run = %run.id, "Halting stimulation");
                run.token.cancel();
                // The active task already awaits any draining one
                run.task
            }
            None => draining?,
        };

        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Run task terminated abnormally: {}", e);
                None
            }
        }
    }

    /// Restarts the active run with new parameters
    ///
    /// Returns the new run id, or `None` when nothing was running. The new run
    /// always begins at the left pulse.
    pub async fn apply_live_config(&self, config: StimulationConfig) -> Option<RunId> {
        if !self.is_running().await {
            return None;
        }
        Some(self.start(config).await)
    }

    pub async fn is_running(&self) -> bool {
        self.active_run().await.is_some()
    }

    /// Id of the run that is neither cancelled nor finished
    pub async fn active_run(&self) -> Option<RunId> {
        let state = self.state.lock().await;
        state
            .active
            .as_ref()
            .filter(|run| !run.task.is_finished())
            .map(|run| run.id)
    }
}

enum Pulse {
    Skipped,
    Delivered,
    Cancelled,
}

/// State owned by one spawned run
struct CycleRun {
    id: RunId,
    config: StimulationConfig,
    packet: RumblePacket,
    left: SessionLink,
    right: SessionLink,
    events: EventSink,
    timing: SchedulerTiming,
    token: CancellationToken,
}

impl CycleRun {
    async fn execute(self) -> RunOutcome {
        let mut cycles = 0;
        let result = self.run_cycles(&mut cycles).await;

        self.final_stop().await;

        let outcome = match result {
            Ok(true) => RunOutcome::Completed { cycles },
            Ok(false) => RunOutcome::Cancelled { cycles },
            Err(reason) => {
                error!(run = %self.id, "Aborting run: {}", reason);
                RunOutcome::Failed { cycles, reason }
            }
        };
        info!(run = %self.id, ?outcome, "Stimulation finished");
        self.events.emit(RunEvent::Finished {
            run: self.id,
            outcome: outcome.clone(),
        });
        outcome
    }

    // Ok(true) when the cycle limit was reached, Ok(false) when cancelled
    async fn run_cycles(&self, cycles: &mut u32) -> Result<bool, String> {
        let limit = self.config.cycle_limit();
        if let Some(limit) = limit {
            self.publish_remaining(limit);
        }

        loop {
            if limit.is_some_and(|limit| *cycles >= limit) {
                return Ok(true);
            }
            if self.token.is_cancelled() {
                return Ok(false);
            }
            if !self.left.is_present().await && !self.right.is_present().await {
                info!(run = %self.id, "No Joy-Con left to drive");
                return Ok(false);
            }

            let left = match self.pulse(&self.left).await? {
                Pulse::Cancelled => return Ok(false),
                Pulse::Delivered => Some(&self.left),
                Pulse::Skipped => None,
            };
            if !self.rest(left).await {
                return Ok(false);
            }

            let right = match self.pulse(&self.right).await? {
                Pulse::Cancelled => return Ok(false),
                Pulse::Delivered => Some(&self.right),
                Pulse::Skipped => None,
            };
            let another_follows = limit.map_or(true, |limit| *cycles + 1 < limit);
            if another_follows && !self.rest(right).await {
                return Ok(false);
            }

            *cycles += 1;
            debug!(run = %self.id, cycles = *cycles, "Cycle complete");
            if let Some(limit) = limit {
                self.publish_remaining(limit.saturating_sub(*cycles));
            }
        }
    }

    /// One pulse on one side, ending with the first stop packet
    async fn pulse(&self, link: &SessionLink) -> Result<Pulse, String> {
        if self.token.is_cancelled() {
            return Ok(Pulse::Cancelled);
        }
        if !link.is_present().await {
            return Ok(Pulse::Skipped);
        }

        self.set_side(Some(link.side()));
        let sent = link.send(&self.packet).await.map_err(|e| e.to_string())?;
        if !sent {
            self.set_side(None);
            return Ok(Pulse::Skipped);
        }

        if !self.wait(self.config.pulse_duration()).await {
            return Ok(Pulse::Cancelled);
        }

        link.send(&RumblePacket::stop())
            .await
            .map_err(|e| e.to_string())?;
        self.set_side(None);
        Ok(Pulse::Delivered)
    }

    /// Silent pause; repeats the stop packet for `settling` meanwhile
    ///
    /// The pause length wins: repeats that do not fit into it are dropped.
    /// Returns false when cancelled.
    async fn rest(&self, settling: Option<&SessionLink>) -> bool {
        let pause = self.wait(self.config.pause_duration());
        tokio::pin!(pause);
        tokio::select! {
            biased;
            waited = &mut pause => waited,
            _ = self.repeat_stop(settling) => pause.await,
        }
    }

    async fn repeat_stop(&self, link: Option<&SessionLink>) {
        let Some(link) = link else {
            return;
        };
        for _ in 1..self.timing.stop_burst {
            if !self.wait(self.timing.stop_interval).await {
                return;
            }
            if let Err(e) = link.send(&RumblePacket::stop()).await {
                warn!(run = %self.id, side = %link.side(), "Stop packet failed: {}", e);
            }
        }
    }

    /// Stop burst to every connected side, whatever ended the run
    async fn final_stop(&self) {
        self.set_side(None);
        for i in 0..self.timing.stop_burst.max(1) {
            if i > 0 {
                tokio::time::sleep(self.timing.stop_interval).await;
            }
            for link in [&self.left, &self.right] {
                if let Err(e) = link.send(&RumblePacket::stop()).await {
                    debug!(run = %self.id, side = %link.side(), "Ignoring stop failure: {}", e);
                }
            }
        }
    }

    /// Abortable sleep; false if the run was cancelled first
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn set_side(&self, side: Option<Side>) {
        self.events.emit(RunEvent::SideChanged { run: self.id, side });
    }

    fn publish_remaining(&self, remaining: u32) {
        self.events.emit(RunEvent::Remaining {
            run: self.id,
            remaining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::{MemoryDevice, ReportLog, SentReport};
    use crate::device::{open_session, DeviceId, RUMBLE_REPORT_ID};
    use crate::events::ControlEvent;
    use crate::stimulation::StimulationRequest;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Rig {
        scheduler: StimulationScheduler,
        log: ReportLog,
        events: UnboundedReceiver<ControlEvent>,
    }

    async fn rig() -> Rig {
        let log = ReportLog::default();
        let slots = SessionSlots::new();
        let (sink, events) = EventSink::channel();

        let left = MemoryDevice::left("joycon-left").into_transport(log.clone());
        let right = MemoryDevice::right("joycon-right").into_transport(log.clone());
        slots.install(open_session(left, Side::Left).unwrap()).await;
        slots.install(open_session(right, Side::Right).unwrap()).await;
        log.clear();

        Rig {
            scheduler: StimulationScheduler::new(slots, sink, SchedulerTiming::default()),
            log,
            events,
        }
    }

    fn config(pulse: f64, pause: f64, count: Option<u32>) -> StimulationConfig {
        StimulationConfig::from(StimulationRequest {
            pulse_duration_ms: Some(pulse),
            pause_duration_ms: Some(pause),
            amplitude: Some(0.5),
            repeat_mode: count.map(|_| "count".to_string()),
            repeat_count: count.map(f64::from),
            ..StimulationRequest::default()
        })
    }

    fn is_pulse(report: &SentReport) -> bool {
        let pulse = config(100.0, 0.0, None).rumble_packet();
        report.report_id == RUMBLE_REPORT_ID && report.payload == pulse.as_bytes().to_vec()
    }

    fn pulses(reports: &[SentReport], device: &str) -> usize {
        reports
            .iter()
            .filter(|r| r.device == DeviceId::new(device) && is_pulse(r))
            .count()
    }

    fn drain(rx: &mut UnboundedReceiver<ControlEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ControlEvent::Run(run) = event {
                out.push(run);
            }
        }
        out
    }

    // Lets a run end on its own, then collects its outcome
    async fn run_to_end(scheduler: &StimulationScheduler) -> Option<RunOutcome> {
        while scheduler.is_running().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.halt().await
    }

    #[tokio::test(start_paused = true)]
    async fn counted_run_completes_after_exact_cycles() {
        let mut rig = rig().await;
        let run = rig.scheduler.start(config(100.0, 50.0, Some(3))).await;

        let outcome = run_to_end(&rig.scheduler).await;
        assert_eq!(outcome, Some(RunOutcome::Completed { cycles: 3 }));

        let reports = rig.log.reports();
        assert_eq!(pulses(&reports, "joycon-left"), 3);
        assert_eq!(pulses(&reports, "joycon-right"), 3);

        let events = drain(&mut rig.events);
        let remaining: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Remaining { run: r, remaining } if *r == run => Some(*remaining),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![3, 2, 1, 0]);
        assert!(matches!(events.last(), Some(RunEvent::Finished { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn pulses_alternate_left_then_right() {
        let rig = rig().await;
        rig.scheduler.start(config(100.0, 200.0, Some(1))).await;
        run_to_end(&rig.scheduler).await;

        let pulse_reports: Vec<SentReport> =
            rig.log.reports().into_iter().filter(is_pulse).collect();
        let order: Vec<&str> = pulse_reports.iter().map(|r| r.device.as_str()).collect();
        assert_eq!(order, vec!["joycon-left", "joycon-right"]);

        // pulse and pause lie between the two pulses
        let gap = pulse_reports[1].at - pulse_reports[0].at;
        assert!(gap >= Duration::from_millis(300), "gap was {gap:?}");
        assert!(gap < Duration::from_millis(310), "gap was {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_repeats_do_not_stretch_a_short_pause() {
        let rig = rig().await;
        rig.scheduler.start(config(100.0, 0.0, Some(1))).await;
        run_to_end(&rig.scheduler).await;

        let pulse_reports: Vec<SentReport> =
            rig.log.reports().into_iter().filter(is_pulse).collect();
        assert_eq!(pulse_reports.len(), 2);
        let gap = pulse_reports[1].at - pulse_reports[0].at;
        assert_eq!(gap, Duration::from_millis(100));

        // With room for it, the whole burst still reaches the left side
        let rig = self::rig().await;
        rig.scheduler.start(config(100.0, 50.0, Some(1))).await;
        run_to_end(&rig.scheduler).await;

        let reports = rig.log.reports();
        let right_pulse = reports
            .iter()
            .position(|r| r.device == DeviceId::new("joycon-right") && is_pulse(r))
            .unwrap();
        let left_stops = reports[..right_pulse]
            .iter()
            .filter(|r| r.device == DeviceId::new("joycon-left") && !is_pulse(r))
            .count();
        assert_eq!(left_stops, SchedulerTiming::default().stop_burst as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_pulse_sends_stop_to_buzzing_side() {
        let mut rig = rig().await;
        let run = rig.scheduler.start(config(1000.0, 0.0, None)).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rig.scheduler.stop().await);
        assert!(!rig.scheduler.is_running().await);

        let outcome = rig.scheduler.halt().await;
        assert_eq!(outcome, Some(RunOutcome::Cancelled { cycles: 0 }));

        let left = rig.log.reports_for(&DeviceId::new("joycon-left"));
        assert_eq!(
            left.last().map(|r| r.payload.clone()),
            Some(RumblePacket::stop().as_bytes().to_vec())
        );
        assert_eq!(pulses(&rig.log.reports(), "joycon-right"), 0);

        let finished = drain(&mut rig.events)
            .into_iter()
            .filter(|e| matches!(e, RunEvent::Finished { run: r, .. } if *r == run))
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_run_supersedes_old_one() {
        let mut rig = rig().await;
        let first = rig.scheduler.start(config(500.0, 500.0, None)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = rig.scheduler.start(config(200.0, 100.0, None)).await;
        assert_ne!(first, second);
        assert_eq!(rig.scheduler.active_run().await, Some(second));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reports = rig.log.reports();
        rig.scheduler.halt().await;

        // The old run's stop burst lands between the two runs' pulses
        let pulse_at: Vec<usize> = reports
            .iter()
            .enumerate()
            .filter(|(_, r)| is_pulse(r))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pulse_at.len(), 2, "{reports:?}");
        assert_eq!(reports[pulse_at[1]].device, DeviceId::new("joycon-left"));
        let between = &reports[pulse_at[0] + 1..pulse_at[1]];
        let stop = RumblePacket::stop().as_bytes().to_vec();
        assert!(between.iter().all(|r| r.payload == stop));
        for device in ["joycon-left", "joycon-right"] {
            let stops = between
                .iter()
                .filter(|r| r.device == DeviceId::new(device))
                .count();
            assert_eq!(stops, SchedulerTiming::default().stop_burst as usize);
        }

        let finished: Vec<RunId> = drain(&mut rig.events)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::Finished { run, .. } => Some(run),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![first, second]);
    }

    #[tokio::test(start_paused = true)]
    async fn live_config_only_restarts_active_runs() {
        let rig = rig().await;
        assert_eq!(
            rig.scheduler
                .apply_live_config(config(100.0, 0.0, None))
                .await,
            None
        );

        let first = rig.scheduler.start(config(300.0, 300.0, None)).await;
        let restarted = rig
            .scheduler
            .apply_live_config(config(100.0, 100.0, None))
            .await;
        assert!(matches!(restarted, Some(id) if id != first));
        rig.scheduler.halt().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_aborts_the_run() {
        let log = ReportLog::default();
        let slots = SessionSlots::new();
        let (sink, _events) = EventSink::channel();
        // Two handshake writes and one pulse get through
        let left = MemoryDevice::left("joycon-left")
            .failing_writes_after(3)
            .into_transport(log.clone());
        slots.install(open_session(left, Side::Left).unwrap()).await;

        let scheduler = StimulationScheduler::new(slots, sink, SchedulerTiming::default());
        scheduler.start(config(100.0, 0.0, None)).await;

        let outcome = run_to_end(&scheduler).await;
        assert!(matches!(outcome, Some(RunOutcome::Failed { cycles: 0, .. })));
    }
}
