//! Stimulation parameters and the alternating-pulse scheduler

pub mod config;
pub mod scheduler;

pub use config::{RepeatMode, StimulationConfig, StimulationRequest};
pub use scheduler::{SchedulerTiming, StimulationScheduler};
