use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapendos::config::Settings;
use tapendos::control::{ControlError, ControllerHandle, StatusSnapshot};
use tapendos::device::hid::HidapiDiscovery;
use tapendos::device::memory::MemoryDiscovery;
use tapendos::device::watcher::spawn_presence_watcher;
use tapendos::device::{Connectivity, DeviceDiscovery};
use tapendos::persistence::{KeyValueStore, MemoryStore, PresetMemory, TomlFileStore};
use tapendos::rumble::format_amplitude;
use tapendos::stimulation::{StimulationConfig, StimulationRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Alternating Joy-Con vibration for bilateral stimulation
#[derive(Parser, Debug)]
#[command(name = "tapendos", version, about)]
struct Args {
    /// Pulse length per side in milliseconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Pause after each pulse in milliseconds
    #[arg(short, long)]
    pause: Option<f64>,

    /// Vibration strength between 0.0 and 1.0
    #[arg(short, long)]
    amplitude: Option<f64>,

    /// Stop after this many left/right cycles instead of running until Ctrl-C
    #[arg(short, long)]
    count: Option<u32>,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use two in-memory Joy-Cons instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Preset id to remember as the active one
    #[arg(long)]
    preset: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> StimulationRequest {
        StimulationRequest {
            pulse_duration_ms: self.duration,
            amplitude: self.amplitude,
            pause_duration_ms: self.pause,
            repeat_mode: self.count.map(|_| "count".to_string()),
            repeat_count: self.count.map(f64::from),
            ..StimulationRequest::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.verbose)?;

    let settings_path = args.config.clone().unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_default(&settings_path).await;
    debug!("Settings: {:?}", settings);

    if args.simulate {
        remember_preset(MemoryStore::new(), args.preset.as_deref()).await;
    } else {
        let store = settings
            .store_path
            .clone()
            .map(TomlFileStore::new)
            .unwrap_or_else(TomlFileStore::in_config_dir);
        remember_preset(store, args.preset.as_deref()).await;
    }

    let discovery: Arc<dyn DeviceDiscovery> = if args.simulate {
        info!("Using simulated Joy-Cons");
        Arc::new(MemoryDiscovery::with_pair())
    } else {
        Arc::new(HidapiDiscovery::new().map_err(|e| eyre!("Failed to start HID backend: {}", e))?)
    };

    let handle = ControllerHandle::spawn(discovery.clone(), Some(settings.controller.clone()));

    let shutdown = CancellationToken::new();
    let watcher = spawn_presence_watcher(
        discovery,
        handle.event_sink(),
        Duration::from_millis(settings.presence_poll_ms.max(50)),
        shutdown.clone(),
    );

    let result = run(&handle, &settings, &args).await;

    shutdown.cancel();
    if let Err(e) = watcher.await {
        warn!("Presence watcher ended abnormally: {}", e);
    }
    if let Err(e) = handle.shutdown().await {
        debug!("Controller already stopped: {}", e);
    }

    result
}

async fn run(handle: &ControllerHandle, settings: &Settings, args: &Args) -> Result<()> {
    match handle.connect_both().await {
        Ok(_) => {}
        Err(ControlError::Device(e)) if e.is_cancelled_selection() => {
            return Err(eyre!("No Joy-Con found, pair both controllers first"));
        }
        Err(e) => return Err(eyre!("Failed to connect Joy-Cons: {}", e)),
    }
    let status = handle.status();
    report(&status);
    info!("Using {}", connectivity_name(&status));

    let request = settings.stimulation.merged_with(&args.overrides());
    let config = StimulationConfig::normalize(&request);
    info!(
        "Pulse {} ms, pause {} ms, amplitude {}, cycles {}",
        config.pulse_duration_ms(),
        config.pause_duration_ms(),
        format_amplitude(config.amplitude()),
        config
            .cycle_limit()
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );

    let run = handle
        .start_vibration(config)
        .await
        .map_err(|e| eyre!("Failed to start stimulation: {}", e))?;
    info!("Stimulation {} running, press Ctrl-C to stop", run);

    let mut status = handle.subscribe();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Stopping stimulation");
            handle
                .stop()
                .await
                .map_err(|e| eyre!("Failed to stop stimulation: {}", e))?;
        }
        finished = status.wait_for(|s| !s.vibrating) => {
            if finished.is_err() {
                warn!("Controller stopped while stimulation was running");
            }
        }
    }

    report(&handle.status());
    Ok(())
}

async fn remember_preset<S: KeyValueStore>(store: S, preset: Option<&str>) {
    let memory = PresetMemory::new(store);
    match preset {
        Some(id) => memory.remember(id).await,
        None => match memory.last().await {
            Some(id) => info!("Last active preset: {}", id),
            None => debug!("No preset remembered"),
        },
    }
}

fn connectivity_name(status: &StatusSnapshot) -> &'static str {
    Connectivity {
        left_present: status.left_present,
        right_present: status.right_present,
    }
    .device_name()
}

fn report(status: &StatusSnapshot) {
    info!(
        state = ?status.connection_state,
        class = ?status.status.class,
        "{}",
        status.status.text
    );
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", if verbose { "debug" } else { "info" })
    }
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
