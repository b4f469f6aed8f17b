use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mqtt_visualiser_core::device::FREQUENCY_PRESETS;
use mqtt_visualiser_core::publish::{probe, DEFAULT_QUEUE};
use mqtt_visualiser_core::telemetry::TelemetryEvent;
use mqtt_visualiser_core::{
    select_detector, ActuatorPublisher, AppConfig, AudioConfig, AudioSource, Backoff, ClipSource,
    ConfigProvider, ConfigStore, ControlLoop, LoopStats, Result, TcpConnector, TelemetryQueue,
    VisualiserError,
};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing_subscriber::EnvFilter;

/// Quiet period after a file event before the config is re-read.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);
/// How long the publisher gets to say goodbye to the broker.
const PUBLISHER_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let app = load_config(&config, cli.debug)?;
            run_pipeline(&config, app, open_capture)
        }
        Commands::Replay {
            input,
            config,
            fast,
        } => {
            let app = load_config(&config, cli.debug)?;
            run_pipeline(&config, app, move |audio| {
                let clip = ClipSource::open_wav(&input, audio.buffer_size)?.realtime(!fast);
                Ok(Box::new(clip) as Box<dyn AudioSource>)
            })
        }
        Commands::CheckBroker { config } => {
            let app = load_config(&config, cli.debug)?;
            check_broker(&app)
        }
        Commands::Presets => {
            init_tracing(cli.debug);
            for (key, label, range) in FREQUENCY_PRESETS {
                println!("{key:<12} {label:<16} {range}");
            }
            Ok(())
        }
    }
}

fn load_config(path: &Path, debug: bool) -> Result<AppConfig> {
    let loaded = AppConfig::load(path);
    let debug = debug || loaded.as_ref().map(|app| app.runtime.debug).unwrap_or(false);
    init_tracing(debug);

    let app = loaded?;
    tracing::info!(
        path = %path.display(),
        broker = %app.broker.address(),
        devices = app.devices.len(),
        "configuration loaded"
    );
    Ok(app)
}

#[cfg(feature = "capture")]
fn open_capture(audio: &AudioConfig) -> Result<Box<dyn AudioSource>> {
    let source = mqtt_visualiser_core::audio::CaptureSource::open(audio)?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "capture"))]
fn open_capture(_audio: &AudioConfig) -> Result<Box<dyn AudioSource>> {
    Err(VisualiserError::AudioUnavailable(
        "built without the `capture` feature; use `replay` or rebuild with --features capture"
            .into(),
    ))
}

/// Wires source, control loop, publisher, telemetry and config reload
/// together and blocks until the source ends or Ctrl-C is pressed.
fn run_pipeline<F>(config_path: &Path, app: AppConfig, open_source: F) -> Result<()>
where
    F: FnOnce(&AudioConfig) -> Result<Box<dyn AudioSource>> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let store = Arc::new(ConfigStore::from_app_config(&app)?);
    let shutdown = Arc::new(AtomicBool::new(false));
    let telemetry = TelemetryQueue::default();

    let (publisher, handle) = ActuatorPublisher::new(
        Box::new(TcpConnector::new(app.broker.clone())),
        Backoff::from_config(&app.broker),
        DEFAULT_QUEUE,
    );
    let publisher_stats = handle.stats();
    let publisher_task = runtime.spawn(publisher.run());

    {
        let shutdown = shutdown.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }
    let _watcher = watch_config(config_path, store.clone(), runtime.handle());
    let sink = spawn_telemetry_sink(&telemetry, shutdown.clone())?;

    let audio = app.audio.clone();
    let provider: Arc<dyn ConfigProvider> = store;
    let loop_shutdown = shutdown.clone();
    // The audio stream is not Send, so everything that touches it is built on
    // the loop thread itself.
    let control = std::thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || -> Result<LoopStats> {
            let source = open_source(&audio)?;
            let detector = select_detector(source.as_ref(), audio.buffer_size);
            let mut control = ControlLoop::new(source, detector, provider, Box::new(handle))
                .with_telemetry(telemetry);
            control.run(&loop_shutdown)
        })?;

    let outcome = control
        .join()
        .map_err(|_| VisualiserError::msg("control loop thread panicked"))?;
    shutdown.store(true, Ordering::SeqCst);

    runtime.block_on(async {
        if tokio::time::timeout(PUBLISHER_GRACE, publisher_task).await.is_err() {
            tracing::warn!("publisher did not stop in time");
        }
    });
    if sink.join().is_err() {
        tracing::warn!("telemetry sink thread panicked");
    }

    let counters = publisher_stats.snapshot();
    tracing::info!(
        sent = counters.sent,
        dropped = counters.dropped,
        failed = counters.failed,
        "publisher finished"
    );
    runtime.shutdown_timeout(Duration::from_millis(100));
    outcome.map(|_| ())
}

fn check_broker(app: &AppConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let connector = TcpConnector::new(app.broker.clone());
    runtime.block_on(probe(&connector))?;
    println!("broker {} is reachable", app.broker.address());
    Ok(())
}

/// Reloads runtime scalars and devices whenever the config file changes.
/// Broker and audio settings need a restart.
fn watch_config(
    path: &Path,
    store: Arc<ConfigStore>,
    runtime: &tokio::runtime::Handle,
) -> Option<RecommendedWatcher> {
    let file_name = path.file_name()?.to_owned();
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !directory.exists() {
        return None;
    }

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let watched = file_name.clone();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|changed| changed.file_name() == Some(watched.as_os_str()));
        if relevant {
            let _ = events_tx.send(());
        }
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            tracing::warn!("config hot reload disabled: {err}");
            return None;
        }
    };
    if let Err(err) = watcher.watch(&directory, RecursiveMode::NonRecursive) {
        tracing::warn!(path = %directory.display(), "config hot reload disabled: {err}");
        return None;
    }

    let path = path.to_path_buf();
    runtime.spawn(async move {
        while events_rx.recv().await.is_some() {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while events_rx.try_recv().is_ok() {}

            match AppConfig::load(&path).and_then(|config| store.apply(&config)) {
                Ok(version) => tracing::info!(version, "configuration reloaded"),
                Err(err) => tracing::error!("configuration reload rejected, keeping the old one: {err}"),
            }
        }
    });

    tracing::info!(path = %directory.join(&file_name).display(), "watching configuration");
    Some(watcher)
}

/// Drains telemetry into debug logs until shutdown.
fn spawn_telemetry_sink(
    queue: &TelemetryQueue,
    shutdown: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    let events = queue.subscribe();
    let handle = std::thread::Builder::new()
        .name("telemetry".into())
        .spawn(move || loop {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(TelemetryEvent::Spectrum { .. }) => {}
                Ok(event) => tracing::debug!(?event, "telemetry"),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(handle)
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives MQTT lights from live audio", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture from the default input device and drive the lights.
    Run {
        /// YAML configuration file.
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Drive the lights from a WAV file instead of a live input.
    Replay {
        /// WAV file to play back.
        input: PathBuf,
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
        /// Process frames as fast as possible instead of in real time.
        #[arg(long)]
        fast: bool,
    },
    /// Connect to the configured broker once and disconnect again.
    CheckBroker {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// List the named frequency ranges usable in device configs.
    Presets,
}
