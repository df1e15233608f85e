use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use wind_fusion_rs::calibration::{
    CalibrationParams, CalibrationState, CalibratorConfig, ContinuousCalibrator, EngineConfig,
    ManualCalibration,
};
use wind_fusion_rs::dashboard::{self, DashboardConfig};
use wind_fusion_rs::device::{self, DevicePipeline, SerialConfig};
use wind_fusion_rs::direction_history::DirectionHistory;
use wind_fusion_rs::live_status::{self, StatusSources, STATUS_WRITE_INTERVAL};
use wind_fusion_rs::publish::{JsonLinesSink, LogSink, Publisher};
use wind_fusion_rs::reconnect::DEFAULT_RECONNECT_BACKOFF;
use wind_fusion_rs::firewall::{self, FirewallSetup};
use wind_fusion_rs::shutdown;
use wind_fusion_rs::tempest::{self, ReferenceCache, TEMPEST_UDP_PORT};

const CONNECTION_TEST_DURATION: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "wind_fusion")]
#[command(
    about = "Davis wind sensor with continuous calibration against a Tempest station",
    long_about = None
)]
struct Args {
    /// Serial port device
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[arg(long, default_value_t = 9600)]
    baudrate: u32,

    /// Serial read timeout in seconds
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    /// Initial wind speed calibration factor
    #[arg(long, default_value_t = 1.0)]
    calibration_factor: f64,

    /// Initial wind direction offset in degrees
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    direction_offset: f64,

    /// Wind direction scaling factor
    #[arg(long, default_value_t = 1.0)]
    direction_scale: f64,

    /// Tempest broadcast UDP port
    #[arg(long, default_value_t = TEMPEST_UDP_PORT)]
    udp_port: u16,

    /// Seconds before a reference message stops counting as current wind
    #[arg(long, default_value_t = 120)]
    reference_max_age: u64,

    /// Listen for Tempest broadcasts for 10 seconds, report what arrived, and exit
    #[arg(long)]
    test_connection: bool,

    /// Disable the continuous calibration loop
    #[arg(long)]
    no_calibration: bool,

    /// Paired samples per calibration cycle
    #[arg(long, default_value_t = 10)]
    samples_per_cycle: usize,

    /// Seconds between calibration samples
    #[arg(long, default_value_t = 2.0)]
    sample_spacing: f64,

    /// Seconds between bootstrap calibration attempts
    #[arg(long, default_value_t = 180)]
    bootstrap_interval: u64,

    /// Seconds between steady calibration cycles
    #[arg(long, default_value_t = 900)]
    steady_interval: u64,

    /// Minimum speed confidence to accept the first calibration
    #[arg(long, default_value_t = 0.3)]
    bootstrap_speed_threshold: f64,

    /// Minimum direction confidence to accept the first calibration (0 disables)
    #[arg(long, default_value_t = 0.0)]
    bootstrap_direction_threshold: f64,

    /// Minimum speed confidence for later calibrations
    #[arg(long, default_value_t = 0.5)]
    steady_speed_threshold: f64,

    /// Minimum direction confidence for later calibrations (0 disables)
    #[arg(long, default_value_t = 0.0)]
    steady_direction_threshold: f64,

    /// Fraction of each steady calibration applied to the live values
    #[arg(long, default_value_t = 0.3)]
    adjustment_rate: f64,

    /// Direction spread in degrees that halves direction confidence
    #[arg(long, default_value_t = 10.0)]
    direction_confidence_scale: f64,

    /// Seconds per aggregated wind report
    #[arg(long, default_value_t = 60)]
    report_interval: u64,

    /// Direction history file
    #[arg(long, default_value = "direction_history.json")]
    history_file: PathBuf,

    /// Output directory for live status
    #[arg(long, default_value = "wind_fusion_output")]
    output_dir: PathBuf,

    /// Append every published metric as JSON lines to this file
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Dashboard HTTP port
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// Do not start the dashboard
    #[arg(long)]
    no_dashboard: bool,

    /// Insert an iptables rule for the UDP port (removed on exit)
    #[arg(long)]
    open_firewall: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            port: self.port.clone(),
            baud_rate: self.baudrate,
            read_timeout: Duration::from_secs_f64(self.timeout.max(0.1)),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    fn calibrator_config(&self) -> CalibratorConfig {
        CalibratorConfig {
            samples_per_cycle: self.samples_per_cycle,
            sample_spacing: Duration::from_secs_f64(self.sample_spacing.max(0.0)),
            bootstrap_interval: Duration::from_secs(self.bootstrap_interval),
            steady_interval: Duration::from_secs(self.steady_interval),
            bootstrap_speed_threshold: self.bootstrap_speed_threshold,
            bootstrap_direction_threshold: self.bootstrap_direction_threshold,
            steady_speed_threshold: self.steady_speed_threshold,
            steady_direction_threshold: self.steady_direction_threshold,
            adjustment_rate: self.adjustment_rate,
            engine: EngineConfig {
                direction_confidence_scale_deg: self.direction_confidence_scale,
                ..EngineConfig::default()
            },
            ..CalibratorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if args.test_connection {
        return test_connection(&args).await;
    }

    info!("Starting wind sensor on port {}", args.port);
    info!("Wind speed calibration factor: {}", args.calibration_factor);
    info!("Wind direction offset: {}°", args.direction_offset);
    info!("Wind direction scale: {}", args.direction_scale);

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating output directory {}", args.output_dir.display()))?;

    let firewall_rule = if args.open_firewall {
        firewall::open_udp_port(args.udp_port)
    } else {
        None
    };
    firewall::probe_udp_port(args.udp_port);

    let (trigger, shutdown) = shutdown::channel();
    let started = Instant::now();

    let state = CalibrationState::new(CalibrationParams::new(
        args.calibration_factor,
        args.direction_offset,
        args.direction_scale,
    ));
    let reference = ReferenceCache::with_max_age(Duration::from_secs(args.reference_max_age));
    let history = Arc::new(Mutex::new(DirectionHistory::load(&args.history_file)));

    let mut publisher = Publisher::new().with_sink(Box::new(LogSink));
    if let Some(path) = &args.metrics_file {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("opening metrics file {}", path.display()))?;
        publisher = publisher.with_sink(Box::new(sink));
    }

    let pipeline = DevicePipeline::new(
        state.clone(),
        reference.clone(),
        Duration::from_secs(args.report_interval),
        publisher,
    )
    .with_history(history.clone());
    let readings = pipeline.subscribe_readings();
    let windows = pipeline.subscribe_windows();

    // Tempest listener
    let udp_task = {
        let (port, cache, shutdown) = (args.udp_port, reference.clone(), shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = tempest::udp_listener(port, cache, shutdown).await {
                error!("Tempest listener failed, running without a reference: {}", e);
            }
        })
    };

    // Calibration loop
    let (cycles, calibration_task) = if args.no_calibration {
        info!("Continuous calibration disabled");
        let (_, rx) = watch::channel(None);
        (rx, None)
    } else {
        let calibrator = ContinuousCalibrator::new(
            args.calibrator_config(),
            state.clone(),
            reference.clone(),
            readings.clone(),
            shutdown.clone(),
        );
        (calibrator.subscribe_reports(), Some(tokio::spawn(calibrator.run())))
    };

    let sources = StatusSources {
        started,
        state: state.clone(),
        reference: reference.clone(),
        readings,
        windows,
        cycles,
        history: history.clone(),
        manual: ManualCalibration::new(args.calibrator_config().engine),
        firewall: FirewallSetup::from_rule(firewall_rule.as_ref(), args.udp_port),
    };

    let status_task = tokio::spawn(live_status::run_status_writer(
        sources.clone(),
        args.output_dir.clone(),
        STATUS_WRITE_INTERVAL,
        shutdown.clone(),
    ));

    let dashboard_task = if args.no_dashboard {
        None
    } else {
        let config = DashboardConfig {
            port: args.http_port,
        };
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = dashboard::start_dashboard(sources, config, shutdown).await {
                warn!("Dashboard unavailable: {:#}", e);
            }
        }))
    };

    // Serial reader on its own thread; reads block up to the read timeout
    let serial_thread = {
        let (config, shutdown, handle) = (
            args.serial_config(),
            shutdown.clone(),
            tokio::runtime::Handle::current(),
        );
        std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || device::run_serial_loop(config, pipeline, shutdown, handle))
            .context("spawning serial reader thread")?
    };

    wait_for_signal().await;
    info!("Shutting down...");
    trigger.trigger();

    if let Some(task) = calibration_task {
        let _ = task.await;
    }
    let _ = udp_task.await;
    if let Some(task) = dashboard_task {
        let _ = task.await;
    }
    let _ = status_task.await;
    match tokio::task::spawn_blocking(move || serial_thread.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("Serial reader thread did not exit cleanly"),
    }

    let history = history.lock().unwrap_or_else(PoisonError::into_inner);
    match history.save(&args.history_file) {
        Ok(()) => info!(
            "Saved direction history ({} buckets) to {}",
            history.bucket_count(),
            args.history_file.display()
        ),
        Err(e) => warn!("Failed to save direction history: {}", e),
    }
    drop(history);

    let params = state.snapshot();
    info!(
        "Final calibration: speed factor {:.4}, direction offset {:.2}°",
        params.speed_factor, params.direction_offset_deg
    );

    drop(firewall_rule);
    Ok(())
}

/// Listen on the broadcast port for a fixed time and report what arrived.
async fn test_connection(args: &Args) -> Result<()> {
    info!("Testing Tempest UDP connection on port {}", args.udp_port);
    let _firewall_rule = if args.open_firewall {
        firewall::open_udp_port(args.udp_port)
    } else {
        None
    };
    if !firewall::probe_udp_port(args.udp_port) {
        warn!("Port {} is busy; another listener may be running", args.udp_port);
    }

    let socket = tempest::bind(std::net::SocketAddr::from(([0, 0, 0, 0], args.udp_port)))
        .await
        .context("binding Tempest port for the connection test")?;

    let (trigger, shutdown) = shutdown::channel();
    let signal = tokio::spawn(async move {
        wait_for_signal().await;
        trigger.trigger();
    });

    info!("Listening for {} seconds...", CONNECTION_TEST_DURATION.as_secs());
    let report = tempest::test_connection(socket, CONNECTION_TEST_DURATION, shutdown).await;
    signal.abort();

    if report.received_any() {
        info!(
            "Received {} datagrams, message types: {}",
            report.stats.datagrams,
            report.message_types.join(", ")
        );
        match &report.current_wind {
            Some(wind) => info!(
                "Current wind: {:.1} kt from {:.0}° ({})",
                wind.speed_knots,
                wind.direction_deg,
                wind.source.as_str()
            ),
            None => info!("No wind data in the received messages"),
        }
    } else {
        warn!("No Tempest data received. Check that:");
        warn!("  the station hub is on the same network segment");
        warn!("  UDP port {} is open (try --open-firewall)", args.udp_port);
        warn!("  no other program is bound to the port");
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
