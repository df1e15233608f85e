//! Davis anemometer side: line parsing, per-line fan-out, and the serial
//! reader thread with reconnect.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::io::{self, BufRead, BufReader, Read};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::aggregator::{WindowAggregator, WindowSummary};
use crate::calibration::state::{CalibrationParams, CalibrationState};
use crate::direction_history::DirectionHistory;
use crate::error::{FusionError, Result};
use crate::publish::{self, Publisher};
use crate::reconnect::{ReconnectState, DEFAULT_RECONNECT_BACKOFF};
use crate::shutdown::Shutdown;
use crate::tempest::ReferenceCache;
use crate::types::{WindObservation, WindReading};

/// Anemometer cup constant: m/s per debounced RPM count.
pub const RPM_TO_MPS: f64 = 0.098;
pub const MPS_TO_KNOTS: f64 = 1.94384;
/// Potentiometer full-scale count mapped onto 360 degrees.
pub const POT_FULL_SCALE: f64 = 1024.0;
pub const LINE_MARKER: &str = "wind:";

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Wrap any angle into [0, 360).
pub fn normalize_direction(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid of a tiny negative rounds up to exactly 360.0
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

fn parse_count<T: FromStr>(token: &str) -> Option<T> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Parse `wind: <iteration> <pot> <rpm_debounced> <rpm_raw>` into a calibrated reading.
///
/// Anything else yields `None`; partial lines and noise are routine on the wire.
pub fn parse_line(line: &str, params: &CalibrationParams) -> Option<WindReading> {
    let start = line.find(LINE_MARKER)? + LINE_MARKER.len();
    let mut fields = line[start..].split_whitespace();

    let sequence_counter: u64 = parse_count(fields.next()?)?;
    let raw_pot_value: u16 = parse_count(fields.next()?)?;
    let rpm_debounced: u32 = parse_count(fields.next()?)?;
    let rpm_raw: u32 = parse_count(fields.next()?)?;

    let base_direction = raw_pot_value as f64 / POT_FULL_SCALE * 360.0;
    let direction_deg =
        normalize_direction(base_direction * params.direction_scale + params.direction_offset_deg);

    let speed_mps = rpm_debounced as f64 * RPM_TO_MPS * params.speed_factor;

    Some(WindReading {
        sequence_counter,
        speed_mps,
        speed_knots: speed_mps * MPS_TO_KNOTS,
        direction_deg,
        raw_pot_value,
        rpm_debounced,
        rpm_raw,
    })
}

/// Speed and direction of a reading with the live speed factor divided out
/// and the live direction offset removed. Recomputed from the raw counts so
/// it does not depend on which parameters produced the reading.
pub fn uncalibrated_observation(reading: &WindReading, direction_scale: f64) -> WindObservation {
    let speed_knots = reading.rpm_debounced as f64 * RPM_TO_MPS * MPS_TO_KNOTS;
    let base_direction = reading.raw_pot_value as f64 / POT_FULL_SCALE * 360.0;
    WindObservation::new(speed_knots, normalize_direction(base_direction * direction_scale))
}

// ─── Per-line pipeline ───────────────────────────────────────────────────────

/// Everything that happens to one serial line: parse with the live
/// calibration, publish, aggregate, record direction history, and hand the
/// reading to the calibrator.
pub struct DevicePipeline {
    state: CalibrationState,
    reference: ReferenceCache,
    aggregator: WindowAggregator,
    publisher: Publisher,
    history: Option<Arc<Mutex<DirectionHistory>>>,
    reading_tx: watch::Sender<Option<WindReading>>,
    window_tx: watch::Sender<Option<WindowSummary>>,
    lines_seen: u64,
    readings_parsed: u64,
}

impl DevicePipeline {
    pub fn new(
        state: CalibrationState,
        reference: ReferenceCache,
        report_interval: Duration,
        publisher: Publisher,
    ) -> Self {
        let (reading_tx, _) = watch::channel(None);
        let (window_tx, _) = watch::channel(None);
        DevicePipeline {
            state,
            reference,
            aggregator: WindowAggregator::new(report_interval),
            publisher,
            history: None,
            reading_tx,
            window_tx,
            lines_seen: 0,
            readings_parsed: 0,
        }
    }

    pub fn with_history(mut self, history: Arc<Mutex<DirectionHistory>>) -> Self {
        self.history = Some(history);
        self
    }

    /// Latest reading, updated on every parsed line.
    pub fn subscribe_readings(&self) -> watch::Receiver<Option<WindReading>> {
        self.reading_tx.subscribe()
    }

    /// Latest reduced window.
    pub fn subscribe_windows(&self) -> watch::Receiver<Option<WindowSummary>> {
        self.window_tx.subscribe()
    }

    pub fn handle_line(&mut self, line: &str) -> Option<WindReading> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        self.lines_seen += 1;

        let params = self.state.snapshot();
        let Some(reading) = parse_line(line, &params) else {
            debug!("Could not parse line: {}", line);
            return None;
        };
        self.readings_parsed += 1;

        let now = Utc::now();
        self.publisher.publish_all(&publish::reading_metrics(&reading, now));
        info!("Wind: {:.2} knots, {:.1}°", reading.speed_knots, reading.direction_deg);
        debug!(
            "Iteration {}, pot {}, rpm {}/{}, {:.3} rps, {:.2} m/s",
            reading.sequence_counter,
            reading.raw_pot_value,
            reading.rpm_debounced,
            reading.rpm_raw,
            reading.rotations_per_second(),
            reading.speed_mps
        );

        if let Some(history) = &self.history {
            if let Some(reference) = self.reference.current_wind() {
                history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add(reference.direction_deg, reading.raw_pot_value);
            }
        }

        self.aggregator.add(&reading);
        if self.aggregator.should_report() {
            let summary = self.aggregator.reduce();
            info!(
                "Window ({} samples, {:.0}s): avg {:.2} kt [{:.2}-{:.2}], dir {:.1}° consistency {:.2}",
                summary.sample_count,
                summary.interval_secs,
                summary.mean_speed_knots,
                summary.min_speed_knots,
                summary.max_speed_knots,
                summary.mean_direction_deg,
                summary.consistency
            );
            self.publisher.publish_all(&publish::window_metrics(&summary, now));
            self.window_tx.send_replace(Some(summary));
        }

        self.reading_tx.send_replace(Some(reading.clone()));
        Some(reading)
    }

    pub fn report_sensor_failure(&mut self) {
        self.publisher
            .publish_all(&[publish::sensor_status_metric(false, Utc::now())]);
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    pub fn readings_parsed(&self) -> u64 {
        self.readings_parsed
    }
}

// ─── Serial transport ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout: Duration::from_secs(5),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

/// Newline framing over a byte stream with read timeouts.
///
/// Bytes read before a timeout are kept, so a line split across a timeout
/// is still delivered whole.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        LineReader {
            inner: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// `Ok(None)` on read timeout. End of stream is an error: the device went away.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        match self.inner.read_until(b'\n', &mut self.pending) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial stream closed",
            )),
            Ok(_) if self.pending.last() == Some(&b'\n') => {
                let line = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                Ok(Some(line))
            }
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial stream closed mid-line",
            )),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Open serial port. Closed when dropped, on every exit path.
struct SerialConnection {
    port_name: String,
    lines: LineReader<Box<dyn serialport::SerialPort>>,
}

impl SerialConnection {
    fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|source| FusionError::SerialOpen {
                port: config.port.clone(),
                source,
            })?;

        info!("Connected to serial port {} at {} baud", config.port, config.baud_rate);
        Ok(SerialConnection {
            port_name: config.port.clone(),
            lines: LineReader::new(port),
        })
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        info!("Closed serial port {}", self.port_name);
    }
}

/// Feed lines from `lines` into the pipeline until shutdown or an I/O error.
pub fn pump_lines<R: Read>(
    lines: &mut LineReader<R>,
    pipeline: &mut DevicePipeline,
    shutdown: &Shutdown,
) -> Result<()> {
    while !shutdown.is_triggered() {
        match lines.next_line() {
            Ok(Some(line)) => {
                pipeline.handle_line(&line);
            }
            Ok(None) => debug!("Serial read timeout, continuing..."),
            Err(e) => return Err(FusionError::SerialIo(e)),
        }
    }
    Ok(())
}

/// Serial reader loop for a dedicated thread. Reconnects forever with a
/// fixed backoff until shutdown; errors never leave this function.
pub fn run_serial_loop(
    config: SerialConfig,
    mut pipeline: DevicePipeline,
    shutdown: Shutdown,
    handle: Handle,
) {
    let mut reconnect = ReconnectState::new(&config.port, config.reconnect_backoff);
    info!("Waiting for data from Davis wind sensor on {}...", config.port);

    while !shutdown.is_triggered() {
        let session = SerialConnection::open(&config).and_then(|mut conn| {
            reconnect.record_success();
            pump_lines(&mut conn.lines, &mut pipeline, &shutdown)
        });

        match session {
            Ok(()) => break,
            Err(e) => {
                error!("Serial port error: {}", e);
                pipeline.report_sensor_failure();
                let wait = reconnect.record_failure(&e);
                info!("Attempting to reconnect in {:.0} seconds...", wait.as_secs_f64());
                if !shutdown.sleep_blocking(&handle, wait) {
                    break;
                }
            }
        }
    }

    if pipeline.lines_seen() > 0 && pipeline.readings_parsed() == 0 {
        warn!("Saw {} serial lines but none parsed as wind data", pipeline.lines_seen());
    }
    info!("Serial reader stopped ({})", reconnect.status());
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Cursor;

    fn identity() -> CalibrationParams {
        CalibrationParams::default()
    }

    #[test]
    fn test_parse_valid_line() {
        let reading = parse_line("wind: 17 256 10 12\r\n", &identity()).unwrap();
        assert_eq!(reading.sequence_counter, 17);
        assert_eq!(reading.raw_pot_value, 256);
        assert_eq!(reading.rpm_debounced, 10);
        assert_eq!(reading.rpm_raw, 12);
        assert_abs_diff_eq!(reading.direction_deg, 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(reading.speed_mps, 0.98, epsilon = 1e-9);
        assert_abs_diff_eq!(reading.speed_knots, 0.98 * 1.94384, epsilon = 1e-9);
    }

    #[test]
    fn test_parse_marker_anywhere() {
        assert!(parse_line("noise wind:1 2 3 4", &identity()).is_some());
        assert!(parse_line("wind: 1 2 3 4 trailing", &identity()).is_some());
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let params = identity();
        for line in [
            "",
            "wind:",
            "wind: 1 2 3",
            "wind: 1 -2 3 4",
            "wind: 1 +2 3 4",
            "wind: a b c d",
            "speed: 1 2 3 4",
            "wind: 1 2.5 3 4",
            "wind: 1 70000 3 4",
        ] {
            assert!(parse_line(line, &params).is_none(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_calibration_applied() {
        let params = CalibrationParams::new(1.5, 10.0, 1.0);
        let reading = parse_line("wind: 1 512 20 20", &params).unwrap();
        assert_abs_diff_eq!(reading.direction_deg, 190.0, epsilon = 1e-9);
        assert_abs_diff_eq!(reading.speed_mps, 20.0 * 0.098 * 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_negative_offset_wraps_into_range() {
        let params = CalibrationParams::new(1.0, -30.0, 1.0);
        let reading = parse_line("wind: 1 0 0 0", &params).unwrap();
        assert_abs_diff_eq!(reading.direction_deg, 330.0, epsilon = 1e-9);

        for offset in [-1000.0, -360.0, -180.5, -0.0001, 0.0, 359.9, 360.0, 725.0] {
            for pot in [0u16, 1, 512, 1023] {
                let params = CalibrationParams::new(1.0, offset, 1.0);
                let line = format!("wind: 1 {} 5 5", pot);
                let reading = parse_line(&line, &params).unwrap();
                assert!(
                    (0.0..360.0).contains(&reading.direction_deg),
                    "offset {offset} pot {pot} -> {}",
                    reading.direction_deg
                );
                assert!(reading.speed_mps >= 0.0);
            }
        }
    }

    #[test]
    fn test_normalize_direction_edges() {
        assert_eq!(normalize_direction(360.0), 0.0);
        assert_eq!(normalize_direction(-1e-17), 0.0);
        assert_abs_diff_eq!(normalize_direction(-90.0), 270.0);
        assert_abs_diff_eq!(normalize_direction(725.0), 5.0);
    }

    #[test]
    fn test_uncalibrated_observation_ignores_live_params() {
        let params = CalibrationParams::new(1.3, 25.0, 1.0);
        let reading = parse_line("wind: 1 256 10 10", &params).unwrap();
        let raw = uncalibrated_observation(&reading, params.direction_scale);
        assert_abs_diff_eq!(raw.speed_knots, reading.speed_knots / 1.3, epsilon = 1e-9);
        assert_abs_diff_eq!(raw.direction_deg, 90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rotations_per_second() {
        let reading = parse_line("wind: 1 0 120 0", &identity()).unwrap();
        assert_eq!(reading.rotations_per_second(), 2.0);
        let still = parse_line("wind: 1 0 0 0", &identity()).unwrap();
        assert_eq!(still.rotations_per_second(), 0.0);
    }

    struct TimeoutThenData {
        chunks: Vec<io::Result<Vec<u8>>>,
    }

    impl Read for TimeoutThenData {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            match self.chunks.remove(0) {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(e) => Err(e),
            }
        }
    }

    #[test]
    fn test_line_reader_keeps_partial_line_across_timeout() {
        let mut reader = LineReader::new(TimeoutThenData {
            chunks: vec![
                Ok(b"wind: 1 2".to_vec()),
                Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
                Ok(b" 3 4\n".to_vec()),
            ],
        });

        assert_eq!(reader.next_line().unwrap(), None);
        assert_eq!(reader.next_line().unwrap().as_deref(), Some("wind: 1 2 3 4\n"));
        assert_eq!(
            reader.next_line().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_pump_lines_feeds_pipeline_until_eof() {
        let state = CalibrationState::new(identity());
        let mut pipeline = DevicePipeline::new(
            state,
            ReferenceCache::new(),
            Duration::from_secs(3600),
            Publisher::new(),
        );
        let readings = pipeline.subscribe_readings();
        let (_trigger, shutdown) = crate::shutdown::channel();

        let mut lines = LineReader::new(Cursor::new(
            b"boot banner\nwind: 1 256 10 10\n\nwind: 2 512 20 20\n".to_vec(),
        ));
        let result = pump_lines(&mut lines, &mut pipeline, &shutdown);

        assert!(matches!(result, Err(FusionError::SerialIo(_))));
        assert_eq!(pipeline.lines_seen(), 3);
        assert_eq!(pipeline.readings_parsed(), 2);
        assert_eq!(readings.borrow().as_ref().unwrap().sequence_counter, 2);
    }

    #[test]
    fn test_pipeline_reports_window_and_records_history() {
        let cache = ReferenceCache::new();
        cache.ingest_datagram(br#"{"type":"rapid_wind","ob":[1588948614,3.0,123.0]}"#);
        let history = Arc::new(Mutex::new(DirectionHistory::new()));

        let mut pipeline = DevicePipeline::new(
            CalibrationState::new(identity()),
            cache,
            Duration::ZERO,
            Publisher::new(),
        )
        .with_history(history.clone());
        let windows = pipeline.subscribe_windows();

        for i in 0..5 {
            pipeline.handle_line(&format!("wind: {} 400 10 10", i));
        }

        let summary = windows.borrow().clone().unwrap();
        assert_eq!(summary.sample_count, 1);
        assert_eq!(
            history.lock().unwrap().expected_pot_value(123.0),
            Some(400.0)
        );
    }
}
