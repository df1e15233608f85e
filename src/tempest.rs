//! Tempest reference station UDP ingest.
//!
//! One socket reader decodes broadcast datagrams by message kind and keeps
//! only the latest entry per kind in a mutex-guarded [`ReferenceCache`].

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::device::normalize_direction;
use crate::error::{FusionError, Result};
use crate::shutdown::Shutdown;
use crate::types::{ReferenceReading, ReferenceSource};

pub const TEMPEST_UDP_PORT: u16 = 50222;
pub const MPS_TO_KNOTS: f64 = 1.943844;
const MAX_DATAGRAM: usize = 65535;
/// Older entries no longer count as current wind. Two `obs_st` periods.
pub const DEFAULT_REFERENCE_MAX_AGE: Duration = Duration::from_secs(120);

// ─── Message kinds ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ObsSt,
    RapidWind,
    HubStatus,
    /// Stored raw, never decoded
    Unknown(String),
}

impl MessageKind {
    pub fn from_type(type_field: &str) -> Self {
        match type_field {
            "obs_st" => MessageKind::ObsSt,
            "rapid_wind" => MessageKind::RapidWind,
            "hub_status" => MessageKind::HubStatus,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::ObsSt => "obs_st",
            MessageKind::RapidWind => "rapid_wind",
            MessageKind::HubStatus => "hub_status",
            MessageKind::Unknown(name) => name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecipitationType {
    None,
    Rain,
    Hail,
    Snow,
    Unknown,
}

impl PrecipitationType {
    fn from_code(code: Option<f64>) -> Self {
        match code.map(|c| c as i64) {
            Some(0) => PrecipitationType::None,
            Some(1) => PrecipitationType::Rain,
            Some(2) => PrecipitationType::Hail,
            Some(3) => PrecipitationType::Snow,
            _ => PrecipitationType::Unknown,
        }
    }
}

// ─── Decoded messages ────────────────────────────────────────────────────────

/// `obs_st` full observation. Every field after the timestamp may be null on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Observation {
    pub timestamp: i64,
    pub wind_lull_mps: Option<f64>,
    pub wind_avg_mps: Option<f64>,
    pub wind_gust_mps: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub wind_sample_interval_s: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub air_temperature_c: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub illuminance_lux: Option<f64>,
    pub uv_index: Option<f64>,
    pub solar_radiation_wm2: Option<f64>,
    pub rain_since_report_mm: Option<f64>,
    pub precipitation_type: PrecipitationType,
    pub lightning_avg_distance_km: Option<f64>,
    pub lightning_strike_count: Option<f64>,
    pub battery_v: Option<f64>,
    pub report_interval_min: Option<f64>,
    pub local_day_rain_mm: Option<f64>,
    pub device_sn: Option<String>,
    pub hub_sn: Option<String>,
}

impl Observation {
    pub fn wind_avg_knots(&self) -> Option<f64> {
        self.wind_avg_mps.map(|v| v * MPS_TO_KNOTS)
    }

    pub fn wind_gust_knots(&self) -> Option<f64> {
        self.wind_gust_mps.map(|v| v * MPS_TO_KNOTS)
    }

    pub fn wind_lull_knots(&self) -> Option<f64> {
        self.wind_lull_mps.map(|v| v * MPS_TO_KNOTS)
    }

    pub fn air_temperature_f(&self) -> Option<f64> {
        self.air_temperature_c.map(|c| c * 9.0 / 5.0 + 32.0)
    }

    pub fn pressure_inhg(&self) -> Option<f64> {
        self.pressure_hpa.map(|h| h * 0.0295299830714)
    }

    pub fn rain_since_report_in(&self) -> Option<f64> {
        self.rain_since_report_mm.map(|mm| mm / 25.4)
    }
}

/// `rapid_wind` instant reading.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RapidWind {
    pub timestamp: i64,
    pub speed_mps: Option<f64>,
    pub direction_deg: Option<f64>,
    pub device_sn: Option<String>,
    pub hub_sn: Option<String>,
}

impl RapidWind {
    pub fn speed_knots(&self) -> Option<f64> {
        self.speed_mps.map(|v| v * MPS_TO_KNOTS)
    }
}

/// `hub_status` diagnostic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HubStatus {
    #[serde(rename = "firmware_revision")]
    pub firmware: Option<String>,
    #[serde(rename = "uptime")]
    pub uptime_s: Option<u64>,
    pub rssi: Option<i64>,
    #[serde(rename = "time")]
    pub timestamp: Option<i64>,
    #[serde(rename = "serial_number")]
    pub hub_sn: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TempestMessage {
    ObsSt(Observation),
    RapidWind(RapidWind),
    HubStatus(HubStatus),
}

impl TempestMessage {
    /// Wind reading carried by this message, if any.
    pub fn reference_wind(&self) -> Option<ReferenceReading> {
        match self {
            TempestMessage::RapidWind(rapid) => Some(ReferenceReading {
                speed_knots: rapid.speed_knots()?,
                direction_deg: normalize_direction(rapid.direction_deg?),
                timestamp: rapid.timestamp,
                source: ReferenceSource::RapidWind,
            }),
            TempestMessage::ObsSt(obs) => Some(ReferenceReading {
                speed_knots: obs.wind_avg_knots()?,
                direction_deg: normalize_direction(obs.wind_direction_deg?),
                timestamp: obs.timestamp,
                source: ReferenceSource::ObsSt,
            }),
            TempestMessage::HubStatus(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty obs")]
    EmptyObs,
    #[error("bad ob")]
    BadOb,
    #[error("schema mismatch: {0}")]
    Schema(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct ObsStWire {
    #[serde(default)]
    obs: Vec<Vec<Option<f64>>>,
    serial_number: Option<String>,
    hub_sn: Option<String>,
}

#[derive(Deserialize)]
struct RapidWindWire {
    #[serde(default)]
    ob: Vec<Option<f64>>,
    serial_number: Option<String>,
    hub_sn: Option<String>,
}

fn field(row: &[Option<f64>], index: usize) -> Option<f64> {
    row.get(index).copied().flatten()
}

fn decode_obs_st(msg: &Value) -> std::result::Result<TempestMessage, DecodeError> {
    let wire = ObsStWire::deserialize(msg)?;
    let row = wire.obs.first().ok_or(DecodeError::EmptyObs)?;
    let timestamp = field(row, 0).ok_or(DecodeError::EmptyObs)? as i64;

    Ok(TempestMessage::ObsSt(Observation {
        timestamp,
        wind_lull_mps: field(row, 1),
        wind_avg_mps: field(row, 2),
        wind_gust_mps: field(row, 3),
        wind_direction_deg: field(row, 4),
        wind_sample_interval_s: field(row, 5),
        pressure_hpa: field(row, 6),
        air_temperature_c: field(row, 7),
        relative_humidity: field(row, 8),
        illuminance_lux: field(row, 9),
        uv_index: field(row, 10),
        solar_radiation_wm2: field(row, 11),
        rain_since_report_mm: field(row, 12),
        precipitation_type: PrecipitationType::from_code(field(row, 13)),
        lightning_avg_distance_km: field(row, 14),
        lightning_strike_count: field(row, 15),
        battery_v: field(row, 16),
        report_interval_min: field(row, 17),
        local_day_rain_mm: field(row, 18),
        device_sn: wire.serial_number,
        hub_sn: wire.hub_sn,
    }))
}

fn decode_rapid_wind(msg: &Value) -> std::result::Result<TempestMessage, DecodeError> {
    let wire = RapidWindWire::deserialize(msg)?;
    if wire.ob.len() < 3 {
        return Err(DecodeError::BadOb);
    }
    let timestamp = field(&wire.ob, 0).ok_or(DecodeError::BadOb)? as i64;

    Ok(TempestMessage::RapidWind(RapidWind {
        timestamp,
        speed_mps: field(&wire.ob, 1),
        direction_deg: field(&wire.ob, 2),
        device_sn: wire.serial_number,
        hub_sn: wire.hub_sn,
    }))
}

/// Decode a message of a known kind. `None` for unknown kinds.
pub fn decode(
    kind: &MessageKind,
    msg: &Value,
) -> Option<std::result::Result<TempestMessage, DecodeError>> {
    match kind {
        MessageKind::ObsSt => Some(decode_obs_st(msg)),
        MessageKind::RapidWind => Some(decode_rapid_wind(msg)),
        MessageKind::HubStatus => Some(
            HubStatus::deserialize(msg)
                .map(TempestMessage::HubStatus)
                .map_err(DecodeError::from),
        ),
        MessageKind::Unknown(_) => None,
    }
}

// ─── Latest-by-type cache ────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ParsedData {
    Decoded(TempestMessage),
    Error { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct ParsedEntry {
    pub received_at: DateTime<Utc>,
    pub data: ParsedData,
}

impl ParsedEntry {
    /// Time since receipt. A clock step backwards reads as zero.
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.received_at).to_std().unwrap_or_default()
    }

    fn message(&self) -> Option<&TempestMessage> {
        match &self.data {
            ParsedData::Decoded(msg) => Some(msg),
            ParsedData::Error { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct IngestStats {
    pub datagrams: u64,
    pub dropped: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct CacheInner {
    raw: HashMap<String, Value>,
    parsed: HashMap<String, ParsedEntry>,
    stats: IngestStats,
}

/// Latest reference message per kind. Single writer (the UDP listener),
/// any number of readers.
#[derive(Clone)]
pub struct ReferenceCache {
    inner: Arc<Mutex<CacheInner>>,
    max_age: Duration,
}

impl Default for ReferenceCache {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_REFERENCE_MAX_AGE)
    }
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        ReferenceCache {
            inner: Arc::default(),
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode and store one datagram. Returns the message kind, or `None`
    /// when the datagram was dropped as non-JSON.
    pub fn ingest_datagram(&self, bytes: &[u8]) -> Option<MessageKind> {
        let msg: Value = match serde_json::from_slice(bytes) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                debug!("Dropping non-object datagram ({} bytes)", bytes.len());
                self.lock().stats.dropped += 1;
                return None;
            }
            Err(e) => {
                debug!("Dropping non-JSON datagram ({} bytes): {}", bytes.len(), e);
                self.lock().stats.dropped += 1;
                return None;
            }
        };
        Some(self.ingest_message(msg))
    }

    pub fn ingest_message(&self, msg: Value) -> MessageKind {
        let type_field = msg.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let kind = MessageKind::from_type(type_field);
        let decoded = decode(&kind, &msg);
        let key = kind.as_str().to_string();

        let mut inner = self.lock();
        inner.stats.datagrams += 1;
        match decoded {
            Some(Ok(message)) => {
                inner.parsed.insert(
                    key.clone(),
                    ParsedEntry {
                        received_at: Utc::now(),
                        data: ParsedData::Decoded(message),
                    },
                );
            }
            Some(Err(e)) => {
                debug!("Failed to decode {} message: {}", key, e);
                inner.stats.decode_errors += 1;
                inner.parsed.insert(
                    key.clone(),
                    ParsedEntry {
                        received_at: Utc::now(),
                        data: ParsedData::Error {
                            error: e.to_string(),
                        },
                    },
                );
            }
            None => {
                inner.parsed.remove(&key);
            }
        }
        inner.raw.insert(key, msg);
        kind
    }

    /// Current reference wind, preferring the low-latency instant feed and
    /// falling back to the periodic average. Entries older than the max age
    /// are skipped. `None` means unavailable.
    pub fn current_wind(&self) -> Option<ReferenceReading> {
        let now = Utc::now();
        let inner = self.lock();
        [MessageKind::RapidWind, MessageKind::ObsSt]
            .iter()
            .filter_map(|kind| inner.parsed.get(kind.as_str()))
            .filter(|entry| entry.age(now) <= self.max_age)
            .filter_map(ParsedEntry::message)
            .find_map(TempestMessage::reference_wind)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().raw.is_empty()
    }

    pub fn raw_snapshot(&self) -> BTreeMap<String, Value> {
        self.lock().raw.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn parsed_snapshot(&self) -> BTreeMap<String, ParsedEntry> {
        self.lock().parsed.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn stats(&self) -> IngestStats {
        self.lock().stats
    }
}

// ─── UDP listener ────────────────────────────────────────────────────────────

pub async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr).await.map_err(|source| FusionError::UdpBind {
        port: addr.port(),
        source,
    })
}

/// Read datagrams into the cache until shutdown. Bad packets never stop the loop.
pub async fn run_listener(socket: UdpSocket, cache: ReferenceCache, shutdown: Shutdown) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Tempest listener stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        if let Some(kind) = cache.ingest_datagram(&buf[..len]) {
                            debug!("{} from {}", kind.as_str(), from);
                        }
                    }
                    Err(e) => warn!("UDP receive error: {}", e),
                }
            }
        }
    }
}

/// Bind the broadcast port and listen. A bind failure is returned to the
/// caller; the reference source is then gone for the process lifetime.
pub async fn udp_listener(port: u16, cache: ReferenceCache, shutdown: Shutdown) -> Result<()> {
    let socket = bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("Listening for Tempest broadcasts on UDP {}", port);
    run_listener(socket, cache, shutdown).await;
    Ok(())
}

/// What a timed listen on the broadcast port picked up.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionReport {
    pub message_types: Vec<String>,
    pub current_wind: Option<ReferenceReading>,
    pub stats: IngestStats,
}

impl ConnectionReport {
    pub fn from_cache(cache: &ReferenceCache) -> Self {
        ConnectionReport {
            message_types: cache.raw_snapshot().into_keys().collect(),
            current_wind: cache.current_wind(),
            stats: cache.stats(),
        }
    }

    pub fn received_any(&self) -> bool {
        self.stats.datagrams > 0
    }
}

/// Listen into a fresh cache for `duration`, or until shutdown.
pub async fn test_connection(
    socket: UdpSocket,
    duration: Duration,
    shutdown: Shutdown,
) -> ConnectionReport {
    let cache = ReferenceCache::new();
    tokio::select! {
        _ = run_listener(socket, cache.clone(), shutdown) => {}
        _ = tokio::time::sleep(duration) => {}
    }
    ConnectionReport::from_cache(&cache)
}
