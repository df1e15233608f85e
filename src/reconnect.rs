use std::time::{Duration, Instant};

/// Fixed wait between serial reconnect attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Tracks reconnect state for a single serial device. Retries are unbounded.
#[derive(Clone, Debug)]
pub struct ReconnectState {
    pub name: String,
    pub backoff: Duration,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub connected_since: Option<Instant>,
}

impl ReconnectState {
    pub fn new(name: &str, backoff: Duration) -> Self {
        ReconnectState {
            name: name.to_string(),
            backoff,
            consecutive_failures: 0,
            total_failures: 0,
            last_error: None,
            connected_since: None,
        }
    }

    /// Record a failed or dropped connection and return how long to wait.
    pub fn record_failure(&mut self, error: &dyn std::fmt::Display) -> Duration {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
        self.connected_since = None;
        self.backoff
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            log::info!(
                "{} reconnected after {} failed attempt(s)",
                self.name,
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.connected_since = Some(Instant::now());
    }

    pub fn is_connected(&self) -> bool {
        self.connected_since.is_some()
    }

    pub fn status(&self) -> String {
        match (&self.connected_since, &self.last_error) {
            (Some(since), _) => format!(
                "{}: CONNECTED ({:.0}s)",
                self.name,
                since.elapsed().as_secs_f64()
            ),
            (None, Some(err)) => format!(
                "{}: RECONNECTING (attempt {}, last error: {})",
                self.name, self.consecutive_failures, err
            ),
            (None, None) => format!("{}: CONNECTING", self.name),
        }
    }
}
