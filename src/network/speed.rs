//! Per-host connection speed recorder
//!
//! Exponentially weighted average of per-connection throughput, used as the
//! assumed connection speed when sizing multi-connection downloads.

use dashmap::DashMap;

/// Weight of the previous average
const HISTORY_WEIGHT: f64 = 0.8;
/// Weight of the new sample
const SAMPLE_WEIGHT: f64 = 0.2;

/// Default assumed per-connection speed (64KB/s)
pub const DEFAULT_CONNECTION_SPEED: u64 = 64 * 1024;

/// Host -> bytes per second
pub struct SpeedRecorder {
    speeds: DashMap<String, f64>,
    default_speed: u64,
}

impl SpeedRecorder {
    pub fn new(default_speed: u64) -> Self {
        Self {
            speeds: DashMap::new(),
            default_speed: default_speed.max(1),
        }
    }

    /// Fold a per-connection sample into the host average
    pub fn record(&self, url: &str, bytes_per_sec: u64) {
        let Some(host) = host_of(url) else {
            return;
        };
        let sample = bytes_per_sec as f64;
        self.speeds
            .entry(host)
            .and_modify(|avg| *avg = *avg * HISTORY_WEIGHT + sample * SAMPLE_WEIGHT)
            .or_insert(sample);
    }

    /// Assumed per-connection speed for `url`'s host, at least 1 B/s
    pub fn speed_of(&self, url: &str) -> u64 {
        host_of(url)
            .and_then(|host| self.speeds.get(&host).map(|s| s.round() as u64))
            .unwrap_or(self.default_speed)
            .max(1)
    }
}

impl Default for SpeedRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_SPEED)
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
