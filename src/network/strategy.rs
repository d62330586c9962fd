//! Low-Speed Network Strategy
//!
//! Decides when a running transfer is too slow to keep.
//!
//! # Rule
//!
//! ```text
//!   0 ────── window ─────────────── deadline ─────────────►  t
//!   │ no checks │ avg speed >= threshold:                   │
//!   │           │   abort if projected finish > deadline    │
//!   │           │   × PROJECTION_TOLERANCE                  │
//!   │           │ avg speed <  threshold:                   │
//!   │           │   keep going until deadline, then abort   │
//! ```
//!
//! Average speed is measured over the whole transfer, so a fetch that has
//! been below threshold since it started is aborted exactly once it passes
//! the deadline, and never during the window.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Slack applied to the projected completion time before aborting
pub const PROJECTION_TOLERANCE: f64 = 1.25;

/// Network class the strategy table is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    /// 2G/3G style links
    ConstrainedMobile,
    /// 4G/5G
    BroadbandMobile,
    Wifi,
    /// Entry used by indispensable requests on any network
    Indispensable,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkClass::ConstrainedMobile => "constrained-mobile",
            NetworkClass::BroadbandMobile => "broadband-mobile",
            NetworkClass::Wifi => "wifi",
            NetworkClass::Indispensable => "indispensable",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for NetworkClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constrained-mobile" => Ok(NetworkClass::ConstrainedMobile),
            "broadband-mobile" => Ok(NetworkClass::BroadbandMobile),
            "wifi" => Ok(NetworkClass::Wifi),
            "indispensable" => Ok(NetworkClass::Indispensable),
            other => Err(Error::Config(format!("unknown network class: {}", other))),
        }
    }
}

/// Window, deadline and threshold for one network class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowSpeedConfigure {
    pub class: NetworkClass,
    /// No speed checks before this
    pub window_period_ms: u64,
    pub deadline_ms: u64,
    /// Bytes per second
    pub threshold_speed: u64,
}

impl LowSpeedConfigure {
    /// Validated constructor; the deadline must be later than the window
    pub fn new(
        class: NetworkClass,
        window_period: Duration,
        deadline: Duration,
        threshold_speed: u64,
    ) -> Result<Self> {
        let configure = Self {
            class,
            window_period_ms: window_period.as_millis() as u64,
            deadline_ms: deadline.as_millis() as u64,
            threshold_speed,
        };
        configure.validate()?;
        Ok(configure)
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadline_ms <= self.window_period_ms {
            return Err(Error::Config(format!(
                "low-speed {}: deadline ({}ms) must be greater than window period ({}ms)",
                self.class, self.deadline_ms, self.window_period_ms
            )));
        }
        Ok(())
    }

    pub fn window_period(&self) -> Duration {
        Duration::from_millis(self.window_period_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    fn preset(class: NetworkClass) -> Self {
        let (window_secs, deadline_secs, threshold_speed) = match class {
            NetworkClass::ConstrainedMobile => (20, 60, 5 * 1024),
            NetworkClass::BroadbandMobile => (10, 30, 20 * 1024),
            NetworkClass::Wifi => (10, 30, 20 * 1024),
            NetworkClass::Indispensable => (40, 120, 256),
        };
        Self {
            class,
            window_period_ms: window_secs * 1000,
            deadline_ms: deadline_secs * 1000,
            threshold_speed,
        }
    }
}

/// Table of per-class configurations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LowSpeedStrategy {
    configures: Vec<LowSpeedConfigure>,
}

impl Default for LowSpeedStrategy {
    fn default() -> Self {
        Self {
            configures: [
                NetworkClass::ConstrainedMobile,
                NetworkClass::BroadbandMobile,
                NetworkClass::Wifi,
                NetworkClass::Indispensable,
            ]
            .into_iter()
            .map(LowSpeedConfigure::preset)
            .collect(),
        }
    }
}

impl LowSpeedStrategy {
    /// Replace the entry for `configure.class`
    pub fn with_configure(mut self, configure: LowSpeedConfigure) -> Self {
        self.configures.retain(|c| c.class != configure.class);
        self.configures.push(configure);
        self
    }

    /// Configuration for a transfer; indispensable transfers always use the
    /// indispensable entry
    pub fn select(&self, class: NetworkClass, indispensable: bool) -> LowSpeedConfigure {
        let class = if indispensable {
            NetworkClass::Indispensable
        } else {
            class
        };
        self.configures
            .iter()
            .find(|c| c.class == class)
            .copied()
            .unwrap_or_else(|| LowSpeedConfigure::preset(class))
    }

    pub fn validate(&self) -> Result<()> {
        self.configures.iter().try_for_each(LowSpeedConfigure::validate)
    }
}

// =============================================================================
// Speed Watch
// =============================================================================

/// Why a transfer was judged too slow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowSpeedReason {
    /// Average speed stayed below threshold past the deadline
    BelowThreshold,
    /// At the current speed the transfer cannot finish near the deadline
    ProjectedOverrun,
    /// Still running at twice the deadline
    HardDeadline,
}

impl fmt::Display for LowSpeedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowSpeedReason::BelowThreshold => write!(f, "below threshold past deadline"),
            LowSpeedReason::ProjectedOverrun => write!(f, "projected to miss deadline"),
            LowSpeedReason::HardDeadline => write!(f, "exceeded twice the deadline"),
        }
    }
}

/// Outcome of one progress observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedVerdict {
    Continue,
    Abort {
        reason: LowSpeedReason,
        speed_bps: u64,
    },
}

/// Stateless judge applying a [`LowSpeedConfigure`] to progress samples
#[derive(Debug, Clone, Copy)]
pub struct SpeedWatch {
    configure: LowSpeedConfigure,
}

impl SpeedWatch {
    pub fn new(configure: LowSpeedConfigure) -> Self {
        Self { configure }
    }

    pub fn configure(&self) -> &LowSpeedConfigure {
        &self.configure
    }

    /// Judge `loaded` bytes after `elapsed`; `total` is the size reported by
    /// the server, if any
    pub fn observe(&self, elapsed: Duration, loaded: u64, total: Option<u64>) -> SpeedVerdict {
        if elapsed < self.configure.window_period() {
            return SpeedVerdict::Continue;
        }
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let speed = loaded as f64 / secs;
        let speed_bps = speed as u64;

        if speed < self.configure.threshold_speed as f64 {
            if elapsed >= self.configure.deadline() {
                return SpeedVerdict::Abort {
                    reason: LowSpeedReason::BelowThreshold,
                    speed_bps,
                };
            }
            return SpeedVerdict::Continue;
        }

        if let Some(total) = total.filter(|&t| t > loaded) {
            let remaining = (total - loaded) as f64;
            let projected = secs + remaining / speed.max(1.0);
            let allowed = self.configure.deadline().as_secs_f64() * PROJECTION_TOLERANCE;
            if projected > allowed {
                return SpeedVerdict::Abort {
                    reason: LowSpeedReason::ProjectedOverrun,
                    speed_bps,
                };
            }
        }
        SpeedVerdict::Continue
    }

    /// Error reported for an abort verdict
    pub fn abort_error(elapsed: Duration, reason: LowSpeedReason, speed_bps: u64) -> Error {
        Error::LowSpeedAbort {
            elapsed,
            speed_bps,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> LowSpeedConfigure {
        LowSpeedConfigure::new(
            NetworkClass::Wifi,
            Duration::from_secs(1),
            Duration::from_secs(5),
            1024,
        )
        .unwrap()
    }

    #[test]
    fn test_default_table() {
        let strategy = LowSpeedStrategy::default();
        let wifi = strategy.select(NetworkClass::Wifi, false);
        assert_eq!(wifi.window_period(), Duration::from_secs(10));
        assert_eq!(wifi.deadline(), Duration::from_secs(30));
        assert_eq!(wifi.threshold_speed, 20 * 1024);

        let mobile = strategy.select(NetworkClass::ConstrainedMobile, false);
        assert_eq!(mobile.deadline(), Duration::from_secs(60));

        let urgent = strategy.select(NetworkClass::ConstrainedMobile, true);
        assert_eq!(urgent.class, NetworkClass::Indispensable);
        assert_eq!(urgent.threshold_speed, 256);
        assert!(strategy.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(LowSpeedConfigure::new(
            NetworkClass::Wifi,
            Duration::from_secs(5),
            Duration::from_secs(5),
            0
        )
        .is_err());

        let strategy = LowSpeedStrategy::default().with_configure(LowSpeedConfigure {
            class: NetworkClass::Wifi,
            window_period_ms: 10,
            deadline_ms: 1,
            threshold_speed: 0,
        });
        assert!(matches!(strategy.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_with_configure_replaces() {
        let strategy = LowSpeedStrategy::default().with_configure(scenario());
        assert_eq!(
            strategy.select(NetworkClass::Wifi, false).deadline(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_slow_transfer_aborted_after_deadline() {
        let watch = SpeedWatch::new(scenario());
        let mut aborted_at = None;

        // 0.5KB/s sustained from t=0, sampled every 500ms
        for step in 1..=40u64 {
            let elapsed = Duration::from_millis(step * 500);
            let loaded = step * 256;
            if let SpeedVerdict::Abort { reason, .. } = watch.observe(elapsed, loaded, Some(1 << 20))
            {
                assert_eq!(reason, LowSpeedReason::BelowThreshold);
                aborted_at = Some(elapsed);
                break;
            }
        }

        let aborted_at = aborted_at.unwrap();
        assert!(aborted_at >= Duration::from_secs(5));
        assert!(aborted_at < Duration::from_secs(6));
    }

    #[test]
    fn test_no_checks_inside_window() {
        let watch = SpeedWatch::new(scenario());
        assert_eq!(
            watch.observe(Duration::from_millis(999), 0, Some(1 << 30)),
            SpeedVerdict::Continue
        );
    }

    #[test]
    fn test_projected_overrun() {
        let watch = SpeedWatch::new(scenario());
        // 2KB/s is above threshold but 1MB would take ~500s
        let verdict = watch.observe(Duration::from_secs(2), 4096, Some(1 << 20));
        assert!(matches!(
            verdict,
            SpeedVerdict::Abort {
                reason: LowSpeedReason::ProjectedOverrun,
                ..
            }
        ));

        // unknown size: nothing to project
        assert_eq!(
            watch.observe(Duration::from_secs(2), 4096, None),
            SpeedVerdict::Continue
        );
    }

    #[test]
    fn test_fast_transfer_continues() {
        let watch = SpeedWatch::new(scenario());
        assert_eq!(
            watch.observe(Duration::from_secs(2), 200_000, Some(400_000)),
            SpeedVerdict::Continue
        );
    }

    #[test]
    fn test_network_class_parse() {
        assert_eq!(
            "broadband-mobile".parse::<NetworkClass>().unwrap(),
            NetworkClass::BroadbandMobile
        );
        assert!("5g".parse::<NetworkClass>().is_err());
    }
}
