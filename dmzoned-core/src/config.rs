// vim: tw=80
//! Tunables for a running target

use crate::types::*;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Lowest allowed busy reclaim threshold, in percent of free random zones
pub const RECLAIM_LOW_MIN: u32 = 10;
/// Highest allowed reclaim threshold, busy or idle
pub const RECLAIM_LOW_MAX: u32 = 90;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Start reclaiming when the percentage of free random zones falls to
    /// this level while the target is busy.
    pub reclaim_low: u32,
    /// Same as `reclaim_low`, but used while the target is idle.  It should
    /// be higher, so that idle periods are used to prepare for bursts.
    pub reclaim_idle_low: u32,
    /// How often the reclaim task wakes up to check the thresholds
    pub reclaim_period_ms: u64,
    /// After this long without I/O, the target is considered idle
    pub idle_period_ms: u64,
    /// Interval between periodic metadata flushes
    pub flush_period_ms: u64,
    /// Period of the retry loop used while waiting for a free zone, or for a
    /// zone to finish reclaim
    pub zone_wait_ms: u64,
    /// Give up waiting for a free zone after this long, failing the write
    /// with `ENOSPC`.  By default, wait forever.
    pub zone_wait_timeout_ms: Option<u64>,
    /// Open the target read-only.  Writes and discards fail with `EROFS`,
    /// and neither reclaim nor flushing will modify the device.
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reclaim_low: 50,
            reclaim_idle_low: 75,
            reclaim_period_ms: 10_000,
            idle_period_ms: 10_000,
            flush_period_ms: 10_000,
            zone_wait_ms: 1_000,
            zone_wait_timeout_ms: None,
            read_only: false,
        }
    }
}

impl Config {
    /// Parse a YAML document.  Missing fields take their default values.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(s)?;
        config.sanitize()
    }

    /// Check and adjust the thresholds.
    ///
    /// Percentages above 100 are rejected.  Otherwise, `reclaim_low` is
    /// clamped to `[RECLAIM_LOW_MIN, RECLAIM_LOW_MAX]` and `reclaim_idle_low`
    /// to `[reclaim_low, RECLAIM_LOW_MAX]`.
    pub fn sanitize(mut self) -> Result<Self> {
        if self.reclaim_low > 100 || self.reclaim_idle_low > 100 {
            warn!(low = self.reclaim_low, idle = self.reclaim_idle_low,
                  "Invalid reclaim threshold");
            return Err(Error::EINVAL);
        }
        if self.flush_period_ms == 0 || self.zone_wait_ms == 0 ||
            self.reclaim_period_ms == 0
        {
            warn!("Periods must be nonzero");
            return Err(Error::EINVAL);
        }
        let low = self.reclaim_low.clamp(RECLAIM_LOW_MIN, RECLAIM_LOW_MAX);
        if low != self.reclaim_low {
            warn!(from = self.reclaim_low, to = low, "Clamping reclaim_low");
            self.reclaim_low = low;
        }
        let idle = self.reclaim_idle_low.clamp(low, RECLAIM_LOW_MAX);
        if idle != self.reclaim_idle_low {
            warn!(from = self.reclaim_idle_low, to = idle,
                  "Clamping reclaim_idle_low");
            self.reclaim_idle_low = idle;
        }
        Ok(self)
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_millis(self.idle_period_ms)
    }

    pub fn reclaim_period(&self) -> Duration {
        Duration::from_millis(self.reclaim_period_ms)
    }

    pub fn zone_wait(&self) -> Duration {
        Duration::from_millis(self.zone_wait_ms)
    }

    pub fn zone_wait_timeout(&self) -> Option<Duration> {
        self.zone_wait_timeout_ms.map(Duration::from_millis)
    }
}

/// Options used only when formatting a device
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatOptions {
    /// Number of sequential zones set aside for reclaim's exclusive use
    pub nr_reserved_seq: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions { nr_reserved_seq: 16 }
    }
}

// LCOV_EXCL_STOP
