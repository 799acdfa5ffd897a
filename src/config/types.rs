//! Configuration types for netem-router
//!
//! The on-disk schema mirrors the original emulator's profile format:
//! every impairment field takes either a single symmetric `value` or an
//! explicit `up`/`down` pair, and delay alternatively takes a percentile
//! table. [`Config::build_profile`] normalizes all of that into the
//! [`NetworkProfile`] sum types exactly once; nothing downstream ever
//! re-interprets optionals.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::profile::{
    BandwidthModel, DelayModel, LossModel, NetworkProfile, PercentilePoint, PercentileTable,
};
use crate::router::RouterConfig;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Tun interface parameters
    #[serde(default)]
    pub tun: TunSection,

    /// Router tuning knobs
    #[serde(default)]
    pub router: RouterSection,

    /// Impairment profile
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogSection,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on conflicting or
    /// out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        // Building the profile performs its own validation.
        self.build_profile().map(|_| ())
    }

    /// Normalize the profile section into its runtime form
    ///
    /// # Errors
    ///
    /// Returns a validation error on conflicting or out-of-range fields.
    pub fn build_profile(&self) -> Result<NetworkProfile, ConfigError> {
        self.profile.build()
    }

    /// Runtime router configuration derived from this file
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            tun_addr: self.tun.address,
            reject_tcp_ports: self.router.reject_tcp_ports.clone(),
            idle_timeout: Duration::from_secs(self.router.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.router.sweep_interval_secs),
            queue_high_water: self.router.queue_high_water,
            stats_log_interval: Duration::from_secs(self.router.stats_log_interval_secs),
        }
    }
}

/// Tun interface parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunSection {
    /// The address assigned to the tun interface; the only legal source
    /// for outbound frames
    pub address: Ipv4Addr,
}

impl Default for TunSection {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 2),
        }
    }
}

/// Router tuning knobs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterSection {
    /// Destination ports whose outbound SYNs are silently ignored,
    /// forcing client fallback (DNS-over-TLS by default)
    #[serde(default = "default_reject_ports")]
    pub reject_tcp_ports: Vec<u16>,

    /// Idle horizon in seconds after which sessions are evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Sweeper cadence in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Delay queue high-water mark (entries, per direction)
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,

    /// Loss summary log cadence in seconds
    #[serde(default = "default_stats_log_interval")]
    pub stats_log_interval_secs: u64,
}

fn default_reject_ports() -> Vec<u16> {
    vec![853]
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_queue_high_water() -> usize {
    crate::shaper::DEFAULT_HIGH_WATER
}
fn default_stats_log_interval() -> u64 {
    10
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            reject_tcp_ports: default_reject_ports(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            queue_high_water: default_queue_high_water(),
            stats_log_interval_secs: default_stats_log_interval(),
        }
    }
}

impl RouterSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::validation("idle_timeout_secs must be > 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation("sweep_interval_secs must be > 0"));
        }
        if self.queue_high_water == 0 {
            return Err(ConfigError::validation("queue_high_water must be > 0"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSection {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Impairment profile as written in the config file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileConfig {
    /// Delay section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySection>,
    /// Loss section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<LossSection>,
    /// Bandwidth section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthSection>,
}

impl ProfileConfig {
    /// Normalize into the runtime profile
    ///
    /// # Errors
    ///
    /// Returns a validation error on conflicting or out-of-range fields.
    pub fn build(&self) -> Result<NetworkProfile, ConfigError> {
        Ok(NetworkProfile {
            delay: self.delay.as_ref().map(DelaySection::build).transpose()?,
            loss: self.loss.as_ref().map(LossSection::build).transpose()?,
            bandwidth: self
                .bandwidth
                .as_ref()
                .map(BandwidthSection::build)
                .transpose()?,
        })
    }
}

/// Delay: a single value (split 60/40 up/down), an up/down pair, or a
/// percentile table
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DelaySection {
    /// Single value in ms, split 60/40 between up and down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    /// Explicit up (outbound) delay in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<u64>,
    /// Explicit down (inbound) delay in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<u64>,
    /// Percentile table; exclusive with the fixed fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<PercentileSection>,
}

impl DelaySection {
    fn build(&self) -> Result<DelayModel, ConfigError> {
        if let Some(table) = &self.percentiles {
            if self.value.is_some() || self.up.is_some() || self.down.is_some() {
                return Err(ConfigError::validation(
                    "delay takes either fixed values or percentiles, not both",
                ));
            }
            return Ok(DelayModel::Percentile(table.build()?));
        }
        match (self.value, self.up, self.down) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ConfigError::validation(
                "delay takes either value or up/down, not both",
            )),
            (Some(total), None, None) => Ok(DelayModel::from_single(total)),
            (None, Some(up), Some(down)) => Ok(DelayModel::from_split(up, down)),
            (None, Some(_), None) | (None, None, Some(_)) => Err(ConfigError::validation(
                "delay up/down must be given together",
            )),
            (None, None, None) => Err(ConfigError::validation("delay section is empty")),
        }
    }
}

/// Percentile table; each entry is a single value or an up/down pair
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PercentileSection {
    /// 25th percentile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p25: Option<ValueSpec>,
    /// 50th percentile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p50: Option<ValueSpec>,
    /// 90th percentile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p90: Option<ValueSpec>,
    /// 95th percentile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95: Option<ValueSpec>,
}

impl PercentileSection {
    fn build(&self) -> Result<PercentileTable, ConfigError> {
        let mut points = Vec::new();
        for (percentile, spec) in [
            (25.0, &self.p25),
            (50.0, &self.p50),
            (90.0, &self.p90),
            (95.0, &self.p95),
        ] {
            if let Some(spec) = spec {
                let (up_ms, down_ms) = spec.resolve()?;
                points.push(PercentilePoint {
                    percentile,
                    up_ms,
                    down_ms,
                });
            }
        }
        PercentileTable::new(points)
    }
}

/// A single symmetric value or an up/down pair
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValueSpec {
    /// Symmetric value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    /// Up (outbound) value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<u64>,
    /// Down (inbound) value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<u64>,
}

impl ValueSpec {
    fn resolve(&self) -> Result<(u64, u64), ConfigError> {
        match (self.value, self.up, self.down) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ConfigError::validation(
                "percentile entry takes either value or up/down, not both",
            )),
            (Some(v), None, None) => Ok((v, v)),
            (None, Some(up), Some(down)) => Ok((up, down)),
            _ => Err(ConfigError::validation(
                "percentile entry needs value or an up/down pair",
            )),
        }
    }
}

/// Loss percentages
///
/// A single `value` is the end-to-end percentage and is halved per
/// direction; an explicit up/down pair is used verbatim.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LossSection {
    /// End-to-end percentage, split 50/50 across the two legs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Up (outbound) percentage, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<f64>,
    /// Down (inbound) percentage, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<f64>,
}

impl LossSection {
    fn build(&self) -> Result<LossModel, ConfigError> {
        match (self.value, self.up, self.down) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ConfigError::validation(
                "loss takes either value or up/down, not both",
            )),
            (Some(percent), None, None) => LossModel::from_symmetric(percent),
            (None, Some(up), Some(down)) => LossModel::from_split(up, down),
            (None, Some(_), None) | (None, None, Some(_)) => Err(ConfigError::validation(
                "loss up/down must be given together",
            )),
            (None, None, None) => Err(ConfigError::validation("loss section is empty")),
        }
    }
}

/// Bandwidth in kbps
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BandwidthSection {
    /// Symmetric kbps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbps: Option<u64>,
    /// Up (outbound) kbps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<u64>,
    /// Down (inbound) kbps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<u64>,
}

impl BandwidthSection {
    fn build(&self) -> Result<BandwidthModel, ConfigError> {
        match (self.kbps, self.up, self.down) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ConfigError::validation(
                "bandwidth takes either kbps or up/down, not both",
            )),
            (Some(kbps), None, None) => Ok(BandwidthModel::from_symmetric(kbps)),
            (None, Some(up), Some(down)) => Ok(BandwidthModel {
                up_kbps: up,
                down_kbps: down,
            }),
            _ => Err(ConfigError::validation(
                "bandwidth needs kbps or an up/down pair",
            )),
        }
    }
}
