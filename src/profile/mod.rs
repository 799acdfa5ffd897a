//! Network impairment profiles
//!
//! A [`NetworkProfile`] is an immutable snapshot of delay, loss and
//! bandwidth parameters. The config layer normalizes its optional-heavy
//! schema into the sum types here exactly once; the shaper only ever sees
//! normalized models and never re-derives splits.
//!
//! Profiles are replaced atomically as wholes (the shaper holds them behind
//! an `ArcSwap`); no packet ever observes a partial update.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Traffic direction through the emulated link
///
/// `Outbound` is client-to-network (the "up" leg of the link profile);
/// `Inbound` is network-to-client (the "down" leg).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client -> real network ("up")
    Outbound,
    /// Real network -> client ("down")
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outbound => write!(f, "outbound"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}

/// One point of a percentile delay table
///
/// Carries independent up/down values; a symmetric config entry is stored
/// with `up_ms == down_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentilePoint {
    /// Percentile in (0, 100)
    pub percentile: f64,
    /// Delay at this percentile for the up (outbound) leg
    pub up_ms: u64,
    /// Delay at this percentile for the down (inbound) leg
    pub down_ms: u64,
}

impl PercentilePoint {
    fn value(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Outbound => self.up_ms,
            Direction::Inbound => self.down_ms,
        }
    }
}

/// Ordered percentile table used to sample a delay distribution
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileTable {
    points: Vec<PercentilePoint>,
}

impl PercentileTable {
    /// Build a table from points, sorting by percentile
    ///
    /// # Errors
    ///
    /// Returns a validation error when the table is empty, a percentile is
    /// outside (0, 100), or two points share a percentile.
    pub fn new(mut points: Vec<PercentilePoint>) -> Result<Self, ConfigError> {
        if points.is_empty() {
            return Err(ConfigError::validation("percentile table is empty"));
        }
        for p in &points {
            if !(p.percentile > 0.0 && p.percentile < 100.0) {
                return Err(ConfigError::validation(format!(
                    "percentile {} out of range (0, 100)",
                    p.percentile
                )));
            }
        }
        points.sort_by(|a, b| a.percentile.total_cmp(&b.percentile));
        if points
            .windows(2)
            .any(|w| (w[0].percentile - w[1].percentile).abs() < f64::EPSILON)
        {
            return Err(ConfigError::validation("duplicate percentile in table"));
        }
        Ok(Self { points })
    }

    /// The ordered (percentile, value) pairs for one direction
    pub fn column(&self, direction: Direction) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.points.iter().map(move |p| (p.percentile, p.value(direction)))
    }

    /// Map a uniform draw `v` in [0, 1) to a delay in milliseconds
    ///
    /// The draw is interpreted as a percentile `x = v * 100` and mapped
    /// through the table by linear interpolation. Below the lowest
    /// configured percentile the curve scales linearly from zero; above the
    /// highest it extrapolates the slope of the last two points (flat when
    /// the table has a single point). The result is truncated to whole
    /// milliseconds.
    #[must_use]
    pub fn sample(&self, direction: Direction, v: f64) -> u64 {
        let x = v.clamp(0.0, 1.0) * 100.0;
        let first = &self.points[0];
        if x <= first.percentile {
            let y_min = first.value(direction) as f64;
            return (y_min * x / first.percentile) as u64;
        }

        for w in self.points.windows(2) {
            let (lo, hi) = (&w[0], &w[1]);
            if x <= hi.percentile {
                let y_lo = lo.value(direction) as f64;
                let y_hi = hi.value(direction) as f64;
                let t = (x - lo.percentile) / (hi.percentile - lo.percentile);
                return (y_lo + t * (y_hi - y_lo)) as u64;
            }
        }

        // Past the last configured percentile: continue the slope of the
        // final segment. A single-point table extends flat.
        let last = &self.points[self.points.len() - 1];
        let y_last = last.value(direction) as f64;
        if self.points.len() < 2 {
            return y_last as u64;
        }
        let prev = &self.points[self.points.len() - 2];
        let slope = (y_last - prev.value(direction) as f64)
            / (last.percentile - prev.percentile);
        let y = y_last + (x - last.percentile) * slope;
        y.max(0.0) as u64
    }
}

/// Delay model for one profile
#[derive(Debug, Clone, PartialEq)]
pub enum DelayModel {
    /// Fixed per-direction delay
    Fixed {
        /// Outbound delay in ms
        up_ms: u64,
        /// Inbound delay in ms
        down_ms: u64,
    },
    /// Jittered delay sampled from a percentile table
    Percentile(PercentileTable),
}

impl DelayModel {
    /// Build from a single configured value
    ///
    /// A single delay value is split 60/40 between the up and down legs.
    /// The ratio is a compatibility rule inherited from the original
    /// emulator's configuration format.
    #[must_use]
    pub fn from_single(total_ms: u64) -> Self {
        Self::Fixed {
            up_ms: total_ms * 60 / 100,
            down_ms: total_ms * 40 / 100,
        }
    }

    /// Build from explicit per-direction values
    #[must_use]
    pub const fn from_split(up_ms: u64, down_ms: u64) -> Self {
        Self::Fixed { up_ms, down_ms }
    }

    /// Sample a delay for one packet
    ///
    /// `v` is a uniform draw in [0, 1); it is ignored for fixed delays.
    #[must_use]
    pub fn sample(&self, direction: Direction, v: f64) -> u64 {
        match self {
            Self::Fixed { up_ms, down_ms } => match direction {
                Direction::Outbound => *up_ms,
                Direction::Inbound => *down_ms,
            },
            Self::Percentile(table) => table.sample(direction, v),
        }
    }
}

/// Loss model, stored as per-direction drop probabilities in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossModel {
    up_rate: f64,
    down_rate: f64,
}

impl LossModel {
    /// Build from a single symmetric percentage
    ///
    /// The configured end-to-end percentage `L` is halved to `L/2` per
    /// direction so the observed two-leg loss stays ~= `L` instead of
    /// compounding toward `2L`. This normalization happens exactly once,
    /// here; the shaper applies the stored rate verbatim.
    pub fn from_symmetric(percent: f64) -> Result<Self, ConfigError> {
        validate_percent(percent)?;
        let rate = percent / 2.0 / 100.0;
        Ok(Self {
            up_rate: rate,
            down_rate: rate,
        })
    }

    /// Build from explicit per-direction percentages, used verbatim
    pub fn from_split(up_percent: f64, down_percent: f64) -> Result<Self, ConfigError> {
        validate_percent(up_percent)?;
        validate_percent(down_percent)?;
        Ok(Self {
            up_rate: up_percent / 100.0,
            down_rate: down_percent / 100.0,
        })
    }

    /// Drop probability in [0, 1] for one direction
    #[must_use]
    pub fn rate(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Outbound => self.up_rate,
            Direction::Inbound => self.down_rate,
        }
    }
}

fn validate_percent(percent: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&percent) || percent.is_nan() {
        return Err(ConfigError::validation(format!(
            "loss percentage {percent} out of range [0, 100]"
        )));
    }
    Ok(())
}

/// Bandwidth model in kbps per direction
///
/// Parsed and carried with the profile; the shaper does not yet apply it.
/// It is exposed for the forthcoming token-bucket stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthModel {
    /// Outbound bandwidth in kbps
    pub up_kbps: u64,
    /// Inbound bandwidth in kbps
    pub down_kbps: u64,
}

impl BandwidthModel {
    /// Build from a single symmetric value
    #[must_use]
    pub const fn from_symmetric(kbps: u64) -> Self {
        Self {
            up_kbps: kbps,
            down_kbps: kbps,
        }
    }
}

/// Immutable bundle of delay, loss and bandwidth parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkProfile {
    /// Delay model, `None` = no added delay
    pub delay: Option<DelayModel>,
    /// Loss model, `None` = no induced loss
    pub loss: Option<LossModel>,
    /// Bandwidth model, `None` = unlimited
    pub bandwidth: Option<BandwidthModel>,
}

impl NetworkProfile {
    /// A profile that impairs nothing
    #[must_use]
    pub fn unimpaired() -> Self {
        Self::default()
    }

    /// Drop probability in [0, 1] for one direction
    #[must_use]
    pub fn loss_rate(&self, direction: Direction) -> f64 {
        self.loss.map_or(0.0, |l| l.rate(direction))
    }

    /// Whether delay sampling needs an independent uniform draw
    #[must_use]
    pub fn has_jitter(&self) -> bool {
        matches!(self.delay, Some(DelayModel::Percentile(_)))
    }

    /// Per-packet delay in milliseconds for one direction
    ///
    /// `v` is a uniform draw in [0, 1), only consumed by percentile tables.
    #[must_use]
    pub fn sample_delay_ms(&self, direction: Direction, v: f64) -> u64 {
        self.delay.as_ref().map_or(0, |d| d.sample(direction, v))
    }
}
