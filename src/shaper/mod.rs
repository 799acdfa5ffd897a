//! Per-direction loss and delay shaping
//!
//! One [`Shaper`] per direction. Each owns its own PRNG (so outbound draws
//! never starve inbound), its own [`DelayQueue`], its own loss counters,
//! and a profile snapshot swapped atomically on reconfiguration.

pub mod delay_queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::PacketClock;
use crate::profile::{Direction, NetworkProfile};

pub use delay_queue::{DelayQueue, DEFAULT_HIGH_WATER};

/// Running loss counters for one direction
#[derive(Debug, Default)]
pub struct ShaperStats {
    total: AtomicU64,
    dropped: AtomicU64,
}

impl ShaperStats {
    fn record_submitted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Snapshot the counters
    #[must_use]
    pub fn snapshot(&self) -> LossStats {
        LossStats {
            total: self.total.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time loss counters for one direction
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LossStats {
    /// Packets submitted to the shaper
    pub total: u64,
    /// Packets dropped (loss draw or tail-drop)
    pub dropped: u64,
}

impl LossStats {
    /// Observed drop percentage
    #[must_use]
    pub fn observed_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.dropped as f64 / self.total as f64 * 100.0
        }
    }
}

/// Loss and delay shaper for one traffic direction
pub struct Shaper<T> {
    direction: Direction,
    profile: ArcSwap<NetworkProfile>,
    queue: DelayQueue<T>,
    rng: Mutex<SmallRng>,
    stats: ShaperStats,
    clock: Arc<dyn PacketClock>,
}

impl<T> Shaper<T> {
    /// Create a shaper for one direction
    ///
    /// The PRNG is seeded from entropy, independently per shaper.
    pub fn new(
        direction: Direction,
        profile: Arc<NetworkProfile>,
        clock: Arc<dyn PacketClock>,
        high_water: usize,
    ) -> Self {
        Self {
            direction,
            profile: ArcSwap::new(profile),
            queue: DelayQueue::new(clock.clone(), high_water),
            rng: Mutex::new(SmallRng::from_entropy()),
            stats: ShaperStats::default(),
            clock,
        }
    }

    /// Direction this shaper serves
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Submit a packet for shaping
    ///
    /// The packet is counted, subjected to the loss draw, assigned a delay
    /// (fixed or percentile-sampled), and queued for release. Queue
    /// overflow tail-drops and counts against the loss statistics.
    pub fn submit(&self, item: T) {
        self.stats.record_submitted();
        let profile = self.profile.load();

        let loss_rate = profile.loss_rate(self.direction);
        let (u, v) = {
            let mut rng = self.rng.lock();
            let u: f64 = rng.gen();
            // The jitter draw is independent of the loss draw.
            let v: f64 = if profile.has_jitter() { rng.gen() } else { 0.0 };
            (u, v)
        };

        if u < loss_rate {
            self.stats.record_dropped();
            trace!(direction = %self.direction, "packet lost by draw");
            return;
        }

        let delay_ms = profile.sample_delay_ms(self.direction, v);
        let release_at = self.clock.now_ms().saturating_add(delay_ms);
        if !self.queue.push(item, release_at) {
            self.stats.record_dropped();
            debug!(
                direction = %self.direction,
                queued = self.queue.len(),
                "delay queue full, tail-dropping"
            );
        }
    }

    /// Pop the next released packet, waiting at most `max_wait_ms`
    pub async fn drain(&self, max_wait_ms: u64) -> Option<T> {
        self.queue.pop_ready_blocking(max_wait_ms).await
    }

    /// Pop without waiting
    pub fn try_drain(&self) -> Option<T> {
        self.queue.pop_ready()
    }

    /// Replace the profile snapshot atomically
    ///
    /// Loss counters reset so observed-vs-target comparisons restart with
    /// the new profile. Packets already queued keep the release times they
    /// were assigned; a profile change never retro-delays in-flight data.
    pub fn set_profile(&self, profile: Arc<NetworkProfile>) {
        self.profile.store(profile);
        self.stats.reset();
        debug!(direction = %self.direction, "shaper profile replaced");
    }

    /// Current profile snapshot
    #[must_use]
    pub fn profile(&self) -> Arc<NetworkProfile> {
        self.profile.load_full()
    }

    /// Loss counters
    #[must_use]
    pub fn stats(&self) -> LossStats {
        self.stats.snapshot()
    }

    /// Packets currently waiting for release
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drop everything queued (used on shutdown)
    pub fn clear(&self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::profile::{DelayModel, LossModel};

    fn shaper_with(profile: NetworkProfile) -> (Arc<ManualClock>, Shaper<u32>) {
        let clock = Arc::new(ManualClock::new());
        let shaper = Shaper::new(
            Direction::Outbound,
            Arc::new(profile),
            clock.clone(),
            DEFAULT_HIGH_WATER,
        );
        (clock, shaper)
    }

    #[test]
    fn test_no_impairment_passes_through_immediately() {
        let (_clock, shaper) = shaper_with(NetworkProfile::unimpaired());
        shaper.submit(42);
        assert_eq!(shaper.try_drain(), Some(42));
        let stats = shaper.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_fixed_delay_holds_packet() {
        let profile = NetworkProfile {
            delay: Some(DelayModel::from_split(50, 10)),
            ..NetworkProfile::default()
        };
        let (clock, shaper) = shaper_with(profile);
        shaper.submit(1);
        assert_eq!(shaper.try_drain(), None);
        clock.advance(49);
        assert_eq!(shaper.try_drain(), None);
        clock.advance(1);
        assert_eq!(shaper.try_drain(), Some(1));
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let profile = NetworkProfile {
            loss: Some(LossModel::from_split(100.0, 0.0).unwrap()),
            ..NetworkProfile::default()
        };
        let (_clock, shaper) = shaper_with(profile);
        for n in 0..100 {
            shaper.submit(n);
        }
        assert_eq!(shaper.try_drain(), None);
        let stats = shaper.stats();
        assert_eq!(stats.total, 100);
        assert_eq!(stats.dropped, 100);
        assert!((stats.observed_percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tail_drop_counts_as_loss() {
        let clock = Arc::new(ManualClock::new());
        let shaper = Shaper::new(
            Direction::Inbound,
            Arc::new(NetworkProfile::unimpaired()),
            clock,
            2,
        );
        shaper.submit(1);
        shaper.submit(2);
        shaper.submit(3);
        let stats = shaper.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(shaper.queue_len(), 2);
    }

    #[test]
    fn test_profile_swap_resets_stats_keeps_queue() {
        let profile = NetworkProfile {
            delay: Some(DelayModel::from_split(100, 100)),
            ..NetworkProfile::default()
        };
        let (clock, shaper) = shaper_with(profile);
        shaper.submit(5);
        assert_eq!(shaper.stats().total, 1);

        // New profile with zero delay must not retro-release the queued
        // packet before its already-assigned time.
        shaper.set_profile(Arc::new(NetworkProfile::unimpaired()));
        assert_eq!(shaper.stats().total, 0);
        assert_eq!(shaper.try_drain(), None);
        clock.advance(100);
        assert_eq!(shaper.try_drain(), Some(5));
    }
}
