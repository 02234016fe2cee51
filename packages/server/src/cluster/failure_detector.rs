//! Phi-accrual and deadline failure detectors.
//!
//! Two implementations of the [`FailureDetector`] trait:
//! - [`PhiAccrualFailureDetector`]: statistical detection from the heartbeat
//!   inter-arrival distribution, following the phi-accrual failure detector
//!   paper (Hayashibara et al., 2004). Phi is the negative base-10 log of
//!   the probability that a silence at least this long would occur under the
//!   node's historical interval distribution, so it grows without bound
//!   while a node stays quiet.
//! - [`DeadlineFailureDetector`]: fixed-deadline detection for tests.
//!
//! Interval statistics are kept incrementally: each recorded heartbeat
//! updates running sums alongside the bounded sample window, so computing a
//! suspicion score is O(1) and never walks the window. Heartbeats reach the
//! detector only when the gossip executor accepts a strictly newer
//! `(generation, version)`, so replayed or reordered packets cannot keep a
//! dead node looking alive.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use lodestone_core::NodeId;

use super::traits::FailureDetector;
use super::types::PhiAccrualConfig;

/// Below this many recorded intervals the normal fit is meaningless and the
/// detector scales suspicion linearly toward the threshold instead.
const MIN_WINDOW_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Incremental interval statistics
// ---------------------------------------------------------------------------

/// Bounded inter-arrival window with running first and second moments.
///
/// Invariant: `interval_sum` and `interval_sq_sum` always equal the sums
/// over exactly the intervals currently in `window`.
struct HeartbeatStats {
    /// Timestamp of the most recent heartbeat (monotonic ms).
    last_arrival_ms: u64,
    window: VecDeque<u64>,
    interval_sum: u64,
    interval_sq_sum: u128,
}

impl HeartbeatStats {
    /// First heartbeat: anchor only, no interval yet.
    fn anchored_at(now_ms: u64) -> Self {
        Self {
            last_arrival_ms: now_ms,
            window: VecDeque::new(),
            interval_sum: 0,
            interval_sq_sum: 0,
        }
    }

    /// Appends one interval and evicts from the front down to `capacity`.
    fn record(&mut self, interval: u64, capacity: usize) {
        self.window.push_back(interval);
        self.interval_sum += interval;
        self.interval_sq_sum += u128::from(interval) * u128::from(interval);
        while self.window.len() > capacity {
            if let Some(evicted) = self.window.pop_front() {
                self.interval_sum -= evicted;
                self.interval_sq_sum -= u128::from(evicted) * u128::from(evicted);
            }
        }
    }

    /// Mean and floored standard deviation of the window, or `None` while
    /// the window is too small for a normal fit.
    #[allow(clippy::cast_precision_loss)]
    fn normal_fit(&self, std_dev_floor_ms: u64) -> Option<(f64, f64)> {
        if self.window.len() < MIN_WINDOW_LEN {
            return None;
        }
        let n = self.window.len() as f64;
        let mean = self.interval_sum as f64 / n;
        // E[X^2] - E[X]^2; clamp the float residue away from negative zero.
        let variance = (self.interval_sq_sum as f64 / n - mean * mean).max(0.0);
        let std_dev = variance.sqrt().max(std_dev_floor_ms as f64);
        Some((mean, std_dev))
    }
}

// ---------------------------------------------------------------------------
// Phi-accrual failure detector
// ---------------------------------------------------------------------------

/// Statistical failure detector using the phi-accrual algorithm.
///
/// Phi 8 with a 1s heartbeat period corresponds to roughly a one-in-10^8
/// chance that the silence is ordinary jitter rather than a failure.
pub struct PhiAccrualFailureDetector {
    config: PhiAccrualConfig,
    stats: RwLock<HashMap<NodeId, HeartbeatStats>>,
}

impl PhiAccrualFailureDetector {
    #[must_use]
    pub fn new(config: PhiAccrualConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
        }
    }
}

impl FailureDetector for PhiAccrualFailureDetector {
    fn notify_heartbeat(&self, node_id: NodeId, now_ms: u64) {
        match self.stats.write().entry(node_id) {
            Entry::Occupied(mut slot) => {
                let stats = slot.get_mut();
                let interval = now_ms.saturating_sub(stats.last_arrival_ms);
                stats.last_arrival_ms = now_ms;
                stats.record(interval, self.config.max_sample_size);
            }
            Entry::Vacant(slot) => {
                slot.insert(HeartbeatStats::anchored_at(now_ms));
            }
        }
    }

    fn is_alive(&self, node_id: NodeId, now_ms: u64) -> bool {
        self.suspicion(node_id, now_ms) < self.config.phi_threshold
    }

    fn last_heartbeat(&self, node_id: NodeId) -> Option<u64> {
        self.stats
            .read()
            .get(&node_id)
            .map(|stats| stats.last_arrival_ms)
    }

    #[allow(clippy::cast_precision_loss)]
    fn suspicion(&self, node_id: NodeId, now_ms: u64) -> f64 {
        let stats = self.stats.read();
        let Some(stats) = stats.get(&node_id) else {
            // Never heard from: no evidence of failure.
            return 0.0;
        };
        let elapsed = now_ms.saturating_sub(stats.last_arrival_ms) as f64;

        match stats.normal_fit(self.config.min_std_dev_ms) {
            // Window too small for statistics: grow linearly, hitting the
            // threshold once the whole no-heartbeat budget is spent.
            None => {
                self.config.phi_threshold * elapsed / self.config.max_no_heartbeat_ms as f64
            }
            Some((mean, std_dev)) => {
                // Clamping the tail at the smallest positive double bounds
                // phi at a finite ~308.
                let survival = normal_tail(elapsed, mean, std_dev).max(f64::MIN_POSITIVE);
                (-survival.log10()).max(0.0)
            }
        }
    }

    fn remove(&self, node_id: NodeId) {
        self.stats.write().remove(&node_id);
    }

    fn reset(&self) {
        self.stats.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Normal tail probability
// ---------------------------------------------------------------------------

/// P(X > x) for a normal distribution with the given mean and deviation:
/// `0.5 * erfc((x - mean) / (std_dev * sqrt(2)))`.
fn normal_tail(x: f64, mean: f64, std_dev: f64) -> f64 {
    0.5 * erfc((x - mean) / (std_dev * std::f64::consts::SQRT_2))
}

/// Complementary error function via the rational approximation of
/// Abramowitz and Stegun, formula 7.1.26 (|error| < 1.5e-7).
fn erfc(x: f64) -> f64 {
    // Coefficients a1..a5 of the published formula, lowest order first.
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];

    let ax = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * ax);
    let series = A.iter().rev().fold(0.0, |acc, &a| acc * t + a);
    let tail = series * t * (-ax * ax).exp();

    // Reflection for the negative half: erfc(-x) = 2 - erfc(x).
    if x < 0.0 {
        2.0 - tail
    } else {
        tail
    }
}

// ---------------------------------------------------------------------------
// Deadline failure detector (for testing)
// ---------------------------------------------------------------------------

/// A node is dead once its silence exceeds a fixed deadline. Deterministic;
/// intended for tests and simulations.
pub struct DeadlineFailureDetector {
    deadline_ms: u64,
    last_seen: RwLock<HashMap<NodeId, u64>>,
}

/// Suspicion value a deadline detector reports exactly at its deadline,
/// chosen to line up with the phi detector's default threshold.
const DEADLINE_PHI: f64 = 8.0;

impl DeadlineFailureDetector {
    #[must_use]
    pub fn new(deadline_ms: u64) -> Self {
        Self {
            deadline_ms,
            last_seen: RwLock::new(HashMap::new()),
        }
    }
}

impl FailureDetector for DeadlineFailureDetector {
    fn notify_heartbeat(&self, node_id: NodeId, now_ms: u64) {
        self.last_seen.write().insert(node_id, now_ms);
    }

    fn is_alive(&self, node_id: NodeId, now_ms: u64) -> bool {
        self.suspicion(node_id, now_ms) <= DEADLINE_PHI
    }

    fn last_heartbeat(&self, node_id: NodeId) -> Option<u64> {
        self.last_seen.read().get(&node_id).copied()
    }

    #[allow(clippy::cast_precision_loss)]
    fn suspicion(&self, node_id: NodeId, now_ms: u64) -> f64 {
        // No heartbeat recorded means no evidence of failure.
        self.last_seen.read().get(&node_id).map_or(0.0, |&last| {
            let overdue = now_ms.saturating_sub(last) as f64;
            DEADLINE_PHI * overdue / self.deadline_ms as f64
        })
    }

    fn remove(&self, node_id: NodeId) {
        self.last_seen.write().remove(&node_id);
    }

    fn reset(&self) {
        self.last_seen.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
