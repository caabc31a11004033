//! Per-member clock synchronization
//!
//! Estimates each member's clock offset against the session reference clock
//! (this process's wall clock) from heartbeat round trips, using the
//! standard two-way time-transfer estimator:
//!
//! ```text
//! rtt    = (client_receive - client_send) - (server_send - server_receive)
//! offset = ((server_receive - client_send) + (server_send - client_receive)) / 2
//! ```
//!
//! The offset is smoothed with an EWMA; high-rtt samples are down-weighted
//! rather than dropped so the estimate still tracks genuine network
//! degradation. Confidence rises with sample count and falls with rtt
//! jitter; below the configured threshold a member is "unsynced" and its
//! events fall back to arrival-time ordering.

use std::collections::HashMap;

/// Number of recent rtt samples kept per member for the rolling minimum
/// and jitter calculation.
const RTT_SAMPLE_COUNT: usize = 5;

/// Samples needed before confidence can reach 1.0.
const MIN_SAMPLES_FOR_SYNC: u32 = 5;

/// EWMA smoothing factor once warmed up.
const EMA_ALPHA: f64 = 0.15;

/// Faster alpha while the first few samples come in.
const WARMUP_ALPHA: f64 = 0.4;

/// Alpha for outlier samples (rtt well above the rolling minimum).
/// We still learn from them, just much more slowly.
const OUTLIER_ALPHA: f64 = 0.05;

/// An rtt this many times the rolling minimum counts as an outlier.
const OUTLIER_RTT_FACTOR: f64 = 2.0;

/// Jitter scale for the confidence falloff: stddev equal to this value
/// halves the jitter factor.
const JITTER_SCALE_MS: f64 = 25.0;

/// Current time on the session reference clock, in milliseconds since the
/// UNIX epoch.
pub fn reference_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One completed round trip, all four timestamps in epoch milliseconds.
/// Client timestamps are on the member's clock, server timestamps on the
/// reference clock.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ClockSample {
    pub client_send_ms: u64,
    pub server_receive_ms: u64,
    pub server_send_ms: u64,
    pub client_receive_ms: u64,
}

impl ClockSample {
    /// Round-trip time with the server processing gap removed.
    pub fn rtt_ms(&self) -> f64 {
        let total = self.client_receive_ms as i64 - self.client_send_ms as i64;
        let server_gap = self.server_send_ms as i64 - self.server_receive_ms as i64;
        ((total - server_gap).max(0)) as f64
    }

    /// Signed offset such that `reference = member_local + offset`.
    pub fn offset_ms(&self) -> f64 {
        let a = self.server_receive_ms as i64 - self.client_send_ms as i64;
        let b = self.server_send_ms as i64 - self.client_receive_ms as i64;
        (a + b) as f64 / 2.0
    }
}

/// Smoothed estimate of one member's clock against the reference clock.
#[derive(Debug, Clone, Copy)]
pub struct ClockOffsetEstimate {
    /// `reference = member_local + offset_ms`
    pub offset_ms: f64,
    /// Rolling minimum rtt (the most trustworthy sample).
    pub round_trip_ms: f64,
    /// 0.0..=1.0; derived from sample count and rtt jitter.
    pub confidence: f64,
    pub last_updated_ms: u64,
}

/// Offset history for a single member.
#[derive(Debug)]
struct MemberClock {
    offset_ewma_ms: f64,
    /// Recent rtt samples, oldest first.
    rtt_samples: Vec<f64>,
    sample_count: u32,
    last_updated_ms: u64,
}

impl MemberClock {
    fn new() -> Self {
        Self {
            offset_ewma_ms: 0.0,
            rtt_samples: Vec::with_capacity(RTT_SAMPLE_COUNT),
            sample_count: 0,
            last_updated_ms: 0,
        }
    }

    fn min_rtt(&self) -> f64 {
        self.rtt_samples
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn rtt_stddev(&self) -> f64 {
        if self.rtt_samples.len() < 2 {
            return 0.0;
        }
        let n = self.rtt_samples.len() as f64;
        let mean = self.rtt_samples.iter().sum::<f64>() / n;
        let var = self
            .rtt_samples
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f64>()
            / n;
        var.sqrt()
    }

    fn add_sample(&mut self, sample: &ClockSample, now_ms: u64) {
        let rtt = sample.rtt_ms();
        let offset = sample.offset_ms();

        let is_outlier =
            !self.rtt_samples.is_empty() && rtt > self.min_rtt() * OUTLIER_RTT_FACTOR;

        let alpha = if self.sample_count == 0 {
            1.0 // First sample seeds the EWMA directly
        } else if is_outlier {
            OUTLIER_ALPHA
        } else if self.sample_count < MIN_SAMPLES_FOR_SYNC {
            WARMUP_ALPHA
        } else {
            EMA_ALPHA
        };

        self.offset_ewma_ms = alpha * offset + (1.0 - alpha) * self.offset_ewma_ms;

        if self.rtt_samples.len() >= RTT_SAMPLE_COUNT {
            self.rtt_samples.remove(0);
        }
        self.rtt_samples.push(rtt);

        self.sample_count = self.sample_count.saturating_add(1);
        self.last_updated_ms = now_ms;

        if is_outlier {
            tracing::debug!(
                "clock sample outlier: rtt={:.0}ms (min={:.0}ms), damped alpha={}",
                rtt,
                self.min_rtt(),
                OUTLIER_ALPHA
            );
        }
    }

    fn estimate(&self) -> ClockOffsetEstimate {
        let count_factor = (self.sample_count as f64 / MIN_SAMPLES_FOR_SYNC as f64).min(1.0);
        let jitter_factor = JITTER_SCALE_MS / (JITTER_SCALE_MS + self.rtt_stddev());
        ClockOffsetEstimate {
            offset_ms: self.offset_ewma_ms,
            round_trip_ms: if self.rtt_samples.is_empty() {
                0.0
            } else {
                self.min_rtt()
            },
            confidence: count_factor * jitter_factor,
            last_updated_ms: self.last_updated_ms,
        }
    }
}

/// Tracks clock offsets for every member of one session.
///
/// Estimates are per member and never shared across sessions; each member's
/// estimate is updated only from that member's own round trips.
#[derive(Debug)]
pub struct ClockSync {
    members: HashMap<String, MemberClock>,
    min_confidence: f64,
}

impl ClockSync {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            members: HashMap::new(),
            min_confidence,
        }
    }

    /// Fold one completed round trip into the member's estimate.
    pub fn record_sample(
        &mut self,
        member_id: &str,
        sample: ClockSample,
        now_ms: u64,
    ) -> ClockOffsetEstimate {
        let clock = self
            .members
            .entry(member_id.to_string())
            .or_insert_with(MemberClock::new);
        clock.add_sample(&sample, now_ms);
        let estimate = clock.estimate();
        tracing::debug!(
            "clock {}: offset={:+.1}ms rtt={:.0}ms confidence={:.2}",
            member_id,
            estimate.offset_ms,
            estimate.round_trip_ms,
            estimate.confidence
        );
        estimate
    }

    pub fn estimate(&self, member_id: &str) -> Option<ClockOffsetEstimate> {
        self.members.get(member_id).map(|c| c.estimate())
    }

    /// Whether the member's estimate is trustworthy enough for strict
    /// timestamp ordering.
    pub fn is_synced(&self, member_id: &str) -> bool {
        self.estimate(member_id)
            .map(|e| e.confidence >= self.min_confidence)
            .unwrap_or(false)
    }

    /// Convert a member-local timestamp to reference time. `None` when the
    /// member is unsynced; callers fall back to arrival time.
    pub fn to_reference(&self, member_id: &str, member_local_ms: u64) -> Option<u64> {
        if !self.is_synced(member_id) {
            return None;
        }
        let offset = self.members.get(member_id)?.estimate().offset_ms;
        let adjusted = member_local_ms as i64 + offset.round() as i64;
        Some(adjusted.max(0) as u64)
    }

    /// Drop all state for a member (on leave).
    pub fn forget(&mut self, member_id: &str) {
        self.members.remove(member_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A symmetric round trip: client clock 150ms behind reference, 40ms rtt.
    fn sample(client_send: u64) -> ClockSample {
        // Reference time at client_send is client_send + 150.
        ClockSample {
            client_send_ms: client_send,
            server_receive_ms: client_send + 150 + 20,
            server_send_ms: client_send + 150 + 20,
            client_receive_ms: client_send + 40,
        }
    }

    #[test]
    fn test_two_way_estimator_math() {
        let s = sample(1_000);
        assert_eq!(s.rtt_ms(), 40.0);
        assert_eq!(s.offset_ms(), 150.0);
    }

    #[test]
    fn test_confidence_crosses_threshold_after_consistent_samples() {
        let mut clock = ClockSync::new(0.5);

        // One sample is not enough to trust the estimate
        clock.record_sample("m1", sample(1_000), 1_000);
        assert!(!clock.is_synced("m1"));
        assert!(clock.to_reference("m1", 5_000).is_none());

        // Five consistent samples (rtt=40, offset=+150) cross the threshold
        for i in 1..5 {
            clock.record_sample("m1", sample(1_000 + i * 2_000), 1_000 + i * 2_000);
        }
        assert!(clock.is_synced("m1"));

        let est = clock.estimate("m1").unwrap();
        assert!((est.offset_ms - 150.0).abs() < 1.0, "offset={}", est.offset_ms);
        assert_eq!(est.round_trip_ms, 40.0);

        // Conversion applies the offset
        assert_eq!(clock.to_reference("m1", 10_000), Some(10_150));
    }

    #[test]
    fn test_outlier_rtt_is_downweighted_not_dropped() {
        let mut clock = ClockSync::new(0.5);
        for i in 0..5 {
            clock.record_sample("m1", sample(i * 2_000), i * 2_000);
        }
        let before = clock.estimate("m1").unwrap();

        // A congested round trip reporting a wildly different offset
        let outlier = ClockSample {
            client_send_ms: 20_000,
            server_receive_ms: 20_000 + 150 + 400, // asymmetric delay skews offset
            server_send_ms: 20_000 + 150 + 400,
            client_receive_ms: 20_000 + 500,
        };
        clock.record_sample("m1", outlier, 20_000);

        let after = clock.estimate("m1").unwrap();
        // The estimate moved (never simply dropped) but only slightly
        assert!(after.offset_ms != before.offset_ms);
        assert!((after.offset_ms - before.offset_ms).abs() < 15.0);
        // Rolling-minimum rtt is unaffected by the slow sample
        assert_eq!(after.round_trip_ms, 40.0);
    }

    #[test]
    fn test_jitter_lowers_confidence() {
        let mut steady = ClockSync::new(0.5);
        let mut jittery = ClockSync::new(0.5);

        for i in 0..5u64 {
            steady.record_sample("m", sample(i * 2_000), i * 2_000);
            // rtt swinging between 40ms and 240ms
            let extra = if i % 2 == 0 { 0 } else { 200 };
            let s = ClockSample {
                client_send_ms: i * 2_000,
                server_receive_ms: i * 2_000 + 170,
                server_send_ms: i * 2_000 + 170,
                client_receive_ms: i * 2_000 + 40 + extra,
            };
            jittery.record_sample("m", s, i * 2_000);
        }

        let steady_conf = steady.estimate("m").unwrap().confidence;
        let jittery_conf = jittery.estimate("m").unwrap().confidence;
        assert!(steady_conf > jittery_conf);
    }

    #[test]
    fn test_forget_member() {
        let mut clock = ClockSync::new(0.5);
        for i in 0..5 {
            clock.record_sample("m1", sample(i * 2_000), i * 2_000);
        }
        assert!(clock.is_synced("m1"));

        clock.forget("m1");
        assert!(clock.estimate("m1").is_none());
        assert!(!clock.is_synced("m1"));
    }
}
