// src/stats_window.rs
//
// Dual-window per-lane density/occupancy aggregation. The interval
// window closes on wall-clock-aligned boundaries; the signal-phase
// window closes on every red-to-green transition and spans the previous
// one. The two windows never share accumulators: per-frame lane counts
// are folded into both, and each resets only after its own close.

use crate::types::{ApproachStats, LaneStats, StatsWindowPayload, WindowConfig, WindowType};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct LaneAccum {
    total: u64,
    max: u32,
    min_seen: u32,
    frames_seen: u64,
}

#[derive(Debug, Default)]
struct WindowAccum {
    start: Option<f64>,
    frames: u64,
    lanes: BTreeMap<u32, LaneAccum>,
}

impl WindowAccum {
    fn fold(&mut self, counts: &BTreeMap<u32, u32>) {
        self.frames += 1;
        for (&lane, &count) in counts {
            let acc = self.lanes.entry(lane).or_default();
            acc.total += count as u64;
            acc.frames_seen += 1;
            if count > acc.max {
                acc.max = count;
            }
            if acc.frames_seen == 1 || count < acc.min_seen {
                acc.min_seen = count;
            }
        }
    }

    fn reset(&mut self, start: f64) {
        self.frames = 0;
        self.lanes.clear();
        self.start = Some(start);
    }
}

pub struct StatsAggregator {
    /// Metric lane lengths derived from calibration at startup.
    lane_lengths: BTreeMap<u32, f64>,
    default_lane_length_m: f64,
    interval_secs: f64,
    interval: WindowAccum,
    phase: WindowAccum,
}

impl StatsAggregator {
    pub fn new(cfg: &WindowConfig, lane_lengths: BTreeMap<u32, f64>, default_lane_length_m: f64) -> Self {
        Self {
            lane_lengths,
            default_lane_length_m,
            interval_secs: (cfg.interval_minutes * 60) as f64,
            interval: WindowAccum::default(),
            phase: WindowAccum::default(),
        }
    }

    /// Epoch instant of the next aligned interval boundary after `now`:
    /// a 5 minute period closes at :00/:05/:10, never at start+5.
    pub fn next_interval_boundary(&self, now: f64) -> f64 {
        let period = self.interval_secs;
        ((now / period).floor() + 1.0) * period
    }

    pub fn start_interval(&mut self, now: f64) {
        self.interval.reset(now);
    }

    /// Per-frame lane counts feed both windows.
    pub fn fold_counts(&mut self, counts: &BTreeMap<u32, u32>) {
        self.interval.fold(counts);
        self.phase.fold(counts);
    }

    /// Timer context, at an aligned boundary.
    pub fn close_interval(&mut self, now: f64) -> Option<StatsWindowPayload> {
        let payload = self.close(WindowType::Interval, now);
        self.interval.reset(now);
        payload
    }

    /// Signal context, on every red-to-green transition. The first
    /// transition only anchors the span.
    pub fn close_phase(&mut self, now: f64) -> Option<StatsWindowPayload> {
        if self.phase.start.is_none() {
            debug!("phase stats window anchored at {:.3}", now);
            self.phase.reset(now);
            return None;
        }
        let payload = self.close(WindowType::SignalPhase, now);
        self.phase.reset(now);
        payload
    }

    fn lane_length_m(&self, lane: u32) -> f64 {
        self.lane_lengths
            .get(&lane)
            .copied()
            .unwrap_or(self.default_lane_length_m)
    }

    fn close(&self, window_type: WindowType, now: f64) -> Option<StatsWindowPayload> {
        let acc = match window_type {
            WindowType::Interval => &self.interval,
            WindowType::SignalPhase => &self.phase,
        };
        if acc.frames == 0 || acc.lanes.is_empty() {
            return None;
        }
        let window_start = acc.start.unwrap_or(now);
        let grand_total: u64 = acc.lanes.values().map(|l| l.total).sum();

        let per_lane: Vec<LaneStats> = acc
            .lanes
            .iter()
            .map(|(&lane, l)| {
                let per_km = 1000.0 / self.lane_length_m(lane);
                // A lane absent from some frames was empty in them.
                let min_count = if l.frames_seen < acc.frames { 0 } else { l.min_seen };
                LaneStats {
                    lane,
                    total_volume: l.total,
                    avg_density: (l.total as f64 / acc.frames as f64) * per_km,
                    min_density: min_count as f64 * per_km,
                    max_density: l.max as f64 * per_km,
                    occupancy_share: if grand_total > 0 {
                        l.total as f64 / grand_total as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        let with_traffic: Vec<&LaneStats> =
            per_lane.iter().filter(|l| l.total_volume > 0).collect();
        let n = with_traffic.len().max(1) as f64;
        let approach = ApproachStats {
            total_volume: grand_total,
            avg_density: with_traffic.iter().map(|l| l.avg_density).sum::<f64>() / n,
            min_density: with_traffic.iter().map(|l| l.min_density).sum::<f64>() / n,
            max_density: with_traffic.iter().map(|l| l.max_density).sum::<f64>() / n,
            avg_occupancy: with_traffic.iter().map(|l| l.occupancy_share).sum::<f64>() / n,
        };

        Some(StatsWindowPayload {
            window_type,
            window_start,
            window_end: now,
            approach,
            per_lane,
        })
    }
}
