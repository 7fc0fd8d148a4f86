// src/pipeline/counters.rs
//
// Second shared guard of the core: the per-lane counters the frame
// context writes every frame and the timer/signal contexts read and
// reset. Kept separate from the track/incident guard so aggregation
// never contends with the hot path's incident lock.

use crate::queue_window::QueueAggregator;
use crate::stats_window::StatsAggregator;
use std::collections::BTreeMap;

pub struct LaneCounters {
    latest: BTreeMap<u32, u32>,
    pub queue: QueueAggregator,
    pub stats: StatsAggregator,
    queue_enabled: bool,
    stats_enabled: bool,
}

impl LaneCounters {
    pub fn new(stats: StatsAggregator) -> Self {
        Self {
            latest: BTreeMap::new(),
            queue: QueueAggregator::new(),
            stats,
            queue_enabled: true,
            stats_enabled: true,
        }
    }

    /// A window feature whose config was rejected stays dark: counts are
    /// still recorded, but nothing accumulates or publishes for it.
    pub fn set_window_features(&mut self, queue: bool, stats: bool) {
        self.queue_enabled = queue;
        self.stats_enabled = stats;
    }

    pub fn queue_enabled(&self) -> bool {
        self.queue_enabled
    }

    pub fn stats_enabled(&self) -> bool {
        self.stats_enabled
    }

    /// Frame context: record this frame's counts and feed both stats
    /// windows.
    pub fn fold_frame(&mut self, counts: BTreeMap<u32, u32>) {
        if self.stats_enabled {
            self.stats.fold_counts(&counts);
        }
        self.latest = counts;
    }

    /// Timer context, roughly once per second while red.
    pub fn sample_queue(&mut self) {
        if self.queue_enabled {
            self.queue.on_update_counts(&self.latest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WindowConfig;

    fn make_counters() -> LaneCounters {
        let cfg = WindowConfig {
            interval_minutes: 5,
            queue_sample_secs: 1.0,
        };
        LaneCounters::new(StatsAggregator::new(&cfg, BTreeMap::new(), 150.0))
    }

    #[test]
    fn test_fold_feeds_stats_and_queue_sampling() {
        let mut c = make_counters();
        c.stats.start_interval(0.0);
        c.queue.on_green_onset(0.0, &BTreeMap::new()); // discard baseline
        c.queue.on_red_onset(10.0);

        c.fold_frame([(1, 3)].into_iter().collect());
        c.sample_queue();
        c.fold_frame([(1, 2)].into_iter().collect());
        c.sample_queue();

        let snap = c
            .queue
            .on_green_onset(40.0, &[(1, 1)].into_iter().collect())
            .unwrap();
        assert_eq!(snap.per_lane[0].max, 3);

        let stats = c.stats.close_interval(300.0).unwrap();
        assert_eq!(stats.per_lane[0].total_volume, 5);
    }

    #[test]
    fn test_disabled_windows_stop_accumulating() {
        let mut c = make_counters();
        c.set_window_features(false, false);
        c.stats.start_interval(0.0);
        c.queue.on_green_onset(0.0, &BTreeMap::new()); // discard baseline
        c.queue.on_red_onset(10.0);

        c.fold_frame([(1, 3)].into_iter().collect());
        c.sample_queue();

        // No stats were folded, and the queue fold never landed so the
        // maximum falls back to the residual.
        assert!(c.stats.close_interval(300.0).is_none());
        let snap = c
            .queue
            .on_green_onset(40.0, &[(1, 1)].into_iter().collect())
            .unwrap();
        assert_eq!(snap.per_lane[0].max, 1);
    }
}
