// src/queue_window.rs
//
// Queue-length windows bounded by signal onsets: red-onset opens a
// window, per-second count folds accumulate running maxima, green-onset
// closes the window into a snapshot.

use crate::types::{LaneQueue, QueueSnapshotPayload};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct QueueAggregator {
    window_start: Option<f64>,
    running_max: BTreeMap<u32, u32>,
    /// First green onset after start has no baseline and must report
    /// nothing.
    seen_green: bool,
}

impl QueueAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Red for the approach: clear the maxima and open a fresh window.
    pub fn on_red_onset(&mut self, timestamp: f64) {
        self.running_max.clear();
        self.window_start = Some(timestamp);
        debug!("queue window opens at {:.3}", timestamp);
    }

    /// Called roughly once per second while red; folds the current
    /// per-lane counts into the running maxima. Ignored outside a window.
    pub fn on_update_counts(&mut self, lane_counts: &BTreeMap<u32, u32>) {
        if self.window_start.is_none() {
            return;
        }
        for (&lane, &count) in lane_counts {
            let entry = self.running_max.entry(lane).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Green for the approach: close the window into a snapshot. Residuals
    /// come from the external signal source; a lane with no recorded
    /// maximum reports its residual as the maximum.
    pub fn on_green_onset(
        &mut self,
        timestamp: f64,
        residuals: &BTreeMap<u32, u32>,
    ) -> Option<QueueSnapshotPayload> {
        if !self.seen_green {
            self.seen_green = true;
            self.running_max.clear();
            self.window_start = None;
            debug!("first green onset, no queue baseline yet");
            return None;
        }

        let window_start = self.window_start.take().unwrap_or(timestamp);

        let mut lanes: Vec<u32> = residuals.keys().copied().collect();
        for lane in self.running_max.keys() {
            if !residuals.contains_key(lane) {
                lanes.push(*lane);
            }
        }
        lanes.sort_unstable();

        let per_lane: Vec<LaneQueue> = lanes
            .into_iter()
            .map(|lane| {
                let residual = residuals.get(&lane).copied().unwrap_or(0);
                let max = self.running_max.get(&lane).copied().unwrap_or(residual);
                LaneQueue {
                    lane,
                    residual,
                    max,
                }
            })
            .collect();

        let approach_residual = per_lane.iter().map(|l| l.residual).sum();
        let approach_max = per_lane.iter().map(|l| l.max).sum();
        self.running_max.clear();

        Some(QueueSnapshotPayload {
            window_start,
            window_end: timestamp,
            per_lane,
            approach_residual,
            approach_max,
            image_path: None,
            image_file: None,
        })
    }
}
