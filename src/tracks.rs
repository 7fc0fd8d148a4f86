// src/tracks.rs
//
// Per-tracked-object mutable state. Records are created on first sight,
// mutated every frame by the owning (frame) context, and removed only
// through eviction or an external deletion notice.

use crate::signal::SignalPhase;
use crate::types::{BoundingBox, Point};
use std::collections::{BTreeMap, HashMap};

/// Incident id 0 means "no open incident of this kind".
pub const NO_INCIDENT: u64 = 0;

/// One-way latch for the reverse-driving one-shot: once `Fired`, never
/// re-arms for the lifetime of the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseLatch {
    Armed,
    Fired,
}

/// Accumulating reverse-motion window. Reset whenever the gating
/// conditions fail or the object moves forward; the latch is untouched by
/// resets.
#[derive(Debug, Clone, Copy)]
pub struct ReverseWindow {
    /// Travel-axis ordinate at window start.
    pub baseline_ordinate: f64,
    pub window_start: Option<f64>,
    pub latch: ReverseLatch,
    /// Open reverse incident id plus the wall-clock instant its
    /// auto-scheduled end is due.
    pub pending_end: Option<(u64, f64)>,
}

impl ReverseWindow {
    fn new() -> Self {
        Self {
            baseline_ordinate: 0.0,
            window_start: None,
            latch: ReverseLatch::Armed,
            pending_end: None,
        }
    }

    pub fn reset_window(&mut self) {
        self.baseline_ordinate = 0.0;
        self.window_start = None;
    }
}

/// Chained incident sub-states. Each stage is an incident id (0 = none);
/// the snapshots discriminate the phase/cycle escalation rules.
#[derive(Debug, Clone, Copy)]
pub struct ChainState {
    pub stopped_incident: u64,
    pub tailgating_incident: u64,
    pub accident_incident: u64,
    /// When the current sub-threshold-speed dwell began.
    pub stop_since: Option<f64>,
    pub stop_start_phase: Option<SignalPhase>,
    pub tailgate_start_cycle: Option<u64>,
}

impl ChainState {
    fn new() -> Self {
        Self {
            stopped_incident: NO_INCIDENT,
            tailgating_incident: NO_INCIDENT,
            accident_incident: NO_INCIDENT,
            stop_since: None,
            stop_start_phase: None,
            tailgate_start_cycle: None,
        }
    }

    pub fn open_ids(&self) -> Vec<u64> {
        [self.stopped_incident, self.tailgating_incident, self.accident_incident]
            .into_iter()
            .filter(|&id| id != NO_INCIDENT)
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[derive(Debug, Clone)]
pub struct TrackedVehicle {
    pub object_id: u64,
    pub last_position: Point,
    pub last_seen: f64,
    /// Most recent detection box, kept for incident evidence crops.
    pub last_bbox: Option<BoundingBox>,
    /// Roughly one-second-ago position used for speed sampling.
    pub sample_position: Point,
    pub sample_time: f64,
    pub lane_id: u32,
    pub turn_code: i32,
    pub speed_kmh: f64,
    pub avg_speed_kmh: f64,
    speed_samples: u64,
    pub near_stop_line: bool,
    pub chain: ChainState,
    pub reverse: ReverseWindow,
    pub crossing_recorded: bool,
}

impl TrackedVehicle {
    pub fn new(object_id: u64, position: Point, timestamp: f64) -> Self {
        Self {
            object_id,
            last_position: position,
            last_seen: timestamp,
            last_bbox: None,
            sample_position: position,
            sample_time: timestamp,
            lane_id: 0,
            turn_code: crate::regions::TURN_NONE,
            speed_kmh: -1.0,
            avg_speed_kmh: 0.0,
            speed_samples: 0,
            near_stop_line: false,
            chain: ChainState::new(),
            reverse: ReverseWindow::new(),
            crossing_recorded: false,
        }
    }

    /// Move the track to a new observation. Returns the (from, to, dt)
    /// speed sample when at least a second has elapsed since the last one;
    /// the sample baseline then rolls forward.
    pub fn advance(&mut self, position: Point, timestamp: f64) -> Option<(Point, Point, f64)> {
        let prev_sample = self.sample_position;
        let dt = timestamp - self.sample_time;

        self.last_position = position;
        self.last_seen = timestamp;

        if dt >= 1.0 {
            self.sample_position = position;
            self.sample_time = timestamp;
            Some((prev_sample, position, dt))
        } else {
            None
        }
    }

    pub fn record_speed(&mut self, speed_kmh: f64) {
        if speed_kmh < 0.0 {
            return;
        }
        self.speed_kmh = speed_kmh;
        self.speed_samples += 1;
        let n = self.speed_samples as f64;
        self.avg_speed_kmh += (speed_kmh - self.avg_speed_kmh) / n;
    }

    pub fn open_incident_ids(&self) -> Vec<u64> {
        let mut ids = self.chain.open_ids();
        if let Some((id, _)) = self.reverse.pending_end {
            ids.push(id);
        }
        ids
    }
}

#[derive(Debug, Clone)]
pub struct TrackedPedestrian {
    pub object_id: u64,
    pub last_position: Point,
    pub last_seen: f64,
    pub last_bbox: Option<BoundingBox>,
    pub jaywalk_incident: u64,
}

impl TrackedPedestrian {
    pub fn new(object_id: u64, position: Point, timestamp: f64) -> Self {
        Self {
            object_id,
            last_position: position,
            last_seen: timestamp,
            last_bbox: None,
            jaywalk_incident: NO_INCIDENT,
        }
    }
}

/// Owned table of all live tracks. Eviction is the only removal path
/// besides explicit external deletion.
#[derive(Debug, Default)]
pub struct TrackTable {
    vehicles: HashMap<u64, TrackedVehicle>,
    pedestrians: HashMap<u64, TrackedPedestrian>,
}

impl TrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vehicle_mut(&mut self, id: u64) -> Option<&mut TrackedVehicle> {
        self.vehicles.get_mut(&id)
    }

    pub fn vehicle(&self, id: u64) -> Option<&TrackedVehicle> {
        self.vehicles.get(&id)
    }

    pub fn pedestrian(&self, id: u64) -> Option<&TrackedPedestrian> {
        self.pedestrians.get(&id)
    }

    pub fn pedestrian_mut(&mut self, id: u64) -> Option<&mut TrackedPedestrian> {
        self.pedestrians.get_mut(&id)
    }

    pub fn vehicle_entry(&mut self, id: u64, position: Point, timestamp: f64) -> &mut TrackedVehicle {
        self.vehicles
            .entry(id)
            .or_insert_with(|| TrackedVehicle::new(id, position, timestamp))
    }

    pub fn pedestrian_entry(
        &mut self,
        id: u64,
        position: Point,
        timestamp: f64,
    ) -> &mut TrackedPedestrian {
        self.pedestrians
            .entry(id)
            .or_insert_with(|| TrackedPedestrian::new(id, position, timestamp))
    }

    pub fn remove_vehicle(&mut self, id: u64) -> Option<TrackedVehicle> {
        self.vehicles.remove(&id)
    }

    pub fn remove_pedestrian(&mut self, id: u64) -> Option<TrackedPedestrian> {
        self.pedestrians.remove(&id)
    }

    /// Remove and return every track idle beyond `timeout_secs`. The
    /// caller owns force-closing any incidents the evicted records still
    /// reference.
    pub fn take_idle(
        &mut self,
        now: f64,
        timeout_secs: f64,
    ) -> (Vec<TrackedVehicle>, Vec<TrackedPedestrian>) {
        let stale_vehicles: Vec<u64> = self
            .vehicles
            .values()
            .filter(|v| now - v.last_seen > timeout_secs)
            .map(|v| v.object_id)
            .collect();
        let stale_peds: Vec<u64> = self
            .pedestrians
            .values()
            .filter(|p| now - p.last_seen > timeout_secs)
            .map(|p| p.object_id)
            .collect();

        (
            stale_vehicles
                .into_iter()
                .filter_map(|id| self.vehicles.remove(&id))
                .collect(),
            stale_peds
                .into_iter()
                .filter_map(|id| self.pedestrians.remove(&id))
                .collect(),
        )
    }

    pub fn vehicle_ids_with_open_chain(&self) -> Vec<u64> {
        self.vehicles
            .values()
            .filter(|v| !v.chain.open_ids().is_empty())
            .map(|v| v.object_id)
            .collect()
    }

    pub fn vehicle_ids_with_pending_reverse_end(&self) -> Vec<u64> {
        self.vehicles
            .values()
            .filter(|v| v.reverse.pending_end.is_some())
            .map(|v| v.object_id)
            .collect()
    }

    /// Drop every reference to a closed incident id so no track keeps a
    /// dangling handle.
    pub fn scrub_incident(&mut self, id: u64) {
        for v in self.vehicles.values_mut() {
            if v.chain.stopped_incident == id {
                v.chain.stopped_incident = NO_INCIDENT;
            }
            if v.chain.tailgating_incident == id {
                v.chain.tailgating_incident = NO_INCIDENT;
            }
            if v.chain.accident_incident == id {
                v.chain.accident_incident = NO_INCIDENT;
            }
            if matches!(v.reverse.pending_end, Some((pending, _)) if pending == id) {
                v.reverse.pending_end = None;
            }
        }
        for p in self.pedestrians.values_mut() {
            if p.jaywalk_incident == id {
                p.jaywalk_incident = NO_INCIDENT;
            }
        }
    }

    /// Current vehicle count per lane, keyed by lane id; lane 0 (outside
    /// any lane) is excluded.
    pub fn lane_counts(&self) -> BTreeMap<u32, u32> {
        let mut counts = BTreeMap::new();
        for v in self.vehicles.values() {
            if v.lane_id != 0 {
                *counts.entry(v.lane_id).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_rolls_sample_after_one_second() {
        let mut v = TrackedVehicle::new(7, Point::new(0.0, 0.0), 100.0);

        assert!(v.advance(Point::new(1.0, 0.0), 100.4).is_none());
        assert!(v.advance(Point::new(2.0, 0.0), 100.9).is_none());

        let (from, to, dt) = v.advance(Point::new(3.0, 0.0), 101.1).unwrap();
        assert_eq!(from, Point::new(0.0, 0.0));
        assert_eq!(to, Point::new(3.0, 0.0));
        assert!((dt - 1.1).abs() < 1e-9);

        // Baseline rolled forward.
        assert_eq!(v.sample_position, Point::new(3.0, 0.0));
    }

    #[test]
    fn test_record_speed_running_average() {
        let mut v = TrackedVehicle::new(7, Point::new(0.0, 0.0), 0.0);
        v.record_speed(10.0);
        v.record_speed(20.0);
        v.record_speed(30.0);
        assert!((v.avg_speed_kmh - 20.0).abs() < 1e-9);
        assert_eq!(v.speed_kmh, 30.0);

        // Sentinel speeds are ignored.
        v.record_speed(-1.0);
        assert_eq!(v.speed_kmh, 30.0);
    }

    #[test]
    fn test_take_idle_leaves_fresh_tracks() {
        let mut table = TrackTable::new();
        table.vehicle_entry(1, Point::new(0.0, 0.0), 100.0);
        table.vehicle_entry(2, Point::new(0.0, 0.0), 150.0);
        table.pedestrian_entry(3, Point::new(0.0, 0.0), 100.0);

        let (vehicles, peds) = table.take_idle(161.0, 30.0);
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].object_id, 1);
        assert_eq!(peds.len(), 1);
        assert!(table.vehicle(2).is_some());
        assert!(table.vehicle(1).is_none());
    }

    #[test]
    fn test_lane_counts_skip_unassigned() {
        let mut table = TrackTable::new();
        table.vehicle_entry(1, Point::new(0.0, 0.0), 0.0).lane_id = 1;
        table.vehicle_entry(2, Point::new(0.0, 0.0), 0.0).lane_id = 1;
        table.vehicle_entry(3, Point::new(0.0, 0.0), 0.0).lane_id = 2;
        table.vehicle_entry(4, Point::new(0.0, 0.0), 0.0); // lane 0

        let counts = table.lane_counts();
        assert_eq!(counts.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&1));
        assert_eq!(counts.get(&0), None);
    }

    #[test]
    fn test_open_incident_ids_collects_chain_and_reverse() {
        let mut v = TrackedVehicle::new(7, Point::new(0.0, 0.0), 0.0);
        assert!(v.open_incident_ids().is_empty());

        v.chain.stopped_incident = 11;
        v.chain.accident_incident = 13;
        v.reverse.pending_end = Some((17, 5.0));

        let ids = v.open_incident_ids();
        assert_eq!(ids, vec![11, 13, 17]);
    }
}
