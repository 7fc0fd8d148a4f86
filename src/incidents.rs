// src/incidents.rs
//
// Incident detection engine: the chained Stopped → Tailgating → Accident
// state machine, plus the independent reverse-driving and jaywalk
// detectors, idle eviction, and the stuck-incident sweep.
//
// All track and active-incident state lives behind one guard; the frame
// context, the signal dispatcher, and the maintenance timer all enter
// through it.

use crate::calibration::Calibration;
use crate::error::AnalyticsError;
use crate::regions::{RegionSet, TURN_NONE, TURN_U};
use crate::signal::{SignalKnowledge, SignalPhaseTracker, SignalSnapshot};
use crate::tracks::{ReverseLatch, TrackTable, NO_INCIDENT};
use crate::types::{BoundingBox, FrameBatch, IncidentConfig, ObjectClass, Point, VehicleRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Delay between a reverse-driving start and its auto-scheduled end.
const REVERSE_AUTO_END_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentType {
    StoppedVehicle,
    Tailgating,
    Jaywalk,
    ReverseDriving,
    Accident,
}

impl IncidentType {
    /// Wire code published with every incident event.
    pub fn code(&self) -> u32 {
        match self {
            IncidentType::StoppedVehicle => 1,
            IncidentType::Tailgating => 2,
            IncidentType::Jaywalk => 3,
            IncidentType::ReverseDriving => 4,
            IncidentType::Accident => 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IncidentRecord {
    pub id: u64,
    pub kind: IncidentType,
    pub subject_id: u64,
    pub start_time: f64,
    /// Detection box of the subject at allocation, for evidence crops.
    pub subject_bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy)]
pub enum IncidentEvent {
    Started(IncidentRecord),
    Ended {
        record: IncidentRecord,
        end_time: f64,
    },
}

/// Everything one frame of detections produced.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub events: Vec<IncidentEvent>,
    pub lane_counts: BTreeMap<u32, u32>,
    pub crossings: Vec<VehicleRecord>,
}

struct EngineInner {
    tracks: TrackTable,
    active: HashMap<u64, IncidentRecord>,
    next_id: u64,
}

impl EngineInner {
    fn alloc_incident(
        &mut self,
        kind: IncidentType,
        subject_id: u64,
        now: f64,
    ) -> (u64, IncidentEvent) {
        let id = self.next_id;
        self.next_id += 1;
        let subject_bbox = self
            .tracks
            .vehicle(subject_id)
            .and_then(|v| v.last_bbox)
            .or_else(|| self.tracks.pedestrian(subject_id).and_then(|p| p.last_bbox));
        let record = IncidentRecord {
            id,
            kind,
            subject_id,
            start_time: now,
            subject_bbox,
        };
        self.active.insert(id, record);
        info!(
            "incident {} start: {:?} subject {} at {:.3}",
            id, kind, subject_id, now
        );
        (id, IncidentEvent::Started(record))
    }

    /// Idempotent: a second close of the same id is a no-op.
    fn close_incident(&mut self, id: u64, now: f64) -> Option<IncidentEvent> {
        let record = self.active.remove(&id)?;
        info!(
            "incident {} end: {:?} subject {} after {:.1}s",
            id,
            record.kind,
            record.subject_id,
            now - record.start_time
        );
        Some(IncidentEvent::Ended {
            record,
            end_time: now,
        })
    }

    /// Clear any track fields still pointing at a closed incident id.
    fn scrub_refs(&mut self, id: u64) {
        self.tracks.scrub_incident(id);
    }
}

pub struct IncidentEngine {
    cfg: IncidentConfig,
    regions: Arc<RegionSet>,
    calibration: Arc<Calibration>,
    signal: Arc<Mutex<SignalPhaseTracker>>,
    inner: Mutex<EngineInner>,
}

impl IncidentEngine {
    pub fn new(
        cfg: IncidentConfig,
        regions: Arc<RegionSet>,
        calibration: Arc<Calibration>,
        signal: Arc<Mutex<SignalPhaseTracker>>,
    ) -> Self {
        Self {
            cfg,
            regions,
            calibration,
            signal,
            inner: Mutex::new(EngineInner {
                tracks: TrackTable::new(),
                active: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Frame-context entry point: update every track, classify regions,
    /// run the detectors. No I/O happens here.
    pub fn process_frame(&self, batch: &FrameBatch) -> FrameOutcome {
        let snap = self.signal.lock().unwrap().snapshot();
        let mut inner = self.inner.lock().unwrap();
        let mut outcome = FrameOutcome::default();
        let now = batch.timestamp;

        for det in &batch.detections {
            let pos = det.bbox.ground_point();
            match ObjectClass::from_class_id(det.class_id) {
                ObjectClass::Vehicle => {
                    let prev = {
                        let v = inner.tracks.vehicle_entry(det.object_id, pos, now);
                        let prev = v.last_position;
                        v.last_bbox = Some(det.bbox);
                        if let Some((from, to, dt)) = v.advance(pos, now) {
                            let speed = self.calibration.speed_kmh(from, to, dt);
                            v.record_speed(speed);
                        }
                        prev
                    };
                    let events = self.classify_and_detect(
                        &mut inner,
                        det.object_id,
                        prev,
                        pos,
                        now,
                        snap,
                        &mut outcome.crossings,
                    );
                    outcome.events.extend(events);
                }
                ObjectClass::Pedestrian => {
                    inner
                        .tracks
                        .pedestrian_entry(det.object_id, pos, now)
                        .last_bbox = Some(det.bbox);
                    let events = self.step_pedestrian(&mut inner, det.object_id, pos, now);
                    outcome.events.extend(events);
                }
                ObjectClass::Other => {}
            }
        }

        outcome.lane_counts = inner.tracks.lane_counts();
        outcome
    }

    /// Signal dispatcher entry point: the shared phase tracker has already
    /// been updated; re-check escalation rules for every vehicle with an
    /// open stopped chain.
    pub fn after_signal_change(&self, now: f64) -> Vec<IncidentEvent> {
        let snap = self.signal.lock().unwrap().snapshot();
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.tracks.vehicle_ids_with_open_chain();
        let mut events = Vec::new();
        for id in ids {
            events.extend(Self::escalate_chain(&mut inner, &self.cfg, id, now, snap));
        }
        events
    }

    /// Periodic maintenance: deliver due reverse auto-ends, evict idle
    /// tracks (force-closing their incidents), and sweep incidents stuck
    /// beyond the max lifetime.
    pub fn maintenance_tick(&self, now: f64) -> Vec<IncidentEvent> {
        let mut inner = self.inner.lock().unwrap();
        let mut events = Vec::new();

        // Reverse auto-ends that no frame delivered.
        for id in inner.tracks.vehicle_ids_with_pending_reverse_end() {
            events.extend(Self::deliver_reverse_end(&mut inner, id, now));
        }

        // Idle eviction.
        let (vehicles, peds) = inner.tracks.take_idle(now, self.cfg.idle_timeout_secs);
        for v in vehicles {
            debug!("evicting idle vehicle {}", v.object_id);
            for inc in v.open_incident_ids() {
                events.extend(inner.close_incident(inc, now));
            }
        }
        for p in peds {
            debug!("evicting idle pedestrian {}", p.object_id);
            if p.jaywalk_incident != NO_INCIDENT {
                events.extend(inner.close_incident(p.jaywalk_incident, now));
            }
        }

        // Stuck-incident sweep: protects against missed transitions.
        let stuck: Vec<u64> = inner
            .active
            .values()
            .filter(|r| now - r.start_time > self.cfg.max_incident_age_secs)
            .map(|r| r.id)
            .collect();
        for id in stuck {
            warn!("force-closing incident {} past max lifetime", id);
            events.extend(inner.close_incident(id, now));
            inner.scrub_refs(id);
        }

        events
    }

    /// Idempotent explicit close, safe for ids the engine no longer knows.
    pub fn end_incident(&self, id: u64, now: f64) -> Option<IncidentEvent> {
        let mut inner = self.inner.lock().unwrap();
        let event = inner.close_incident(id, now);
        if event.is_some() {
            inner.scrub_refs(id);
        }
        event
    }

    /// External deletion notice. Unknown ids are silently ignored.
    pub fn on_object_removed(&self, object_id: u64, now: f64) -> Vec<IncidentEvent> {
        let mut inner = self.inner.lock().unwrap();
        let mut events = Vec::new();
        if let Some(v) = inner.tracks.remove_vehicle(object_id) {
            for inc in v.open_incident_ids() {
                events.extend(inner.close_incident(inc, now));
            }
        } else if let Some(p) = inner.tracks.remove_pedestrian(object_id) {
            if p.jaywalk_incident != NO_INCIDENT {
                events.extend(inner.close_incident(p.jaywalk_incident, now));
            }
        } else {
            debug!(
                "{}",
                AnalyticsError::UnknownReference {
                    kind: "track",
                    id: object_id,
                }
            );
        }
        events
    }

    /// Safe to call concurrently with the frame path.
    pub fn has_active_incident(&self, object_id: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .active
            .values()
            .any(|r| r.subject_id == object_id)
    }

    pub fn active_incident_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    // -----------------------------------------------------------------------
    // Per-vehicle detection
    // -----------------------------------------------------------------------

    fn classify_and_detect(
        &self,
        inner: &mut EngineInner,
        id: u64,
        prev: Point,
        pos: Point,
        now: f64,
        snap: SignalSnapshot,
        crossings: &mut Vec<VehicleRecord>,
    ) -> Vec<IncidentEvent> {
        let regions = &self.regions;
        let crossed = regions.stop_line_crossed(prev, pos);
        let lane_by_polygon = regions.lane_of(pos);
        let near = regions.near_stop_line(pos, self.cfg.reverse.near_stop_line_px);
        let turn = if regions.is_u_turn(pos) {
            TURN_U
        } else {
            regions.turn_region_of(pos)
        };

        let (speed, crossing_row) = {
            let v = match inner.tracks.vehicle_mut(id) {
                Some(v) => v,
                None => return Vec::new(),
            };
            if lane_by_polygon != 0 {
                v.lane_id = lane_by_polygon;
            } else if crossed {
                // Over the line: containment fails, infer from the crossing.
                let by_crossing = regions.lane_of_4k(prev, pos);
                if by_crossing != 0 {
                    v.lane_id = by_crossing;
                }
            }
            v.near_stop_line = near;
            if turn != TURN_NONE {
                v.turn_code = turn;
            }

            let row = if crossed && !v.crossing_recorded {
                v.crossing_recorded = true;
                Some(VehicleRecord {
                    object_id: id,
                    lane: v.lane_id,
                    turn_code: v.turn_code,
                    speed_kmh: v.speed_kmh,
                    crossed_at: now,
                })
            } else {
                None
            };
            (v.speed_kmh, row)
        };
        crossings.extend(crossing_row);

        let in_intersection = regions.in_intersection(pos);
        let mut events = Self::step_chain(inner, &self.cfg, id, in_intersection, speed, now, snap);
        events.extend(Self::step_reverse(&self.cfg, inner, id, pos, speed, now));
        events
    }

    /// The chained state machine. Entry/dwell lives here; the escalation
    /// rules are shared with the signal path.
    fn step_chain(
        inner: &mut EngineInner,
        cfg: &IncidentConfig,
        id: u64,
        in_intersection: bool,
        speed: f64,
        now: f64,
        snap: SignalSnapshot,
    ) -> Vec<IncidentEvent> {
        let mut events = Vec::new();
        let mut chain = match inner.tracks.vehicle(id) {
            Some(v) => v.chain,
            None => return events,
        };

        if speed < 0.0 {
            // Speed unknown until the first full sample; no verdict yet.
            return events;
        }

        if speed < cfg.stop_speed_kmh {
            if in_intersection {
                if chain.stop_since.is_none() {
                    chain.stop_since = Some(now);
                    debug!("vehicle {} stop dwell begins at {:.3}", id, now);
                }
                if chain.stopped_incident == NO_INCIDENT {
                    let dwell = now - chain.stop_since.unwrap_or(now);
                    if dwell >= cfg.stop_duration_secs {
                        let (inc, ev) = inner.alloc_incident(IncidentType::StoppedVehicle, id, now);
                        chain.stopped_incident = inc;
                        chain.stop_start_phase = Some(snap.phase);
                        events.push(ev);
                    }
                }
                events.extend(Self::escalate_chain_state(
                    inner, cfg, id, &mut chain, now, snap,
                ));
            } else if chain.open_ids().is_empty() {
                chain.stop_since = None;
            }
        } else {
            // Recovered: force-end whatever part of the chain is open and
            // clear the dwell plus the reverse accumulators (not the
            // one-shot latch).
            if chain.stop_since.is_some() || !chain.open_ids().is_empty() {
                for inc in chain.open_ids() {
                    events.extend(inner.close_incident(inc, now));
                }
                chain.clear();
                if let Some(v) = inner.tracks.vehicle_mut(id) {
                    v.reverse.reset_window();
                }
            }
        }

        if let Some(v) = inner.tracks.vehicle_mut(id) {
            v.chain = chain;
        }
        events
    }

    fn escalate_chain(
        inner: &mut EngineInner,
        cfg: &IncidentConfig,
        id: u64,
        now: f64,
        snap: SignalSnapshot,
    ) -> Vec<IncidentEvent> {
        let mut chain = match inner.tracks.vehicle(id) {
            Some(v) => v.chain,
            None => return Vec::new(),
        };
        let events = Self::escalate_chain_state(inner, cfg, id, &mut chain, now, snap);
        if let Some(v) = inner.tracks.vehicle_mut(id) {
            v.chain = chain;
        }
        events
    }

    /// Stopped → Tailgating → Accident, discriminated by phase/cycle when
    /// signal info has ever been observed, by duration fallbacks otherwise.
    fn escalate_chain_state(
        inner: &mut EngineInner,
        cfg: &IncidentConfig,
        id: u64,
        chain: &mut crate::tracks::ChainState,
        now: f64,
        snap: SignalSnapshot,
    ) -> Vec<IncidentEvent> {
        let mut events = Vec::new();
        let stop_since = match chain.stop_since {
            Some(t) => t,
            None => return events,
        };

        if chain.stopped_incident != NO_INCIDENT && chain.tailgating_incident == NO_INCIDENT {
            let fire = match snap.knowledge {
                SignalKnowledge::Observed => Some(snap.phase) != chain.stop_start_phase,
                SignalKnowledge::Unknown => now - stop_since >= cfg.tailgate_fallback_secs,
            };
            if fire {
                let (inc, ev) = inner.alloc_incident(IncidentType::Tailgating, id, now);
                chain.tailgating_incident = inc;
                chain.tailgate_start_cycle = Some(snap.cycle);
                events.push(ev);
            }
        }

        if chain.tailgating_incident != NO_INCIDENT && chain.accident_incident == NO_INCIDENT {
            let fire = match snap.knowledge {
                SignalKnowledge::Observed => {
                    matches!(chain.tailgate_start_cycle, Some(c) if snap.cycle > c + 1)
                }
                SignalKnowledge::Unknown => now - stop_since >= cfg.accident_fallback_secs,
            };
            if fire {
                let (inc, ev) = inner.alloc_incident(IncidentType::Accident, id, now);
                chain.accident_incident = inc;
                events.push(ev);
            }
        }

        events
    }

    /// One-shot reverse-driving detector. Gated on stop-line proximity and
    /// a jitter-filtering minimum speed; gate failure resets the window
    /// but never the latch.
    fn step_reverse(
        cfg: &IncidentConfig,
        inner: &mut EngineInner,
        id: u64,
        pos: Point,
        speed: f64,
        now: f64,
    ) -> Vec<IncidentEvent> {
        let mut events = Vec::new();
        let (mut rw, near) = match inner.tracks.vehicle(id) {
            Some(v) => (v.reverse, v.near_stop_line),
            None => return events,
        };

        // Deliver a due auto-end regardless of gating.
        if let Some((inc, due)) = rw.pending_end {
            if now >= due {
                rw.pending_end = None;
                events.extend(inner.close_incident(inc, now));
            }
        }

        if rw.latch == ReverseLatch::Fired {
            if let Some(v) = inner.tracks.vehicle_mut(id) {
                v.reverse = rw;
            }
            return events;
        }

        if !near || speed < cfg.reverse.min_speed_kmh {
            rw.reset_window();
            if let Some(v) = inner.tracks.vehicle_mut(id) {
                v.reverse = rw;
            }
            return events;
        }

        let ordinate = pos.y;
        if ordinate >= rw.baseline_ordinate {
            // Forward movement: re-baseline and drop the window.
            rw.baseline_ordinate = ordinate;
            rw.window_start = None;
        } else {
            let decrease = rw.baseline_ordinate - ordinate;
            if rw.window_start.is_none() && decrease > cfg.reverse.start_threshold_px {
                rw.window_start = Some(now);
                debug!("vehicle {} reverse window opens ({:.1}px)", id, decrease);
            }
            if let Some(started) = rw.window_start {
                if now - started >= cfg.reverse.min_duration_secs
                    && decrease > cfg.reverse.min_distance_px
                {
                    let (inc, ev) = inner.alloc_incident(IncidentType::ReverseDriving, id, now);
                    events.push(ev);
                    rw.pending_end = Some((inc, now + REVERSE_AUTO_END_SECS));
                    rw.latch = ReverseLatch::Fired;
                }
            }
        }

        if let Some(v) = inner.tracks.vehicle_mut(id) {
            v.reverse = rw;
        }
        events
    }

    fn deliver_reverse_end(inner: &mut EngineInner, id: u64, now: f64) -> Vec<IncidentEvent> {
        let mut events = Vec::new();
        let pending = inner.tracks.vehicle(id).and_then(|v| v.reverse.pending_end);
        if let Some((inc, due)) = pending {
            if now >= due {
                if let Some(v) = inner.tracks.vehicle_mut(id) {
                    v.reverse.pending_end = None;
                }
                events.extend(inner.close_incident(inc, now));
            }
        }
        events
    }

    /// Jaywalk: membership in a forbidden polygon is the whole rule. No
    /// dwell, no chaining. Waiting areas are legitimate ground and exempt
    /// even where the polygons overlap.
    fn step_pedestrian(
        &self,
        inner: &mut EngineInner,
        id: u64,
        pos: Point,
        now: f64,
    ) -> Vec<IncidentEvent> {
        let inside = self.regions.in_no_walk_zone(pos) && !self.regions.in_waiting_area(pos);
        let open = {
            let p = inner.tracks.pedestrian_entry(id, pos, now);
            p.last_position = pos;
            p.last_seen = now;
            p.jaywalk_incident
        };

        let mut events = Vec::new();
        if inside && open == NO_INCIDENT {
            let (inc, ev) = inner.alloc_incident(IncidentType::Jaywalk, id, now);
            if let Some(p) = inner.tracks.pedestrian_mut(id) {
                p.jaywalk_incident = inc;
            }
            events.push(ev);
        } else if !inside && open != NO_INCIDENT {
            events.extend(inner.close_incident(open, now));
            if let Some(p) = inner.tracks.pedestrian_mut(id) {
                p.jaywalk_incident = NO_INCIDENT;
            }
        }
        events
    }

    // -----------------------------------------------------------------------
    // Test hooks: drive a single observation with an explicit speed,
    // bypassing calibration.
    // -----------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn observe_vehicle(
        &self,
        id: u64,
        pos: Point,
        speed_kmh: f64,
        now: f64,
    ) -> Vec<IncidentEvent> {
        let snap = self.signal.lock().unwrap().snapshot();
        let mut inner = self.inner.lock().unwrap();
        let prev = {
            let v = inner.tracks.vehicle_entry(id, pos, now);
            let prev = v.last_position;
            v.last_position = pos;
            v.last_seen = now;
            v.record_speed(speed_kmh);
            if speed_kmh < 0.0 {
                v.speed_kmh = -1.0;
            }
            prev
        };
        let mut crossings = Vec::new();
        self.classify_and_detect(&mut inner, id, prev, pos, now, snap, &mut crossings)
    }

    #[cfg(test)]
    pub(crate) fn observe_pedestrian(&self, id: u64, pos: Point, now: f64) -> Vec<IncidentEvent> {
        let mut inner = self.inner.lock().unwrap();
        self.step_pedestrian(&mut inner, id, pos, now)
    }
}
