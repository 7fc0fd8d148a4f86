// src/dispatch.rs
//
// Signal-event fan-out. The external signal source enqueues events on a
// channel; one dispatcher task consumes it and issues the component
// calls in turn. No ordering is guaranteed across components, but each
// component sees its own calls strictly in arrival order.

use crate::incidents::IncidentEngine;
use crate::pipeline::counters::LaneCounters;
use crate::services::{EventPublisher, SignalSource};
use crate::signal::{SignalKnowledge, SignalPhase, SignalPhaseTracker};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub enum SignalEvent {
    PhaseChange { phase: SignalPhase, timestamp: f64 },
    /// External deletion notice for a tracked object.
    ObjectRemoved { object_id: u64, timestamp: f64 },
}

pub struct EventDispatcher {
    engine: Arc<IncidentEngine>,
    signal: Arc<Mutex<SignalPhaseTracker>>,
    counters: Arc<Mutex<LaneCounters>>,
    source: Arc<dyn SignalSource>,
    publisher: Arc<EventPublisher>,
}

impl EventDispatcher {
    pub fn new(
        engine: Arc<IncidentEngine>,
        signal: Arc<Mutex<SignalPhaseTracker>>,
        counters: Arc<Mutex<LaneCounters>>,
        source: Arc<dyn SignalSource>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            engine,
            signal,
            counters,
            source,
            publisher,
        }
    }

    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<SignalEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(event);
            }
            info!("signal channel closed, dispatcher exits");
        })
    }

    pub fn handle(&self, event: SignalEvent) {
        match event {
            SignalEvent::PhaseChange { phase, timestamp } => {
                self.on_phase_change(phase, timestamp)
            }
            SignalEvent::ObjectRemoved {
                object_id,
                timestamp,
            } => {
                let events = self.engine.on_object_removed(object_id, timestamp);
                self.publisher.publish_incident_events(&events, None);
            }
        }
    }

    fn on_phase_change(&self, phase: SignalPhase, timestamp: f64) {
        let is_onset = {
            let mut tracker = self.signal.lock().unwrap();
            let before = tracker.snapshot();
            tracker.on_signal_change(phase, timestamp);
            before.knowledge == SignalKnowledge::Unknown || before.phase != phase
        };
        debug!("phase change to {:?} at {:.3}, onset={}", phase, timestamp, is_onset);

        // Incident engine first: escalations read the updated tracker.
        let events = self.engine.after_signal_change(timestamp);
        self.publisher.publish_incident_events(&events, None);

        if !is_onset {
            return;
        }
        match phase {
            SignalPhase::Off => {
                let mut c = self.counters.lock().unwrap();
                if c.queue_enabled() {
                    c.queue.on_red_onset(timestamp);
                }
            }
            SignalPhase::On => {
                let residuals = self.source.residual_counts_by_lane();
                let (snapshot, stats) = {
                    let mut c = self.counters.lock().unwrap();
                    let snapshot = if c.queue_enabled() {
                        c.queue.on_green_onset(timestamp, &residuals)
                    } else {
                        None
                    };
                    let stats = if c.stats_enabled() {
                        c.stats.close_phase(timestamp)
                    } else {
                        None
                    };
                    (snapshot, stats)
                };
                if let Some(snapshot) = snapshot {
                    self.publisher.publish_queue_snapshot(&snapshot);
                }
                if let Some(stats) = stats {
                    self.publisher.publish_stats_window(&stats);
                }
            }
        }
    }
}
