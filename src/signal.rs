// src/signal.rs
//
// Binary signal phase for the monitored approach, with a monotonic cycle
// counter and a one-way "have we ever seen signal info" marker.

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPhase {
    /// Red for the approach.
    Off,
    /// Green for the approach.
    On,
}

/// One-way transition: `Unknown` → `Observed`, never back. The incident
/// chain switches from duration fallbacks to phase/cycle rules once
/// `Observed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKnowledge {
    Unknown,
    Observed,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalSnapshot {
    pub phase: SignalPhase,
    pub cycle: u64,
    pub knowledge: SignalKnowledge,
}

#[derive(Debug)]
pub struct SignalPhaseTracker {
    phase: SignalPhase,
    cycle: u64,
    knowledge: SignalKnowledge,
}

impl SignalPhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: SignalPhase::Off,
            cycle: 0,
            knowledge: SignalKnowledge::Unknown,
        }
    }

    pub fn on_signal_change(&mut self, phase: SignalPhase, timestamp: f64) {
        self.knowledge = SignalKnowledge::Observed;
        if phase == SignalPhase::On && self.phase == SignalPhase::Off {
            self.cycle += 1;
            debug!("signal cycle {} started at {:.3}", self.cycle, timestamp);
        }
        self.phase = phase;
    }

    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            phase: self.phase,
            cycle: self.cycle,
            knowledge: self.knowledge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_increments_only_on_off_to_on() {
        let mut t = SignalPhaseTracker::new();
        assert_eq!(t.snapshot().cycle, 0);

        t.on_signal_change(SignalPhase::On, 1.0);
        assert_eq!(t.snapshot().cycle, 1);

        // Repeated On does not increment.
        t.on_signal_change(SignalPhase::On, 2.0);
        assert_eq!(t.snapshot().cycle, 1);

        t.on_signal_change(SignalPhase::Off, 3.0);
        assert_eq!(t.snapshot().cycle, 1);

        t.on_signal_change(SignalPhase::On, 4.0);
        assert_eq!(t.snapshot().cycle, 2);
    }

    #[test]
    fn test_knowledge_is_one_way() {
        let mut t = SignalPhaseTracker::new();
        assert_eq!(t.snapshot().knowledge, SignalKnowledge::Unknown);

        t.on_signal_change(SignalPhase::Off, 1.0);
        assert_eq!(t.snapshot().knowledge, SignalKnowledge::Observed);

        t.on_signal_change(SignalPhase::On, 2.0);
        assert_eq!(t.snapshot().knowledge, SignalKnowledge::Observed);
    }
}
