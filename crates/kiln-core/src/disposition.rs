//! Runner lifecycle states and the disposition classifier.
//!
//! Backends reduce their raw instance listings to a slice of
//! [`InstanceObservation`]s; [`classify`] folds that snapshot into a
//! [`RunnerDisposition`] without touching the backend again.

use serde::{Deserialize, Serialize};

/// Marker value a runner reports once it is registered and waiting for a job.
pub const MARKER_IDLE: &str = "idle";
/// Marker value a runner reports while executing a job.
pub const MARKER_ACTIVE: &str = "active";
/// Marker carried by the short-lived image-preparation instance.
pub const MARKER_PREPARING: &str = "preparing";
/// Marker set at launch, before the runner has reported anything itself.
pub const MARKER_STARTING: &str = "starting";

/// Lifecycle state of a single runner instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Preparing,
    Starting,
    Idle,
    Active,
    Stopped,
}

/// Aggregated runner counts per lifecycle state at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerDisposition {
    pub preparing: usize,
    pub starting: usize,
    pub idle: usize,
    pub active: usize,
    pub stopped: usize,
}

impl RunnerDisposition {
    /// Total runner population. The preparing instance is bake-pipeline
    /// scaffolding, not a runner, and is excluded.
    pub fn total(&self) -> usize {
        self.idle + self.starting + self.active + self.stopped
    }

    /// Runners that satisfy, or will shortly satisfy, the idle target.
    pub fn available(&self) -> usize {
        self.idle + self.starting
    }
}

/// Coarse power phase of an instance as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Running,
    Stopped,
}

/// One instance from a backend listing, reduced to what classification needs.
#[derive(Debug, Clone)]
pub struct InstanceObservation {
    pub name: String,
    pub phase: InstancePhase,
    /// The status marker read from the backend-appropriate channel (an
    /// instance label, or a file inside the instance). `None` when the
    /// marker is unreachable or has not been written yet.
    pub marker: Option<String>,
}

impl InstanceObservation {
    fn state(&self) -> RunnerState {
        if self.phase == InstancePhase::Stopped {
            return RunnerState::Stopped;
        }
        match self.marker.as_deref() {
            Some(MARKER_ACTIVE) => RunnerState::Active,
            Some(MARKER_IDLE) => RunnerState::Idle,
            Some(MARKER_PREPARING) => RunnerState::Preparing,
            // Unreadable, mid-boot, or unrecognized markers all mean the
            // instance has not come up yet. Nothing is ever dropped.
            _ => RunnerState::Starting,
        }
    }
}

/// Fold a listing snapshot into per-state counts.
///
/// Pure function of the snapshot: every observation lands in exactly one
/// state, so `total() == idle + starting + active + stopped` holds for any
/// input, including an empty listing.
pub fn classify(observations: &[InstanceObservation]) -> RunnerDisposition {
    let mut disposition = RunnerDisposition::default();
    for observation in observations {
        match observation.state() {
            RunnerState::Preparing => disposition.preparing += 1,
            RunnerState::Starting => disposition.starting += 1,
            RunnerState::Idle => disposition.idle += 1,
            RunnerState::Active => disposition.active += 1,
            RunnerState::Stopped => disposition.stopped += 1,
        }
    }
    disposition
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(name: &str, marker: Option<&str>) -> InstanceObservation {
        InstanceObservation {
            name: name.to_string(),
            phase: InstancePhase::Running,
            marker: marker.map(str::to_string),
        }
    }

    #[test]
    fn empty_listing_is_all_zero() {
        let disposition = classify(&[]);
        assert_eq!(disposition, RunnerDisposition::default());
        assert_eq!(disposition.total(), 0);
    }

    #[test]
    fn markers_map_to_states() {
        let disposition = classify(&[
            running("a", Some("active")),
            running("b", Some("idle")),
            running("c", Some("preparing")),
            running("d", Some("starting")),
        ]);
        assert_eq!(disposition.active, 1);
        assert_eq!(disposition.idle, 1);
        assert_eq!(disposition.preparing, 1);
        assert_eq!(disposition.starting, 1);
    }

    #[test]
    fn missing_marker_counts_as_starting() {
        let disposition = classify(&[running("a", None)]);
        assert_eq!(disposition.starting, 1);
        assert_eq!(disposition.total(), 1);
    }

    #[test]
    fn unknown_marker_counts_as_starting() {
        // A garbled or partially written marker must not drop the instance.
        let disposition = classify(&[running("a", Some("rebooting")), running("b", Some(""))]);
        assert_eq!(disposition.starting, 2);
    }

    #[test]
    fn stopped_phase_wins_over_marker() {
        let disposition = classify(&[InstanceObservation {
            name: "a".to_string(),
            phase: InstancePhase::Stopped,
            marker: Some("idle".to_string()),
        }]);
        assert_eq!(disposition.stopped, 1);
        assert_eq!(disposition.idle, 0);
    }

    #[test]
    fn total_invariant_holds() {
        let observations = vec![
            running("a", Some("active")),
            running("b", Some("idle")),
            running("c", Some("idle")),
            running("d", None),
            InstanceObservation {
                name: "e".to_string(),
                phase: InstancePhase::Stopped,
                marker: None,
            },
        ];
        let d = classify(&observations);
        assert_eq!(d.total(), d.idle + d.starting + d.active + d.stopped);
        assert_eq!(d.total(), observations.len());
    }

    #[test]
    fn preparing_excluded_from_total() {
        let disposition = classify(&[running("prep", Some("preparing")), running("r", Some("idle"))]);
        assert_eq!(disposition.total(), 1);
        assert_eq!(disposition.preparing, 1);
    }

    #[test]
    fn available_is_idle_plus_starting() {
        let disposition = classify(&[
            running("a", Some("idle")),
            running("b", None),
            running("c", Some("active")),
        ]);
        assert_eq!(disposition.available(), 2);
    }
}
