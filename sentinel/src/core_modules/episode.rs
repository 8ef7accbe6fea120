// THEORY:
// The `episode` module is the memory of the sentinel. The `equipment` module can
// say whether a single frame is deficient; this module decides whether that
// deficiency has lasted long enough to matter, and makes sure each continuous
// deficiency produces exactly one alert.
//
// Key architectural principles:
// 1.  **Explicit States**: An episode is `Closed`, `Holding` (deficient, timer
//     running) or `Alerted` (threshold crossed, alert emitted). Each open state
//     carries its start time and incident id, so "an id exists iff a timer is
//     running" holds by construction.
// 2.  **Pure Transition**: `advance` consumes the current state and one frame's
//     compliance and returns the next state. The caller's loop owns the value;
//     there is no hidden global timer.
// 3.  **No Hysteresis**: The first frame that is not deficient (no person, or
//     everything present) closes the episode, however close it was to firing.
// 4.  **Fire Once**: The `Holding -> Alerted` edge is the only place a `FireAlert`
//     is produced. Staying in `Alerted` never emits again, and what happens to the
//     alert downstream cannot move the episode back.

use crate::core_modules::equipment::Compliance;
use crate::core_modules::incident::IncidentId;
use std::fmt;
use std::time::{Duration, Instant};

/// The debounce state carried from one frame to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ViolationEpisode {
    /// No deficiency is being observed.
    #[default]
    Closed,
    /// A deficiency is being observed but has not yet lasted the threshold.
    Holding {
        started_at: Instant,
        incident_id: IncidentId,
    },
    /// The deficiency lasted the threshold and its alert has been emitted.
    Alerted {
        started_at: Instant,
        incident_id: IncidentId,
    },
}

/// The one-shot signal emitted when an episode crosses the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireAlert {
    pub incident_id: IncidentId,
    pub missing: Vec<String>,
}

impl FireAlert {
    /// Missing labels joined with `", "`, e.g. `Helmet, Gloves`.
    pub fn description(&self) -> String {
        self.missing.join(", ")
    }
}

/// How a frame should be presented to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Clear,
    Compliant,
    Holding { missing: String, remaining: Duration },
    Alerted { missing: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warning,
    Alert,
}

impl Severity {
    /// Overlay colour as RGB: green, orange, red.
    pub fn rgb(self) -> [u8; 3] {
        match self {
            Severity::Ok => [0, 255, 0],
            Severity::Warning => [255, 165, 0],
            Severity::Alert => [255, 0, 0],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Alert => "alert",
        }
    }
}

impl Status {
    pub fn severity(&self) -> Severity {
        match self {
            Status::Clear | Status::Compliant => Severity::Ok,
            Status::Holding { .. } => Severity::Warning,
            Status::Alerted { .. } => Severity::Alert,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Clear => write!(f, "CLEAR"),
            Status::Compliant => write!(f, "COMPLIANT"),
            Status::Holding { missing, remaining } => {
                write!(f, "HOLDING ({}, {:.1}s)", missing, remaining.as_secs_f64())
            }
            Status::Alerted { missing } => write!(f, "ALERTED ({})", missing),
        }
    }
}

/// The outcome of advancing an episode by one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub episode: ViolationEpisode,
    pub status: Status,
    pub alert: Option<FireAlert>,
}

impl ViolationEpisode {
    /// Advances the episode by one frame.
    ///
    /// `mint` is called exactly once when an episode opens and never otherwise.
    pub fn advance<F>(
        self,
        compliance: &Compliance,
        now: Instant,
        threshold: Duration,
        mint: F,
    ) -> Step
    where
        F: FnOnce() -> IncidentId,
    {
        if !compliance.is_deficient() {
            let status = if compliance.person_present {
                Status::Compliant
            } else {
                Status::Clear
            };
            return Step {
                episode: ViolationEpisode::Closed,
                status,
                alert: None,
            };
        }

        let missing = compliance.description();

        let (started_at, incident_id, already_alerted) = match self {
            ViolationEpisode::Closed => (now, mint(), false),
            ViolationEpisode::Holding {
                started_at,
                incident_id,
            } => (started_at, incident_id, false),
            ViolationEpisode::Alerted {
                started_at,
                incident_id,
            } => (started_at, incident_id, true),
        };

        let elapsed = now.saturating_duration_since(started_at);

        if already_alerted {
            return Step {
                episode: ViolationEpisode::Alerted {
                    started_at,
                    incident_id,
                },
                status: Status::Alerted { missing },
                alert: None,
            };
        }

        if elapsed >= threshold {
            let alert = FireAlert {
                incident_id: incident_id.clone(),
                missing: compliance.missing.clone(),
            };
            Step {
                episode: ViolationEpisode::Alerted {
                    started_at,
                    incident_id,
                },
                status: Status::Alerted { missing },
                alert: Some(alert),
            }
        } else {
            Step {
                episode: ViolationEpisode::Holding {
                    started_at,
                    incident_id,
                },
                status: Status::Holding {
                    missing,
                    remaining: threshold - elapsed,
                },
                alert: None,
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, ViolationEpisode::Closed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ViolationEpisode::Alerted { .. })
    }

    pub fn started_at(&self) -> Option<Instant> {
        match self {
            ViolationEpisode::Closed => None,
            ViolationEpisode::Holding { started_at, .. }
            | ViolationEpisode::Alerted { started_at, .. } => Some(*started_at),
        }
    }

    pub fn incident_id(&self) -> Option<&IncidentId> {
        match self {
            ViolationEpisode::Closed => None,
            ViolationEpisode::Holding { incident_id, .. }
            | ViolationEpisode::Alerted { incident_id, .. } => Some(incident_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(5);

    fn deficient(missing: &[&str]) -> Compliance {
        Compliance {
            person_present: true,
            missing: missing.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn compliant() -> Compliance {
        Compliance {
            person_present: true,
            missing: Vec::new(),
        }
    }

    fn nobody() -> Compliance {
        Compliance {
            person_present: false,
            missing: Vec::new(),
        }
    }

    #[test]
    fn closed_to_holding_mints_once() {
        let t0 = Instant::now();
        let step = ViolationEpisode::Closed.advance(&deficient(&["Helmet"]), t0, THRESHOLD, || {
            IncidentId::from("first")
        });

        assert_eq!(step.episode.incident_id(), Some(&IncidentId::from("first")));
        assert_eq!(step.episode.started_at(), Some(t0));
        assert!(!step.episode.is_active());
        assert!(step.alert.is_none());

        let next = step.episode.advance(
            &deficient(&["Helmet"]),
            t0 + Duration::from_secs(1),
            THRESHOLD,
            || panic!("an open episode must not mint a new id"),
        );
        assert_eq!(next.episode.incident_id(), Some(&IncidentId::from("first")));
    }

    #[test]
    fn holding_to_alerted_at_threshold() {
        let t0 = Instant::now();
        let episode = ViolationEpisode::Holding {
            started_at: t0,
            incident_id: IncidentId::from("abc"),
        };

        let step = episode.advance(&deficient(&["Helmet", "Gloves"]), t0 + THRESHOLD, THRESHOLD, || {
            unreachable!()
        });

        assert!(step.episode.is_active());
        let alert = step.alert.expect("threshold frame must fire");
        assert_eq!(alert.incident_id, IncidentId::from("abc"));
        assert_eq!(alert.description(), "Helmet, Gloves");
        assert_eq!(step.status.to_string(), "ALERTED (Helmet, Gloves)");
    }

    #[test]
    fn alerted_stays_silent() {
        let t0 = Instant::now();
        let episode = ViolationEpisode::Alerted {
            started_at: t0,
            incident_id: IncidentId::from("abc"),
        };
        let step = episode.advance(&deficient(&["Helmet"]), t0 + Duration::from_secs(60), THRESHOLD, || {
            unreachable!()
        });
        assert!(step.alert.is_none());
        assert!(step.episode.is_active());
    }

    #[test]
    fn no_person_closes_any_episode() {
        let t0 = Instant::now();
        let episode = ViolationEpisode::Alerted {
            started_at: t0,
            incident_id: IncidentId::from("abc"),
        };
        let step = episode.advance(&nobody(), t0 + Duration::from_secs(1), THRESHOLD, || unreachable!());
        assert_eq!(step.episode, ViolationEpisode::Closed);
        assert_eq!(step.status, Status::Clear);
        assert!(step.episode.incident_id().is_none());
        assert!(step.episode.started_at().is_none());
    }

    #[test]
    fn compliance_closes_and_reports_compliant() {
        let t0 = Instant::now();
        let episode = ViolationEpisode::Holding {
            started_at: t0,
            incident_id: IncidentId::from("abc"),
        };
        let step = episode.advance(&compliant(), t0 + Duration::from_secs(4), THRESHOLD, || unreachable!());
        assert_eq!(step.episode, ViolationEpisode::Closed);
        assert_eq!(step.status.to_string(), "COMPLIANT");
        assert_eq!(step.status.severity(), Severity::Ok);
    }

    #[test]
    fn holding_status_shows_remaining_seconds() {
        let t0 = Instant::now();
        let episode = ViolationEpisode::Holding {
            started_at: t0,
            incident_id: IncidentId::from("abc"),
        };
        let step = episode.advance(
            &deficient(&["Helmet", "Gloves"]),
            t0 + Duration::from_millis(1800),
            THRESHOLD,
            || unreachable!(),
        );
        assert_eq!(step.status.to_string(), "HOLDING (Helmet, Gloves, 3.2s)");
        assert_eq!(step.status.severity(), Severity::Warning);
    }

    #[test]
    fn severity_colours() {
        assert_eq!(Severity::Ok.rgb(), [0, 255, 0]);
        assert_eq!(Severity::Warning.rgb(), [255, 165, 0]);
        assert_eq!(Severity::Alert.rgb(), [255, 0, 0]);
    }
}
