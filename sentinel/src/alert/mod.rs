//! Alert delivery.
//!
//! The episode state machine decides *when* to alert; the types here decide *how*.
//! Delivery is best effort: a failed dispatcher is logged and reported, and the
//! remaining dispatchers still run. Nothing here retries.

pub mod email;
pub mod workflow;

use crate::core_modules::incident::IncidentId;
use crate::error::Result;
use chrono::{DateTime, Local};
use tracing::{info, warn};

pub use email::EmailDispatcher;
pub use workflow::{WorkflowEvent, WorkflowTrigger};

/// Everything a dispatcher needs to describe one violation.
#[derive(Debug, Clone)]
pub struct AlertPayload {
    pub incident_id: IncidentId,
    /// Missing equipment, e.g. `Helmet, Gloves`.
    pub description: String,
    /// The frame that crossed the threshold, JPEG encoded. `None` if encoding failed.
    pub frame_jpeg: Option<Vec<u8>>,
    pub raised_at: DateTime<Local>,
}

pub trait AlertDispatcher: Send {
    fn name(&self) -> &str;
    fn dispatch(&self, alert: &AlertPayload) -> Result<()>;
}

/// Result of handing one alert to one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub dispatcher: String,
    pub delivered: bool,
    pub error: Option<String>,
}

/// Fans an alert out to every configured dispatcher, in order.
#[derive(Default)]
pub struct AlertRouter {
    dispatchers: Vec<Box<dyn AlertDispatcher>>,
}

impl AlertRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dispatcher: impl AlertDispatcher + 'static) -> Self {
        self.push(Box::new(dispatcher));
        self
    }

    pub fn push(&mut self, dispatcher: Box<dyn AlertDispatcher>) {
        self.dispatchers.push(dispatcher);
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Delivers the alert everywhere. Errors are logged and returned as outcomes, never propagated.
    pub fn fire(&self, alert: &AlertPayload) -> Vec<DispatchOutcome> {
        self.dispatchers
            .iter()
            .map(|dispatcher| match dispatcher.dispatch(alert) {
                Ok(()) => {
                    info!(
                        incident = alert.incident_id.short(),
                        dispatcher = dispatcher.name(),
                        "Alert delivered"
                    );
                    DispatchOutcome {
                        dispatcher: dispatcher.name().to_string(),
                        delivered: true,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(
                        incident = alert.incident_id.short(),
                        dispatcher = dispatcher.name(),
                        "Alert delivery failed: {}",
                        e
                    );
                    DispatchOutcome {
                        dispatcher: dispatcher.name().to_string(),
                        delivered: false,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SentinelError;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<String>>>);

    impl AlertDispatcher for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn dispatch(&self, alert: &AlertPayload) -> Result<()> {
            self.0.lock().unwrap().push(alert.description.clone());
            Ok(())
        }
    }

    struct Failing;

    impl AlertDispatcher for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn dispatch(&self, _alert: &AlertPayload) -> Result<()> {
            Err(SentinelError::Alert("smtp down".to_string()))
        }
    }

    fn payload() -> AlertPayload {
        AlertPayload {
            incident_id: IncidentId::from("deadbeef-0000"),
            description: "Helmet".to_string(),
            frame_jpeg: None,
            raised_at: Local::now(),
        }
    }

    #[test]
    fn failure_does_not_stop_later_dispatchers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = AlertRouter::new().with(Failing).with(Recording(seen.clone()));

        let outcomes = router.fire(&payload());

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].delivered);
        assert!(outcomes[0].error.as_deref().unwrap().contains("smtp down"));
        assert!(outcomes[1].delivered);
        assert_eq!(*seen.lock().unwrap(), vec!["Helmet".to_string()]);
    }

    #[test]
    fn empty_router_reports_nothing() {
        let router = AlertRouter::new();
        assert!(router.is_empty());
        assert!(router.fire(&payload()).is_empty());
    }
}
