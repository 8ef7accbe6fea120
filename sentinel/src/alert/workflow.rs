//! Secondary workflow trigger.
//!
//! Hands the incident to a downstream escalation workflow. The trigger is
//! fire-and-forget: the event is logged and nothing is read back.

use crate::alert::{AlertDispatcher, AlertPayload};
use crate::config::{IncidentContext, WorkflowConfig};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub incident_id: String,
    pub violation_details: String,
    pub manager_mobile: String,
    pub evidence_url: String,
}

pub struct WorkflowTrigger {
    endpoint: String,
    image_base_url: String,
    manager_mobile: String,
}

impl WorkflowTrigger {
    pub fn new(config: &WorkflowConfig, context: &IncidentContext) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            image_base_url: config.image_base_url.clone(),
            manager_mobile: context.manager_mobile.clone(),
        }
    }

    pub fn evidence_url(&self, alert: &AlertPayload) -> String {
        format!(
            "{}/violation_{}.jpg",
            self.image_base_url.trim_end_matches(['/', '\\']),
            alert.incident_id.short()
        )
    }

    pub fn event(&self, alert: &AlertPayload) -> WorkflowEvent {
        WorkflowEvent {
            incident_id: alert.incident_id.to_string(),
            violation_details: alert.description.clone(),
            manager_mobile: self.manager_mobile.clone(),
            evidence_url: self.evidence_url(alert),
        }
    }
}

impl AlertDispatcher for WorkflowTrigger {
    fn name(&self) -> &str {
        "workflow"
    }

    fn dispatch(&self, alert: &AlertPayload) -> Result<()> {
        let event = self.event(alert);
        let body = serde_json::to_string(&event)?;
        info!(
            endpoint = %self.endpoint,
            manager_mobile = %event.manager_mobile,
            "Workflow trigger simulated: {}",
            body
        );
        Ok(())
    }
}
