//! Configuration for the sentinel.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `SENTINEL_*` environment variables.

use crate::alert::{AlertRouter, EmailDispatcher, WorkflowTrigger};
use crate::core_modules::equipment::EquipmentPolicy;
use crate::detector::RemoteDetector;
use crate::error::{Result, SentinelError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Where detections come from when a remote inference service is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Inference endpoint accepting `image/jpeg` bodies.
    pub endpoint: Option<String>,
    /// Detections below this confidence are discarded.
    pub min_confidence: f32,
    pub timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            min_confidence: 0.5,
            timeout_secs: 10,
        }
    }
}

impl DetectorConfig {
    pub fn remote(&self) -> Result<Option<RemoteDetector>> {
        self.endpoint
            .as_ref()
            .map(|url| RemoteDetector::new(url.clone(), self.min_confidence, Duration::from_secs(self.timeout_secs)))
            .transpose()
    }
}

/// SMTP settings for direct email alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub sender: String,
    /// App password for the sender account.
    #[serde(skip_serializing)]
    pub password: String,
    pub recipient: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 465,
            sender: String::new(),
            password: String::new(),
            recipient: String::new(),
        }
    }
}

impl EmailConfig {
    /// Email alerts are sent only when sender, password and recipient are all set.
    pub fn is_configured(&self) -> bool {
        !self.sender.is_empty() && !self.password.is_empty() && !self.recipient.is_empty()
    }
}

/// Identity strings copied into every alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentContext {
    pub person_id: String,
    pub location: String,
    pub manager_mobile: String,
}

impl Default for IncidentContext {
    fn default() -> Self {
        Self {
            person_id: "P001_Contractor_North".to_string(),
            location: "Factory Zone 3 (Near Main Entrance)".to_string(),
            manager_mobile: "0000000000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub endpoint: String,
    /// Base URL under which evidence images are published.
    pub image_base_url: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/orchestrate/trigger".to_string(),
            image_base_url: "https://storage.example.com/violations/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub policy: EquipmentPolicy,
    pub detector: DetectorConfig,
    pub email: EmailConfig,
    pub incident: IncidentContext,
    pub workflow: WorkflowConfig,
}

impl SentinelConfig {
    /// Loads defaults, the optional TOML file and the process environment, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SentinelError::Config(format!("Invalid config file: {}", e)))
    }

    /// Applies `SENTINEL_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SENTINEL_THRESHOLD_SECS") {
            let secs: f64 = parse("SENTINEL_THRESHOLD_SECS", &v)?;
            self.policy.threshold = Duration::try_from_secs_f64(secs)
                .map_err(|e| SentinelError::Config(format!("SENTINEL_THRESHOLD_SECS: {}", e)))?;
        }
        if let Some(v) = lookup("SENTINEL_PERSON_CLASS") {
            self.policy.person_class = parse("SENTINEL_PERSON_CLASS", &v)?;
        }
        if let Some(v) = lookup("SENTINEL_DETECTOR_URL") {
            self.detector.endpoint = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("SENTINEL_MIN_CONFIDENCE") {
            self.detector.min_confidence = parse("SENTINEL_MIN_CONFIDENCE", &v)?;
        }
        if let Some(v) = lookup("SENTINEL_SMTP_HOST") {
            self.email.smtp_host = v;
        }
        if let Some(v) = lookup("SENTINEL_SMTP_PORT") {
            self.email.smtp_port = parse("SENTINEL_SMTP_PORT", &v)?;
        }
        if let Some(v) = lookup("SENTINEL_SMTP_SENDER") {
            self.email.sender = v;
        }
        if let Some(v) = lookup("SENTINEL_SMTP_PASSWORD") {
            self.email.password = v;
        }
        if let Some(v) = lookup("SENTINEL_ALERT_RECIPIENT") {
            self.email.recipient = v;
        }
        if let Some(v) = lookup("SENTINEL_PERSON_ID") {
            self.incident.person_id = v;
        }
        if let Some(v) = lookup("SENTINEL_LOCATION") {
            self.incident.location = v;
        }
        if let Some(v) = lookup("SENTINEL_MANAGER_MOBILE") {
            self.incident.manager_mobile = v;
        }
        if let Some(v) = lookup("SENTINEL_EVIDENCE_BASE_URL") {
            self.workflow.image_base_url = v;
        }
        if let Some(v) = lookup("SENTINEL_WORKFLOW_URL") {
            self.workflow.endpoint = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(SentinelError::Config(
                "Detector min_confidence must be between 0 and 1".to_string(),
            ));
        }

        if self.detector.timeout_secs == 0 {
            return Err(SentinelError::Config("Detector timeout must be non-zero".to_string()));
        }

        if self.email.smtp_port == 0 {
            return Err(SentinelError::Config("SMTP port must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Builds the alert fan-out: email when credentials are present, then the workflow trigger.
    pub fn build_router(&self) -> Result<AlertRouter> {
        let mut router = AlertRouter::new();

        if self.email.is_configured() {
            router.push(Box::new(EmailDispatcher::new(&self.email, self.incident.clone())?));
            info!(recipient = %self.email.recipient, "Email alerts enabled");
        } else {
            warn!("Email alerts disabled: SMTP sender, password or recipient not configured");
        }

        router.push(Box::new(WorkflowTrigger::new(&self.workflow, &self.incident)));
        Ok(router)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SentinelError::Config(format!("{}='{}': {}", key, value, e)))
}
