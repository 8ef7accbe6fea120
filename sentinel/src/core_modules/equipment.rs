// THEORY:
// The `equipment` module is the compliance layer of the sentinel. It knows nothing
// about time. Given the set of classes the detector reported for one frame, it
// answers two questions: is a person in view, and which pieces of required
// equipment are absent?
//
// Key architectural principles:
// 1.  **Ordered Policy**: The required items are an ordered list, not a map. The
//     order in which items are checked is the order in which missing labels are
//     reported, and that exact ordering appears verbatim in alert text and on
//     screen.
// 2.  **Person Gate**: Equipment is only checked when a person is present. A frame
//     with no person is never deficient, whatever else it contains.
// 3.  **Stateless Utility**: `assess` is a pure function of the policy and one
//     frame's detections. All memory lives in the `episode` module.

use crate::error::{Result, SentinelError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// A detector class identifier.
pub type ClassId = u32;

/// One piece of required equipment: the label shown to humans and the class the detector reports for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredItem {
    pub label: String,
    pub class_id: ClassId,
}

impl RequiredItem {
    pub fn new(label: impl Into<String>, class_id: ClassId) -> Self {
        Self {
            label: label.into(),
            class_id,
        }
    }
}

/// The set of classes detected in a single frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedClasses(HashSet<ClassId>);

impl DetectedClasses {
    pub fn contains(&self, class_id: ClassId) -> bool {
        self.0.contains(&class_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Class ids in ascending order, for logs and status messages.
    pub fn sorted(&self) -> Vec<ClassId> {
        let mut ids: Vec<ClassId> = self.0.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl FromIterator<ClassId> for DetectedClasses {
    fn from_iter<I: IntoIterator<Item = ClassId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The result of checking one frame against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compliance {
    pub person_present: bool,
    /// Labels of absent items, in policy order. Always empty when no person is present.
    pub missing: Vec<String>,
}

impl Compliance {
    pub fn is_deficient(&self) -> bool {
        !self.missing.is_empty()
    }

    /// The missing labels joined the way they appear in alerts, e.g. `Helmet, Gloves`.
    pub fn description(&self) -> String {
        self.missing.join(", ")
    }
}

/// Which classes must accompany a person, and for how long a deficiency is tolerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentPolicy {
    pub person_class: ClassId,
    pub required: Vec<RequiredItem>,
    /// Minimum continuous deficiency before an alert may fire.
    #[serde(with = "threshold_secs", rename = "threshold_secs")]
    pub threshold: Duration,
}

impl Default for EquipmentPolicy {
    fn default() -> Self {
        Self {
            person_class: 0,
            required: vec![
                RequiredItem::new("Helmet", 4),
                RequiredItem::new("Eye Glass", 11),
                RequiredItem::new("Gloves", 39),
                RequiredItem::new("Jacket", 27),
            ],
            threshold: Duration::from_secs(5),
        }
    }
}

impl EquipmentPolicy {
    pub fn assess(&self, detected: &DetectedClasses) -> Compliance {
        let person_present = detected.contains(self.person_class);
        let missing = if person_present {
            self.required
                .iter()
                .filter(|item| !detected.contains(item.class_id))
                .map(|item| item.label.clone())
                .collect()
        } else {
            Vec::new()
        };

        Compliance {
            person_present,
            missing,
        }
    }

    /// Human label for a class the policy knows about.
    pub fn label_for(&self, class_id: ClassId) -> Option<&str> {
        if class_id == self.person_class {
            return Some("Person");
        }
        self.required
            .iter()
            .find(|item| item.class_id == class_id)
            .map(|item| item.label.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.required.is_empty() {
            return Err(SentinelError::Config(
                "At least one required equipment item must be configured".to_string(),
            ));
        }

        if self.threshold.is_zero() {
            return Err(SentinelError::Config(
                "Violation threshold must be greater than zero".to_string(),
            ));
        }

        let mut labels = HashSet::new();
        for item in &self.required {
            if item.label.trim().is_empty() {
                return Err(SentinelError::Config("Equipment labels must not be empty".to_string()));
            }
            if item.class_id == self.person_class {
                return Err(SentinelError::Config(format!(
                    "Equipment '{}' uses the person class id {}",
                    item.label, self.person_class
                )));
            }
            if !labels.insert(item.label.as_str()) {
                return Err(SentinelError::Config(format!(
                    "Duplicate equipment label '{}'",
                    item.label
                )));
            }
        }

        Ok(())
    }
}

/// Stores the threshold as fractional seconds in config files.
mod threshold_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
