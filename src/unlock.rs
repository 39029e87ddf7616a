//! Unlock criteria for gamified content gating
//!
//! Modules and lessons carry an optional criteria descriptor, persisted as
//! JSON:
//!
//! ```text
//! {"type": "none"}
//! {"type": "prerequisite", "courseIds": ["c1", "c2"]}
//! {"type": "xp", "minXp": 100}
//! {"type": "purchase", "required": true}
//! ```
//!
//! Evaluation is a pure function of (criteria, learner state, owning course).
//! Nothing here is cached or persisted; access is recomputed for every view.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::StorageError;

/// Tagged unlock descriptor attached to a module or lesson
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UnlockCriteria {
    /// Always unlocked
    None,
    /// Every listed course must be completed
    Prerequisite {
        #[serde(rename = "courseIds", default)]
        course_ids: Vec<String>,
    },
    /// Learner needs at least this much accumulated XP
    Xp {
        #[serde(rename = "minXp", default, deserialize_with = "deserialize_min_xp")]
        min_xp: i64,
    },
    /// Owning course must be purchased when `required` is set
    Purchase {
        #[serde(default = "default_required")]
        required: bool,
    },
}

fn default_required() -> bool {
    true
}

/// Accepts any JSON number (or null); negatives and null become 0,
/// fractional thresholds round up.
fn deserialize_min_xp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(v) if v > 0.0 => v.ceil().min(i64::MAX as f64) as i64,
        _ => 0,
    })
}

impl Default for UnlockCriteria {
    fn default() -> Self {
        UnlockCriteria::None
    }
}

impl UnlockCriteria {
    /// Strict parse used on writes. Malformed descriptors are rejected.
    pub fn from_json_str(raw: &str) -> Result<Self, StorageError> {
        serde_json::from_str(raw)
            .map_err(|e| StorageError::InvalidInput(format!("unlock_criteria is not valid: {}", e)))
    }

    /// Serialize for storage
    pub fn to_json_string(&self) -> String {
        // Enum of plain strings/numbers; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"none"}"#.to_string())
    }

    /// Variant tag as persisted
    pub fn type_name(&self) -> &'static str {
        match self {
            UnlockCriteria::None => "none",
            UnlockCriteria::Prerequisite { .. } => "prerequisite",
            UnlockCriteria::Xp { .. } => "xp",
            UnlockCriteria::Purchase { .. } => "purchase",
        }
    }

    /// Evaluate against a learner, reporting what is missing when locked
    pub fn evaluate(&self, learner: &LearnerState, owning_course_id: &str) -> Access {
        match self {
            UnlockCriteria::None => Access::Unlocked,
            UnlockCriteria::Prerequisite { course_ids } => {
                let missing: Vec<String> = course_ids
                    .iter()
                    .filter(|id| !learner.completed_course_ids.contains(*id))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Access::Unlocked
                } else {
                    Access::Locked(LockReason::MissingPrerequisites { course_ids: missing })
                }
            }
            UnlockCriteria::Xp { min_xp } => {
                let required = (*min_xp).max(0);
                if learner.total_xp >= required {
                    Access::Unlocked
                } else {
                    Access::Locked(LockReason::InsufficientXp {
                        required,
                        current: learner.total_xp,
                    })
                }
            }
            UnlockCriteria::Purchase { required } => {
                if !required || learner.purchased_course_ids.contains(owning_course_id) {
                    Access::Unlocked
                } else {
                    Access::Locked(LockReason::PurchaseRequired {
                        course_id: owning_course_id.to_string(),
                    })
                }
            }
        }
    }

    pub fn is_unlocked(&self, learner: &LearnerState, owning_course_id: &str) -> bool {
        self.evaluate(learner, owning_course_id).is_unlocked()
    }
}

/// Learner facts the evaluator needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerState {
    #[serde(default, alias = "completed_course_ids")]
    pub completed_course_ids: HashSet<String>,
    #[serde(default, rename = "totalXP", alias = "total_xp", alias = "totalXp")]
    pub total_xp: i64,
    #[serde(default, alias = "purchased_course_ids")]
    pub purchased_course_ids: HashSet<String>,
}

/// Outcome of evaluating criteria for a learner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Access {
    Unlocked,
    Locked(LockReason),
}

impl Access {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Access::Unlocked)
    }
}

/// Why content is locked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LockReason {
    MissingPrerequisites { course_ids: Vec<String> },
    InsufficientXp { required: i64, current: i64 },
    PurchaseRequired { course_id: String },
    /// Stored descriptor could not be read and the policy is fail-closed
    InvalidCriteria,
    /// The enclosing module is locked
    ModuleLocked,
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockReason::MissingPrerequisites { course_ids } => {
                write!(f, "complete these courses first: {}", course_ids.join(", "))
            }
            LockReason::InsufficientXp { required, current } => {
                write!(f, "requires {} XP, learner has {}", required, current)
            }
            LockReason::PurchaseRequired { course_id } => {
                write!(f, "course '{}' must be purchased", course_id)
            }
            LockReason::InvalidCriteria => f.write_str("unlock criteria are unreadable"),
            LockReason::ModuleLocked => f.write_str("the enclosing module is locked"),
        }
    }
}

/// Criteria as read back from storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCriteria {
    Valid(UnlockCriteria),
    Malformed { raw: String, reason: String },
}

impl StoredCriteria {
    /// Lenient parse of a stored column. Absent or blank means no gate.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => StoredCriteria::Valid(UnlockCriteria::None),
            Some(text) => match serde_json::from_str::<UnlockCriteria>(text) {
                Ok(criteria) => StoredCriteria::Valid(criteria),
                Err(e) => StoredCriteria::Malformed {
                    raw: text.to_string(),
                    reason: e.to_string(),
                },
            },
        }
    }

    /// Lenient read of a descriptor supplied in a request body. `null` means
    /// no gate.
    pub fn from_value(value: &serde_json::Value) -> Self {
        if value.is_null() {
            return StoredCriteria::Valid(UnlockCriteria::None);
        }
        match UnlockCriteria::deserialize(value) {
            Ok(criteria) => StoredCriteria::Valid(criteria),
            Err(e) => StoredCriteria::Malformed {
                raw: value.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

/// Treatment of stored criteria that fail to parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaPolicy {
    /// Malformed criteria lock the content
    #[default]
    FailClosed,
    /// Malformed criteria behave like `none`
    FailOpen,
}

impl std::str::FromStr for CriteriaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" | "fail_closed" | "fail-closed" => Ok(CriteriaPolicy::FailClosed),
            "open" | "fail_open" | "fail-open" => Ok(CriteriaPolicy::FailOpen),
            other => Err(format!("unknown criteria policy '{}' (expected open or closed)", other)),
        }
    }
}

impl CriteriaPolicy {
    /// Evaluate stored criteria, applying this policy to malformed values
    pub fn evaluate(
        &self,
        stored: &StoredCriteria,
        learner: &LearnerState,
        owning_course_id: &str,
    ) -> Access {
        match stored {
            StoredCriteria::Valid(criteria) => criteria.evaluate(learner, owning_course_id),
            StoredCriteria::Malformed { raw, reason } => {
                warn!(raw = %raw, reason = %reason, policy = ?self, "Malformed unlock criteria");
                match self {
                    CriteriaPolicy::FailClosed => Access::Locked(LockReason::InvalidCriteria),
                    CriteriaPolicy::FailOpen => Access::Unlocked,
                }
            }
        }
    }
}
