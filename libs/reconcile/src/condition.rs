//! Status conditions and the lifecycle condition state machine.
//!
//! A resource carries at most one condition per [`ConditionType`]. Setting a
//! condition replaces the one of the same type; `last_transition_time` only
//! moves when the status flips.
//!
//! `Creating`, `Available` and `Deleting` are lifecycle phases: setting one
//! of them marks the other two `False` (reason `Superseded`), so at most one
//! lifecycle phase is current. `Synced` is orthogonal and reports whether the
//! last pass completed without error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The type slot a condition occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Creating,
    Available,
    Deleting,
    Synced,
}

impl ConditionType {
    pub const LIFECYCLE: [ConditionType; 3] = [
        ConditionType::Creating,
        ConditionType::Available,
        ConditionType::Deleting,
    ];

    pub fn is_lifecycle(self) -> bool {
        !matches!(self, ConditionType::Synced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Machine-readable reason for a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionReason {
    Creating,
    Available,
    Deleting,
    /// Another lifecycle phase became current.
    Superseded,
    ReconcileSuccess,
    ReconcileError,
}

/// A typed, timestamped status flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    /// The external resource is being created.
    pub fn creating() -> Self {
        Self::new(ConditionType::Creating, ConditionStatus::True, ConditionReason::Creating)
    }

    /// The external resource exists and matches the desired state.
    pub fn available() -> Self {
        Self::new(ConditionType::Available, ConditionStatus::True, ConditionReason::Available)
    }

    /// The external resource is being deleted.
    pub fn deleting() -> Self {
        Self::new(ConditionType::Deleting, ConditionStatus::True, ConditionReason::Deleting)
    }

    /// The last pass completed without error.
    pub fn reconcile_success() -> Self {
        Self::new(
            ConditionType::Synced,
            ConditionStatus::True,
            ConditionReason::ReconcileSuccess,
        )
    }

    /// The last pass failed.
    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self::new(
            ConditionType::Synced,
            ConditionStatus::False,
            ConditionReason::ReconcileError,
        )
        .with_message(message)
    }

    fn superseded(condition_type: ConditionType) -> Self {
        Self::new(condition_type, ConditionStatus::False, ConditionReason::Superseded)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Equal in everything but the transition time.
    pub fn equivalent(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Ordered set of conditions, one per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a condition, replacing any existing condition of the same type.
    ///
    /// Returns true if anything changed.
    pub fn set(&mut self, condition: Condition) -> bool {
        let mut changed = false;

        if condition.condition_type.is_lifecycle() {
            for other in ConditionType::LIFECYCLE {
                if other == condition.condition_type {
                    continue;
                }
                if self.get(other).is_some_and(Condition::is_true) {
                    changed |= self.upsert(Condition::superseded(other));
                }
            }
        }

        changed | self.upsert(condition)
    }

    fn upsert(&mut self, mut condition: Condition) -> bool {
        let existing = self
            .0
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type);

        match existing {
            Some(existing) if existing.equivalent(&condition) => false,
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
                true
            }
            None => {
                self.0.push(condition);
                true
            }
        }
    }

    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    /// The lifecycle phase currently in effect, if any.
    pub fn current_lifecycle(&self) -> Option<ConditionType> {
        self.0
            .iter()
            .find(|c| c.condition_type.is_lifecycle() && c.is_true())
            .map(|c| c.condition_type)
    }

    pub fn is_available(&self) -> bool {
        self.current_lifecycle() == Some(ConditionType::Available)
    }

    /// `Some(true)` if the last pass succeeded, `None` if never reported.
    pub fn is_synced(&self) -> Option<bool> {
        self.get(ConditionType::Synced).map(Condition::is_true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
