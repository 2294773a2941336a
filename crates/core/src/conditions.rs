//! Reconcile conditions: typed, timestamped assertions about the most
//! recent reconcile outcome of one worker. A condition list holds at most
//! one entry per type; newer entries replace older ones in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    ReconcileSuccess,
    ReconcileError,
    Initializing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    LastReconcileCycleSucceded,
    LastReconcileCycleFailed,
    ReconcilerManagerRestarting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub last_transition: DateTime<Utc>,
    pub observed_generation: i64,
    pub reason: ConditionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn success(observed_generation: i64) -> Self {
        Self {
            condition_type: ConditionType::ReconcileSuccess,
            status: ConditionStatus::True,
            last_transition: Utc::now(),
            observed_generation,
            reason: ConditionReason::LastReconcileCycleSucceded,
            message: None,
        }
    }

    pub fn error(observed_generation: i64, message: impl Into<String>) -> Self {
        Self {
            condition_type: ConditionType::ReconcileError,
            status: ConditionStatus::True,
            last_transition: Utc::now(),
            observed_generation,
            reason: ConditionReason::LastReconcileCycleFailed,
            message: Some(message.into()),
        }
    }

    pub fn initializing(observed_generation: i64) -> Self {
        Self {
            condition_type: ConditionType::Initializing,
            status: ConditionStatus::True,
            last_transition: Utc::now(),
            observed_generation,
            reason: ConditionReason::ReconcilerManagerRestarting,
            message: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.condition_type == ConditionType::ReconcileError
    }
}

/// Replace the condition of the same type in place, or append.
pub fn add_or_replace(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(slot) => *slot = condition,
        None => conditions.push(condition),
    }
}

/// The most recently transitioned condition, if any.
pub fn latest(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().max_by_key(|c| c.last_transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_in_place_keeps_one_entry_per_type() {
        let mut list = vec![Condition::initializing(0)];
        add_or_replace(&mut list, Condition::success(1));
        add_or_replace(&mut list, Condition::success(2));
        assert_eq!(list.len(), 2);
        let success = list
            .iter()
            .find(|c| c.condition_type == ConditionType::ReconcileSuccess)
            .unwrap();
        assert_eq!(success.observed_generation, 2);
    }

    #[test]
    fn error_carries_message_and_reason() {
        let c = Condition::error(4, "patch rejected");
        assert!(c.is_error());
        assert_eq!(c.reason, ConditionReason::LastReconcileCycleFailed);
        assert_eq!(c.message.as_deref(), Some("patch rejected"));
        assert_eq!(c.observed_generation, 4);
    }

    #[test]
    fn latest_picks_most_recent_transition() {
        let old = Condition {
            last_transition: Utc::now() - chrono::Duration::seconds(30),
            ..Condition::success(1)
        };
        let mut list = vec![old];
        add_or_replace(&mut list, Condition::error(1, "boom"));
        assert!(latest(&list).unwrap().is_error());
    }

    #[test]
    fn serializes_with_kubernetes_field_names() {
        let c = Condition::success(7);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "ReconcileSuccess");
        assert_eq!(v["status"], "True");
        assert_eq!(v["reason"], "LastReconcileCycleSucceded");
        assert_eq!(v["observedGeneration"], 7);
        assert!(v.get("lastTransition").is_some());
    }
}
