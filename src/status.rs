//! Condition builders and event recording.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

use crate::crd::{Condition, ConditionSeverity, ConditionStatus};

/// Set a condition, replacing any existing one of the same type.
///
/// `last_transition_time` is kept when the status value does not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter().find(|c| c.r#type == condition.r#type)
        && existing.status == condition.status
    {
        condition.last_transition_time = existing.last_transition_time;
    }
    conditions.retain(|c| c.r#type != condition.r#type);
    conditions.push(condition);
}

pub fn mark_true(conditions: &mut Vec<Condition>, condition_type: &str) {
    set_condition(
        conditions,
        Condition {
            r#type: condition_type.to_string(),
            status: ConditionStatus::True,
            reason: None,
            severity: None,
            message: None,
            last_transition_time: Utc::now(),
        },
    );
}

pub fn mark_false(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set_condition(
        conditions,
        Condition {
            r#type: condition_type.to_string(),
            status: ConditionStatus::False,
            reason: Some(reason.to_string()),
            severity: Some(severity),
            message: Some(message.into()).filter(|m: &String| !m.is_empty()),
            last_transition_time: Utc::now(),
        },
    );
}

pub fn mark_unknown(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    reason: &str,
    message: impl Into<String>,
) {
    set_condition(
        conditions,
        Condition {
            r#type: condition_type.to_string(),
            status: ConditionStatus::Unknown,
            reason: Some(reason.to_string()),
            severity: None,
            message: Some(message.into()).filter(|m: &String| !m.is_empty()),
            last_transition_time: Utc::now(),
        },
    );
}

pub fn get<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

pub fn has(conditions: &[Condition], condition_type: &str) -> bool {
    get(conditions, condition_type).is_some()
}

pub fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
    get(conditions, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

pub fn is_false(conditions: &[Condition], condition_type: &str) -> bool {
    get(conditions, condition_type).is_some_and(|c| c.status == ConditionStatus::False)
}

pub fn delete(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.r#type != condition_type);
}

/// Publishes Kubernetes events against an object.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, obj_ref: &ObjectReference, reason: &str, message: &str);

    async fn publish_warning(&self, obj_ref: &ObjectReference, reason: &str, message: &str);
}

/// `EventPublisher` backed by the events API.
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "sko".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    async fn emit(&self, obj_ref: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                obj_ref,
            )
            .await
            .unwrap_or_else(|e| tracing::warn!("Failed to publish event {}: {}", reason, e));
    }
}

#[async_trait]
impl EventPublisher for KubeEvents {
    async fn publish(&self, obj_ref: &ObjectReference, reason: &str, message: &str) {
        self.emit(obj_ref, EventType::Normal, reason, message).await;
    }

    async fn publish_warning(&self, obj_ref: &ObjectReference, reason: &str, message: &str) {
        self.emit(obj_ref, EventType::Warning, reason, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::condition::{reasons, types};

    #[test]
    fn test_mark_true_adds_condition() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, types::NODE_HEALTHY);
        assert_eq!(conditions.len(), 1);
        assert!(is_true(&conditions, types::NODE_HEALTHY));
        assert!(!has(&conditions, types::DRAIN_SUCCEEDED));
    }

    #[test]
    fn test_mark_false_replaces_existing() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, types::DRAIN_SUCCEEDED);
        mark_false(
            &mut conditions,
            types::DRAIN_SUCCEEDED,
            reasons::DRAINING_FAILED,
            ConditionSeverity::Warning,
            "eviction blocked",
        );
        assert_eq!(conditions.len(), 1);
        let cond = get(&conditions, types::DRAIN_SUCCEEDED).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason.as_deref(), Some("DrainingFailed"));
        assert_eq!(cond.severity, Some(ConditionSeverity::Warning));
        assert_eq!(cond.message.as_deref(), Some("eviction blocked"));
        assert!(is_false(&conditions, types::DRAIN_SUCCEEDED));
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut conditions = Vec::new();
        mark_false(
            &mut conditions,
            types::DRAIN_SUCCEEDED,
            reasons::DRAINING,
            ConditionSeverity::Info,
            "",
        );
        let first = get(&conditions, types::DRAIN_SUCCEEDED)
            .unwrap()
            .last_transition_time;
        std::thread::sleep(std::time::Duration::from_millis(5));
        mark_false(
            &mut conditions,
            types::DRAIN_SUCCEEDED,
            reasons::DRAINING,
            ConditionSeverity::Info,
            "still draining",
        );
        let cond = get(&conditions, types::DRAIN_SUCCEEDED).unwrap();
        assert_eq!(cond.last_transition_time, first);
        assert_eq!(cond.message.as_deref(), Some("still draining"));

        std::thread::sleep(std::time::Duration::from_millis(5));
        mark_true(&mut conditions, types::DRAIN_SUCCEEDED);
        assert!(get(&conditions, types::DRAIN_SUCCEEDED).unwrap().last_transition_time > first);
    }

    #[test]
    fn test_empty_message_is_omitted() {
        let mut conditions = Vec::new();
        mark_unknown(&mut conditions, types::NODE_HEALTHY, reasons::NODE_CONDITIONS_FAILED, "");
        let cond = get(&conditions, types::NODE_HEALTHY).unwrap();
        assert_eq!(cond.status, ConditionStatus::Unknown);
        assert!(cond.message.is_none());
    }

    #[test]
    fn test_delete_preserves_other_types() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, types::IN_PLACE_UPGRADED);
        mark_true(&mut conditions, types::NODE_HEALTHY);
        delete(&mut conditions, types::IN_PLACE_UPGRADED);
        delete(&mut conditions, types::IN_PLACE_UPGRADE_BINARIES_READY);
        assert_eq!(conditions.len(), 1);
        assert!(is_true(&conditions, types::NODE_HEALTHY));
    }
}
