//! Node health summary from raw node conditions.

use k8s_openapi::api::core::v1::NodeCondition;

use crate::crd::ConditionStatus;

const MEMORY_PRESSURE: &str = "MemoryPressure";
const DISK_PRESSURE: &str = "DiskPressure";
const PID_PRESSURE: &str = "PIDPressure";
const READY: &str = "Ready";

/// Number of condition kinds taken into account.
const TRACKED_CONDITIONS: usize = 4;

/// Summarize a node's conditions into one tri-state value and a message.
///
/// A pressure condition that is `True` or a `Ready` that is not `True`
/// counts as failed. Raw `Unknown` statuses count as unknown instead. The
/// result is `False` when anything failed, `Unknown` when all four tracked
/// kinds are unknown, and `True` otherwise. Untracked kinds are ignored.
pub fn summarize(conditions: &[NodeCondition]) -> (ConditionStatus, String) {
    let mut false_count = 0;
    let mut unknown_count = 0;
    let mut message = String::new();

    for condition in conditions {
        let tracked = matches!(
            condition.type_.as_str(),
            MEMORY_PRESSURE | DISK_PRESSURE | PID_PRESSURE | READY
        );
        if !tracked {
            continue;
        }

        let affirmative = if condition.type_ == READY {
            condition.status == "True"
        } else {
            condition.status == "False"
        };
        if affirmative {
            continue;
        }

        if condition.status == "Unknown" {
            unknown_count += 1;
        } else {
            false_count += 1;
        }
        message.push_str(&format!(
            "Node condition {} is {}. ",
            condition.type_, condition.status
        ));
    }

    let status = if false_count > 0 {
        ConditionStatus::False
    } else if false_count + unknown_count < TRACKED_CONDITIONS {
        ConditionStatus::True
    } else {
        ConditionStatus::Unknown
    };
    (status, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..NodeCondition::default()
        }
    }

    #[test]
    fn test_healthy_with_one_unknown_pressure() {
        let (status, message) = summarize(&[
            cond("Ready", "True"),
            cond("MemoryPressure", "False"),
            cond("DiskPressure", "False"),
            cond("PIDPressure", "Unknown"),
        ]);
        assert_eq!(status, ConditionStatus::True);
        assert_eq!(message, "Node condition PIDPressure is Unknown. ");
    }

    #[test]
    fn test_not_ready_is_false() {
        let (status, message) = summarize(&[
            cond("Ready", "False"),
            cond("MemoryPressure", "False"),
            cond("DiskPressure", "False"),
            cond("PIDPressure", "False"),
        ]);
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(message, "Node condition Ready is False. ");
    }

    #[test]
    fn test_all_unknown_is_unknown() {
        let (status, message) = summarize(&[
            cond("Ready", "Unknown"),
            cond("MemoryPressure", "Unknown"),
            cond("DiskPressure", "Unknown"),
            cond("PIDPressure", "Unknown"),
        ]);
        assert_eq!(status, ConditionStatus::Unknown);
        assert!(message.contains("Node condition Ready is Unknown. "));
        assert!(message.contains("Node condition DiskPressure is Unknown. "));
    }

    #[test]
    fn test_pressure_true_is_false() {
        let (status, message) = summarize(&[
            cond("Ready", "True"),
            cond("DiskPressure", "True"),
            cond("MemoryPressure", "Unknown"),
        ]);
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(
            message,
            "Node condition DiskPressure is True. Node condition MemoryPressure is Unknown. "
        );
    }

    #[test]
    fn test_empty_and_untracked_conditions() {
        assert_eq!(summarize(&[]), (ConditionStatus::True, String::new()));
        let (status, message) = summarize(&[
            cond("NetworkUnavailable", "True"),
            cond("Ready", "True"),
        ]);
        assert_eq!(status, ConditionStatus::True);
        assert!(message.is_empty());
    }
}
