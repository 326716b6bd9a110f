//! Node-side state primitives: the drain lifecycle taint, the `DrainScheduled`
//! condition, the replacement label and the retry annotations.
//!
//! All controller-owned state lives on the Node object itself so that a restart
//! of the controller reconstructs everything from the cluster.

mod client;
pub mod error;

pub use self::client::*;

use crate::constants::{
    COMPLETED_STR, CONDITION_DRAIN_SCHEDULED, DRAIN_TAINT_KEY, DRAIN_TAINT_SINCE_ANNOTATION,
    FAILED_STR, OUT_OF_SCOPE_LABEL_VALUE, REPLACE_LABEL_KEY, RETRY_MAX_ATTEMPT_ANNOTATION,
    SCOPE_LABEL_KEY,
};
use error::Result;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition, Taint};
use lazy_static::lazy_static;
use std::time::Duration;

#[cfg(feature = "mockall")]
pub use self::client::MockNodeStateClient;

lazy_static! {
    // Attempt counter prefix of the DrainScheduled condition message, e.g. "[3]".
    static ref ATTEMPT_PREFIX_RE: regex::Regex =
        regex::Regex::new(r"^\[(\d+)\]$").expect("Invalid regex literal.");
}

/// The lifecycle value carried by the drain taint. The taint key is unique, so a
/// node can never hold two of these states at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTaintValue {
    /// The node has been selected for an eventual drain.
    DrainCandidate,
    /// A drain is actively in progress. At most one node per drain group holds this value.
    Draining,
    /// The drain completed and the node awaits replacement or deletion.
    Drained,
}

impl DrainTaintValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DrainCandidate => "drain-candidate",
            Self::Draining => "draining",
            Self::Drained => "drained",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drain-candidate" => Some(Self::DrainCandidate),
            "draining" => Some(Self::Draining),
            "drained" => Some(Self::Drained),
            _ => None,
        }
    }
}

/// The drain taint currently present on a node, together with the timestamp at
/// which the node was selected (carried in a companion annotation; taint values
/// must be valid label values and cannot hold an RFC 3339 string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTaintState {
    pub value: DrainTaintValue,
    pub since: Option<DateTime<Utc>>,
}

/// Returns the drain taint state of the given node, if any.
pub fn drain_taint(node: &Node) -> Option<DrainTaintState> {
    let taints = node.spec.as_ref()?.taints.as_ref()?;
    let taint = taints.iter().find(|t| t.key == DRAIN_TAINT_KEY)?;
    let value = DrainTaintValue::parse(taint.value.as_deref().unwrap_or_default())?;
    Some(DrainTaintState {
        value,
        since: drain_taint_since(node),
    })
}

/// Returns the timestamp at which the drain taint was first applied.
pub fn drain_taint_since(node: &Node) -> Option<DateTime<Utc>> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DRAIN_TAINT_SINCE_ANNOTATION))
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Builds the taint object for the given lifecycle value. NoSchedule keeps new
/// workloads off the node without disturbing the ones we are about to evict.
pub fn build_drain_taint(value: DrainTaintValue) -> Taint {
    Taint {
        key: DRAIN_TAINT_KEY.to_string(),
        value: Some(value.as_str().to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    }
}

/// Parsed view of the `DrainScheduled` node condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConditionStatus {
    pub completed: bool,
    pub failed: bool,
    pub failed_count: u32,
    pub last_transition: Option<DateTime<Utc>>,
}

impl DrainConditionStatus {
    pub fn in_progress(&self) -> bool {
        !self.completed && !self.failed
    }
}

/// Builds the `DrainScheduled` condition message.
///
/// The attempt counter rides in a human-readable `[N]` prefix so operators can see
/// it with `kubectl describe node`; [`drain_condition`] round-trips it back out.
pub fn format_drain_condition_message(
    when: DateTime<Utc>,
    finish: Option<DateTime<Utc>>,
    failed: bool,
    fail_count: u32,
) -> String {
    let mut message = format!(
        "[{}] | Drain activity scheduled {}",
        fail_count,
        when.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    if let Some(finish) = finish {
        let outcome = if failed { FAILED_STR } else { COMPLETED_STR };
        message.push_str(&format!(
            " | {}: {}",
            outcome,
            finish.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));
    }
    message
}

/// Reads the `DrainScheduled` condition from a node, if present.
pub fn drain_condition(node: &Node) -> Result<Option<DrainConditionStatus>> {
    let node_name = node.metadata.name.clone().unwrap_or_default();
    let conditions = match node.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        Some(conditions) => conditions,
        None => return Ok(None),
    };

    for condition in conditions {
        if condition.type_ != CONDITION_DRAIN_SCHEDULED {
            continue;
        }

        let message = condition.message.as_deref().unwrap_or_default();
        let mut failed_count = 0;
        if let Some(prefix) = message.split(" | ").next() {
            if let Some(captures) = ATTEMPT_PREFIX_RE.captures(prefix) {
                failed_count = captures[1].parse().map_err(|_| {
                    error::ParseConditionMessageSnafu {
                        node_name: node_name.clone(),
                        message: message.to_string(),
                    }
                    .build()
                })?;
            }
        }

        let last_transition = condition
            .last_transition_time
            .as_ref()
            .map(|time| time.0.with_timezone(&Utc));

        return match condition.status.as_str() {
            "True" => Ok(Some(DrainConditionStatus {
                completed: false,
                failed: false,
                failed_count,
                last_transition,
            })),
            "False" => {
                let completed = message.contains(COMPLETED_STR);
                let failed = message.contains(FAILED_STR);
                if !completed && !failed {
                    return error::UnreadableConditionSnafu {
                        node_name,
                        condition: CONDITION_DRAIN_SCHEDULED,
                    }
                    .fail();
                }
                Ok(Some(DrainConditionStatus {
                    completed,
                    failed,
                    failed_count,
                    last_transition,
                }))
            }
            _ => error::UnreadableConditionSnafu {
                node_name,
                condition: CONDITION_DRAIN_SCHEDULED,
            }
            .fail(),
        };
    }
    Ok(None)
}

/// Value of the replacement request label, owned jointly with the external
/// provisioner: this controller writes `requested`, the provisioner answers
/// with `done` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementStatus {
    Requested,
    Done,
    Failed,
}

impl ReplacementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "requested" => Some(Self::Requested),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Reads the replacement request label from a node.
pub fn replacement_status(node: &Node) -> Option<ReplacementStatus> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(REPLACE_LABEL_KEY))
        .and_then(|value| ReplacementStatus::parse(value))
}

/// Reads the per-node retry-max-attempt override.
///
/// Returns the effective override (clamped to 100) and an optional warning to be
/// surfaced as a `BadValueForAnnotation` event. A missing annotation, an
/// unparseable value or a value below 1 all mean "use the default".
pub fn retry_max_attempt(node: &Node) -> (Option<u32>, Option<String>) {
    let raw = match node
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(RETRY_MAX_ATTEMPT_ANNOTATION))
    {
        Some(raw) => raw,
        None => return (None, None),
    };

    match raw.parse::<i64>() {
        Err(_) => (
            None,
            Some(format!(
                "{} can't convert value. Ignoring the user value '{}' and using default instead.",
                RETRY_MAX_ATTEMPT_ANNOTATION, raw
            )),
        ),
        Ok(value) if value < 1 => (
            None,
            Some(format!(
                "{} has a zero or negative value. Ignoring the value '{}' and using default instead.",
                RETRY_MAX_ATTEMPT_ANNOTATION, raw
            )),
        ),
        Ok(value) if value > 100 => (
            Some(100),
            Some(format!(
                "{} has a too big value '{}'. Ignoring the value and using 100 instead.",
                RETRY_MAX_ATTEMPT_ANNOTATION, raw
            )),
        ),
        Ok(value) => (Some(value as u32), None),
    }
}

/// A node condition that makes a node eligible for draining, as configured by the
/// operator (for example `KernelDeadlock` or `OutOfDisk=10m`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppliedCondition {
    pub condition_type: String,
    /// The condition must have been `True` for at least this long before it counts.
    pub min_duration: Option<Duration>,
}

/// Returns the conditions on the node that currently match the supplied set.
pub fn offending_conditions<'a>(
    node: &'a Node,
    supplied: &[SuppliedCondition],
    now: DateTime<Utc>,
) -> Vec<&'a NodeCondition> {
    let conditions = match node.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        Some(conditions) => conditions,
        None => return Vec::new(),
    };

    conditions
        .iter()
        .filter(|condition| {
            let matching = match supplied
                .iter()
                .find(|s| s.condition_type == condition.type_)
            {
                Some(matching) => matching,
                None => return false,
            };
            if condition.status != "True" {
                return false;
            }
            match matching.min_duration {
                None => true,
                Some(min_duration) => condition
                    .last_transition_time
                    .as_ref()
                    .map(|transition| {
                        (now - transition.0)
                            .to_std()
                            .map(|elapsed| elapsed >= min_duration)
                            .unwrap_or(false)
                    })
                    .unwrap_or(true),
            }
        })
        .collect()
}

/// Returns the controller identities listed in the node's scope label.
pub fn scope_identities(node: &Node) -> Vec<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SCOPE_LABEL_KEY))
        .map(|value| {
            value
                .split('.')
                .filter(|part| !part.is_empty() && *part != OUT_OF_SCOPE_LABEL_VALUE)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the node's scope label lists this controller's identity.
pub fn node_in_scope(node: &Node, config_name: &str) -> bool {
    scope_identities(node).iter().any(|id| id == config_name)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn node_with_taint(value: &str, since: Option<&str>) -> Node {
        let mut annotations = btreemap! {};
        if let Some(since) = since {
            annotations.insert(
                DRAIN_TAINT_SINCE_ANNOTATION.to_string(),
                since.to_string(),
            );
        }
        Node {
            metadata: ObjectMeta {
                name: Some("test-node".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(vec![Taint {
                    key: DRAIN_TAINT_KEY.to_string(),
                    value: Some(value.to_string()),
                    effect: "NoSchedule".to_string(),
                    time_added: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_with_condition(status: &str, message: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("test-node".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: CONDITION_DRAIN_SCHEDULED.to_string(),
                    status: status.to_string(),
                    message: Some(message.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_drain_taint_round_trip() {
        let node = node_with_taint("drain-candidate", Some("2023-03-20T15:50:34Z"));
        let state = drain_taint(&node).unwrap();
        assert_eq!(state.value, DrainTaintValue::DrainCandidate);
        assert_eq!(
            state.since.unwrap(),
            DateTime::parse_from_rfc3339("2023-03-20T15:50:34Z").unwrap()
        );

        let node = node_with_taint("draining", None);
        let state = drain_taint(&node).unwrap();
        assert_eq!(state.value, DrainTaintValue::Draining);
        assert_eq!(state.since, None);

        let node = node_with_taint("unrelated-value", None);
        assert!(drain_taint(&node).is_none());

        assert!(drain_taint(&Node::default()).is_none());
    }

    #[test]
    fn test_condition_message_round_trip() {
        let when = DateTime::parse_from_rfc3339("2023-03-20T15:50:34Z")
            .unwrap()
            .with_timezone(&Utc);
        let finish = DateTime::parse_from_rfc3339("2023-03-20T15:55:50Z")
            .unwrap()
            .with_timezone(&Utc);

        let test_cases = vec![
            (
                format_drain_condition_message(when, None, false, 0),
                "True",
                DrainConditionStatus {
                    completed: false,
                    failed: false,
                    failed_count: 0,
                    last_transition: None,
                },
            ),
            (
                format_drain_condition_message(when, Some(finish), false, 2),
                "False",
                DrainConditionStatus {
                    completed: true,
                    failed: false,
                    failed_count: 2,
                    last_transition: None,
                },
            ),
            (
                format_drain_condition_message(when, Some(finish), true, 7),
                "False",
                DrainConditionStatus {
                    completed: false,
                    failed: true,
                    failed_count: 7,
                    last_transition: None,
                },
            ),
        ];

        for (message, status, expected) in test_cases {
            let node = node_with_condition(status, &message);
            let parsed = drain_condition(&node).unwrap().unwrap();
            assert_eq!(parsed, expected, "message: {}", message);
        }
    }

    #[test]
    fn test_condition_message_format() {
        let when = DateTime::parse_from_rfc3339("2020-03-20T15:50:34Z")
            .unwrap()
            .with_timezone(&Utc);
        let finish = DateTime::parse_from_rfc3339("2020-03-20T15:55:50Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            format_drain_condition_message(when, Some(finish), true, 1),
            "[1] | Drain activity scheduled 2020-03-20T15:50:34Z | Failed: 2020-03-20T15:55:50Z"
        );
        assert_eq!(
            format_drain_condition_message(when, None, false, 0),
            "[0] | Drain activity scheduled 2020-03-20T15:50:34Z"
        );
    }

    #[test]
    fn test_drain_condition_absent() {
        assert_eq!(drain_condition(&Node::default()).unwrap(), None);
    }

    #[test]
    fn test_drain_condition_unreadable() {
        let node = node_with_condition("False", "[1] | Drain activity scheduled sometime");
        assert!(drain_condition(&node).is_err());

        let node = node_with_condition("Unknown", "[1] | Drain activity scheduled sometime");
        assert!(drain_condition(&node).is_err());
    }

    #[test]
    fn test_retry_max_attempt() {
        let annotated = |value: &str| Node {
            metadata: ObjectMeta {
                annotations: Some(btreemap! {
                    RETRY_MAX_ATTEMPT_ANNOTATION.to_string() => value.to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(retry_max_attempt(&Node::default()), (None, None));

        let (value, warning) = retry_max_attempt(&annotated("12"));
        assert_eq!(value, Some(12));
        assert!(warning.is_none());

        let (value, warning) = retry_max_attempt(&annotated("0"));
        assert_eq!(value, None);
        assert!(warning.is_some());

        let (value, warning) = retry_max_attempt(&annotated("250"));
        assert_eq!(value, Some(100));
        assert!(warning.is_some());

        let (value, warning) = retry_max_attempt(&annotated("abc"));
        assert_eq!(value, None);
        assert!(warning.is_some());
    }

    #[test]
    fn test_offending_conditions() {
        let now = Utc::now();
        let node = Node {
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition {
                        type_: "KernelDeadlock".to_string(),
                        status: "True".to_string(),
                        last_transition_time: Some(Time(now - chrono::Duration::minutes(30))),
                        ..Default::default()
                    },
                    NodeCondition {
                        type_: "OutOfDisk".to_string(),
                        status: "False".to_string(),
                        ..Default::default()
                    },
                    NodeCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let supplied = vec![
            SuppliedCondition {
                condition_type: "KernelDeadlock".to_string(),
                min_duration: None,
            },
            SuppliedCondition {
                condition_type: "OutOfDisk".to_string(),
                min_duration: None,
            },
        ];
        let offending = offending_conditions(&node, &supplied, now);
        assert_eq!(offending.len(), 1);
        assert_eq!(offending[0].type_, "KernelDeadlock");

        // The condition only counts once it has been true for the minimum duration.
        let supplied = vec![SuppliedCondition {
            condition_type: "KernelDeadlock".to_string(),
            min_duration: Some(Duration::from_secs(3600)),
        }];
        assert!(offending_conditions(&node, &supplied, now).is_empty());

        let supplied = vec![SuppliedCondition {
            condition_type: "KernelDeadlock".to_string(),
            min_duration: Some(Duration::from_secs(600)),
        }];
        assert_eq!(offending_conditions(&node, &supplied, now).len(), 1);
    }

    #[test]
    fn test_scope_identities() {
        let labelled = |value: &str| Node {
            metadata: ObjectMeta {
                labels: Some(btreemap! {
                    SCOPE_LABEL_KEY.to_string() => value.to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(scope_identities(&Node::default()).is_empty());
        assert!(scope_identities(&labelled(OUT_OF_SCOPE_LABEL_VALUE)).is_empty());
        assert_eq!(scope_identities(&labelled("drainop1")), vec!["drainop1"]);
        assert_eq!(
            scope_identities(&labelled("drainop1.drainop2")),
            vec!["drainop1", "drainop2"]
        );
        assert!(node_in_scope(&labelled("drainop1.drainop2"), "drainop2"));
        assert!(!node_in_scope(&labelled("drainop1"), "drainop2"));
    }
}
