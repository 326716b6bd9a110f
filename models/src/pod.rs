//! Pod classification and annotation plumbing.
//!
//! Eviction-related annotations may live on a pod or on its controlling workload;
//! lookups here take an optional resolved controller so callers backed by the
//! object index can search the whole chain.

use crate::constants::{
    DO_NOT_EVICT_ANNOTATION, EVICTION_API_URL_ANNOTATION, KIND_DAEMON_SET, MIRROR_POD_ANNOTATION,
    PVC_CLEANUP_ANNOTATION, PVC_CLEANUP_ANNOTATION_FALSE_VALUE, PVC_CLEANUP_ANNOTATION_TRUE_VALUE,
};

use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Metadata of a pod's controlling workload (Deployment, StatefulSet, DaemonSet or
/// bare ReplicaSet), resolved through the object index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadMeta {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
}

/// Looks up an annotation on the pod itself.
pub fn pod_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Looks up an annotation on the pod first, then on its controlling workload.
pub fn annotation_from_pod_or_controller<'a>(
    pod: &'a Pod,
    controller: Option<&'a WorkloadMeta>,
    key: &str,
) -> Option<&'a str> {
    pod_annotation(pod, key).or_else(|| {
        controller
            .and_then(|workload| workload.annotations.get(key))
            .map(String::as_str)
    })
}

/// Static mirror pods are created by the kubelet from local manifests; evicting
/// them has no effect because the kubelet recreates them immediately.
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| annotations.contains_key(MIRROR_POD_ANNOTATION))
        .unwrap_or(false)
}

/// DaemonSet pods ignore taints this controller applies, so evicting them only
/// battles the DaemonSet controller.
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|owners| {
            owners
                .iter()
                .any(|owner| owner.controller == Some(true) && owner.kind == KIND_DAEMON_SET)
        })
        .unwrap_or(false)
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Whether the pod currently counts as healthy toward its disruption budget.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// Returns the pod's termination grace period, falling back to the kubernetes
/// default of 30 seconds.
pub fn termination_grace_period(pod: &Pod) -> Duration {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.termination_grace_period_seconds)
        .filter(|seconds| *seconds >= 0)
        .map(|seconds| Duration::from_secs(seconds as u64))
        .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD)
}

/// The custom eviction endpoint configured for a pod, if any.
pub fn eviction_url<'a>(pod: &'a Pod, controller: Option<&'a WorkloadMeta>) -> Option<&'a str> {
    annotation_from_pod_or_controller(pod, controller, EVICTION_API_URL_ANNOTATION)
}

/// Whether PVC/PV cleanup applies to this pod.
///
/// Explicit opt-in/opt-out annotations win. Without one, cleanup may default to
/// enabled for pods that have no custom eviction endpoint (those endpoints usually
/// manage their own storage).
pub fn pvc_cleanup_enabled(
    pod: &Pod,
    controller: Option<&WorkloadMeta>,
    default_true_if_no_eviction_url: bool,
) -> bool {
    match annotation_from_pod_or_controller(pod, controller, PVC_CLEANUP_ANNOTATION) {
        Some(PVC_CLEANUP_ANNOTATION_TRUE_VALUE) => return true,
        Some(PVC_CLEANUP_ANNOTATION_FALSE_VALUE) => return false,
        _ => {}
    }
    if default_true_if_no_eviction_url {
        return eviction_url(pod, controller).is_none();
    }
    false
}

/// Whether the pod is protected from eviction by the opt-out annotation, on the
/// pod itself or on its controlling workload. Nodes hosting a protected pod are
/// taken out of scope entirely: a drain of such a node could never complete.
pub fn is_protected(pod: &Pod, controller: Option<&WorkloadMeta>) -> bool {
    annotation_from_pod_or_controller(pod, controller, DO_NOT_EVICT_ANNOTATION) == Some("true")
}

/// Decides which pods are subject to eviction during a drain. Mirror and DaemonSet
/// pods are excluded; everything else is evicted, including completed and
/// unreplicated pods (disruption budgets protect workloads that need protecting).
#[derive(Debug, Clone, Default)]
pub struct PodFilter {}

impl PodFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the pod should go through eviction, and the reason when not.
    pub fn evictable(&self, pod: &Pod) -> (bool, String) {
        if is_mirror_pod(pod) {
            return (false, "pod is a static mirror pod".to_string());
        }
        if is_daemonset_pod(pod) {
            return (false, "pod is member of a DaemonSet".to_string());
        }
        (true, String::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn pod_with_annotations(annotations: BTreeMap<String, String>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn daemonset_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: KIND_DAEMON_SET.to_string(),
                    name: "ds".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_filter() {
        let filter = PodFilter::new();

        let (pass, _) = filter.evictable(&Pod::default());
        assert!(pass);

        let mirror = pod_with_annotations(btreemap! {
            MIRROR_POD_ANNOTATION.to_string() => "checksum".to_string(),
        });
        let (pass, reason) = filter.evictable(&mirror);
        assert!(!pass);
        assert!(reason.contains("mirror"));

        let (pass, reason) = filter.evictable(&daemonset_pod());
        assert!(!pass);
        assert!(reason.contains("DaemonSet"));
    }

    #[test]
    fn test_is_protected() {
        assert!(!is_protected(&Pod::default(), None));

        let protected = pod_with_annotations(btreemap! {
            DO_NOT_EVICT_ANNOTATION.to_string() => "true".to_string(),
        });
        assert!(is_protected(&protected, None));

        // Protection can also come from the controlling workload.
        let controller = WorkloadMeta {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
            annotations: btreemap! {
                DO_NOT_EVICT_ANNOTATION.to_string() => "true".to_string(),
            },
        };
        assert!(is_protected(&Pod::default(), Some(&controller)));

        let opted_in = pod_with_annotations(btreemap! {
            DO_NOT_EVICT_ANNOTATION.to_string() => "false".to_string(),
        });
        assert!(!is_protected(&opted_in, None));
    }

    #[test]
    fn test_pvc_cleanup_enabled() {
        let with_cleanup = |value: &str| {
            pod_with_annotations(btreemap! {
                PVC_CLEANUP_ANNOTATION.to_string() => value.to_string(),
            })
        };
        let with_url = pod_with_annotations(btreemap! {
            EVICTION_API_URL_ANNOTATION.to_string() => "https://example/evict".to_string(),
        });
        let with_both = pod_with_annotations(btreemap! {
            PVC_CLEANUP_ANNOTATION.to_string() => PVC_CLEANUP_ANNOTATION_TRUE_VALUE.to_string(),
            EVICTION_API_URL_ANNOTATION.to_string() => "https://example/evict".to_string(),
        });

        let test_cases = vec![
            // (pod, default_true_if_no_eviction_url, expected)
            (Pod::default(), false, false),
            (Pod::default(), true, true),
            (with_cleanup(PVC_CLEANUP_ANNOTATION_FALSE_VALUE), true, false),
            (with_cleanup(PVC_CLEANUP_ANNOTATION_TRUE_VALUE), false, true),
            (with_url, true, false),
            (with_both, true, true),
        ];
        for (pod, default_if_no_url, expected) in test_cases {
            assert_eq!(
                pvc_cleanup_enabled(&pod, None, default_if_no_url),
                expected,
                "pod: {:?}",
                pod.metadata.annotations,
            );
        }
    }

    #[test]
    fn test_termination_grace_period() {
        assert_eq!(
            termination_grace_period(&Pod::default()),
            DEFAULT_TERMINATION_GRACE_PERIOD
        );

        let pod = Pod {
            spec: Some(PodSpec {
                termination_grace_period_seconds: Some(120),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(termination_grace_period(&pod), Duration::from_secs(120));
    }
}
