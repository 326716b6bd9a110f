//! Third-party activity hooks that gate a drain (pre) or the replacement of a
//! drained node (post).
//!
//! Activities are declared as annotations on the node, on any pod running on it,
//! or on a pod's controlling workload. Each activity has a state annotation and an
//! optional timeout annotation; elapsed time is measured from the moment the
//! drain-candidate marker was applied.

use crate::index::ObjectIndex;

use models::constants::{
    ACTIVITY_STATE_DONE, ACTIVITY_STATE_FAILED, ACTIVITY_STATE_NOT_STARTED,
    POST_ACTIVITY_ANNOTATION_PREFIX, POST_ACTIVITY_TIMEOUT_ANNOTATION_PREFIX,
    PRE_ACTIVITY_ANNOTATION_PREFIX, PRE_ACTIVITY_TIMEOUT_ANNOTATION_PREFIX,
};
use models::duration::parse_duration;
use models::node::drain_taint;
use models::pod::WorkloadMeta;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

pub type Result<T> = std::result::Result<T, error::Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityPhase {
    /// Gates the transition from drain-candidate to draining.
    Pre,
    /// Gates the replacement request after a successful drain.
    Post,
}

impl ActivityPhase {
    fn state_prefix(&self) -> &'static str {
        match self {
            Self::Pre => PRE_ACTIVITY_ANNOTATION_PREFIX,
            Self::Post => POST_ACTIVITY_ANNOTATION_PREFIX,
        }
    }

    fn timeout_prefix(&self) -> &'static str {
        match self {
            Self::Pre => PRE_ACTIVITY_TIMEOUT_ANNOTATION_PREFIX,
            Self::Post => POST_ACTIVITY_TIMEOUT_ANNOTATION_PREFIX,
        }
    }
}

/// Aggregated answer over every activity reachable from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityCheck {
    /// All activities are done, or none exist.
    Done,
    /// At least one activity is still running within its time budget.
    Processing { activity: String },
    /// An activity reported failure.
    Failed { activity: String },
    /// An activity exceeded its time budget.
    TimedOut { activity: String },
}

/// Where an activity annotation was found; needed to reset it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AnnotationSource {
    Node { name: String },
    Pod { namespace: String, name: String },
    Workload(WorkloadMeta),
}

#[derive(Debug, Clone)]
struct ActivityState {
    name: String,
    state: String,
    source: AnnotationSource,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// Annotation writes performed by the orchestrator's reset operation. A trait so
/// tests can observe the patches without a cluster.
pub trait ActivityPatcher: Send + Sync {
    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), kube::Error>;
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), kube::Error>;
    async fn patch_workload_annotations(
        &self,
        workload: &WorkloadMeta,
        annotations: BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), kube::Error>;
}

#[derive(Clone)]
pub struct KubeActivityPatcher {
    client: kube::Client,
}

impl KubeActivityPatcher {
    pub fn new(client: kube::Client) -> Self {
        KubeActivityPatcher { client }
    }

    fn annotation_patch(annotations: &BTreeMap<String, Option<String>>) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in annotations {
            let value = match value {
                Some(value) => serde_json::Value::String(value.clone()),
                None => serde_json::Value::Null,
            };
            map.insert(key.clone(), value);
        }
        serde_json::json!({ "metadata": { "annotations": serde_json::Value::Object(map) } })
    }
}

#[async_trait]
impl ActivityPatcher for KubeActivityPatcher {
    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), kube::Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(Self::annotation_patch(&annotations)),
        )
        .await?;
        Ok(())
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(Self::annotation_patch(&annotations)),
        )
        .await?;
        Ok(())
    }

    async fn patch_workload_annotations(
        &self,
        workload: &WorkloadMeta,
        annotations: BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), kube::Error> {
        let patch = Patch::Merge(Self::annotation_patch(&annotations));
        let params = PatchParams::default();
        match workload.kind.as_str() {
            "Deployment" => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &patch).await?;
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &patch).await?;
            }
            "DaemonSet" => {
                let api: Api<DaemonSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &patch).await?;
            }
            "ReplicaSet" => {
                let api: Api<ReplicaSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &patch).await?;
            }
            other => {
                event!(Level::WARN, kind = other, "Cannot patch unknown workload kind.");
            }
        }
        Ok(())
    }
}

pub struct ActivityOrchestrator<P: ActivityPatcher> {
    patcher: P,
    index: Arc<ObjectIndex>,
    default_timeout: Duration,
}

impl<P: ActivityPatcher> ActivityOrchestrator<P> {
    pub fn new(patcher: P, index: Arc<ObjectIndex>, default_timeout: Duration) -> Self {
        ActivityOrchestrator {
            patcher,
            index,
            default_timeout,
        }
    }

    /// Collects every activity state and timeout reachable from the node
    /// (node -> pods -> controlling workloads).
    fn collect(
        &self,
        node: &Node,
        phase: ActivityPhase,
    ) -> Result<(Vec<ActivityState>, HashMap<String, Duration>)> {
        let mut states = Vec::new();
        let mut timeouts = HashMap::new();

        let mut absorb = |annotations: Option<&BTreeMap<String, String>>,
                          source: AnnotationSource| {
            let annotations = match annotations {
                Some(annotations) => annotations,
                None => return,
            };
            for (key, value) in annotations {
                if let Some(name) = key.strip_prefix(phase.state_prefix()) {
                    states.push(ActivityState {
                        name: name.to_string(),
                        state: value.clone(),
                        source: source.clone(),
                    });
                } else if let Some(name) = key.strip_prefix(phase.timeout_prefix()) {
                    match parse_duration(value) {
                        Ok(timeout) => {
                            timeouts.insert(name.to_string(), timeout);
                        }
                        Err(err) => event!(
                            Level::WARN,
                            activity = name,
                            value = %value,
                            error = %err,
                            "Ignoring unparseable activity timeout annotation."
                        ),
                    }
                }
            }
        };

        absorb(
            node.metadata.annotations.as_ref(),
            AnnotationSource::Node {
                name: node.name_any(),
            },
        );

        let mut seen_workloads = HashSet::new();
        for pod in self.index.pods_on_node(&node.name_any())? {
            absorb(
                pod.metadata.annotations.as_ref(),
                AnnotationSource::Pod {
                    namespace: pod.namespace().unwrap_or_default(),
                    name: pod.name_any(),
                },
            );
            if let Some(workload) = self.index.controller_of(&pod)? {
                let key = (
                    workload.kind.clone(),
                    workload.namespace.clone(),
                    workload.name.clone(),
                );
                if seen_workloads.insert(key) {
                    let annotations = workload.annotations.clone();
                    absorb(Some(&annotations), AnnotationSource::Workload(workload));
                }
            }
        }

        Ok((states, timeouts))
    }

    /// Aggregates the activities for a phase. Failure wins over timeout, timeout
    /// over processing.
    pub fn check(
        &self,
        node: &Node,
        phase: ActivityPhase,
        now: DateTime<Utc>,
    ) -> Result<ActivityCheck> {
        let (states, timeouts) = self.collect(node, phase)?;
        let since = drain_taint(node).and_then(|taint| taint.since);

        let mut timed_out: Option<String> = None;
        let mut processing: Option<String> = None;
        for activity in &states {
            match activity.state.as_str() {
                ACTIVITY_STATE_FAILED => {
                    return Ok(ActivityCheck::Failed {
                        activity: activity.name.clone(),
                    })
                }
                ACTIVITY_STATE_DONE => {}
                // not-started, processing, and anything unrecognized all mean the
                // activity is not finished; only the clock decides between
                // "still waiting" and "timed out".
                _ => {
                    let timeout = timeouts
                        .get(&activity.name)
                        .copied()
                        .unwrap_or(self.default_timeout);
                    let elapsed = since
                        .map(|since| (now - since).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::ZERO);
                    if elapsed > timeout {
                        timed_out.get_or_insert_with(|| activity.name.clone());
                    } else {
                        processing.get_or_insert_with(|| activity.name.clone());
                    }
                }
            }
        }

        if let Some(activity) = timed_out {
            return Ok(ActivityCheck::TimedOut { activity });
        }
        if let Some(activity) = processing {
            return Ok(ActivityCheck::Processing { activity });
        }
        Ok(ActivityCheck::Done)
    }

    /// Rewrites every activity state annotation reachable from the node back to
    /// `not-started`, preparing a retry.
    pub async fn reset(&self, node: &Node, phase: ActivityPhase) -> Result<()> {
        let (states, _) = self.collect(node, phase)?;

        // Group the rewrites per source object so each object gets a single patch.
        let mut per_source: Vec<(AnnotationSource, BTreeMap<String, Option<String>>)> = Vec::new();
        for activity in states {
            let key = format!("{}{}", phase.state_prefix(), activity.name);
            match per_source
                .iter_mut()
                .find(|(source, _)| *source == activity.source)
            {
                Some((_, annotations)) => {
                    annotations.insert(key, Some(ACTIVITY_STATE_NOT_STARTED.to_string()));
                }
                None => {
                    let mut annotations = BTreeMap::new();
                    annotations.insert(key, Some(ACTIVITY_STATE_NOT_STARTED.to_string()));
                    per_source.push((activity.source, annotations));
                }
            }
        }

        for (source, annotations) in per_source {
            match source {
                AnnotationSource::Node { name } => self
                    .patcher
                    .patch_node_annotations(&name, annotations)
                    .await
                    .map_err(|source| error::Error::Patch { source })?,
                AnnotationSource::Pod { namespace, name } => self
                    .patcher
                    .patch_pod_annotations(&namespace, &name, annotations)
                    .await
                    .map_err(|source| error::Error::Patch { source })?,
                AnnotationSource::Workload(workload) => self
                    .patcher
                    .patch_workload_annotations(&workload, annotations)
                    .await
                    .map_err(|source| error::Error::Patch { source })?,
            }
        }
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Object index is not usable: '{}'", source))]
        Index {
            source: crate::index::error::Error,
        },

        #[snafu(display("Cannot patch activity annotation: '{}'", source))]
        Patch { source: kube::Error },
    }

    impl From<crate::index::error::Error> for Error {
        fn from(source: crate::index::error::Error) -> Self {
            Error::Index { source }
        }
    }
}
