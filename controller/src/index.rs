//! Reflector-backed in-memory indexes over the cluster objects the controller reads.
//!
//! Queries are read-only snapshots; consistency holds within a single query but not
//! across queries. Until every underlying store has synced, queries fail with a
//! distinguishable `not-ready` error so callers defer work instead of acting on an
//! incomplete view of the cluster.

use models::constants::{KIND_DAEMON_SET, KIND_DEPLOYMENT, KIND_REPLICA_SET, KIND_STATEFUL_SET};
use models::pod::WorkloadMeta;

use futures::{future, Future, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::{reflector, reflector::Store, watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{event, Level};

pub type Result<T> = std::result::Result<T, error::Error>;

/// In-memory indexes over nodes, pods, disruption budgets and the workload kinds
/// needed to resolve a pod's controlling object.
#[derive(Clone)]
pub struct ObjectIndex {
    nodes: Store<Node>,
    pods: Store<Pod>,
    budgets: Store<PodDisruptionBudget>,
    replica_sets: Store<ReplicaSet>,
    deployments: Store<Deployment>,
    stateful_sets: Store<StatefulSet>,
    daemon_sets: Store<DaemonSet>,
    ready: Arc<AtomicBool>,
}

fn reflect<K>(
    client: &kube::Client,
) -> (Store<K>, impl Future<Output = ()> + Send + 'static)
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(client.clone());
    let writer = reflector::store::Writer::<K>::default();
    let reader = writer.as_reader();
    let drive = reflector(writer, watcher(api, watcher::Config::default()))
        .touched_objects()
        .filter_map(|object| future::ready(object.ok()))
        .for_each(|object| {
            event!(
                Level::TRACE,
                name = %object.name_any(),
                "Processed a k8s event for a watched object."
            );
            future::ready(())
        });
    (reader, drive)
}

impl ObjectIndex {
    /// Creates the index and the future driving its reflectors. The future runs for
    /// the lifetime of the process and must be polled (spawned or selected on) for
    /// the index to observe the cluster.
    pub fn new(client: &kube::Client) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let (nodes, drive_nodes) = reflect::<Node>(client);
        let (pods, drive_pods) = reflect::<Pod>(client);
        let (budgets, drive_budgets) = reflect::<PodDisruptionBudget>(client);
        let (replica_sets, drive_replica_sets) = reflect::<ReplicaSet>(client);
        let (deployments, drive_deployments) = reflect::<Deployment>(client);
        let (stateful_sets, drive_stateful_sets) = reflect::<StatefulSet>(client);
        let (daemon_sets, drive_daemon_sets) = reflect::<DaemonSet>(client);

        let ready = Arc::new(AtomicBool::new(false));
        let index = ObjectIndex {
            nodes: nodes.clone(),
            pods: pods.clone(),
            budgets: budgets.clone(),
            replica_sets: replica_sets.clone(),
            deployments: deployments.clone(),
            stateful_sets: stateful_sets.clone(),
            daemon_sets: daemon_sets.clone(),
            ready: ready.clone(),
        };

        let mark_ready = async move {
            let _ = nodes.wait_until_ready().await;
            let _ = pods.wait_until_ready().await;
            let _ = budgets.wait_until_ready().await;
            let _ = replica_sets.wait_until_ready().await;
            let _ = deployments.wait_until_ready().await;
            let _ = stateful_sets.wait_until_ready().await;
            let _ = daemon_sets.wait_until_ready().await;
            ready.store(true, Ordering::SeqCst);
            event!(Level::INFO, "Object index synced.");
        };

        let drive = async move {
            futures::join!(
                drive_nodes,
                drive_pods,
                drive_budgets,
                drive_replica_sets,
                drive_deployments,
                drive_stateful_sets,
                drive_daemon_sets,
                mark_ready,
            );
        }
        .boxed();

        (index, drive)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            error::NotReadySnafu.fail()
        }
    }

    /// Snapshot of all nodes in the cluster.
    pub fn nodes(&self) -> Result<Vec<Arc<Node>>> {
        self.ensure_ready()?;
        Ok(self.nodes.state())
    }

    /// Looks up a single node by name.
    pub fn node(&self, name: &str) -> Result<Option<Arc<Node>>> {
        self.ensure_ready()?;
        Ok(self.nodes.find(|node| node.name_any() == name))
    }

    /// All pods currently scheduled on the named node.
    pub fn pods_on_node(&self, node_name: &str) -> Result<Vec<Arc<Pod>>> {
        self.ensure_ready()?;
        Ok(self
            .pods
            .state()
            .into_iter()
            .filter(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|spec| spec.node_name.as_deref())
                    == Some(node_name)
            })
            .collect())
    }

    /// All disruption budgets whose selector matches the given pod.
    pub fn budgets_for_pod(&self, pod: &Pod) -> Result<Vec<Arc<PodDisruptionBudget>>> {
        self.ensure_ready()?;
        let namespace = pod.namespace().unwrap_or_default();
        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        Ok(self
            .budgets
            .state()
            .into_iter()
            .filter(|budget| budget.namespace().unwrap_or_default() == namespace)
            .filter(|budget| {
                budget
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.selector.as_ref())
                    .map(|selector| selector_matches(selector, labels))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Resolves the workload controlling a pod, following the ReplicaSet hop up to
    /// its Deployment when there is one.
    pub fn controller_of(&self, pod: &Pod) -> Result<Option<WorkloadMeta>> {
        self.ensure_ready()?;
        let namespace = pod.namespace().unwrap_or_default();
        let owner = match pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|owners| owners.iter().find(|o| o.controller == Some(true)))
        {
            Some(owner) => owner,
            None => return Ok(None),
        };

        let meta = match owner.kind.as_str() {
            KIND_REPLICA_SET => {
                let replica_set = self.replica_sets.find(|rs| {
                    rs.name_any() == owner.name && rs.namespace().unwrap_or_default() == namespace
                });
                match replica_set {
                    None => None,
                    Some(replica_set) => {
                        let deployment_owner = replica_set
                            .metadata
                            .owner_references
                            .as_ref()
                            .and_then(|owners| owners.iter().find(|o| {
                                o.controller == Some(true) && o.kind == KIND_DEPLOYMENT
                            }))
                            .cloned();
                        match deployment_owner {
                            Some(deployment_owner) => self
                                .deployments
                                .find(|d| {
                                    d.name_any() == deployment_owner.name
                                        && d.namespace().unwrap_or_default() == namespace
                                })
                                .map(|d| workload_meta(KIND_DEPLOYMENT, &d.metadata))
                                .or_else(|| {
                                    Some(workload_meta(KIND_REPLICA_SET, &replica_set.metadata))
                                }),
                            None => Some(workload_meta(KIND_REPLICA_SET, &replica_set.metadata)),
                        }
                    }
                }
            }
            KIND_STATEFUL_SET => self
                .stateful_sets
                .find(|s| {
                    s.name_any() == owner.name && s.namespace().unwrap_or_default() == namespace
                })
                .map(|s| workload_meta(KIND_STATEFUL_SET, &s.metadata)),
            KIND_DAEMON_SET => self
                .daemon_sets
                .find(|d| {
                    d.name_any() == owner.name && d.namespace().unwrap_or_default() == namespace
                })
                .map(|d| workload_meta(KIND_DAEMON_SET, &d.metadata)),
            KIND_DEPLOYMENT => self
                .deployments
                .find(|d| {
                    d.name_any() == owner.name && d.namespace().unwrap_or_default() == namespace
                })
                .map(|d| workload_meta(KIND_DEPLOYMENT, &d.metadata)),
            _ => None,
        };
        Ok(meta)
    }
}

fn workload_meta(kind: &str, metadata: &kube::api::ObjectMeta) -> WorkloadMeta {
    WorkloadMeta {
        kind: kind.to_string(),
        name: metadata.name.clone().unwrap_or_default(),
        namespace: metadata.namespace.clone().unwrap_or_default(),
        annotations: metadata.annotations.clone().unwrap_or_default(),
    }
}

/// Label selector matching with standard kubernetes semantics: `NotIn` and
/// `DoesNotExist` also match when the key is absent, and the empty selector
/// matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = selector.match_labels.as_ref() {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = selector.match_expressions.as_ref() {
        for expression in expressions {
            let current = labels.get(&expression.key);
            let values = expression.values.as_deref().unwrap_or_default();
            let matched = match expression.operator.as_str() {
                "In" => current.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => current.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => current.is_some(),
                "DoesNotExist" => current.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }
    true
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Object index has not synced yet"))]
        NotReady,
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use kube::runtime::watcher::Event;

    /// Builds an `ObjectIndex` over literal objects for tests, bypassing the
    /// reflector machinery.
    #[derive(Default)]
    pub(crate) struct TestIndex {
        pub nodes: Vec<Node>,
        pub pods: Vec<Pod>,
        pub budgets: Vec<PodDisruptionBudget>,
        pub replica_sets: Vec<ReplicaSet>,
        pub deployments: Vec<Deployment>,
        pub stateful_sets: Vec<StatefulSet>,
        pub daemon_sets: Vec<DaemonSet>,
    }

    fn store_of<K>(objects: Vec<K>) -> Store<K>
    where
        K: kube::Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    {
        let (reader, mut writer) = reflector::store();
        writer.apply_watcher_event(&Event::Restarted(objects));
        reader
    }

    impl TestIndex {
        pub(crate) fn build(self) -> ObjectIndex {
            ObjectIndex {
                nodes: store_of(self.nodes),
                pods: store_of(self.pods),
                budgets: store_of(self.budgets),
                replica_sets: store_of(self.replica_sets),
                deployments: store_of(self.deployments),
                stateful_sets: store_of(self.stateful_sets),
                daemon_sets: store_of(self.daemon_sets),
                ready: Arc::new(AtomicBool::new(true)),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    #[test]
    fn test_selector_matches() {
        let labels = btreemap! {
            "app".to_string() => "web".to_string(),
            "tier".to_string() => "frontend".to_string(),
        };

        let match_labels = |entries: BTreeMap<String, String>| LabelSelector {
            match_labels: Some(entries),
            match_expressions: None,
        };
        let expression = |key: &str, operator: &str, values: Option<Vec<&str>>| LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: values.map(|v| v.into_iter().map(str::to_string).collect()),
            }]),
        };

        // The empty selector matches everything.
        assert!(selector_matches(&LabelSelector::default(), &labels));

        assert!(selector_matches(
            &match_labels(btreemap! { "app".to_string() => "web".to_string() }),
            &labels
        ));
        assert!(!selector_matches(
            &match_labels(btreemap! { "app".to_string() => "db".to_string() }),
            &labels
        ));

        assert!(selector_matches(
            &expression("app", "In", Some(vec!["web", "api"])),
            &labels
        ));
        assert!(!selector_matches(
            &expression("app", "In", Some(vec!["db"])),
            &labels
        ));
        assert!(selector_matches(
            &expression("app", "NotIn", Some(vec!["db"])),
            &labels
        ));
        // NotIn matches when the key is absent.
        assert!(selector_matches(
            &expression("missing", "NotIn", Some(vec!["db"])),
            &labels
        ));
        assert!(selector_matches(&expression("app", "Exists", None), &labels));
        assert!(!selector_matches(
            &expression("missing", "Exists", None),
            &labels
        ));
        assert!(selector_matches(
            &expression("missing", "DoesNotExist", None),
            &labels
        ));
    }

    #[test]
    fn test_not_ready_index_defers() {
        let index = ObjectIndex {
            nodes: reflector::store::<Node>().0,
            pods: reflector::store::<Pod>().0,
            budgets: reflector::store::<PodDisruptionBudget>().0,
            replica_sets: reflector::store::<ReplicaSet>().0,
            deployments: reflector::store::<Deployment>().0,
            stateful_sets: reflector::store::<StatefulSet>().0,
            daemon_sets: reflector::store::<DaemonSet>().0,
            ready: Arc::new(AtomicBool::new(false)),
        };
        assert!(matches!(
            index.nodes(),
            Err(error::Error::NotReady)
        ));
    }

    #[test]
    fn test_pods_on_node_and_budgets() {
        use k8s_openapi::api::core::v1::PodSpec;
        use k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec;

        let pod = |name: &str, node: &str, labels: BTreeMap<String, String>| Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let budget = |name: &str, selector: BTreeMap<String, String>| PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(selector),
                    match_expressions: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let app_labels = btreemap! { "app".to_string() => "web".to_string() };
        let index = fixture::TestIndex {
            pods: vec![
                pod("web-1", "node-a", app_labels.clone()),
                pod("web-2", "node-b", app_labels.clone()),
                pod("other", "node-a", btreemap! {}),
            ],
            budgets: vec![
                budget("web-pdb", app_labels.clone()),
                budget("db-pdb", btreemap! { "app".to_string() => "db".to_string() }),
            ],
            ..Default::default()
        }
        .build();

        let on_node = index.pods_on_node("node-a").unwrap();
        assert_eq!(on_node.len(), 2);

        let web_pod = pod("web-1", "node-a", app_labels);
        let budgets = index.budgets_for_pod(&web_pod).unwrap();
        assert_eq!(budgets.len(), 1);
        assert_eq!(budgets[0].name_any(), "web-pdb");
    }

    #[test]
    fn test_controller_of_follows_replicaset_to_deployment() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(btreemap! {
                    "team".to_string() => "storage".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let replica_set = ReplicaSet {
            metadata: ObjectMeta {
                name: Some("web-abc123".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: KIND_DEPLOYMENT.to_string(),
                    name: "web".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-abc123-xyz".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: KIND_REPLICA_SET.to_string(),
                    name: "web-abc123".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        let index = fixture::TestIndex {
            replica_sets: vec![replica_set],
            deployments: vec![deployment],
            ..Default::default()
        }
        .build();

        let workload = index.controller_of(&pod).unwrap().unwrap();
        assert_eq!(workload.kind, KIND_DEPLOYMENT);
        assert_eq!(workload.name, "web");
        assert_eq!(
            workload.annotations.get("team"),
            Some(&"storage".to_string())
        );

        assert!(index.controller_of(&Pod::default()).unwrap().is_none());
    }
}
