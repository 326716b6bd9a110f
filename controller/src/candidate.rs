//! Walks in-scope nodes on a tick, marks those whose health has degraded (and
//! whose drain would currently succeed) as drain candidates, and clears the
//! marker when health recovers.
//!
//! The pass is idempotent: repeated runs over unchanged cluster state produce no
//! API writes.

use crate::events::EventRecorder;
use crate::index::ObjectIndex;
use crate::simulator::{DrainSimulator, EvictionDryRun};

use models::constants::{
    EVENT_DRAIN_CANDIDATE, EVENT_DRAIN_CANDIDATE_CLEARED, RETRY_FAILED_ANNOTATION,
};
use models::node::{
    drain_taint, node_in_scope, offending_conditions, DrainTaintValue, NodeStateClient,
    SuppliedCondition,
};

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

pub type Result<T> = std::result::Result<T, crate::index::error::Error>;

const CANDIDATE_INTERVAL: Duration = Duration::from_secs(10);

pub struct CandidateRunner<C: NodeStateClient, E: EvictionDryRun> {
    client: C,
    index: Arc<ObjectIndex>,
    simulator: Arc<DrainSimulator<E>>,
    events: EventRecorder,
    config_name: String,
    conditions: Vec<SuppliedCondition>,
}

impl<C: NodeStateClient, E: EvictionDryRun> CandidateRunner<C, E> {
    pub fn new(
        client: C,
        index: Arc<ObjectIndex>,
        simulator: Arc<DrainSimulator<E>>,
        events: EventRecorder,
        config_name: String,
        conditions: Vec<SuppliedCondition>,
    ) -> Self {
        CandidateRunner {
            client,
            index,
            simulator,
            events,
            config_name,
            conditions,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<()> {
        for node in self.index.nodes()? {
            if !node_in_scope(&node, &self.config_name) {
                continue;
            }
            if let Err(err) = self.progress_node(&node).await {
                // Errors against a single node are logged and the walk moves on.
                event!(
                    Level::WARN,
                    node_name = %node.name_any(),
                    error = %err,
                    "Failed to progress node candidacy."
                );
            }
        }
        Ok(())
    }

    async fn progress_node(&self, node: &Node) -> models::node::error::Result<()> {
        let node_name = node.name_any();
        let offending = offending_conditions(node, &self.conditions, Utc::now());
        let taint = drain_taint(node);

        if offending.is_empty() {
            // Health recovered; withdraw the candidacy if we had marked one.
            if matches!(taint, Some(t) if t.value == DrainTaintValue::DrainCandidate) {
                event!(Level::INFO, node_name = %node_name, "Node conditions cleared, removing drain candidate marker.");
                self.client.remove_drain_taint(&node_name).await?;
                self.events
                    .node_event(
                        node,
                        EventType::Normal,
                        EVENT_DRAIN_CANDIDATE_CLEARED,
                        "Node conditions cleared before the drain started",
                    )
                    .await;
            }
            return Ok(());
        }

        match taint {
            // Already selected, draining or drained; nothing to do here.
            Some(_) => Ok(()),
            None => {
                if node
                    .metadata
                    .annotations
                    .as_ref()
                    .map(|annotations| annotations.contains_key(RETRY_FAILED_ANNOTATION))
                    .unwrap_or(false)
                {
                    // All drain attempts were burned; an operator has to reset the node.
                    return Ok(());
                }

                let (can_evict, reasons, errors) = self.simulator.simulate_drain(node).await;
                if !errors.is_empty() {
                    for error in &errors {
                        event!(
                            Level::DEBUG,
                            node_name = %node_name,
                            error = %error,
                            "Drain simulation errored."
                        );
                    }
                    return Ok(());
                }
                if !can_evict {
                    event!(
                        Level::DEBUG,
                        node_name = %node_name,
                        reasons = ?reasons,
                        "Node is unhealthy but cannot be drained right now."
                    );
                    return Ok(());
                }

                let condition_names: Vec<&str> = offending
                    .iter()
                    .map(|condition| condition.type_.as_str())
                    .collect();
                event!(
                    Level::INFO,
                    node_name = %node_name,
                    conditions = ?condition_names,
                    "Marking node as drain candidate."
                );
                self.client
                    .set_drain_taint(&node_name, DrainTaintValue::DrainCandidate, Utc::now())
                    .await?;
                self.events
                    .node_event(
                        node,
                        EventType::Warning,
                        EVENT_DRAIN_CANDIDATE,
                        format!(
                            "Node selected for drain due to conditions: {}",
                            condition_names.join(", ")
                        ),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Runs the candidate loop until the returned future is dropped.
    pub async fn run(self) {
        loop {
            if let Err(err) = self.run_once().await {
                event!(Level::DEBUG, error = %err, "Candidate pass deferred.");
            }
            tokio::time::sleep(CANDIDATE_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::fixture::TestIndex;
    use crate::metrics::ControllerMetrics;
    use crate::simulator::MockEvictionDryRun;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, Taint};
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use models::constants::{DRAIN_TAINT_KEY, SCOPE_LABEL_KEY};
    use models::node::MockNodeStateClient;

    fn unhealthy_node(name: &str, tainted: bool) -> Node {
        let taints = if tainted {
            Some(vec![Taint {
                key: DRAIN_TAINT_KEY.to_string(),
                value: Some("drain-candidate".to_string()),
                effect: "NoSchedule".to_string(),
                time_added: None,
            }])
        } else {
            None
        };
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(btreemap! {
                    SCOPE_LABEL_KEY.to_string() => "drainop1".to_string(),
                }),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints,
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "KernelDeadlock".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn supplied() -> Vec<SuppliedCondition> {
        vec![SuppliedCondition {
            condition_type: "KernelDeadlock".to_string(),
            min_duration: None,
        }]
    }

    fn runner(
        index: TestIndex,
        client: MockNodeStateClient,
    ) -> CandidateRunner<MockNodeStateClient, MockEvictionDryRun> {
        let index = Arc::new(index.build());
        let mut eviction = MockEvictionDryRun::new();
        eviction.expect_evict_dry_run().returning(|_| Ok(()));
        let simulator = Arc::new(DrainSimulator::new(
            index.clone(),
            eviction,
            EventRecorder::disabled(),
            Arc::new(ControllerMetrics::new(opentelemetry::global::meter("test"))),
            60,
        ));
        CandidateRunner::new(
            client,
            index,
            simulator,
            EventRecorder::disabled(),
            "drainop1".to_string(),
            supplied(),
        )
    }

    #[tokio::test]
    async fn test_unhealthy_node_gets_candidate_taint() {
        let node = unhealthy_node("node-1", false);
        let mut client = MockNodeStateClient::new();
        client
            .expect_set_drain_taint()
            .withf(|name, value, _| name == "node-1" && *value == DrainTaintValue::DrainCandidate)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let runner = runner(
            TestIndex {
                nodes: vec![node],
                ..Default::default()
            },
            client,
        );
        runner.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_pass_is_idempotent_for_already_tainted_node() {
        // The node is unhealthy and already carries the candidate taint; the pass
        // must not produce any write.
        let node = unhealthy_node("node-1", true);
        let client = MockNodeStateClient::new();

        let runner = runner(
            TestIndex {
                nodes: vec![node],
                ..Default::default()
            },
            client,
        );
        runner.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovered_node_loses_candidate_taint() {
        let mut node = unhealthy_node("node-1", true);
        node.status = Some(NodeStatus::default());

        let mut client = MockNodeStateClient::new();
        client
            .expect_remove_drain_taint()
            .times(1)
            .returning(|_| Ok(()));

        let runner = runner(
            TestIndex {
                nodes: vec![node],
                ..Default::default()
            },
            client,
        );
        runner.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_scope_and_exhausted_nodes_are_ignored() {
        let mut out_of_scope = unhealthy_node("node-1", false);
        out_of_scope.metadata.labels = Some(btreemap! {
            SCOPE_LABEL_KEY.to_string() => "other-instance".to_string(),
        });

        let mut exhausted = unhealthy_node("node-2", false);
        exhausted.metadata.annotations = Some(btreemap! {
            RETRY_FAILED_ANNOTATION.to_string() => "failed".to_string(),
        });

        let client = MockNodeStateClient::new();
        let runner = runner(
            TestIndex {
                nodes: vec![out_of_scope, exhausted],
                ..Default::default()
            },
            client,
        );
        runner.run_once().await.unwrap();
    }
}
