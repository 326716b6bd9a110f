//! Node replacement via the replace-request label contract.
//!
//! This controller only ever writes `requested`; an external provisioner answers
//! by flipping the label to `done` or `failed`. Nodes are never deleted here.

use crate::events::EventRecorder;
use crate::metrics::ControllerMetrics;

use models::constants::{EVENT_REPLACEMENT_REQUESTED, REPLACE_LABEL_KEY};
use models::node::{replacement_status, NodeStateClient, ReplacementStatus};

use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[derive(Clone)]
pub struct NodeReplacer<C: NodeStateClient> {
    client: C,
    events: EventRecorder,
    metrics: Arc<ControllerMetrics>,
}

impl<C: NodeStateClient> NodeReplacer<C> {
    pub fn new(client: C, events: EventRecorder, metrics: Arc<ControllerMetrics>) -> Self {
        NodeReplacer {
            client,
            events,
            metrics,
        }
    }

    async fn request(
        &self,
        node: &Node,
        reason: &'static str,
    ) -> models::node::error::Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert(
            REPLACE_LABEL_KEY.to_string(),
            Some(ReplacementStatus::Requested.as_str().to_string()),
        );
        self.client
            .patch_node_labels(&node.name_any(), labels)
            .await?;

        event!(Level::INFO, node_name = %node.name_any(), reason, "Requested node replacement.");
        self.metrics.replacement_requested(reason);
        self.events
            .node_event(
                node,
                EventType::Normal,
                EVENT_REPLACEMENT_REQUESTED,
                format!("Node replacement requested ({})", reason),
            )
            .await;
        Ok(())
    }

    /// Requests a replacement for a drained node.
    #[instrument(skip(self, node), fields(node_name = %node.name_any()), err)]
    pub async fn replace_node(&self, node: &Node) -> models::node::error::Result<()> {
        self.request(node, "replacement").await
    }

    /// Requests a replacement while the node is still in service, so capacity is
    /// ready before the drain starts.
    #[instrument(skip(self, node), fields(node_name = %node.name_any()), err)]
    pub async fn preprovision_node(&self, node: &Node) -> models::node::error::Result<()> {
        self.request(node, "preprovisioning").await
    }

    /// The current replacement status published on the node, if any.
    pub fn replacement_status(node: &Node) -> Option<ReplacementStatus> {
        replacement_status(node)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use models::node::MockNodeStateClient;

    fn replacer(client: MockNodeStateClient) -> NodeReplacer<MockNodeStateClient> {
        NodeReplacer::new(
            client,
            EventRecorder::disabled(),
            Arc::new(ControllerMetrics::new(opentelemetry::global::meter("test"))),
        )
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replace_node_sets_requested_label() {
        let mut client = MockNodeStateClient::new();
        client
            .expect_patch_node_labels()
            .withf(|name, labels| {
                name == "node-1"
                    && labels.get(REPLACE_LABEL_KEY)
                        == Some(&Some("requested".to_string()))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        replacer(client).replace_node(&node("node-1")).await.unwrap();
    }

    #[test]
    fn test_replacement_status_round_trip() {
        let labelled = |value: &str| Node {
            metadata: ObjectMeta {
                labels: Some(btreemap! {
                    REPLACE_LABEL_KEY.to_string() => value.to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            NodeReplacer::<MockNodeStateClient>::replacement_status(&labelled("requested")),
            Some(ReplacementStatus::Requested)
        );
        assert_eq!(
            NodeReplacer::<MockNodeStateClient>::replacement_status(&labelled("done")),
            Some(ReplacementStatus::Done)
        );
        assert_eq!(
            NodeReplacer::<MockNodeStateClient>::replacement_status(&labelled("failed")),
            Some(ReplacementStatus::Failed)
        );
        assert_eq!(
            NodeReplacer::<MockNodeStateClient>::replacement_status(&Node::default()),
            None
        );
    }
}
