//! Per-node drain attempt accounting.
//!
//! The attempt counter itself rides in the `DrainScheduled` condition message; this
//! module owns the max-attempt policy (default plus per-node annotation override)
//! and the reset performed after a successful drain.

use crate::events::EventRecorder;

use models::constants::{
    EVENT_BAD_VALUE_FOR_ANNOTATION, REPLACE_LABEL_KEY, RETRY_FAILED_ANNOTATION,
};
use models::node::{retry_max_attempt, NodeStateClient};

use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use std::collections::BTreeMap;
use tracing::{event, Level};

#[derive(Clone)]
pub struct RetryManager<C: NodeStateClient> {
    client: C,
    events: EventRecorder,
    default_max_attempts: u32,
}

impl<C: NodeStateClient> RetryManager<C> {
    pub fn new(client: C, events: EventRecorder, default_max_attempts: u32) -> Self {
        RetryManager {
            client,
            events,
            default_max_attempts,
        }
    }

    /// The effective max drain attempts for a node. A malformed annotation value is
    /// reported on the node and the default applies.
    pub async fn max_attempts_for(&self, node: &Node) -> u32 {
        let (value, warning) = retry_max_attempt(node);
        if let Some(warning) = warning {
            event!(Level::WARN, "{}", warning);
            self.events
                .node_event(
                    node,
                    EventType::Warning,
                    EVENT_BAD_VALUE_FOR_ANNOTATION,
                    warning,
                )
                .await;
        }
        value.unwrap_or(self.default_max_attempts)
    }

    /// Whether the node burned all its attempts and carries the terminal marker.
    pub fn attempts_exhausted(node: &Node) -> bool {
        node.metadata
            .annotations
            .as_ref()
            .map(|annotations| annotations.contains_key(RETRY_FAILED_ANNOTATION))
            .unwrap_or(false)
    }

    /// Clears the retry bookkeeping after a successful drain: the terminal
    /// annotation and any stale replacement request label.
    pub async fn reset(&self, node_name: &str) -> models::node::error::Result<()> {
        let mut annotations = BTreeMap::new();
        annotations.insert(RETRY_FAILED_ANNOTATION.to_string(), None);
        self.client
            .patch_node_annotations(node_name, annotations)
            .await?;

        let mut labels = BTreeMap::new();
        labels.insert(REPLACE_LABEL_KEY.to_string(), None);
        self.client.patch_node_labels(node_name, labels).await
    }
}
