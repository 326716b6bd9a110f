//! Decides which nodes this controller instance is responsible for, and publishes
//! the decision in the scope label so operators (and peer controller instances)
//! can see it.
//!
//! The label value is a dot-separated, sorted, duplicate-free list of controller
//! identities, or `out-of-scope` when no instance claims the node. Peer identities
//! already present are always preserved.

use crate::index::ObjectIndex;

use models::constants::{OUT_OF_SCOPE_LABEL_VALUE, SCOPE_LABEL_KEY};
use models::node::{drain_taint, DrainTaintValue, NodeStateClient};
use models::pod::is_protected;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

pub type Result<T> = std::result::Result<T, error::Error>;

const OBSERVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct ScopeObserver<C: NodeStateClient> {
    client: C,
    index: Arc<ObjectIndex>,
    config_name: String,
    /// Label requirements a node must carry to be in scope. Empty means all nodes.
    node_labels: Vec<(String, String)>,
}

impl<C: NodeStateClient> ScopeObserver<C> {
    pub fn new(
        client: C,
        index: Arc<ObjectIndex>,
        config_name: String,
        node_labels: Vec<(String, String)>,
    ) -> Self {
        ScopeObserver {
            client,
            index,
            config_name,
            node_labels,
        }
    }

    /// Whether this instance considers the node in scope: the node predicate must
    /// accept it, and no pod on it may be protected from eviction (a drain of such
    /// a node could never complete).
    fn in_scope(&self, node: &Node) -> Result<bool> {
        let empty = BTreeMap::new();
        let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
        for (key, value) in &self.node_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
        for pod in self.index.pods_on_node(&node.name_any())? {
            let controller = self.index.controller_of(&pod)?;
            if is_protected(&pod, controller.as_ref()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Computes the desired scope label value for a node and whether a patch is needed.
    pub fn label_update(&self, node: &Node) -> Result<(String, bool)> {
        let in_scope = self.in_scope(node)?;
        let current = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SCOPE_LABEL_KEY))
            .map(String::as_str)
            .unwrap_or_default();
        Ok(compute_scope_label(current, &self.config_name, in_scope))
    }

    #[instrument(skip(self))]
    pub async fn observe_once(&self) -> Result<()> {
        let nodes = self.index.nodes()?;
        for node in nodes {
            let node_name = node.name_any();
            let (value, out_of_date) = match self.label_update(&node) {
                Ok(update) => update,
                Err(err) => {
                    event!(Level::WARN, node_name = %node_name, error = %err, "Cannot classify node scope.");
                    continue;
                }
            };
            if out_of_date {
                event!(Level::INFO, node_name = %node_name, value = %value, "Updating scope label.");
                let mut labels = BTreeMap::new();
                labels.insert(SCOPE_LABEL_KEY.to_string(), Some(value.clone()));
                self.client
                    .patch_node_labels(&node_name, labels)
                    .await
                    .map_err(|source| error::Error::Patch { source })?;
            }

            // When a node we selected leaves our scope, take our candidate marker
            // and the drain condition back off it.
            if !value.split('.').any(|id| id == self.config_name) {
                if let Some(taint) = drain_taint(&node) {
                    if taint.value == DrainTaintValue::DrainCandidate {
                        event!(Level::INFO, node_name = %node_name, "Clearing candidate marker on out-of-scope node.");
                        self.client
                            .remove_drain_taint(&node_name)
                            .await
                            .map_err(|source| error::Error::Patch { source })?;
                        self.client
                            .clear_drain_condition(&node_name)
                            .await
                            .map_err(|source| error::Error::Patch { source })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs the observer loop until the returned future is dropped.
    pub async fn run(self) {
        loop {
            if let Err(err) = self.observe_once().await {
                event!(Level::WARN, error = %err, "Scope observation pass failed.");
            }
            tokio::time::sleep(OBSERVE_INTERVAL).await;
        }
    }
}

/// Pure computation of the scope label: insert or remove our identity, keep peer
/// identities, sort, deduplicate. Returns the new value and whether it differs
/// from the current one.
pub fn compute_scope_label(current: &str, config_name: &str, in_scope: bool) -> (String, bool) {
    let mut identities: BTreeSet<&str> = current
        .split('.')
        .filter(|part| {
            !part.is_empty() && *part != OUT_OF_SCOPE_LABEL_VALUE && *part != config_name
        })
        .collect();
    if in_scope {
        identities.insert(config_name);
    }

    let value = if identities.is_empty() {
        OUT_OF_SCOPE_LABEL_VALUE.to_string()
    } else {
        identities.into_iter().collect::<Vec<_>>().join(".")
    };
    let out_of_date = value != current;
    (value, out_of_date)
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

        #[snafu(display("Cannot patch node: '{}'", source))]
        Patch {
            source: models::node::error::Error,
        },
    }

    impl From<crate::index::error::Error> for Error {
        fn from(source: crate::index::error::Error) -> Self {
            Error::Index { source }
        }
    }
}
