use super::error::{self, Result};
use super::{build_drain_taint, format_drain_condition_message, DrainTaintValue};
use crate::constants::{
    CONDITION_DRAIN_SCHEDULED, DRAIN_TAINT_KEY, DRAIN_TAINT_SINCE_ANNOTATION, DRAINOP,
    RETRY_FAILED_ANNOTATION, RETRY_FAILED_ANNOTATION_VALUE,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, PostParams};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_retry::{strategy::FixedInterval, RetryIf};
use tracing::instrument;

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

// Writes against a node's spec or status race with other controllers; they use
// optimistic concurrency (resource version via replace) and retry on conflict.
const CONFLICT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const CONFLICT_RETRY_COUNT: usize = 10;

fn conflict_retry_strategy() -> impl Iterator<Item = Duration> {
    FixedInterval::new(CONFLICT_RETRY_INTERVAL).take(CONFLICT_RETRY_COUNT)
}

fn is_conflict(err: &error::Error) -> bool {
    let source = match err {
        error::Error::PatchNode { source, .. } => source,
        error::Error::UpdateNodeStatus { source, .. } => source,
        _ => return false,
    };
    matches!(source, kube::Error::Api(response) if response.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
/// A trait providing an interface for every write this controller performs on Node
/// objects, plus fresh reads. This is provided as a trait in order to allow mocks
/// to be used for testing purposes.
pub trait NodeStateClient: Clone + Sized + Send + Sync {
    /// Fetch a fresh copy of the named node.
    async fn get_node(&self, node_name: &str) -> Result<Node>;
    /// Apply the drain taint with the given lifecycle value, replacing any previous
    /// value, and record the selection timestamp in the companion annotation.
    async fn set_drain_taint(
        &self,
        node_name: &str,
        value: DrainTaintValue,
        since: DateTime<Utc>,
    ) -> Result<()>;
    /// Remove the drain taint and its companion annotation.
    async fn remove_drain_taint(&self, node_name: &str) -> Result<()>;
    /// Create or update the `DrainScheduled` condition. When `retry_exhausted` is
    /// set, the terminal retry-failed annotation is written as well.
    async fn mark_drain(
        &self,
        node_name: &str,
        when: DateTime<Utc>,
        finish: Option<DateTime<Utc>>,
        failed: bool,
        fail_count: u32,
        retry_exhausted: bool,
    ) -> Result<()>;
    /// Remove the `DrainScheduled` condition entirely.
    async fn clear_drain_condition(&self, node_name: &str) -> Result<()>;
    /// Merge-patch node labels. A `None` value deletes the key.
    async fn patch_node_labels(
        &self,
        node_name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()>;
    /// Merge-patch node annotations. A `None` value deletes the key.
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock NodeStateClient for use in tests.
    pub NodeStateClient {}
    #[async_trait]
    impl NodeStateClient for NodeStateClient {
        async fn get_node(&self, node_name: &str) -> Result<Node>;
        async fn set_drain_taint(
            &self,
            node_name: &str,
            value: DrainTaintValue,
            since: DateTime<Utc>,
        ) -> Result<()>;
        async fn remove_drain_taint(&self, node_name: &str) -> Result<()>;
        async fn mark_drain(
            &self,
            node_name: &str,
            when: DateTime<Utc>,
            finish: Option<DateTime<Utc>>,
            failed: bool,
            fail_count: u32,
            retry_exhausted: bool,
        ) -> Result<()>;
        async fn clear_drain_condition(&self, node_name: &str) -> Result<()>;
        async fn patch_node_labels(
            &self,
            node_name: &str,
            labels: BTreeMap<String, Option<String>>,
        ) -> Result<()>;
        async fn patch_node_annotations(
            &self,
            node_name: &str,
            annotations: BTreeMap<String, Option<String>>,
        ) -> Result<()>;
    }

    impl Clone for NodeStateClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> NodeStateClient for Arc<T>
where
    T: NodeStateClient,
{
    async fn get_node(&self, node_name: &str) -> Result<Node> {
        (**self).get_node(node_name).await
    }
    async fn set_drain_taint(
        &self,
        node_name: &str,
        value: DrainTaintValue,
        since: DateTime<Utc>,
    ) -> Result<()> {
        (**self).set_drain_taint(node_name, value, since).await
    }
    async fn remove_drain_taint(&self, node_name: &str) -> Result<()> {
        (**self).remove_drain_taint(node_name).await
    }
    async fn mark_drain(
        &self,
        node_name: &str,
        when: DateTime<Utc>,
        finish: Option<DateTime<Utc>>,
        failed: bool,
        fail_count: u32,
        retry_exhausted: bool,
    ) -> Result<()> {
        (**self)
            .mark_drain(node_name, when, finish, failed, fail_count, retry_exhausted)
            .await
    }
    async fn clear_drain_condition(&self, node_name: &str) -> Result<()> {
        (**self).clear_drain_condition(node_name).await
    }
    async fn patch_node_labels(
        &self,
        node_name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        (**self).patch_node_labels(node_name, labels).await
    }
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        (**self).patch_node_annotations(node_name, annotations).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `NodeStateClient` trait. This implementation will
/// almost certainly be used in any case that isn't a unit test.
pub struct K8sNodeStateClient {
    k8s_client: kube::client::Client,
}

impl K8sNodeStateClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8sNodeStateClient { k8s_client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }

    fn metadata_patch(
        field: &str,
        entries: &BTreeMap<String, Option<String>>,
    ) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in entries {
            let value = match value {
                Some(value) => serde_json::Value::String(value.clone()),
                None => serde_json::Value::Null,
            };
            map.insert(key.clone(), value);
        }
        serde_json::json!({ "metadata": { field: serde_json::Value::Object(map) } })
    }

    async fn patch_metadata(
        &self,
        node_name: &str,
        field: &str,
        entries: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let patch = Self::metadata_patch(field, &entries);
        self.nodes()
            .patch(
                node_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    error::NodeNotFoundSnafu { node_name }.build()
                } else {
                    error::Error::PatchNode {
                        source: err,
                        node_name: node_name.to_string(),
                    }
                }
            })?;
        Ok(())
    }

    /// Replace the node's taint list with optimistic concurrency, retrying on conflict.
    async fn replace_taints(
        &self,
        node_name: &str,
        mutate: impl Fn(Vec<k8s_openapi::api::core::v1::Taint>) -> Vec<k8s_openapi::api::core::v1::Taint>
            + Send
            + Sync,
    ) -> Result<()> {
        RetryIf::spawn(
            conflict_retry_strategy(),
            || async {
                let api = self.nodes();
                let mut node = api.get(node_name).await.map_err(|err| {
                    if is_not_found(&err) {
                        error::NodeNotFoundSnafu { node_name }.build()
                    } else {
                        error::Error::GetNode {
                            source: err,
                            node_name: node_name.to_string(),
                        }
                    }
                })?;

                let spec = node.spec.get_or_insert_with(Default::default);
                spec.taints = Some(mutate(spec.taints.take().unwrap_or_default()));

                api.replace(node_name, &PostParams::default(), &node)
                    .await
                    .context(error::PatchNodeSnafu { node_name })?;
                Ok(())
            },
            is_conflict,
        )
        .await
    }
}

#[async_trait]
impl NodeStateClient for K8sNodeStateClient {
    #[instrument(skip(self), err)]
    async fn get_node(&self, node_name: &str) -> Result<Node> {
        self.nodes().get(node_name).await.map_err(|err| {
            if is_not_found(&err) {
                error::NodeNotFoundSnafu { node_name }.build()
            } else {
                error::Error::GetNode {
                    source: err,
                    node_name: node_name.to_string(),
                }
            }
        })
    }

    #[instrument(skip(self), err)]
    async fn set_drain_taint(
        &self,
        node_name: &str,
        value: DrainTaintValue,
        since: DateTime<Utc>,
    ) -> Result<()> {
        self.replace_taints(node_name, move |taints| {
            let mut taints: Vec<_> = taints
                .into_iter()
                .filter(|taint| taint.key != DRAIN_TAINT_KEY)
                .collect();
            taints.push(build_drain_taint(value));
            taints
        })
        .await?;

        let mut annotations = BTreeMap::new();
        annotations.insert(
            DRAIN_TAINT_SINCE_ANNOTATION.to_string(),
            Some(since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        self.patch_metadata(node_name, "annotations", annotations)
            .await
    }

    #[instrument(skip(self), err)]
    async fn remove_drain_taint(&self, node_name: &str) -> Result<()> {
        self.replace_taints(node_name, |taints| {
            taints
                .into_iter()
                .filter(|taint| taint.key != DRAIN_TAINT_KEY)
                .collect()
        })
        .await?;

        let mut annotations = BTreeMap::new();
        annotations.insert(DRAIN_TAINT_SINCE_ANNOTATION.to_string(), None);
        self.patch_metadata(node_name, "annotations", annotations)
            .await
    }

    #[instrument(skip(self), err)]
    async fn mark_drain(
        &self,
        node_name: &str,
        when: DateTime<Utc>,
        finish: Option<DateTime<Utc>>,
        failed: bool,
        fail_count: u32,
        retry_exhausted: bool,
    ) -> Result<()> {
        RetryIf::spawn(
            conflict_retry_strategy(),
            || async {
                let api = self.nodes();
                let mut node = match api.get(node_name).await {
                    Ok(node) => node,
                    // A node deleted mid-drain has nothing left to mark.
                    Err(err) if is_not_found(&err) => return Ok(()),
                    Err(err) => {
                        return Err(error::Error::GetNode {
                            source: err,
                            node_name: node_name.to_string(),
                        })
                    }
                };

                let message = format_drain_condition_message(when, finish, failed, fail_count);
                let condition_status = if finish.is_some() { "False" } else { "True" };
                let now = Time(Utc::now());

                let status = node.status.get_or_insert_with(Default::default);
                let conditions = status.conditions.get_or_insert_with(Vec::new);
                match conditions
                    .iter_mut()
                    .find(|condition| condition.type_ == CONDITION_DRAIN_SCHEDULED)
                {
                    Some(condition) => {
                        condition.last_heartbeat_time = Some(now);
                        condition.message = Some(message);
                        condition.status = condition_status.to_string();
                    }
                    None => conditions.push(NodeCondition {
                        type_: CONDITION_DRAIN_SCHEDULED.to_string(),
                        status: condition_status.to_string(),
                        last_heartbeat_time: Some(now.clone()),
                        last_transition_time: Some(now),
                        reason: Some(DRAINOP.to_string()),
                        message: Some(message),
                    }),
                }

                let data =
                    serde_json::to_vec(&node).context(error::CreateK8SPatchSnafu)?;
                api.replace_status(node_name, &PostParams::default(), data)
                    .await
                    .context(error::UpdateNodeStatusSnafu { node_name })?;
                Ok(())
            },
            is_conflict,
        )
        .await?;

        if retry_exhausted {
            let mut annotations = BTreeMap::new();
            annotations.insert(
                RETRY_FAILED_ANNOTATION.to_string(),
                Some(RETRY_FAILED_ANNOTATION_VALUE.to_string()),
            );
            self.patch_metadata(node_name, "annotations", annotations)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn clear_drain_condition(&self, node_name: &str) -> Result<()> {
        RetryIf::spawn(
            conflict_retry_strategy(),
            || async {
                let api = self.nodes();
                let mut node = match api.get(node_name).await {
                    Ok(node) => node,
                    Err(err) if is_not_found(&err) => return Ok(()),
                    Err(err) => {
                        return Err(error::Error::GetNode {
                            source: err,
                            node_name: node_name.to_string(),
                        })
                    }
                };

                let conditions = match node.status.as_mut().and_then(|s| s.conditions.as_mut()) {
                    Some(conditions) => conditions,
                    None => return Ok(()),
                };
                let before = conditions.len();
                conditions.retain(|condition| condition.type_ != CONDITION_DRAIN_SCHEDULED);
                if conditions.len() == before {
                    return Ok(());
                }

                let data =
                    serde_json::to_vec(&node).context(error::CreateK8SPatchSnafu)?;
                api.replace_status(node_name, &PostParams::default(), data)
                    .await
                    .context(error::UpdateNodeStatusSnafu { node_name })?;
                Ok(())
            },
            is_conflict,
        )
        .await
    }

    #[instrument(skip(self, labels), err)]
    async fn patch_node_labels(
        &self,
        node_name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.patch_metadata(node_name, "labels", labels).await
    }

    #[instrument(skip(self, annotations), err)]
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.patch_metadata(node_name, "annotations", annotations)
            .await
    }
}
