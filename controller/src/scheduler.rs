//! Group-scoped drain scheduling.
//!
//! Candidates are partitioned into groups derived from configured node labels; at
//! most one drain runs per group, bounded globally, with groups served
//! round-robin so a slow group cannot starve the others. A slot is held from the
//! moment a candidate enters its pre-activity gate until the drain reaches a
//! terminal outcome. State is reconstructed from cluster objects on every tick, so
//! a controller restart adopts in-flight drains instead of doubling them.

use crate::activities::{ActivityCheck, ActivityOrchestrator, ActivityPatcher, ActivityPhase};
use crate::drain::{error::DrainError, DrainExecutor};
use crate::events::EventRecorder;
use crate::index::ObjectIndex;
use crate::metrics::ControllerMetrics;
use crate::replace::NodeReplacer;
use crate::retry::RetryManager;

use models::constants::{
    EVENT_DRAIN_STARTING, EVENT_POST_ACTIVITY_FAILED, EVENT_POST_ACTIVITY_TIMEOUT,
    EVENT_PRE_ACTIVITY_FAILED, EVENT_PRE_ACTIVITY_TIMEOUT, POST_ACTIVITY_RESULT_ANNOTATION,
};
use models::node::{
    drain_condition, drain_taint, node_in_scope, DrainTaintValue, NodeStateClient,
};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

pub type Result<T> = std::result::Result<T, crate::index::error::Error>;

const SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);

/// A queued drain candidate. Ordering is (retry count, selection time, name) so
/// fresh nodes drain before repeatedly failing ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_name: String,
    pub retry_count: u32,
    pub since: DateTime<Utc>,
}

struct ActiveDrain {
    node_name: String,
    abort: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct GroupScheduler<C, P>
where
    C: NodeStateClient + Send + Sync + 'static,
    P: ActivityPatcher + Send + Sync + 'static,
{
    client: C,
    index: Arc<ObjectIndex>,
    executor: Arc<DrainExecutor<C>>,
    activities: Arc<ActivityOrchestrator<P>>,
    replacer: NodeReplacer<C>,
    retry: RetryManager<C>,
    events: EventRecorder,
    metrics: Arc<ControllerMetrics>,
    config_name: String,
    group_labels: Vec<String>,
    max_concurrent_drains: usize,
    replace_drained_nodes: bool,
    active: Mutex<HashMap<String, ActiveDrain>>,
    cursor: Mutex<Option<String>>,
}

impl<C, P> GroupScheduler<C, P>
where
    C: NodeStateClient + Send + Sync + 'static,
    P: ActivityPatcher + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: C,
        index: Arc<ObjectIndex>,
        executor: Arc<DrainExecutor<C>>,
        activities: Arc<ActivityOrchestrator<P>>,
        replacer: NodeReplacer<C>,
        retry: RetryManager<C>,
        events: EventRecorder,
        metrics: Arc<ControllerMetrics>,
        config: &crate::config::Config,
    ) -> Self {
        GroupScheduler {
            client,
            index,
            executor,
            activities,
            replacer,
            retry,
            events,
            metrics,
            config_name: config.config_name.clone(),
            group_labels: config.group_labels.clone(),
            max_concurrent_drains: config.max_concurrent_drains,
            replace_drained_nodes: config.replace_drained_nodes,
            active: Mutex::new(HashMap::new()),
            cursor: Mutex::new(None),
        }
    }

    /// Runs the scheduling loop until the returned future is dropped.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.run_once().await {
                event!(Level::DEBUG, error = %err, "Scheduling pass deferred.");
            }
            tokio::time::sleep(SCHEDULE_INTERVAL).await;
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(self: &Arc<Self>) -> Result<()> {
        self.reap_finished();
        self.abort_withdrawn()?;

        let nodes = self.index.nodes()?;

        // Groups occupied by an in-process task or by a node already tainted
        // draining (e.g. after a controller restart) cannot take another drain.
        let mut occupied: std::collections::BTreeSet<String> = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.keys().cloned().collect()
        };
        let mut orphans: Vec<(String, String)> = Vec::new();
        for node in &nodes {
            if !node_in_scope(node, &self.config_name) {
                continue;
            }
            if matches!(drain_taint(node), Some(t) if t.value == DrainTaintValue::Draining) {
                let group = group_key(node, &self.group_labels);
                if occupied.insert(group.clone()) {
                    orphans.push((group, node.name_any()));
                }
            }
        }
        // Adopt drains that were in flight when the controller restarted.
        for (group, node_name) in orphans {
            event!(Level::INFO, node_name = %node_name, "Adopting in-flight drain.");
            self.start_drain(group, node_name);
        }

        // Collect and order the queued candidates per group.
        let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for node in &nodes {
            if !node_in_scope(node, &self.config_name) {
                continue;
            }
            if RetryManager::<C>::attempts_exhausted(node) {
                continue;
            }
            let taint = match drain_taint(node) {
                Some(taint) if taint.value == DrainTaintValue::DrainCandidate => taint,
                _ => continue,
            };
            let retry_count = drain_condition(node)
                .ok()
                .flatten()
                .map(|condition| condition.failed_count)
                .unwrap_or(0);
            groups
                .entry(group_key(node, &self.group_labels))
                .or_default()
                .push(Candidate {
                    node_name: node.name_any(),
                    retry_count,
                    since: taint.since.unwrap_or_else(Utc::now),
                });
        }
        for candidates in groups.values_mut() {
            order_candidates(candidates);
        }

        // Serve groups round-robin, resuming after the last group served.
        let cursor = self
            .cursor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let order = rotate_after(groups.keys().cloned().collect(), cursor.as_deref());
        for group in order {
            if occupied.contains(&group) {
                continue;
            }
            let active_count = self
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len();
            if active_count >= self.max_concurrent_drains {
                break;
            }
            let candidate = match groups.get(&group).and_then(|c| c.first()) {
                Some(candidate) => candidate.clone(),
                None => continue,
            };
            event!(
                Level::INFO,
                node_name = %candidate.node_name,
                group = %group,
                "Scheduling drain."
            );
            self.start_drain(group.clone(), candidate.node_name);
            *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = Some(group);
        }

        self.progress_drained_nodes().await?;
        Ok(())
    }

    fn reap_finished(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|_, drain| !drain.handle.is_finished());
    }

    /// Instructs active drains to abort when their node disappeared or lost the
    /// drain taint (candidacy withdrawn by the candidate runner or an operator).
    fn abort_withdrawn(&self) -> Result<()> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for drain in active.values() {
            let withdrawn = match self.index.node(&drain.node_name)? {
                None => true,
                Some(node) => drain_taint(&node).is_none(),
            };
            if withdrawn {
                event!(
                    Level::INFO,
                    node_name = %drain.node_name,
                    "Node withdrew from draining, aborting."
                );
                let _ = drain.abort.send(true);
            }
        }
        Ok(())
    }

    fn start_drain(self: &Arc<Self>, group: String, node_name: String) {
        let (abort_tx, abort_rx) = watch::channel(false);
        let scheduler = self.clone();
        let task_node = node_name.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_drain(task_node, abort_rx).await;
        });
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                group,
                ActiveDrain {
                    node_name,
                    abort: abort_tx,
                    handle,
                },
            );
    }

    /// The supervisory task for one drain: pre-activity gate, taint transition,
    /// execution, and retry bookkeeping. Returning releases the group slot.
    async fn run_drain(&self, node_name: String, abort: watch::Receiver<bool>) {
        let node = match self.client.get_node(&node_name).await {
            Ok(node) => node,
            Err(err) => {
                event!(Level::WARN, node_name = %node_name, error = %err, "Cannot fetch node for drain.");
                return;
            }
        };

        let taint = match drain_taint(&node) {
            Some(taint) => taint,
            // Lost the taint while queued; nothing to do.
            None => return,
        };

        if taint.value == DrainTaintValue::DrainCandidate {
            match self.activities.check(&node, ActivityPhase::Pre, Utc::now()) {
                Err(err) => {
                    event!(Level::WARN, node_name = %node_name, error = %err, "Cannot evaluate pre-activities, deferring drain.");
                    return;
                }
                Ok(ActivityCheck::Processing { activity }) => {
                    event!(
                        Level::INFO,
                        node_name = %node_name,
                        activity = %activity,
                        "Waiting for pre-activity, deferring drain."
                    );
                    return;
                }
                Ok(ActivityCheck::Failed { activity }) => {
                    self.record_gate_failure(
                        &node,
                        EVENT_PRE_ACTIVITY_FAILED,
                        "pre_activity_failure",
                        format!("Pre-activity '{}' failed", activity),
                    )
                    .await;
                    return;
                }
                Ok(ActivityCheck::TimedOut { activity }) => {
                    self.record_gate_failure(
                        &node,
                        EVENT_PRE_ACTIVITY_TIMEOUT,
                        "pre_activity_timeout",
                        format!("Pre-activity '{}' timed out", activity),
                    )
                    .await;
                    return;
                }
                Ok(ActivityCheck::Done) => {}
            }

            // Keep the original selection timestamp through the transition so
            // activity timeouts keep their reference point.
            let since = taint.since.unwrap_or_else(Utc::now);
            if let Err(err) = self
                .client
                .set_drain_taint(&node_name, DrainTaintValue::Draining, since)
                .await
            {
                event!(Level::WARN, node_name = %node_name, error = %err, "Cannot mark node as draining.");
                return;
            }
            self.events
                .node_event(
                    &node,
                    EventType::Normal,
                    EVENT_DRAIN_STARTING,
                    "Draining node",
                )
                .await;
        }

        let since = taint.since.unwrap_or_else(Utc::now);
        match self.executor.drain(&node_name, abort).await {
            Ok(()) => {
                if let Err(err) = self
                    .client
                    .set_drain_taint(&node_name, DrainTaintValue::Drained, since)
                    .await
                {
                    event!(Level::WARN, node_name = %node_name, error = %err, "Cannot mark node as drained.");
                }
            }
            Err(DrainError::Aborted) => {
                // Candidacy was withdrawn mid-drain; take our markers off the node.
                event!(Level::INFO, node_name = %node_name, "Drain aborted, clearing markers.");
                if let Err(err) = self.client.remove_drain_taint(&node_name).await {
                    event!(Level::WARN, node_name = %node_name, error = %err, "Cannot remove drain taint.");
                }
                if let Err(err) = self.client.clear_drain_condition(&node_name).await {
                    event!(Level::WARN, node_name = %node_name, error = %err, "Cannot clear drain condition.");
                }
            }
            Err(err) => {
                // The executor already recorded the failed condition and events.
                event!(Level::WARN, node_name = %node_name, error = %err, "Drain failed.");
                let exhausted = match self.client.get_node(&node_name).await {
                    Ok(fresh) => RetryManager::<C>::attempts_exhausted(&fresh),
                    Err(_) => false,
                };
                if exhausted {
                    // Out of attempts; leave only the terminal annotation behind.
                    if let Err(err) = self.client.remove_drain_taint(&node_name).await {
                        event!(Level::WARN, node_name = %node_name, error = %err, "Cannot remove drain taint.");
                    }
                } else {
                    // Hand the node back to the queue and rearm its pre-activities.
                    if let Err(err) = self
                        .client
                        .set_drain_taint(&node_name, DrainTaintValue::DrainCandidate, since)
                        .await
                    {
                        event!(Level::WARN, node_name = %node_name, error = %err, "Cannot restore candidate taint.");
                    }
                    if let Err(err) = self.activities.reset(&node, ActivityPhase::Pre).await {
                        event!(Level::WARN, node_name = %node_name, error = %err, "Cannot reset pre-activities.");
                    }
                }
            }
        }
    }

    /// Records a pre-activity gate failure as a failed drain attempt.
    async fn record_gate_failure(
        &self,
        node: &Node,
        reason: &'static str,
        cause: &'static str,
        message: String,
    ) {
        let node_name = node.name_any();
        let attempt = drain_condition(node)
            .ok()
            .flatten()
            .map(|condition| condition.failed_count)
            .unwrap_or(0)
            + 1;
        let max_attempts = self.retry.max_attempts_for(node).await;
        let when = drain_taint(node)
            .and_then(|taint| taint.since)
            .unwrap_or_else(Utc::now);
        if let Err(err) = self
            .client
            .mark_drain(
                &node_name,
                when,
                Some(Utc::now()),
                true,
                attempt,
                attempt >= max_attempts,
            )
            .await
        {
            event!(Level::WARN, node_name = %node_name, error = %err, "Cannot record gate failure.");
        }
        self.metrics.drain_failure(cause);
        self.events
            .node_event(node, EventType::Warning, reason, message)
            .await;
        if let Err(err) = self.activities.reset(node, ActivityPhase::Pre).await {
            event!(Level::WARN, node_name = %node_name, error = %err, "Cannot reset pre-activities.");
        }
    }

    /// Drained nodes: wait for post-activities, then request replacement.
    async fn progress_drained_nodes(&self) -> Result<()> {
        if !self.replace_drained_nodes {
            return Ok(());
        }
        for node in self.index.nodes()? {
            if !node_in_scope(&node, &self.config_name) {
                continue;
            }
            if !matches!(drain_taint(&node), Some(t) if t.value == DrainTaintValue::Drained) {
                continue;
            }

            match self.activities.check(&node, ActivityPhase::Post, Utc::now()) {
                Err(err) => {
                    event!(Level::WARN, node_name = %node.name_any(), error = %err, "Cannot evaluate post-activities.");
                }
                Ok(ActivityCheck::Processing { .. }) => {}
                Ok(ActivityCheck::Done) => {
                    if NodeReplacer::<C>::replacement_status(&node).is_none() {
                        if let Err(err) = self.replacer.replace_node(&node).await {
                            event!(Level::WARN, node_name = %node.name_any(), error = %err, "Cannot request replacement.");
                        }
                    }
                }
                Ok(ActivityCheck::Failed { activity }) => {
                    self.record_post_gate_failure(
                        &node,
                        EVENT_POST_ACTIVITY_FAILED,
                        "failure",
                        format!("Post-activity '{}' failed, not requesting replacement", activity),
                    )
                    .await;
                }
                Ok(ActivityCheck::TimedOut { activity }) => {
                    self.record_post_gate_failure(
                        &node,
                        EVENT_POST_ACTIVITY_TIMEOUT,
                        "timeout",
                        format!(
                            "Post-activity '{}' timed out, not requesting replacement",
                            activity
                        ),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Post-activity failures gate the replacement; recorded once via a marker
    /// annotation so the event does not repeat every tick.
    async fn record_post_gate_failure(
        &self,
        node: &Node,
        reason: &'static str,
        result: &str,
        message: String,
    ) {
        let already_recorded = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(POST_ACTIVITY_RESULT_ANNOTATION))
            .map(|value| value == result)
            .unwrap_or(false);
        if already_recorded {
            return;
        }
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            POST_ACTIVITY_RESULT_ANNOTATION.to_string(),
            Some(result.to_string()),
        );
        if let Err(err) = self
            .client
            .patch_node_annotations(&node.name_any(), annotations)
            .await
        {
            event!(Level::WARN, node_name = %node.name_any(), error = %err, "Cannot record post-activity result.");
        }
        self.events
            .node_event(node, EventType::Warning, reason, message)
            .await;
    }
}

/// The drain group key: the values of the configured group labels joined with
/// '/'. Nodes missing every label share the empty key (one global slot for the
/// unlabeled pool).
pub fn group_key(node: &Node, group_labels: &[String]) -> String {
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    group_labels
        .iter()
        .map(|label| labels.get(label).map(String::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("/")
}

/// Orders candidates by (retry count, selection time, name).
pub fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.retry_count
            .cmp(&b.retry_count)
            .then(a.since.cmp(&b.since))
            .then(a.node_name.cmp(&b.node_name))
    });
}

/// Round-robin rotation: iteration resumes after the cursor's group.
pub fn rotate_after(keys: Vec<String>, cursor: Option<&str>) -> Vec<String> {
    let position = match cursor {
        Some(cursor) => keys.iter().position(|key| key.as_str() == cursor),
        None => None,
    };
    match position {
        Some(index) => {
            let mut rotated = keys[index + 1..].to_vec();
            rotated.extend_from_slice(&keys[..=index]);
            rotated
        }
        None => keys,
    }
}
