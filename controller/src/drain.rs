//! Provides the drain executor: evicts every includable pod from a node, waits
//! for the pods to be deleted, optionally cleans up their volumes, and records
//! progress in the `DrainScheduled` node condition.
//!
//! Draining in Kubernetes is done client side. This implementation uses evictions,
//! which respect PodDisruptionBudgets; pods that carry a custom eviction-endpoint
//! annotation are evicted through that HTTP endpoint instead of the native
//! eviction subresource, with the same payload shape.

use crate::events::EventRecorder;
use crate::index::ObjectIndex;
use crate::metrics::ControllerMetrics;
use crate::retry::RetryManager;

use models::constants::{
    EVENT_DRAIN_FAILED, EVENT_DRAIN_SUCCEEDED, EVENT_EVICTION_ATTEMPT_FAILED,
    EVENT_EVICTION_FAILED, EVENT_EVICTION_STARTING, EVENT_EVICTION_SUCCEEDED,
    KIND_STATEFUL_SET, NODE_CONDITIONS_ANNOTATION,
};
use models::node::{
    drain_condition, drain_taint, offending_conditions, DrainTaintValue, NodeStateClient,
    SuppliedCondition,
};
use models::pod::{
    eviction_url, is_terminating, pvc_cleanup_enabled, termination_grace_period, PodFilter,
    WorkloadMeta,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, EvictParams};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use snafu::ResultExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};
use tracing::{event, instrument, Level};

// Maximum number of pods evicted concurrently per drain. Waiting for pods to be
// deleted is included in this limitation; eviction retries are slow under typical
// conditions and we don't want to generate too many TPS to Kubernetes.
const CONCURRENT_EVICTIONS: usize = 5;

// Eviction attempts back off exponentially between retries, bounded by a cap so a
// long-lived 429 stream keeps probing at a steady rate.
const EVICTION_BACKOFF_INITIAL: Duration = Duration::from_secs(10);
const EVICTION_BACKOFF_FACTOR: f64 = 1.5;
const EVICTION_BACKOFF_CAP: Duration = Duration::from_secs(60);

// Custom eviction endpoint handling.
const ENDPOINT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const ENDPOINT_MAX_RETRIES_ON_500: u32 = 4;
const ENDPOINT_RETRY_AFTER_429: Duration = Duration::from_secs(10);
const ENDPOINT_RETRY_AFTER_503: Duration = Duration::from_secs(15);
const ENDPOINT_RETRY_AFTER_500: Duration = Duration::from_secs(20);
const TOKEN_AUDIENCE_PARAM: &str = "token-audience";

// Deletion polling.
const AWAIT_DELETION_POLL_MIN: Duration = Duration::from_secs(6);
const AWAIT_DELETION_POLL_MAX: Duration = Duration::from_secs(120);
const AWAIT_PVC_DELETION_TIMEOUT: Duration = Duration::from_secs(60);
const AWAIT_PVC_DELETION_POLL: Duration = Duration::from_secs(1);
const AWAIT_PV_DELETION_TIMEOUT: Duration = Duration::from_secs(60);
const PVC_RECREATE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const PVC_RECREATE_POLL: Duration = Duration::from_secs(10);

type EvictionResult<T> = std::result::Result<T, error::EvictionError>;
type DrainResult<T> = std::result::Result<T, error::DrainError>;

/// Classified outcome of a single eviction attempt, shared by the native API
/// backend and the custom HTTP endpoint backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The eviction was accepted; wait for the pod to be deleted.
    Evicted,
    /// Try again later, after the suggested delay when the server provided one.
    TooManyRequests { retry_after: Option<Duration> },
    /// The pod is already gone.
    Gone,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// One eviction attempt against whichever backend serves this pod.
pub trait EvictionBackend: Send + Sync {
    async fn evict_once(&self) -> EvictionResult<EvictOutcome>;
}

struct NativeEvictionBackend {
    api: Api<Pod>,
    pod_name: String,
}

#[async_trait]
impl EvictionBackend for NativeEvictionBackend {
    async fn evict_once(&self) -> EvictionResult<EvictOutcome> {
        match self.api.evict(&self.pod_name, &EvictParams::default()).await {
            Ok(_) => Ok(EvictOutcome::Evicted),
            Err(kube::Error::Api(response)) => match response.code {
                // 429 means a disruption budget cannot currently be satisfied. The
                // typed error response from kube does not carry the server's
                // suggested retry-after, so the local backoff decides the wait.
                429 => Ok(EvictOutcome::TooManyRequests { retry_after: None }),
                404 => Ok(EvictOutcome::Gone),
                403 => error::ForbiddenSnafu {
                    reason: response.message,
                }
                .fail(),
                // The eviction API returns a bare 500 when a pod matches more than
                // one disruption budget.
                500 => error::OverlappingBudgetsSnafu.fail(),
                _ => Err(error::EvictionError::Api {
                    source: kube::Error::Api(response),
                }),
            },
            Err(err) => Err(error::EvictionError::Api { source: err }),
        }
    }
}

/// Calls an operator-provided endpoint instead of the native eviction subresource.
/// The endpoint receives the same payload shape and answers with the status codes
/// documented for the native API (200/201, 429, 404, 503, 500).
struct EndpointEvictionBackend {
    url: reqwest::Url,
    client: reqwest::Client,
    payload: serde_json::Value,
    bearer_token: Option<String>,
    retries_on_500: AtomicU32,
}

/// The HTTP client for custom eviction endpoints. Certificate verification is
/// deliberately relaxed: endpoints live inside the cluster behind self-signed
/// certificates, and the network policy layer bounds the man-in-the-middle risk.
/// Tighten here if your endpoints carry real certificates.
pub fn insecure_endpoint_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(ENDPOINT_REQUEST_TIMEOUT)
        .build()
}

impl EndpointEvictionBackend {
    fn new(
        raw_url: &str,
        pod: &Pod,
        conditions: &[String],
        token_path: &str,
    ) -> EvictionResult<Self> {
        let mut url = reqwest::Url::parse(raw_url).map_err(|_| {
            error::EndpointUrlSnafu {
                url: raw_url.to_string(),
            }
            .build()
        })?;

        // When the URL carries a token-audience parameter, the caller wants a
        // bearer token scoped to that audience. The parameter is stripped so the
        // server only sees the audience inside the token itself.
        let audience = url
            .query_pairs()
            .find(|(key, _)| key == TOKEN_AUDIENCE_PARAM)
            .map(|(_, value)| value.to_string());
        let bearer_token = match audience {
            Some(audience) => {
                let remaining: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(key, _)| key != TOKEN_AUDIENCE_PARAM)
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect();
                url.set_query(None);
                if !remaining.is_empty() {
                    let mut pairs = url.query_pairs_mut();
                    for (key, value) in &remaining {
                        pairs.append_pair(key, value);
                    }
                }
                event!(
                    Level::INFO,
                    audience = %audience,
                    "Attaching projected token for eviction endpoint."
                );
                Some(read_projected_token(token_path)?)
            }
            None => None,
        };

        let client = insecure_endpoint_client().map_err(|source| {
            error::EvictionError::EndpointRequest { source }
        })?;

        Ok(EndpointEvictionBackend {
            url,
            client,
            payload: eviction_payload(pod, conditions),
            bearer_token,
            retries_on_500: AtomicU32::new(ENDPOINT_MAX_RETRIES_ON_500),
        })
    }
}

#[async_trait]
impl EvictionBackend for EndpointEvictionBackend {
    async fn evict_once(&self) -> EvictionResult<EvictOutcome> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&self.payload);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                error::EndpointTimeoutSnafu.build()
            } else {
                error::EvictionError::EndpointRequest { source: err }
            }
        })?;

        let status = response.status();
        event!(
            Level::INFO,
            url = %self.url,
            code = status.as_u16(),
            "Custom eviction endpoint response."
        );
        match status {
            reqwest::StatusCode::OK | reqwest::StatusCode::CREATED => Ok(EvictOutcome::Evicted),
            reqwest::StatusCode::TOO_MANY_REQUESTS => Ok(EvictOutcome::TooManyRequests {
                retry_after: Some(ENDPOINT_RETRY_AFTER_429),
            }),
            reqwest::StatusCode::NOT_FOUND => Ok(EvictOutcome::Gone),
            // The endpoint may not be the leader right now; retry shortly.
            reqwest::StatusCode::SERVICE_UNAVAILABLE => Ok(EvictOutcome::TooManyRequests {
                retry_after: Some(ENDPOINT_RETRY_AFTER_503),
            }),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR => {
                let remaining = self.retries_on_500.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.retries_on_500.store(remaining - 1, Ordering::SeqCst);
                    return Ok(EvictOutcome::TooManyRequests {
                        retry_after: Some(ENDPOINT_RETRY_AFTER_500),
                    });
                }
                error::EndpointSnafu {
                    status_code: status.as_u16(),
                    after_several_retries: true,
                }
                .fail()
            }
            status => error::EndpointSnafu {
                status_code: status.as_u16(),
                after_several_retries: false,
            }
            .fail(),
        }
    }
}

fn read_projected_token(path: &str) -> EvictionResult<String> {
    std::fs::read_to_string(path)
        .map(|token| token.trim().to_string())
        .context(error::TokenReadSnafu { path })
}

/// The wire payload for custom eviction endpoints mirrors the native eviction
/// subresource body, plus an annotation carrying the offending node conditions.
fn eviction_payload(pod: &Pod, conditions: &[String]) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "policy/v1",
        "kind": "Eviction",
        "metadata": {
            "name": pod.name_any(),
            "namespace": pod.namespace().unwrap_or_default(),
            "annotations": {
                NODE_CONDITIONS_ANNOTATION: conditions.join(","),
            },
        },
    })
}

/// Exponential backoff between eviction attempts, bounded by a cap.
struct EvictionBackoff {
    current: Duration,
}

impl EvictionBackoff {
    fn new() -> Self {
        EvictionBackoff {
            current: EVICTION_BACKOFF_INITIAL,
        }
    }

    fn step(&mut self) -> Duration {
        let step = self.current;
        self.current = std::cmp::min(
            EVICTION_BACKOFF_CAP,
            self.current.mul_f64(EVICTION_BACKOFF_FACTOR),
        );
        step
    }
}

/// Drains Kubernetes nodes via the eviction API (or per-pod custom endpoints).
pub struct DrainExecutor<C: NodeStateClient> {
    client: C,
    kube_client: kube::Client,
    index: Arc<ObjectIndex>,
    events: EventRecorder,
    metrics: Arc<ControllerMetrics>,
    retry: RetryManager<C>,
    filter: PodFilter,
    min_eviction_timeout: Duration,
    eviction_headroom: Duration,
    storage_classes_allowing_pv_deletion: HashSet<String>,
    pvc_cleanup_default_if_no_eviction_url: bool,
    supplied_conditions: Vec<SuppliedCondition>,
    token_path: String,
}

impl<C: NodeStateClient> DrainExecutor<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: C,
        kube_client: kube::Client,
        index: Arc<ObjectIndex>,
        events: EventRecorder,
        metrics: Arc<ControllerMetrics>,
        retry: RetryManager<C>,
        config: &crate::config::Config,
    ) -> Self {
        DrainExecutor {
            client,
            kube_client,
            index,
            events,
            metrics,
            retry,
            filter: PodFilter::new(),
            min_eviction_timeout: config.min_eviction_timeout,
            eviction_headroom: config.eviction_headroom,
            storage_classes_allowing_pv_deletion: config
                .pv_deletion_storage_classes
                .iter()
                .cloned()
                .collect(),
            pvc_cleanup_default_if_no_eviction_url: config.pvc_cleanup_default_if_no_eviction_url,
            supplied_conditions: config.node_conditions.clone(),
            token_path: config.token_path.clone(),
        }
    }

    /// Drains the named node: evicts all includable pods in parallel (bounded),
    /// records progress in the `DrainScheduled` condition, and accounts the
    /// attempt. The node must already carry the `draining` taint.
    #[instrument(skip(self, abort), err)]
    pub async fn drain(
        &self,
        node_name: &str,
        abort: watch::Receiver<bool>,
    ) -> DrainResult<()> {
        let node = self
            .client
            .get_node(node_name)
            .await
            .context(error::NodeStateSnafu)?;

        let draining = matches!(
            drain_taint(&node),
            Some(taint) if taint.value == DrainTaintValue::Draining
        );
        if !draining {
            return error::NotDrainingSnafu { node_name }.fail();
        }

        let when = Utc::now();
        let attempt = drain_condition(&node)
            .context(error::NodeStateSnafu)?
            .map(|condition| condition.failed_count)
            .unwrap_or(0);
        self.client
            .mark_drain(node_name, when, None, false, attempt, false)
            .await
            .context(error::NodeStateSnafu)?;
        self.metrics.drain_attempt();

        match self.evict_pods(&node, abort).await {
            Ok(()) => {
                self.client
                    .mark_drain(node_name, when, Some(Utc::now()), false, attempt, false)
                    .await
                    .context(error::NodeStateSnafu)?;
                self.retry
                    .reset(node_name)
                    .await
                    .context(error::NodeStateSnafu)?;
                self.metrics.drain_success();
                self.events
                    .node_event(
                        &node,
                        EventType::Normal,
                        EVENT_DRAIN_SUCCEEDED,
                        "Node drained",
                    )
                    .await;
                Ok(())
            }
            Err(error::DrainError::Aborted) => {
                // The scheduler withdraws the node; nothing terminal to record.
                Err(error::DrainError::Aborted)
            }
            Err(err) => {
                let fail_count = attempt + 1;
                let max_attempts = self.retry.max_attempts_for(&node).await;
                self.client
                    .mark_drain(
                        node_name,
                        when,
                        Some(Utc::now()),
                        true,
                        fail_count,
                        fail_count >= max_attempts,
                    )
                    .await
                    .context(error::NodeStateSnafu)?;
                self.metrics.drain_failure(err.failure_cause());
                self.events
                    .node_event(
                        &node,
                        EventType::Warning,
                        EVENT_DRAIN_FAILED,
                        format!("Drain failed: {}", err),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// The pods on the node that are subject to eviction, with their resolved
    /// controlling workloads.
    pub fn pods_to_drain(
        &self,
        node_name: &str,
    ) -> DrainResult<Vec<(Arc<Pod>, Option<WorkloadMeta>)>> {
        let pods = self
            .index
            .pods_on_node(node_name)
            .context(error::IndexSnafu)?;
        let mut include = Vec::with_capacity(pods.len());
        for pod in pods {
            let (passes, reason) = self.filter.evictable(&pod);
            if !passes {
                event!(
                    Level::INFO,
                    pod_name = %pod.name_any(),
                    reason = %reason,
                    "Not draining pod."
                );
                continue;
            }
            let workload = self
                .index
                .controller_of(&pod)
                .context(error::IndexSnafu)?;
            include.push((pod, workload));
        }
        Ok(include)
    }

    async fn evict_pods(
        &self,
        node: &Node,
        mut abort: watch::Receiver<bool>,
    ) -> DrainResult<()> {
        let pods = self.pods_to_drain(&node.name_any())?;

        let evictions = stream::iter(pods.into_iter().map(Ok::<_, error::DrainError>))
            .try_for_each_concurrent(CONCURRENT_EVICTIONS, |(pod, workload)| async move {
                self.evict_pod(node, &pod, workload.as_ref()).await
            });

        // A first error cancels the remaining per-pod sequences at their next
        // suspension point; so does the scheduler's abort signal.
        tokio::select! {
            result = evictions => result,
            _ = abort.changed() => Err(error::DrainError::Aborted),
        }
    }

    async fn evict_pod(
        &self,
        node: &Node,
        pod: &Pod,
        workload: Option<&WorkloadMeta>,
    ) -> DrainResult<()> {
        let pod_id = format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        );
        self.events
            .node_event(
                node,
                EventType::Normal,
                EVENT_EVICTION_STARTING,
                format!("Evicting pod {} to drain node", pod_id),
            )
            .await;
        self.events
            .pod_event(
                pod,
                EventType::Normal,
                EVENT_EVICTION_STARTING,
                format!("Evicting pod to drain node {}", node.name_any()),
            )
            .await;

        match self.eviction_sequence(node, pod, workload).await {
            Ok(()) => {
                self.events
                    .node_event(
                        node,
                        EventType::Normal,
                        EVENT_EVICTION_SUCCEEDED,
                        format!("Pod {} evicted from node", pod_id),
                    )
                    .await;
                self.events
                    .pod_event(
                        pod,
                        EventType::Normal,
                        EVENT_EVICTION_SUCCEEDED,
                        format!("Pod evicted from node {}", node.name_any()),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.events
                    .node_event(
                        node,
                        EventType::Warning,
                        EVENT_EVICTION_FAILED,
                        format!("Eviction failed for pod {}: {}", pod_id, err),
                    )
                    .await;
                self.events
                    .pod_event(
                        pod,
                        EventType::Warning,
                        EVENT_EVICTION_FAILED,
                        format!("Eviction failed: {}", err),
                    )
                    .await;
                Err(error::DrainError::Eviction {
                    source: err,
                    pod_name: pod_id,
                })
            }
        }
    }

    /// The per-pod eviction sequence: attempt the eviction with retries inside a
    /// total time budget, await the pod's deletion, then clean up volumes.
    async fn eviction_sequence(
        &self,
        node: &Node,
        pod: &Pod,
        workload: Option<&WorkloadMeta>,
    ) -> EvictionResult<()> {
        let custom_url = eviction_url(pod, workload).map(str::to_string);
        let grace = termination_grace_period(pod);
        let total_budget =
            std::cmp::max(self.min_eviction_timeout, grace) + self.eviction_headroom;

        let backend: Box<dyn EvictionBackend> = match &custom_url {
            Some(url) => {
                event!(
                    Level::INFO,
                    pod_name = %pod.name_any(),
                    endpoint = %url,
                    "Using custom eviction endpoint."
                );
                let conditions: Vec<String> =
                    offending_conditions(node, &self.supplied_conditions, Utc::now())
                        .iter()
                        .map(|condition| condition.type_.clone())
                        .collect();
                Box::new(EndpointEvictionBackend::new(
                    url,
                    pod,
                    &conditions,
                    &self.token_path,
                )?)
            }
            None => Box::new(NativeEvictionBackend {
                api: Api::namespaced(
                    self.kube_client.clone(),
                    &pod.namespace().unwrap_or_else(|| "default".to_string()),
                ),
                pod_name: pod.name_any(),
            }),
        };

        let sequence = async {
            let mut backoff = EvictionBackoff::new();
            loop {
                // If the pod is already terminating (e.g. a retry after an earlier
                // eviction), asking again would only produce a misleading 429 while
                // its replacement is pending. Skip straight to awaiting deletion.
                let outcome = if is_terminating(pod) {
                    EvictOutcome::Evicted
                } else {
                    backend.evict_once().await?
                };

                match outcome {
                    EvictOutcome::TooManyRequests { retry_after } => {
                        self.events
                            .node_event(
                                node,
                                EventType::Warning,
                                EVENT_EVICTION_ATTEMPT_FAILED,
                                format!(
                                    "Attempt to evict pod {}/{} failed, retrying",
                                    pod.namespace().unwrap_or_default(),
                                    pod.name_any()
                                ),
                            )
                            .await;
                        let wait = retry_after.unwrap_or_else(|| backoff.step());
                        sleep(wait).await;
                    }
                    EvictOutcome::Gone => {
                        // The pod is already gone; PVC management may still apply.
                        self.cleanup_volumes(pod, workload).await?;
                        return Ok(());
                    }
                    EvictOutcome::Evicted => {
                        self.await_deletion(pod, grace + self.eviction_headroom)
                            .await?;
                        self.cleanup_volumes(pod, workload).await?;
                        return Ok(());
                    }
                }
            }
        };

        match tokio::time::timeout(total_budget, sequence).await {
            Ok(result) => result,
            Err(_) => error::EvictionTimeoutSnafu {
                used_custom_endpoint: custom_url.is_some(),
            }
            .fail(),
        }
    }

    /// Waits until the pod is observed deleted (not found, or replaced under a new
    /// UID). The poll period targets ten checks within the timeout, clamped so we
    /// neither hammer nor fall asleep.
    async fn await_deletion(&self, pod: &Pod, timeout: Duration) -> EvictionResult<()> {
        let poll = (timeout / 10).clamp(AWAIT_DELETION_POLL_MIN, AWAIT_DELETION_POLL_MAX);
        let api: Api<Pod> = Api::namespaced(
            self.kube_client.clone(),
            &pod.namespace().unwrap_or_else(|| "default".to_string()),
        );
        let start = Instant::now();
        loop {
            match api.get(&pod.name_any()).await {
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    event!(Level::INFO, pod_name = %pod.name_any(), "Pod deleted.");
                    return Ok(());
                }
                Ok(found) => {
                    if found.uid() != pod.uid() {
                        return Ok(());
                    }
                    event!(
                        Level::DEBUG,
                        pod_name = %pod.name_any(),
                        "Pod not yet deleted, waiting."
                    );
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        pod_name = %pod.name_any(),
                        error = %err,
                        "Could not determine if pod has been deleted, waiting."
                    );
                }
            }
            if start.elapsed() >= timeout {
                return error::PodDeletionTimeoutSnafu {
                    pod_name: pod.name_any(),
                }
                .fail();
            }
            sleep(poll).await;
        }
    }

    /// PVC/PV cleanup after a pod left the node: deletes claims bound to
    /// allow-listed storage classes, then their volumes; for stateful pods the
    /// replacement pod is deleted until the controller recreates the claim.
    async fn cleanup_volumes(
        &self,
        pod: &Pod,
        workload: Option<&WorkloadMeta>,
    ) -> EvictionResult<()> {
        if self.storage_classes_allowing_pv_deletion.is_empty() {
            return Ok(());
        }
        if !pvc_cleanup_enabled(pod, workload, self.pvc_cleanup_default_if_no_eviction_url) {
            return Ok(());
        }

        let result: std::result::Result<(), String> = async {
            let pvcs = self.in_scope_pvcs(pod).await?;
            let deleted = self.delete_pvcs(pod, &pvcs).await?;
            if !deleted.is_empty() {
                self.delete_pvs(pod, &deleted).await?;
                if is_stateful(pod, workload) {
                    for pvc in &deleted {
                        self.force_pvc_recreation(pod, pvc).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        result.map_err(|message| error::VolumeCleanupSnafu { message }.build())
    }

    /// Claims referenced by the pod whose storage class is in the deletion allow-set.
    async fn in_scope_pvcs(
        &self,
        pod: &Pod,
    ) -> std::result::Result<Vec<PersistentVolumeClaim>, String> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.kube_client.clone(), &namespace);

        let mut claims = Vec::new();
        let volumes = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .cloned()
            .unwrap_or_default();
        for volume in volumes {
            let claim_name = match volume.persistent_volume_claim {
                Some(source) => source.claim_name,
                None => continue,
            };
            let pvc = match api.get(&claim_name).await {
                Ok(pvc) => pvc,
                Err(kube::Error::Api(response)) if response.code == 404 => continue,
                Err(err) => {
                    return Err(format!("cannot get pvc {}/{}: {}", namespace, claim_name, err))
                }
            };
            let storage_class = pvc
                .spec
                .as_ref()
                .and_then(|spec| spec.storage_class_name.clone());
            match storage_class {
                Some(class) if self.storage_classes_allowing_pv_deletion.contains(&class) => {
                    claims.push(pvc);
                }
                _ => {}
            }
        }
        Ok(claims)
    }

    async fn delete_pvcs(
        &self,
        pod: &Pod,
        pvcs: &[PersistentVolumeClaim],
    ) -> std::result::Result<Vec<PersistentVolumeClaim>, String> {
        let mut deleted = Vec::new();
        for pvc in pvcs {
            let namespace = pvc.namespace().unwrap_or_default();
            let api: Api<PersistentVolumeClaim> =
                Api::namespaced(self.kube_client.clone(), &namespace);

            // Work on a fresh copy; skip claims that were already replaced.
            let fresh = match api.get(&pvc.name_any()).await {
                Ok(fresh) => fresh,
                Err(kube::Error::Api(response)) if response.code == 404 => continue,
                Err(err) => return Err(format!("cannot get pvc {}: {}", pvc.name_any(), err)),
            };
            if fresh.uid() != pvc.uid() {
                continue;
            }

            self.events
                .pod_event(
                    pod,
                    EventType::Normal,
                    "Eviction",
                    format!("Deletion of associated PVC {}/{}", namespace, pvc.name_any()),
                )
                .await;
            self.events
                .pvc_event(
                    pvc,
                    EventType::Normal,
                    "Eviction",
                    format!(
                        "Deletion requested due to association with evicted pod {}/{}",
                        pod.namespace().unwrap_or_default(),
                        pod.name_any()
                    ),
                )
                .await;

            match api.delete(&pvc.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => continue,
                Err(err) => {
                    self.events
                        .pvc_event(
                            pvc,
                            EventType::Warning,
                            "EvictionFailure",
                            format!("Could not delete: {}", err),
                        )
                        .await;
                    return Err(format!("cannot delete pvc {}: {}", pvc.name_any(), err));
                }
            }

            self.await_object_gone(&api, &pvc.name_any(), pvc.uid(), AWAIT_PVC_DELETION_POLL, AWAIT_PVC_DELETION_TIMEOUT)
                .await
                .map_err(|err| format!("pvc deletion timeout {}: {}", pvc.name_any(), err))?;
            deleted.push(pvc.clone());
        }
        Ok(deleted)
    }

    async fn delete_pvs(
        &self,
        pod: &Pod,
        deleted_pvcs: &[PersistentVolumeClaim],
    ) -> std::result::Result<(), String> {
        let api: Api<PersistentVolume> = Api::all(self.kube_client.clone());
        for claim in deleted_pvcs {
            let volume_name = match claim
                .spec
                .as_ref()
                .and_then(|spec| spec.volume_name.clone())
            {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };

            let pv = match api.get(&volume_name).await {
                Ok(pv) => pv,
                Err(kube::Error::Api(response)) if response.code == 404 => continue,
                Err(err) => return Err(format!("cannot get pv {}: {}", volume_name, err)),
            };

            self.events
                .pv_event(
                    &pv,
                    EventType::Normal,
                    "Eviction",
                    format!(
                        "Deletion requested due to association with evicted pvc {}/{}",
                        claim.namespace().unwrap_or_default(),
                        claim.name_any()
                    ),
                )
                .await;
            self.events
                .pod_event(
                    pod,
                    EventType::Normal,
                    "Eviction",
                    format!("Deletion of associated PV {}", pv.name_any()),
                )
                .await;

            match api.delete(&pv.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => continue,
                Err(err) => {
                    self.events
                        .pv_event(
                            &pv,
                            EventType::Warning,
                            "EvictionFailure",
                            format!("Could not delete PV: {}", err),
                        )
                        .await;
                    return Err(format!("cannot delete pv {}: {}", pv.name_any(), err));
                }
            }

            let poll = (AWAIT_PV_DELETION_TIMEOUT / 10)
                .clamp(AWAIT_DELETION_POLL_MIN, AWAIT_DELETION_POLL_MAX);
            self.await_object_gone(&api, &pv.name_any(), pv.uid(), poll, AWAIT_PV_DELETION_TIMEOUT)
                .await
                .map_err(|err| format!("pv deletion timeout {}: {}", pv.name_any(), err))?;
        }
        Ok(())
    }

    /// Deletes the stateful pod's replacement until its controller recreates the
    /// claim (observed as a new PVC UID).
    async fn force_pvc_recreation(
        &self,
        pod: &Pod,
        pvc: &PersistentVolumeClaim,
    ) -> std::result::Result<(), String> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let pvc_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.kube_client.clone(), &namespace);
        let pod_api: Api<Pod> = Api::namespaced(self.kube_client.clone(), &namespace);

        let start = Instant::now();
        loop {
            match pvc_api.get(&pvc.name_any()).await {
                Ok(found) if found.uid() != pvc.uid() => {
                    event!(
                        Level::INFO,
                        pvc = %pvc.name_any(),
                        "Associated PVC was recreated."
                    );
                    return Ok(());
                }
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(err) => return Err(format!("cannot get pvc {}: {}", pvc.name_any(), err)),
            }

            event!(
                Level::INFO,
                pod_name = %pod.name_any(),
                "Deleting pod to force PVC recreation."
            );
            match pod_api.delete(&pod.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(err) => {
                    return Err(format!(
                        "cannot delete pod {}/{} to regenerate PVC: {}",
                        namespace,
                        pod.name_any(),
                        err
                    ))
                }
            }

            if start.elapsed() >= PVC_RECREATE_TIMEOUT {
                return Err(format!(
                    "timed out waiting for PVC {} to be recreated",
                    pvc.name_any()
                ));
            }
            sleep(PVC_RECREATE_POLL).await;
        }
    }

    async fn await_object_gone<K>(
        &self,
        api: &Api<K>,
        name: &str,
        uid: Option<String>,
        poll: Duration,
        timeout: Duration,
    ) -> std::result::Result<(), String>
    where
        K: kube::Resource<DynamicType = ()>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
    {
        let start = Instant::now();
        loop {
            match api.get(name).await {
                Err(kube::Error::Api(response)) if response.code == 404 => return Ok(()),
                Ok(found) => {
                    if found.uid() != uid {
                        return Ok(());
                    }
                }
                Err(err) => return Err(format!("cannot get {}: {}", name, err)),
            }
            if start.elapsed() >= timeout {
                return Err(format!("timed out waiting for {} to be deleted", name));
            }
            sleep(poll).await;
        }
    }
}

fn is_stateful(pod: &Pod, workload: Option<&WorkloadMeta>) -> bool {
    if matches!(workload, Some(workload) if workload.kind == KIND_STATEFUL_SET) {
        return true;
    }
    pod.metadata
        .owner_references
        .as_ref()
        .map(|owners| {
            owners
                .iter()
                .any(|owner| owner.controller == Some(true) && owner.kind == KIND_STATEFUL_SET)
        })
        .unwrap_or(false)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("the node '{}' is not tainted 'draining'", node_name))]
        NotDraining { node_name: String },

        #[snafu(display("cannot read or write node state: '{}'", source))]
        NodeState {
            source: models::node::error::Error,
        },

        #[snafu(display("object index is not usable: '{}'", source))]
        Index {
            source: crate::index::error::Error,
        },

        #[snafu(display("cannot evict pod '{}': '{}'", pod_name, source))]
        Eviction {
            source: EvictionError,
            pod_name: String,
        },

        #[snafu(display("drain aborted"))]
        Aborted,
    }

    impl DrainError {
        /// The failure-cause tag recorded in metrics and on the node condition.
        pub fn failure_cause(&self) -> &'static str {
            match self {
                Self::NotDraining { .. } => "not_draining",
                Self::NodeState { .. } | Self::Index { .. } => "api_error",
                Self::Aborted => "aborted",
                Self::Eviction { source, .. } => match source {
                    EvictionError::Forbidden { .. } => "admission_forbidden",
                    EvictionError::OverlappingBudgets => "overlapping_budgets",
                    EvictionError::EvictionTimeout { .. } => "eviction_timeout",
                    EvictionError::PodDeletionTimeout { .. } => "pod_deletion_timeout",
                    EvictionError::EndpointTimeout => "endpoint_timeout",
                    EvictionError::Endpoint { .. }
                    | EvictionError::EndpointRequest { .. }
                    | EvictionError::EndpointUrl { .. }
                    | EvictionError::TokenRead { .. } => "endpoint_error",
                    EvictionError::VolumeCleanup { .. } => "volume_cleanup",
                    EvictionError::Api { .. } => "api_error",
                },
            }
        }
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        #[snafu(display("eviction rejected by admission: '{}'", reason))]
        Forbidden { reason: String },

        #[snafu(display("overlapping pod disruption budgets"))]
        OverlappingBudgets,

        #[snafu(display("eviction API error: '{}'", source))]
        Api { source: kube::Error },

        #[snafu(display("timeout while waiting for eviction endpoint response"))]
        EndpointTimeout,

        #[snafu(display(
            "eviction endpoint error: code={}{}",
            status_code,
            if *after_several_retries { " after several retries" } else { "" }
        ))]
        Endpoint {
            status_code: u16,
            after_several_retries: bool,
        },

        #[snafu(display("cannot call eviction endpoint: '{}'", source))]
        EndpointRequest { source: reqwest::Error },

        #[snafu(display("invalid eviction endpoint url '{}'", url))]
        EndpointUrl { url: String },

        #[snafu(display("cannot read bearer token from '{}': '{}'", path, source))]
        TokenRead {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display(
            "timed out waiting for eviction;{}",
            if *used_custom_endpoint {
                " eviction endpoint was not able to finish the request in time."
            } else {
                " most likely related to a missing disruption budget."
            }
        ))]
        EvictionTimeout { used_custom_endpoint: bool },

        #[snafu(display(
            "timed out waiting for pod '{}' to be deleted (stuck terminating, check finalizers)",
            pod_name
        ))]
        PodDeletionTimeout { pod_name: String },

        #[snafu(display("error while cleaning up volumes: '{}'", message))]
        VolumeCleanup { message: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_eviction_backoff_steps_and_caps() {
        let mut backoff = EvictionBackoff::new();
        assert_eq!(backoff.step(), Duration::from_secs(10));
        assert_eq!(backoff.step(), Duration::from_secs(15));
        assert_eq!(backoff.step(), Duration::from_millis(22_500));
        // After enough steps the cap takes over.
        for _ in 0..10 {
            backoff.step();
        }
        assert_eq!(backoff.step(), EVICTION_BACKOFF_CAP);
    }

    #[test]
    fn test_eviction_payload_shape() {
        use kube::api::ObjectMeta;

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let payload = eviction_payload(&pod, &["KernelDeadlock".to_string()]);
        assert_eq!(payload["apiVersion"], "policy/v1");
        assert_eq!(payload["kind"], "Eviction");
        assert_eq!(payload["metadata"]["name"], "web-1");
        assert_eq!(payload["metadata"]["namespace"], "prod");
        assert_eq!(
            payload["metadata"]["annotations"][NODE_CONDITIONS_ANNOTATION],
            "KernelDeadlock"
        );
    }

    #[test]
    fn test_failure_causes() {
        let cases: Vec<(error::DrainError, &str)> = vec![
            (
                error::DrainError::Eviction {
                    source: error::EvictionError::OverlappingBudgets,
                    pod_name: "p".to_string(),
                },
                "overlapping_budgets",
            ),
            (
                error::DrainError::Eviction {
                    source: error::EvictionError::Forbidden {
                        reason: "denied".to_string(),
                    },
                    pod_name: "p".to_string(),
                },
                "admission_forbidden",
            ),
            (
                error::DrainError::Eviction {
                    source: error::EvictionError::PodDeletionTimeout {
                        pod_name: "p".to_string(),
                    },
                    pod_name: "p".to_string(),
                },
                "pod_deletion_timeout",
            ),
            (
                error::DrainError::Eviction {
                    source: error::EvictionError::EndpointTimeout,
                    pod_name: "p".to_string(),
                },
                "endpoint_timeout",
            ),
            (error::DrainError::Aborted, "aborted"),
            (
                error::DrainError::NotDraining {
                    node_name: "n".to_string(),
                },
                "not_draining",
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.failure_cause(), expected, "error: {}", err);
        }
    }

    #[test]
    fn test_is_stateful() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        use kube::api::ObjectMeta;
        use maplit::btreemap;

        let sts_workload = WorkloadMeta {
            kind: KIND_STATEFUL_SET.to_string(),
            name: "db".to_string(),
            namespace: "default".to_string(),
            annotations: btreemap! {},
        };
        assert!(is_stateful(&Pod::default(), Some(&sts_workload)));
        assert!(!is_stateful(&Pod::default(), None));

        let owned = Pod {
            metadata: ObjectMeta {
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: KIND_STATEFUL_SET.to_string(),
                    name: "db".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(is_stateful(&owned, None));
    }

    #[test]
    fn test_endpoint_backend_url_handling() {
        use kube::api::ObjectMeta;

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        // Plain URL, no token involved.
        let backend = EndpointEvictionBackend::new(
            "https://evictor.cluster.local/evict?keep=1",
            &pod,
            &[],
            "/nonexistent/token",
        )
        .unwrap();
        assert!(backend.bearer_token.is_none());
        assert_eq!(
            backend.url.as_str(),
            "https://evictor.cluster.local/evict?keep=1"
        );

        // An unparseable URL is a typed failure.
        assert!(matches!(
            EndpointEvictionBackend::new("::not-a-url::", &pod, &[], "/nonexistent/token"),
            Err(error::EvictionError::EndpointUrl { .. })
        ));

        // token-audience requests a token; an unreadable token path surfaces as a
        // typed error rather than a blind request.
        assert!(matches!(
            EndpointEvictionBackend::new(
                "https://evictor.cluster.local/evict?token-audience=evictor",
                &pod,
                &[],
                "/nonexistent/token",
            ),
            Err(error::EvictionError::TokenRead { .. })
        ));
    }

    #[test]
    fn test_endpoint_backend_strips_token_audience_param() {
        use kube::api::ObjectMeta;
        use std::io::Write;

        let mut token_file = tempfile_path();
        let path = token_file.1.clone();
        token_file
            .0
            .write_all(b"sa-token\n")
            .expect("write token fixture");

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let backend = EndpointEvictionBackend::new(
            "https://evictor.cluster.local/evict?token-audience=evictor&keep=1",
            &pod,
            &[],
            &path,
        )
        .unwrap();

        assert_eq!(backend.bearer_token.as_deref(), Some("sa-token"));
        assert_eq!(
            backend.url.as_str(),
            "https://evictor.cluster.local/evict?keep=1"
        );
        let _ = std::fs::remove_file(&path);
    }

    fn tempfile_path() -> (std::fs::File, String) {
        let path = std::env::temp_dir().join(format!(
            "drainop-token-test-{}",
            std::process::id()
        ));
        let file = std::fs::File::create(&path).expect("create token fixture");
        (file, path.to_string_lossy().to_string())
    }
}
