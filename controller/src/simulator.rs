//! The drain simulator predicts whether a node could be drained right now by
//! running dry-run evictions against every pod it would have to evict.
//!
//! Results are cached per pod UID: positive answers briefly (the cluster moves
//! on), negative answers longer (an exhausted budget rarely recovers within a
//! minute). Obvious failures (overlapping budgets, exhausted budgets) are decided
//! locally without touching the API server, and an outbound token bucket keeps the
//! dry-run traffic polite.

use crate::analyser::{budget_names, is_budget_blocked_by_pod};
use crate::cache::TtlCache;
use crate::events::EventRecorder;
use crate::index::ObjectIndex;
use crate::metrics::ControllerMetrics;

use models::constants::{EVENT_DRAIN_SIMULATION_FAILED, EVENT_EVICTION_SIMULATION_FAILED};
use models::pod::{is_terminating, PodFilter};

use async_trait::async_trait;
use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota,
    RateLimiter,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, PostParams};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

pub const POSITIVE_CACHE_TTL: Duration = Duration::from_secs(60);
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(3 * 60);
pub const CACHE_CLEANUP_PERIOD: Duration = Duration::from_secs(10);

type SimpleRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Outcome of simulating the eviction of a single pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationResult {
    pub can_evict: bool,
    pub reason: String,
    /// Error text recorded alongside a negative result when the dry run failed
    /// unexpectedly.
    pub error: Option<String>,
}

impl SimulationResult {
    fn accepted(reason: impl Into<String>) -> Self {
        SimulationResult {
            can_evict: true,
            reason: reason.into(),
            error: None,
        }
    }

    fn rejected(reason: impl Into<String>, error: Option<String>) -> Self {
        SimulationResult {
            can_evict: false,
            reason: reason.into(),
            error,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// The dry-run eviction seam. The simulator only ever goes through this trait, so
/// it structurally cannot issue a real eviction.
pub trait EvictionDryRun: Send + Sync {
    async fn evict_dry_run(&self, pod: &Pod) -> std::result::Result<(), kube::Error>;
}

#[derive(Clone)]
pub struct KubeEvictionDryRun {
    client: kube::Client,
}

impl KubeEvictionDryRun {
    pub fn new(client: kube::Client) -> Self {
        KubeEvictionDryRun { client }
    }
}

#[async_trait]
impl EvictionDryRun for KubeEvictionDryRun {
    async fn evict_dry_run(&self, pod: &Pod) -> std::result::Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(
            self.client.clone(),
            &pod.namespace().unwrap_or_else(|| "default".to_string()),
        );
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                dry_run: true,
                ..Default::default()
            }),
            post_options: PostParams::default(),
        };
        api.evict(&pod.name_any(), &params).await.map(|_| ())
    }
}

pub struct DrainSimulator<E: EvictionDryRun> {
    index: Arc<ObjectIndex>,
    eviction: E,
    events: EventRecorder,
    metrics: Arc<ControllerMetrics>,
    filter: PodFilter,
    limiter: SimpleRateLimiter,
    cache: TtlCache<SimulationResult>,
}

impl<E: EvictionDryRun> DrainSimulator<E> {
    pub fn new(
        index: Arc<ObjectIndex>,
        eviction: E,
        events: EventRecorder,
        metrics: Arc<ControllerMetrics>,
        dry_runs_per_minute: u32,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(dry_runs_per_minute).unwrap_or(nonzero!(60u32)),
        );
        DrainSimulator {
            index,
            eviction,
            events,
            metrics,
            filter: PodFilter::new(),
            limiter: RateLimiter::direct(quota),
            cache: TtlCache::new(),
        }
    }

    /// The cache cleanup task; runs until dropped.
    pub fn cache_cleanup(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.cache.clone().run_cleanup(CACHE_CLEANUP_PERIOD)
    }

    /// Simulates a drain of the whole node: every pod on it must be evictable.
    ///
    /// Emits a warning event on the node listing the blocking reasons when the
    /// answer is negative.
    #[instrument(skip(self, node), fields(node_name = %node.name_any()))]
    pub async fn simulate_drain(
        &self,
        node: &Node,
    ) -> (bool, Vec<String>, Vec<error::Error>) {
        let pods = match self.index.pods_on_node(&node.name_any()) {
            Ok(pods) => pods,
            Err(err) => return (false, Vec::new(), vec![err.into()]),
        };

        // Positive entries live shorter than negative ones, so check for any cached
        // negative answer first; one is enough to fail the node without API calls.
        let mut reasons = Vec::new();
        let mut errors = Vec::new();
        for pod in &pods {
            if let Some(cached) = self.cache.get(&cache_key(pod)) {
                if !cached.can_evict {
                    reasons.push(blocked_pod_reason(pod, &cached.reason));
                    if let Some(message) = cached.error {
                        errors.push(error::CachedSimulationSnafu { message }.build());
                    }
                }
            }
        }
        if !reasons.is_empty() || !errors.is_empty() {
            self.record_negative(node, &reasons).await;
            return (false, reasons, errors);
        }

        for pod in &pods {
            match self.simulate_pod_drain(pod).await {
                Err(err) => {
                    self.metrics.simulation(false);
                    return (false, Vec::new(), vec![err]);
                }
                Ok(result) if !result.can_evict => {
                    reasons.push(blocked_pod_reason(pod, &result.reason));
                }
                Ok(_) => {}
            }
        }

        if !reasons.is_empty() {
            self.record_negative(node, &reasons).await;
            return (false, reasons, Vec::new());
        }
        self.metrics.simulation(true);
        (true, Vec::new(), Vec::new())
    }

    /// Simulates the eviction of a single pod. Checks the obvious local
    /// disqualifiers before spending a dry-run API call.
    pub async fn simulate_pod_drain(
        &self,
        pod: &Pod,
    ) -> std::result::Result<SimulationResult, error::Error> {
        if let Some(cached) = self.cache.get(&cache_key(pod)) {
            return Ok(cached);
        }

        let (evictable, reason) = self.filter.evictable(pod);
        if !evictable {
            // Filtered pods are not evicted at all, so they never block a drain.
            let result = SimulationResult::accepted(reason);
            self.cache
                .insert(&cache_key(pod), result.clone(), POSITIVE_CACHE_TTL);
            return Ok(result);
        }

        // A terminating pod is already going away; the eviction API would answer
        // with a misleading 429 while its replacement is pending. Not cached.
        if is_terminating(pod) {
            return Ok(SimulationResult::accepted("pod is already terminating"));
        }

        let budgets = self.index.budgets_for_pod(pod)?;
        if budgets.len() > 1 {
            let reason = format!(
                "Pod has more than one associated PDB: {}",
                budget_names(&budgets)
            );
            return Ok(self.reject(pod, reason, None).await);
        }
        if let Some(budget) = budgets.first() {
            if is_budget_blocked_by_pod(pod, budget) {
                let reason = format!(
                    "PDB '{}' does not allow any disruptions",
                    budget.name_any()
                );
                return Ok(self.reject(pod, reason, None).await);
            }
        }

        if self.limiter.check().is_err() {
            event!(
                Level::DEBUG,
                "Drain simulation aborted due to rate limiting."
            );
            return error::ClientRateLimitedSnafu.fail();
        }

        match self.eviction.evict_dry_run(pod).await {
            Ok(()) => {
                let result = SimulationResult::accepted("");
                self.cache
                    .insert(&cache_key(pod), result.clone(), POSITIVE_CACHE_TTL);
                Ok(result)
            }
            Err(err) => {
                let reason = format!("Eviction dry run was not successful: {}", err);
                match api_status_code(&err) {
                    // 429 means the budget is exhausted right now; 403 means an
                    // admission plugin rejected the eviction and the body carries
                    // the reason. Both are expected answers, not errors.
                    Some(429) | Some(403) => Ok(self.reject(pod, reason, None).await),
                    _ => {
                        let message = err.to_string();
                        self.reject(pod, reason, Some(message.clone())).await;
                        error::DryRunSnafu {
                            pod_name: pod.name_any(),
                            message,
                        }
                        .fail()
                    }
                }
            }
        }
    }

    async fn reject(
        &self,
        pod: &Pod,
        reason: String,
        error: Option<String>,
    ) -> SimulationResult {
        let result = SimulationResult::rejected(reason.clone(), error);
        self.cache
            .insert(&cache_key(pod), result.clone(), NEGATIVE_CACHE_TTL);
        self.events
            .pod_event(
                pod,
                EventType::Warning,
                EVENT_EVICTION_SIMULATION_FAILED,
                reason,
            )
            .await;
        result
    }

    async fn record_negative(&self, node: &Node, reasons: &[String]) {
        self.metrics.simulation(false);
        self.events
            .node_event(
                node,
                EventType::Warning,
                EVENT_DRAIN_SIMULATION_FAILED,
                format!("Drain simulation failed: {}", reasons.join("; ")),
            )
            .await;
    }
}

fn blocked_pod_reason(pod: &Pod, reason: &str) -> String {
    format!(
        "Cannot drain pod '{}/{}', because: {}",
        pod.namespace().unwrap_or_default(),
        pod.name_any(),
        reason
    )
}

fn cache_key(pod: &Pod) -> String {
    pod.uid().unwrap_or_else(|| pod.name_any())
}

fn api_status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Drain simulation aborted due to client-side rate limiting"))]
        ClientRateLimited,

        #[snafu(display("Object index is not usable: '{}'", source))]
        Index {
            source: crate::index::error::Error,
        },

        #[snafu(display("Eviction dry run for pod '{}' errored: '{}'", pod_name, message))]
        DryRun { pod_name: String, message: String },

        #[snafu(display("Cached simulation error: '{}'", message))]
        CachedSimulation { message: String },
    }

    impl From<crate::index::error::Error> for Error {
        fn from(source: crate::index::error::Error) -> Self {
            Error::Index { source }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::fixture::TestIndex;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::api::policy::v1::{
        PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use maplit::btreemap;
    use std::collections::BTreeMap;

    fn pod(name: &str, labels: BTreeMap<String, String>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{}", name)),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("my-node".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
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

    fn budget(
        name: &str,
        selector: BTreeMap<String, String>,
        desired: i32,
        healthy: i32,
    ) -> PodDisruptionBudget {
        PodDisruptionBudget {
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
            status: Some(PodDisruptionBudgetStatus {
                desired_healthy: desired,
                current_healthy: healthy,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn simulator(
        index: TestIndex,
        eviction: MockEvictionDryRun,
        rate: u32,
    ) -> DrainSimulator<MockEvictionDryRun> {
        DrainSimulator::new(
            Arc::new(index.build()),
            eviction,
            EventRecorder::disabled(),
            Arc::new(ControllerMetrics::new(opentelemetry::global::meter("test"))),
            rate,
        )
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "denied".to_string(),
            reason: "TooManyRequests".to_string(),
            code,
        })
    }

    #[tokio::test]
    async fn test_exhausted_budget_blocks_without_api_call() {
        let labels = btreemap! { "app".to_string() => "web".to_string() };
        let blocked = pod("web-1", labels.clone());
        let mut eviction = MockEvictionDryRun::new();
        eviction.expect_evict_dry_run().times(0);

        let sim = simulator(
            TestIndex {
                nodes: vec![node("my-node")],
                pods: vec![blocked],
                budgets: vec![budget("my-pdb", labels, 1, 1)],
                ..Default::default()
            },
            eviction,
            60,
        );

        let (can_evict, reasons, errors) = sim.simulate_drain(&node("my-node")).await;
        assert!(!can_evict);
        assert!(errors.is_empty());
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("PDB 'my-pdb' does not allow any disruptions"));
    }

    #[tokio::test]
    async fn test_overlapping_budgets_block_without_api_call() {
        let labels = btreemap! { "app".to_string() => "web".to_string() };
        let mut eviction = MockEvictionDryRun::new();
        eviction.expect_evict_dry_run().times(0);

        let sim = simulator(
            TestIndex {
                pods: vec![pod("web-1", labels.clone())],
                budgets: vec![
                    budget("pdb-1", labels.clone(), 1, 3),
                    budget("pdb-2", labels.clone(), 1, 3),
                ],
                ..Default::default()
            },
            eviction,
            60,
        );

        let result = sim
            .simulate_pod_drain(&pod("web-1", labels))
            .await
            .unwrap();
        assert!(!result.can_evict);
        assert!(result
            .reason
            .contains("Pod has more than one associated PDB: pdb-1;pdb-2"));
    }

    #[tokio::test]
    async fn test_positive_result_is_cached() {
        let target = pod("web-1", btreemap! {});
        let mut eviction = MockEvictionDryRun::new();
        // The second simulation must be answered from the cache.
        eviction.expect_evict_dry_run().times(1).returning(|_| Ok(()));

        let sim = simulator(
            TestIndex {
                pods: vec![target.clone()],
                ..Default::default()
            },
            eviction,
            60,
        );

        assert!(sim.simulate_pod_drain(&target).await.unwrap().can_evict);
        assert!(sim.simulate_pod_drain(&target).await.unwrap().can_evict);
    }

    #[tokio::test]
    async fn test_too_many_requests_is_negative_but_not_error() {
        let target = pod("web-1", btreemap! {});
        let mut eviction = MockEvictionDryRun::new();
        eviction
            .expect_evict_dry_run()
            .times(1)
            .returning(|_| Err(api_error(429)));

        let sim = simulator(
            TestIndex {
                pods: vec![target.clone()],
                ..Default::default()
            },
            eviction,
            60,
        );

        let result = sim.simulate_pod_drain(&target).await.unwrap();
        assert!(!result.can_evict);
        assert!(result.error.is_none());

        // Negative answers are served from the cache afterwards.
        let result = sim.simulate_pod_drain(&target).await.unwrap();
        assert!(!result.can_evict);
    }

    #[tokio::test]
    async fn test_unexpected_api_error_is_surfaced() {
        let target = pod("web-1", btreemap! {});
        let mut eviction = MockEvictionDryRun::new();
        eviction
            .expect_evict_dry_run()
            .times(1)
            .returning(|_| Err(api_error(500)));

        let sim = simulator(
            TestIndex {
                pods: vec![target.clone()],
                ..Default::default()
            },
            eviction,
            60,
        );

        assert!(matches!(
            sim.simulate_pod_drain(&target).await,
            Err(error::Error::DryRun { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminating_pod_skips_api_and_is_not_cached() {
        let mut terminating = pod("web-1", btreemap! {});
        terminating.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        let mut eviction = MockEvictionDryRun::new();
        eviction.expect_evict_dry_run().times(0);

        let sim = simulator(TestIndex::default(), eviction, 60);
        let result = sim.simulate_pod_drain(&terminating).await.unwrap();
        assert!(result.can_evict);
    }

    #[tokio::test]
    async fn test_rate_limiter_produces_typed_outcome() {
        let first = pod("web-1", btreemap! {});
        let second = pod("web-2", btreemap! {});
        let mut eviction = MockEvictionDryRun::new();
        eviction.expect_evict_dry_run().times(1).returning(|_| Ok(()));

        // A quota of one per minute leaves no credit for the second pod.
        let sim = simulator(
            TestIndex {
                pods: vec![first.clone(), second.clone()],
                ..Default::default()
            },
            eviction,
            1,
        );

        assert!(sim.simulate_pod_drain(&first).await.unwrap().can_evict);
        assert!(matches!(
            sim.simulate_pod_drain(&second).await,
            Err(error::Error::ClientRateLimited)
        ));
    }

    #[tokio::test]
    async fn test_daemonset_pod_passes_without_api_call() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut ds_pod = pod("ds-1", btreemap! {});
        ds_pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "ds".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);

        let mut eviction = MockEvictionDryRun::new();
        eviction.expect_evict_dry_run().times(0);

        let sim = simulator(TestIndex::default(), eviction, 60);
        let result = sim.simulate_pod_drain(&ds_pod).await.unwrap();
        assert!(result.can_evict);
        assert!(result.reason.contains("DaemonSet"));
    }
}
