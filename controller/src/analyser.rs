//! Disruption-budget analysis: which pods on a node currently block eviction.

use crate::index::ObjectIndex;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use models::pod::is_pod_ready;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, crate::index::error::Error>;

/// Why a pod blocks the drain of its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReason {
    /// The pod's budget has no disruption credit left.
    BudgetExhausted,
    /// The pod matches several budgets; the eviction API rejects such pods outright.
    OverlappingBudgets,
}

#[derive(Debug, Clone)]
pub struct BlockingPod {
    pub pod: Arc<Pod>,
    pub budget: Arc<PodDisruptionBudget>,
    pub reason: BlockingReason,
}

#[derive(Clone)]
pub struct PdbAnalyser {
    index: Arc<ObjectIndex>,
}

impl PdbAnalyser {
    pub fn new(index: Arc<ObjectIndex>) -> Self {
        PdbAnalyser { index }
    }

    /// Returns the pods on the named node whose disruption budget currently forbids
    /// eviction, or which match more than one budget.
    pub fn blocking_pods_on_node(&self, node_name: &str) -> Result<Vec<BlockingPod>> {
        let mut blocking = Vec::new();
        for pod in self.index.pods_on_node(node_name)? {
            let budgets = self.index.budgets_for_pod(&pod)?;
            match budgets.len() {
                0 => {}
                1 => {
                    if is_budget_blocked_by_pod(&pod, &budgets[0]) {
                        blocking.push(BlockingPod {
                            pod: pod.clone(),
                            budget: budgets[0].clone(),
                            reason: BlockingReason::BudgetExhausted,
                        });
                    }
                }
                _ => blocking.push(BlockingPod {
                    pod: pod.clone(),
                    budget: budgets[0].clone(),
                    reason: BlockingReason::OverlappingBudgets,
                }),
            }
        }
        Ok(blocking)
    }
}

/// Whether evicting this pod is currently forbidden by the given budget.
///
/// A ready pod counts toward the budget, so eviction is blocked once
/// `currentHealthy <= desiredHealthy`. An unready pod no longer counts, so the
/// budget only blocks when it is already short without it
/// (`desiredHealthy >= currentHealthy + 1`).
pub fn is_budget_blocked_by_pod(pod: &Pod, budget: &PodDisruptionBudget) -> bool {
    let status = match budget.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    let current_healthy = status.current_healthy;
    let desired_healthy = status.desired_healthy;

    if is_pod_ready(pod) {
        current_healthy <= desired_healthy
    } else {
        desired_healthy >= current_healthy + 1
    }
}

/// Names of the budgets, joined for diagnostics.
pub fn budget_names(budgets: &[Arc<PodDisruptionBudget>]) -> String {
    budgets
        .iter()
        .map(|budget| budget.name_any())
        .collect::<Vec<_>>()
        .join(";")
}
