use opentelemetry::{
    metrics::{Counter, Meter},
    Key,
};

const CAUSE_KEY: Key = Key::from_static_str("cause");
const REASON_KEY: Key = Key::from_static_str("reason");
const RESULT_KEY: Key = Key::from_static_str("result");

pub struct ControllerMetrics {
    drain_attempts: Counter<u64>,
    drain_successes: Counter<u64>,
    drain_failures: Counter<u64>,
    replacement_requests: Counter<u64>,
    simulations: Counter<u64>,
}

impl ControllerMetrics {
    pub fn new(meter: Meter) -> Self {
        let drain_attempts = meter
            .u64_counter("drainop_drain_attempts")
            .with_description("Node drains started")
            .init();
        let drain_successes = meter
            .u64_counter("drainop_drain_successes")
            .with_description("Node drains completed successfully")
            .init();
        let drain_failures = meter
            .u64_counter("drainop_drain_failures")
            .with_description("Node drains that failed, labelled by cause")
            .init();
        let replacement_requests = meter
            .u64_counter("drainop_replacement_requests")
            .with_description("Node replacement requests issued")
            .init();
        let simulations = meter
            .u64_counter("drainop_drain_simulations")
            .with_description("Node drain simulations, labelled by result")
            .init();
        ControllerMetrics {
            drain_attempts,
            drain_successes,
            drain_failures,
            replacement_requests,
            simulations,
        }
    }

    pub fn drain_attempt(&self) {
        self.drain_attempts.add(1, &[]);
    }

    pub fn drain_success(&self) {
        self.drain_successes.add(1, &[]);
    }

    pub fn drain_failure(&self, cause: &'static str) {
        self.drain_failures.add(1, &[CAUSE_KEY.string(cause)]);
    }

    pub fn replacement_requested(&self, reason: &'static str) {
        self.replacement_requests
            .add(1, &[REASON_KEY.string(reason)]);
    }

    pub fn simulation(&self, can_evict: bool) {
        let result = if can_evict { "accepted" } else { "rejected" };
        self.simulations.add(1, &[RESULT_KEY.string(result)]);
    }
}
