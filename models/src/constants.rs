/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! drainop_domain {
    () => {
        "drainop.dev"
    };
    ($s:literal) => {
        concat!(drainop_domain!(), "/", $s)
    };
}

pub const DRAINOP: &str = "drainop";
pub const DRAINOP_DOMAIN_LIKE_NAME: &str = drainop_domain!();

// The single taint owned by this controller. Its value carries the drain lifecycle
// state; the selection timestamp lives in the companion annotation because taint
// values must be valid label values and cannot hold an RFC 3339 string.
pub const DRAIN_TAINT_KEY: &str = drainop_domain!("drain");
pub const DRAIN_TAINT_SINCE_ANNOTATION: &str = drainop_domain!("drain-since");

// Label keys
pub const SCOPE_LABEL_KEY: &str = drainop_domain!("scope");
pub const OUT_OF_SCOPE_LABEL_VALUE: &str = "out-of-scope";
pub const REPLACE_LABEL_KEY: &str = drainop_domain!("replace");

// Node annotations
pub const RETRY_MAX_ATTEMPT_ANNOTATION: &str = drainop_domain!("retry-max-attempt");
pub const RETRY_FAILED_ANNOTATION: &str = drainop_domain!("drain-retry-failed");
pub const RETRY_FAILED_ANNOTATION_VALUE: &str = "failed";
pub const POST_ACTIVITY_RESULT_ANNOTATION: &str = drainop_domain!("post-activity-result");

// Pod (or controlling workload) annotations
pub const EVICTION_API_URL_ANNOTATION: &str = drainop_domain!("eviction-api-url");
pub const PVC_CLEANUP_ANNOTATION: &str = drainop_domain!("delete-pvc-and-pv");
pub const PVC_CLEANUP_ANNOTATION_TRUE_VALUE: &str = "true";
pub const PVC_CLEANUP_ANNOTATION_FALSE_VALUE: &str = "false";
pub const DO_NOT_EVICT_ANNOTATION: &str = drainop_domain!("do-not-evict");

// Annotation set on payloads sent to custom eviction endpoints, carrying the
// offending node conditions that triggered the drain.
pub const NODE_CONDITIONS_ANNOTATION: &str = drainop_domain!("node-conditions");

// Pre/post activity annotations. Activity names are appended to the prefixes.
pub const PRE_ACTIVITY_ANNOTATION_PREFIX: &str = drainop_domain!("pre-activity.");
pub const PRE_ACTIVITY_TIMEOUT_ANNOTATION_PREFIX: &str = drainop_domain!("pre-activity-timeout.");
pub const POST_ACTIVITY_ANNOTATION_PREFIX: &str = drainop_domain!("post-activity.");
pub const POST_ACTIVITY_TIMEOUT_ANNOTATION_PREFIX: &str = drainop_domain!("post-activity-timeout.");

pub const ACTIVITY_STATE_NOT_STARTED: &str = "not-started";
pub const ACTIVITY_STATE_PROCESSING: &str = "processing";
pub const ACTIVITY_STATE_DONE: &str = "done";
pub const ACTIVITY_STATE_FAILED: &str = "failed";

// Node condition recording drain progress.
pub const CONDITION_DRAIN_SCHEDULED: &str = "DrainScheduled";
pub const COMPLETED_STR: &str = "Completed";
pub const FAILED_STR: &str = "Failed";

// Upstream kubernetes annotation marking static mirror pods.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub const KIND_DAEMON_SET: &str = "DaemonSet";
pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";
pub const KIND_DEPLOYMENT: &str = "Deployment";

// Event reasons
pub const EVENT_EVICTION_STARTING: &str = "EvictionStarting";
pub const EVENT_EVICTION_SUCCEEDED: &str = "EvictionSucceeded";
pub const EVENT_EVICTION_FAILED: &str = "EvictionFailed";
pub const EVENT_EVICTION_ATTEMPT_FAILED: &str = "EvictionAttemptFailed";
pub const EVENT_DRAIN_SIMULATION_FAILED: &str = "DrainSimulationFailed";
pub const EVENT_EVICTION_SIMULATION_FAILED: &str = "EvictionSimulationFailed";
pub const EVENT_BAD_VALUE_FOR_ANNOTATION: &str = "BadValueForAnnotation";
pub const EVENT_DRAIN_CANDIDATE: &str = "DrainCandidate";
pub const EVENT_DRAIN_CANDIDATE_CLEARED: &str = "DrainCandidateCleared";
pub const EVENT_DRAIN_STARTING: &str = "DrainStarting";
pub const EVENT_DRAIN_SUCCEEDED: &str = "DrainSucceeded";
pub const EVENT_DRAIN_FAILED: &str = "DrainFailed";
pub const EVENT_PRE_ACTIVITY_TIMEOUT: &str = "PreActivityTimeout";
pub const EVENT_PRE_ACTIVITY_FAILED: &str = "PreActivityFailed";
pub const EVENT_POST_ACTIVITY_TIMEOUT: &str = "PostActivityTimeout";
pub const EVENT_POST_ACTIVITY_FAILED: &str = "PostActivityFailed";
pub const EVENT_REPLACEMENT_REQUESTED: &str = "ReplacementRequested";

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
