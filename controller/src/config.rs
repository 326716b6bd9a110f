//! Environment-driven configuration for the controller.
//!
//! Everything has a sensible default except the controller identity and the set
//! of node conditions that trigger drains.

use models::duration::parse_duration;
use models::node::SuppliedCondition;

use snafu::{ensure, ResultExt};
use std::env;
use std::time::Duration;

const CONFIG_NAME_ENV_VAR: &str = "DRAINOP_CONFIG_NAME";
const NODE_CONDITIONS_ENV_VAR: &str = "DRAINOP_NODE_CONDITIONS";
const NODE_LABELS_ENV_VAR: &str = "DRAINOP_NODE_LABELS";
const GROUP_LABELS_ENV_VAR: &str = "DRAINOP_GROUP_LABELS";
const MAX_CONCURRENT_DRAINS_ENV_VAR: &str = "DRAINOP_MAX_CONCURRENT_DRAINS";
const MAX_DRAIN_ATTEMPTS_ENV_VAR: &str = "DRAINOP_MAX_DRAIN_ATTEMPTS";
const ACTIVITY_TIMEOUT_ENV_VAR: &str = "DRAINOP_ACTIVITY_TIMEOUT";
const MIN_EVICTION_TIMEOUT_ENV_VAR: &str = "DRAINOP_MIN_EVICTION_TIMEOUT";
const EVICTION_HEADROOM_ENV_VAR: &str = "DRAINOP_EVICTION_HEADROOM";
const PV_DELETION_STORAGE_CLASSES_ENV_VAR: &str = "DRAINOP_PV_DELETION_STORAGE_CLASSES";
const PVC_CLEANUP_DEFAULT_ENV_VAR: &str = "DRAINOP_PVC_CLEANUP_DEFAULT_IF_NO_EVICTION_URL";
const SIMULATION_RATE_ENV_VAR: &str = "DRAINOP_SIMULATION_RATE_PER_MINUTE";
const REPLACE_DRAINED_ENV_VAR: &str = "DRAINOP_REPLACE_DRAINED_NODES";
const TOKEN_PATH_ENV_VAR: &str = "DRAINOP_TOKEN_PATH";

const DEFAULT_GROUP_LABELS: &str = "nodepool";
const DEFAULT_MAX_CONCURRENT_DRAINS: usize = 4;
const DEFAULT_MAX_DRAIN_ATTEMPTS: u32 = 8;
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MIN_EVICTION_TIMEOUT: Duration = Duration::from_secs(8 * 60);
const DEFAULT_EVICTION_HEADROOM: Duration = Duration::from_secs(30);
const DEFAULT_SIMULATION_RATE_PER_MINUTE: u32 = 60;
const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/tokens/drainop-token";

/// The module-wide result type.
type Result<T> = std::result::Result<T, error::Error>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this controller instance, published in the scope label.
    pub config_name: String,
    /// Node conditions that make a node eligible for draining.
    pub node_conditions: Vec<SuppliedCondition>,
    /// Label requirements a node must carry to be in scope. Empty means all nodes.
    pub node_labels: Vec<(String, String)>,
    /// Labels whose values form the drain group key.
    pub group_labels: Vec<String>,
    /// Global cap on simultaneously active drains across all groups.
    pub max_concurrent_drains: usize,
    /// Default maximum number of drain attempts before giving up on a node.
    pub max_drain_attempts: u32,
    /// Default timeout for pre/post activities without their own timeout annotation.
    pub activity_timeout: Duration,
    /// Minimum time budget for a single pod eviction.
    pub min_eviction_timeout: Duration,
    /// Extra time granted on top of a pod's grace period for the API server to
    /// report the deletion.
    pub eviction_headroom: Duration,
    /// Storage classes whose PVCs (and PVs) may be deleted after eviction.
    pub pv_deletion_storage_classes: Vec<String>,
    /// Whether PVC cleanup defaults to enabled for pods without a custom eviction endpoint.
    pub pvc_cleanup_default_if_no_eviction_url: bool,
    /// Token bucket refill rate for dry-run eviction calls.
    pub simulation_rate_per_minute: u32,
    /// Whether drained nodes get a replacement request.
    pub replace_drained_nodes: bool,
    /// Path of the projected service-account token attached to custom eviction
    /// endpoint calls that request one.
    pub token_path: String,
}

impl Config {
    pub fn from_environment() -> Result<Self> {
        let config_name = env::var(CONFIG_NAME_ENV_VAR).context(error::MissingEnvVariableSnafu {
            variable: CONFIG_NAME_ENV_VAR,
        })?;
        // Identities are joined with '.' in the scope label, so they cannot contain one.
        ensure!(
            !config_name.is_empty() && !config_name.contains('.'),
            error::InvalidConfigNameSnafu { value: config_name }
        );

        let conditions_raw =
            env::var(NODE_CONDITIONS_ENV_VAR).context(error::MissingEnvVariableSnafu {
                variable: NODE_CONDITIONS_ENV_VAR,
            })?;
        let node_conditions = parse_conditions(&conditions_raw)?;
        ensure!(!node_conditions.is_empty(), error::NoConditionsSnafu);

        let node_labels = parse_label_requirements(
            &env::var(NODE_LABELS_ENV_VAR).unwrap_or_default(),
        )?;

        let group_labels = env::var(GROUP_LABELS_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_GROUP_LABELS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Config {
            config_name,
            node_conditions,
            node_labels,
            group_labels,
            max_concurrent_drains: parse_env_or(
                MAX_CONCURRENT_DRAINS_ENV_VAR,
                DEFAULT_MAX_CONCURRENT_DRAINS,
            )?,
            max_drain_attempts: parse_env_or(
                MAX_DRAIN_ATTEMPTS_ENV_VAR,
                DEFAULT_MAX_DRAIN_ATTEMPTS,
            )?,
            activity_timeout: parse_duration_env_or(
                ACTIVITY_TIMEOUT_ENV_VAR,
                DEFAULT_ACTIVITY_TIMEOUT,
            )?,
            min_eviction_timeout: parse_duration_env_or(
                MIN_EVICTION_TIMEOUT_ENV_VAR,
                DEFAULT_MIN_EVICTION_TIMEOUT,
            )?,
            eviction_headroom: parse_duration_env_or(
                EVICTION_HEADROOM_ENV_VAR,
                DEFAULT_EVICTION_HEADROOM,
            )?,
            pv_deletion_storage_classes: env::var(PV_DELETION_STORAGE_CLASSES_ENV_VAR)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|class| !class.is_empty())
                .map(str::to_string)
                .collect(),
            pvc_cleanup_default_if_no_eviction_url: env::var(PVC_CLEANUP_DEFAULT_ENV_VAR)
                .map(|value| value == "true")
                .unwrap_or(false),
            simulation_rate_per_minute: parse_env_or(
                SIMULATION_RATE_ENV_VAR,
                DEFAULT_SIMULATION_RATE_PER_MINUTE,
            )?,
            replace_drained_nodes: env::var(REPLACE_DRAINED_ENV_VAR)
                .map(|value| value == "true")
                .unwrap_or(false),
            token_path: env::var(TOKEN_PATH_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_TOKEN_PATH.to_string()),
        })
    }
}

/// Parses the condition list, e.g. `"KernelDeadlock,OutOfDisk=10m"`.
fn parse_conditions(raw: &str) -> Result<Vec<SuppliedCondition>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            None => Ok(SuppliedCondition {
                condition_type: entry.to_string(),
                min_duration: None,
            }),
            Some((condition_type, duration)) => Ok(SuppliedCondition {
                condition_type: condition_type.trim().to_string(),
                min_duration: Some(parse_duration(duration).context(
                    error::InvalidConditionDurationSnafu {
                        entry: entry.to_string(),
                    },
                )?),
            }),
        })
        .collect()
}

/// Parses node label requirements, e.g. `"role=worker,zone=eu-west-1a"`.
fn parse_label_requirements(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| {
                    error::InvalidLabelRequirementSnafu {
                        entry: entry.to_string(),
                    }
                    .build()
                })
        })
        .collect()
}

fn parse_env_or<T: std::str::FromStr>(variable: &str, default: T) -> Result<T> {
    match env::var(variable) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| {
            error::UnparseableEnvVariableSnafu {
                variable: variable.to_string(),
                value: raw,
            }
            .build()
        }),
    }
}

fn parse_duration_env_or(variable: &str, default: Duration) -> Result<Duration> {
    match env::var(variable) {
        Err(_) => Ok(default),
        Ok(raw) => parse_duration(&raw).map_err(|_| {
            error::UnparseableEnvVariableSnafu {
                variable: variable.to_string(),
                value: raw,
            }
            .build()
        }),
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to get environment variable '{}': '{}'", variable, source))]
        MissingEnvVariable {
            source: std::env::VarError,
            variable: String,
        },

        #[snafu(display(
            "Config name '{}' is invalid: it must be non-empty and must not contain '.'",
            value
        ))]
        InvalidConfigName { value: String },

        #[snafu(display("At least one node condition must be supplied"))]
        NoConditions,

        #[snafu(display("Invalid duration in condition entry '{}': '{}'", entry, source))]
        InvalidConditionDuration {
            entry: String,
            source: models::duration::error::Error,
        },

        #[snafu(display("Invalid label requirement '{}', expected key=value", entry))]
        InvalidLabelRequirement { entry: String },

        #[snafu(display("Cannot parse environment variable '{}' value '{}'", variable, value))]
        UnparseableEnvVariable { variable: String, value: String },
    }
}
