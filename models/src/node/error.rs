use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to fetch node '{}': '{}'", node_name, source))]
    GetNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Node '{}' was not found", node_name))]
    NodeNotFound { node_name: String },

    #[snafu(display("Unable to patch node '{}': '{}'", node_name, source))]
    PatchNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to update status of node '{}': '{}'", node_name, source))]
    UpdateNodeStatus {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to create patch to send to Kubernetes API: '{}'", source))]
    CreateK8SPatch { source: serde_json::error::Error },

    #[snafu(display(
        "Cannot parse attempt count from condition message '{}' on node '{}'",
        message,
        node_name
    ))]
    ParseConditionMessage { node_name: String, message: String },

    #[snafu(display("Cannot read '{}' condition on node '{}'", condition, node_name))]
    UnreadableCondition {
        node_name: String,
        condition: String,
    },
}
