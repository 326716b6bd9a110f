//! Event emission on the cluster objects this controller acts on.
//!
//! Events are best-effort: a failure to publish is logged and otherwise ignored,
//! so callers never branch on event delivery.

use models::constants::DRAINOP;

use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use tracing::{event, Level};

#[derive(Clone)]
pub struct EventRecorder {
    inner: Option<Inner>,
}

#[derive(Clone)]
struct Inner {
    client: kube::Client,
    reporter: Reporter,
}

impl EventRecorder {
    pub fn new(client: kube::Client, instance: &str) -> Self {
        EventRecorder {
            inner: Some(Inner {
                client,
                reporter: Reporter {
                    controller: DRAINOP.to_string(),
                    instance: Some(instance.to_string()),
                },
            }),
        }
    }

    /// A recorder that drops every event. Used by tests and by tooling that runs
    /// without cluster access.
    pub fn disabled() -> Self {
        EventRecorder { inner: None }
    }

    async fn publish<K>(&self, object: &K, type_: EventType, reason: &str, message: String)
    where
        K: Resource<DynamicType = ()>,
    {
        let inner = match self.inner.as_ref() {
            Some(inner) => inner,
            None => return,
        };
        let recorder = Recorder::new(
            inner.client.clone(),
            inner.reporter.clone(),
            object.object_ref(&()),
        );
        if let Err(err) = recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(message),
                action: "Drain".to_string(),
                secondary: None,
            })
            .await
        {
            event!(Level::WARN, error = %err, reason, "Failed to publish event.");
        }
    }

    pub async fn node_event(
        &self,
        node: &Node,
        type_: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.publish(node, type_, reason, message.into()).await;
    }

    pub async fn pod_event(
        &self,
        pod: &Pod,
        type_: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.publish(pod, type_, reason, message.into()).await;
    }

    pub async fn pvc_event(
        &self,
        pvc: &PersistentVolumeClaim,
        type_: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.publish(pvc, type_, reason, message.into()).await;
    }

    pub async fn pv_event(
        &self,
        pv: &PersistentVolume,
        type_: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.publish(pv, type_, reason, message.into()).await;
    }
}
