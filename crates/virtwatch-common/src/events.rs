//! Kubernetes Event recording for the node controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that the controller can surface anomalies as standard Kubernetes Events
//! visible via `kubectl describe node`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. Ordinary heartbeat-driven cycles publish no events at all;
//! events are reserved for conditions an operator should look at.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "NodeReconcileFailing")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation, used when event recording is disabled.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An Event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was published on
    pub object: String,
    /// Warning or Normal
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Optional note
    pub note: Option<String>,
}

/// In-memory publisher that keeps every event, for tests and dry runs.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// True if nothing was published
    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        let event = RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Build an ObjectReference for a cluster-scoped Node
pub fn node_reference(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Reconciliation of a node keeps failing and is being retried with backoff
    pub const NODE_RECONCILE_FAILING: &str = "NodeReconcileFailing";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[test]
    fn node_reference_points_at_core_node() {
        let r = node_reference("node01");
        assert_eq!(r.kind.as_deref(), Some("Node"));
        assert_eq!(r.api_version.as_deref(), Some("v1"));
        assert_eq!(r.name.as_deref(), Some("node01"));
        assert!(r.namespace.is_none());
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &node_reference("node01"),
                EventType::Normal,
                reasons::NODE_RECONCILE_FAILING,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }

    #[tokio::test]
    async fn recording_publisher_keeps_events() {
        let recorder = RecordingEventPublisher::new();
        assert!(recorder.is_empty());

        recorder
            .publish(
                &node_reference("node01"),
                EventType::Warning,
                reasons::NODE_RECONCILE_FAILING,
                actions::RECONCILE,
                Some("5 consecutive failures".to_string()),
            )
            .await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].object, "node01");
        assert!(events[0].warning);
        assert_eq!(events[0].reason, "NodeReconcileFailing");
    }
}
