//! Node health from the agent heartbeat (pure functions)

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use virtwatch_common::{HEARTBEAT_ANNOTATION, SCHEDULABLE_LABEL};

/// Health verdict for a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeHealth {
    /// The agent stamped a heartbeat within the threshold
    Healthy,
    /// The heartbeat is stale, missing or unreadable
    Unresponsive,
}

impl NodeHealth {
    /// Whether new VMs may be placed on a node with this health
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Value of the schedulable label matching this health
    pub fn label_value(&self) -> &'static str {
        if self.is_schedulable() {
            "true"
        } else {
            "false"
        }
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Unresponsive => write!(f, "Unresponsive"),
        }
    }
}

/// Decide node health from a raw heartbeat value.
///
/// Unresponsive iff `now - heartbeat > threshold`. A missing or unparseable
/// heartbeat means the agent was never seen and is Unresponsive as well.
/// A heartbeat from the future (clock skew) counts as fresh.
pub fn evaluate(heartbeat: Option<&str>, now: DateTime<Utc>, threshold: Duration) -> NodeHealth {
    let Some(heartbeat) = heartbeat.and_then(parse_heartbeat) else {
        return NodeHealth::Unresponsive;
    };
    let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
    if now.signed_duration_since(heartbeat) > threshold {
        NodeHealth::Unresponsive
    } else {
        NodeHealth::Healthy
    }
}

/// Health of a Node object at `now`
pub fn evaluate_node(node: &Node, now: DateTime<Utc>, threshold: Duration) -> NodeHealth {
    evaluate(heartbeat(node), now, threshold)
}

/// Raw heartbeat annotation of a node
pub fn heartbeat(node: &Node) -> Option<&str> {
    node.annotations()
        .get(HEARTBEAT_ANNOTATION)
        .map(String::as_str)
}

/// Current value of the schedulable label, if set
pub fn schedulable_label(node: &Node) -> Option<&str> {
    node.labels().get(SCHEDULABLE_LABEL).map(String::as_str)
}

/// Label value that has to be written for the node to match its health.
///
/// Returns `None` when the label already agrees. An unresponsive node is
/// patched unless it is already labeled `"false"`; a healthy node is only
/// patched back when it is currently labeled `"false"`, since the agent
/// writes the initial label itself.
pub fn desired_label_change(node: &Node, health: NodeHealth) -> Option<bool> {
    let current = schedulable_label(node);
    match health {
        NodeHealth::Unresponsive if current != Some("false") => Some(false),
        NodeHealth::Healthy if current == Some("false") => Some(true),
        _ => None,
    }
}

fn parse_heartbeat(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
