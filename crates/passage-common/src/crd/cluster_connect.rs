//! ClusterConnect Custom Resource Definition
//!
//! A ClusterConnect represents one remote cluster reachable through the
//! gateway. Its name doubles as the globally unique tunnel id.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, Condition, ConditionStatus};

/// Reference to another Kubernetes object by name and namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Name of the referenced object
    pub name: String,
    /// Namespace of the referenced object
    pub namespace: String,
    /// Kind of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// API version of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Specification for a ClusterConnect
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "connect.passage.dev",
    version = "v1alpha1",
    kind = "ClusterConnect",
    plural = "clusterconnects",
    shortname = "ccon",
    status = "ClusterConnectStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectSpec {
    /// Optional reference to the upstream cluster-lifecycle resource that
    /// owns the remote cluster's control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<ObjectRef>,

    /// Optional reference to a Secret holding the remote API server CA,
    /// matching the format of the CAPI `<cluster>-ca` Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert_ref: Option<ObjectRef>,

    /// Optional reference to a Secret holding admin client certificates,
    /// matching the format of the CAPI `<cluster>-cca` Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_ref: Option<ObjectRef>,
}

/// Probe state recording the last liveness check against the tunnel
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProbeState {
    /// Time of the most recent probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_timestamp: Option<DateTime<Utc>>,

    /// Time of the most recent successful probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_success_timestamp: Option<DateTime<Utc>>,

    /// Number of consecutive failed probes since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// Status for a ClusterConnect
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectStatus {
    /// True when every provisioning condition (probe excluded) is true
    #[serde(default)]
    pub ready: bool,

    /// URL coordinates for reaching the remote API server through the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// The rendered connect-agent Pod manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_manifest: Option<String>,

    /// State of the connection with the connect agent
    #[serde(default)]
    pub connection_probe: ConnectionProbeState,

    /// Conditions describing the provisioning state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterConnect {
    /// The tunnel id. The object name is used as the globally unique id.
    pub fn tunnel_id(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

impl ClusterConnectStatus {
    /// Get a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Set a condition, replacing any existing condition of the same type.
    ///
    /// The transition time is only refreshed when the status changes, per
    /// Kubernetes conventions.
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            let transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..condition
            };
        } else {
            self.conditions.push(condition);
        }
    }

    /// True when a condition of the given type exists with status True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}
