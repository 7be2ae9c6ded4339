//! Upstream cluster-lifecycle resource access
//!
//! The upstream `Cluster` (cluster.x-k8s.io/v1beta1) is treated as a
//! dynamic object: the controller only touches `spec.controlPlaneRef.kind`,
//! `spec.topology.variables`, and the generation bookkeeping. Variable
//! injection merges by name so entries written by other controllers
//! survive.

use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

use passage_common::{Error, Result};

/// Topology variable carrying the rendered agent manifest
pub const CONNECT_AGENT_MANIFEST_VARIABLE: &str = "connectAgentManifest";

/// Owner rendered into the injected static-pod file
pub const MANIFEST_FILE_OWNER: &str = "root:root";

/// GVK of the upstream cluster resource
pub fn cluster_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta1", "Cluster"))
}

/// The agent config embedded in the cluster topology
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ConnectAgentConfig {
    /// Destination path of the static-pod manifest on control-plane nodes
    pub path: String,
    /// File owner
    pub owner: String,
    /// The manifest content
    pub content: String,
}

/// One entry of `spec.topology.variables`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TopologyVariable {
    /// Variable name
    pub name: String,
    /// Opaque value
    pub value: serde_json::Value,
}

/// The slice of the upstream Cluster the reconciler needs
#[derive(Clone, Debug, PartialEq)]
pub struct CapiCluster {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Kind of the control-plane provider resource
    pub control_plane_kind: Option<String>,
    /// metadata.generation
    pub generation: i64,
    /// status.observedGeneration
    pub observed_generation: i64,
    /// spec.topology.variables
    pub variables: Vec<TopologyVariable>,
}

impl CapiCluster {
    /// Extract the needed fields from a dynamic object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let generation = obj.metadata.generation.unwrap_or_default();

        let spec = obj.data.get("spec");
        let control_plane_kind = spec
            .and_then(|s| s.get("controlPlaneRef"))
            .and_then(|r| r.get("kind"))
            .and_then(|k| k.as_str())
            .map(str::to_string);

        let variables = spec
            .and_then(|s| s.get("topology"))
            .and_then(|t| t.get("variables"))
            .map(|v| {
                serde_json::from_value::<Vec<TopologyVariable>>(v.clone()).map_err(|e| {
                    Error::internal(format!("malformed topology variables on {name}: {e}"))
                })
            })
            .transpose()?
            .unwrap_or_default();

        let observed_generation = obj
            .data
            .get("status")
            .and_then(|s| s.get("observedGeneration"))
            .and_then(|g| g.as_i64())
            .unwrap_or_default();

        Ok(Self {
            name,
            namespace,
            control_plane_kind,
            generation,
            observed_generation,
            variables,
        })
    }

    /// Whether the named topology variable is present
    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
    }

    /// Whether the topology controller has caught up with the spec
    pub fn is_topology_reconciled(&self) -> bool {
        self.generation == self.observed_generation
    }
}

/// Merge a variable into the list, keyed by name.
///
/// Entries owned by other controllers are preserved; an existing entry with
/// the same name is replaced in place.
pub fn merge_variables(
    mut variables: Vec<TopologyVariable>,
    incoming: TopologyVariable,
) -> Vec<TopologyVariable> {
    match variables.iter_mut().find(|v| v.name == incoming.name) {
        Some(existing) => *existing = incoming,
        None => variables.push(incoming),
    }
    variables
}

/// Build the topology variable embedding the agent manifest
pub fn connect_agent_variable(path: &str, manifest: &str) -> Result<TopologyVariable> {
    let config = ConnectAgentConfig {
        path: path.to_string(),
        owner: MANIFEST_FILE_OWNER.to_string(),
        content: manifest.to_string(),
    };
    Ok(TopologyVariable {
        name: CONNECT_AGENT_MANIFEST_VARIABLE.to_string(),
        value: serde_json::to_value(&config)
            .map_err(|e| Error::internal(format!("failed to encode agent config: {e}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_dynamic(spec: serde_json::Value, status: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new("c2", &cluster_api_resource());
        obj.metadata.namespace = Some("default".to_string());
        obj.metadata.generation = Some(3);
        obj.data = json!({ "spec": spec, "status": status });
        obj
    }

    #[test]
    fn test_from_dynamic_extracts_fields() {
        let obj = make_dynamic(
            json!({
                "controlPlaneRef": {"kind": "RKE2ControlPlane", "name": "c2-cp"},
                "topology": {
                    "class": "default",
                    "variables": [
                        {"name": "other", "value": 42}
                    ]
                }
            }),
            json!({"observedGeneration": 3}),
        );

        let cluster = CapiCluster::from_dynamic(&obj).unwrap();
        assert_eq!(cluster.name, "c2");
        assert_eq!(cluster.namespace, "default");
        assert_eq!(cluster.control_plane_kind.as_deref(), Some("RKE2ControlPlane"));
        assert_eq!(cluster.generation, 3);
        assert_eq!(cluster.observed_generation, 3);
        assert!(cluster.is_topology_reconciled());
        assert!(cluster.has_variable("other"));
        assert!(!cluster.has_variable(CONNECT_AGENT_MANIFEST_VARIABLE));
    }

    #[test]
    fn test_from_dynamic_tolerates_missing_topology() {
        let obj = make_dynamic(json!({}), json!({}));
        let cluster = CapiCluster::from_dynamic(&obj).unwrap();
        assert!(cluster.variables.is_empty());
        assert!(cluster.control_plane_kind.is_none());
        assert_eq!(cluster.observed_generation, 0);
        assert!(!cluster.is_topology_reconciled());
    }

    #[test]
    fn test_merge_preserves_foreign_variables() {
        // The redesigned injection must not clobber entries owned by other
        // controllers
        let existing = vec![
            TopologyVariable {
                name: "dnsConfig".to_string(),
                value: json!({"servers": ["10.0.0.2"]}),
            },
            TopologyVariable {
                name: CONNECT_AGENT_MANIFEST_VARIABLE.to_string(),
                value: json!({"path": "/old", "owner": "root:root", "content": "old"}),
            },
        ];

        let incoming = connect_agent_variable("/new/path", "new-manifest").unwrap();
        let merged = merge_variables(existing, incoming);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "dnsConfig");
        assert_eq!(merged[1].value["path"], "/new/path");
        assert_eq!(merged[1].value["content"], "new-manifest");
    }

    #[test]
    fn test_merge_appends_when_absent() {
        let incoming = connect_agent_variable("/p", "m").unwrap();
        let merged = merge_variables(Vec::new(), incoming);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, CONNECT_AGENT_MANIFEST_VARIABLE);
    }

    #[test]
    fn test_connect_agent_variable_shape() {
        let variable = connect_agent_variable("/var/lib/rancher/rke2/agent/pod-manifests/connect-agent.yaml", "apiVersion: v1").unwrap();
        assert_eq!(variable.value["owner"], "root:root");
        assert_eq!(variable.value["content"], "apiVersion: v1");
    }
}
