//! Control-plane provider registry
//!
//! Maps an upstream control-plane kind to the path where that distribution
//! picks up static-pod manifests. Registration happens at startup; unknown
//! kinds yield no path and injection is skipped.

use std::collections::HashMap;

/// Static-pod manifest path for RKE2 control planes
pub const RKE2_STATIC_POD_PATH: &str =
    "/var/lib/rancher/rke2/agent/pod-manifests/connect-agent.yaml";

/// Static-pod manifest path for k3s control planes
pub const K3S_STATIC_POD_PATH: &str =
    "/var/lib/rancher/k3s/agent/pod-manifests/connect-agent.yaml";

/// Registry of control-plane providers
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    paths: HashMap<String, String>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the known distributions
    pub fn with_defaults() -> Self {
        Self::new()
            .with_provider("RKE2ControlPlane", RKE2_STATIC_POD_PATH)
            .with_provider("KThreesControlPlane", K3S_STATIC_POD_PATH)
    }

    /// Register a provider for a control-plane kind
    pub fn with_provider(mut self, kind: impl Into<String>, path: impl Into<String>) -> Self {
        self.paths.insert(kind.into(), path.into());
        self
    }

    /// Register a provider on an existing registry
    pub fn register(&mut self, kind: impl Into<String>, path: impl Into<String>) {
        self.paths.insert(kind.into(), path.into());
    }

    /// The static-pod manifest path for a control-plane kind, if known
    pub fn static_pod_manifest_path(&self, kind: &str) -> Option<&str> {
        self.paths.get(kind).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_rke2_and_k3s() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.static_pod_manifest_path("RKE2ControlPlane"),
            Some(RKE2_STATIC_POD_PATH)
        );
        assert_eq!(
            registry.static_pod_manifest_path("KThreesControlPlane"),
            Some(K3S_STATIC_POD_PATH)
        );
    }

    #[test]
    fn test_unknown_kind_yields_none() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.static_pod_manifest_path("KubeadmControlPlane"),
            None
        );
    }

    #[test]
    fn test_additional_providers_register_without_rebuilds() {
        let mut registry = ProviderRegistry::with_defaults();
        registry.register("KubeadmControlPlane", "/etc/kubernetes/manifests/connect-agent.yaml");
        assert_eq!(
            registry.static_pod_manifest_path("KubeadmControlPlane"),
            Some("/etc/kubernetes/manifests/connect-agent.yaml")
        );
    }
}
