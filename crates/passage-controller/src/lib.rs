//! Passage controller
//!
//! Reconciles `ClusterConnect` objects: provisions per-tunnel auth tokens,
//! renders the connect-agent static-pod manifest, injects it into the
//! upstream cluster-lifecycle resource, and maintains the kubeconfig Secret
//! that routes through the gateway.

pub mod agent_manifest;
pub mod cluster_api;
pub mod conditions;
pub mod controller;
pub mod kubeconfig;
pub mod provider;
pub mod watches;

pub use controller::{error_policy, reconcile, Context, KubeAccess, KubeAccessImpl};
pub use provider::ProviderRegistry;
