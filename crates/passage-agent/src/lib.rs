//! Passage agent
//!
//! Runs inside a remote cluster as a static pod, opens one outbound
//! WebSocket tunnel to the gateway, and serves stream-open requests by
//! dialing local destinations (the local API server). On transport error the
//! process exits; the static-pod supervisor restarts it.

pub mod client;
pub mod config;

pub use client::run;
pub use config::{AgentAuthMode, AgentConfig};
