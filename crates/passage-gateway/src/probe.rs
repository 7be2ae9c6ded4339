//! Connection liveness probe
//!
//! A periodic sweeper correlates session-registry state with per-
//! ClusterConnect probe timestamps. The gateway is the single writer of the
//! `status.connectionProbe` fields; the controller only reads them to derive
//! the probe condition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, warn};

use passage_common::crd::{ClusterConnect, ConnectionProbeState};

use crate::registry::SharedSessionRegistry;

/// Default sweep cadence
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Compute the next probe state from the previous one and the registry
/// lookup. Pure so the transition table is unit-testable.
pub fn next_probe_state(
    prev: &ConnectionProbeState,
    has_session: bool,
    now: DateTime<Utc>,
) -> ConnectionProbeState {
    if has_session {
        ConnectionProbeState {
            last_probe_timestamp: Some(now),
            last_probe_success_timestamp: Some(now),
            consecutive_failures: 0,
        }
    } else {
        ConnectionProbeState {
            last_probe_timestamp: Some(now),
            last_probe_success_timestamp: prev.last_probe_success_timestamp,
            consecutive_failures: prev.consecutive_failures.saturating_add(1),
        }
    }
}

/// Periodic liveness sweeper over all ClusterConnect objects
pub struct ConnectionProbe {
    connects: Api<ClusterConnect>,
    registry: SharedSessionRegistry,
    interval: Duration,
}

impl ConnectionProbe {
    /// Create a sweeper with the given cadence
    pub fn new(client: Client, registry: SharedSessionRegistry, interval: Duration) -> Self {
        Self {
            connects: Api::all(client),
            registry,
            interval,
        }
    }

    /// Run the sweeper until the process exits
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One pass over every known ClusterConnect
    pub async fn sweep(&self) {
        let list = match self.connects.list(&Default::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Probe sweep failed to list ClusterConnects");
                return;
            }
        };

        let now = Utc::now();
        for cc in list.items {
            let tunnel_id = cc.tunnel_id();
            if tunnel_id.is_empty() {
                continue;
            }
            let has_session = self.registry.has_session(&tunnel_id);
            let prev = cc
                .status
                .as_ref()
                .map(|s| s.connection_probe.clone())
                .unwrap_or_default();
            let next = next_probe_state(&prev, has_session, now);

            debug!(
                tunnel_id = %tunnel_id,
                has_session,
                consecutive_failures = next.consecutive_failures,
                "Probed tunnel"
            );

            let patch = serde_json::json!({
                "status": {
                    "connectionProbe": next,
                }
            });
            if let Err(e) = self
                .connects
                .patch_status(
                    &tunnel_id,
                    &PatchParams::apply("passage-gateway"),
                    &Patch::Merge(&patch),
                )
                .await
            {
                warn!(tunnel_id = %tunnel_id, error = %e, "Failed to update probe state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_success_resets_failures() {
        let prev = ConnectionProbeState {
            last_probe_timestamp: None,
            last_probe_success_timestamp: None,
            consecutive_failures: 4,
        };
        let now = Utc::now();

        let next = next_probe_state(&prev, true, now);
        assert_eq!(next.last_probe_timestamp, Some(now));
        assert_eq!(next.last_probe_success_timestamp, Some(now));
        assert_eq!(next.consecutive_failures, 0);
    }

    #[test]
    fn test_probe_failure_increments_and_preserves_last_success() {
        let success_time = Utc::now() - chrono::Duration::minutes(10);
        let prev = ConnectionProbeState {
            last_probe_timestamp: Some(success_time),
            last_probe_success_timestamp: Some(success_time),
            consecutive_failures: 1,
        };
        let now = Utc::now();

        let next = next_probe_state(&prev, false, now);
        assert_eq!(next.last_probe_timestamp, Some(now));
        assert_eq!(next.last_probe_success_timestamp, Some(success_time));
        assert_eq!(next.consecutive_failures, 2);
    }

    #[test]
    fn test_probe_failure_saturates() {
        let prev = ConnectionProbeState {
            last_probe_timestamp: None,
            last_probe_success_timestamp: None,
            consecutive_failures: u32::MAX,
        };
        let next = next_probe_state(&prev, false, Utc::now());
        assert_eq!(next.consecutive_failures, u32::MAX);
    }
}
