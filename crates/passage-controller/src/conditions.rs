//! Condition bookkeeping for ClusterConnect status
//!
//! Every condition starts `Unknown` with reason `ReadyUnknown`. The
//! cluster-ref conditions only exist when `spec.clusterRef` is set.
//! `status.ready` is the AND of every present condition except the probe.

use passage_common::crd::{conditions, Condition, ConditionStatus};
use passage_common::crd::ClusterConnectStatus;

/// Condition types required for a ClusterConnect, in phase order
pub fn required_conditions(has_cluster_ref: bool) -> Vec<&'static str> {
    let mut required = vec![
        conditions::AUTH_TOKEN_READY,
        conditions::AGENT_MANIFEST_GENERATED,
        conditions::CONTROL_PLANE_ENDPOINT_SET,
    ];
    if has_cluster_ref {
        required.push(conditions::CLUSTER_SPEC_UPDATED);
        required.push(conditions::TOPOLOGY_RECONCILED);
    }
    required.push(conditions::CONNECTION_PROBE);
    required
}

/// Initialize missing conditions to Unknown
pub fn init_conditions(status: &mut ClusterConnectStatus, has_cluster_ref: bool) {
    for type_ in required_conditions(has_cluster_ref) {
        if status.condition(type_).is_none() {
            status.set_condition(Condition::new(
                type_,
                ConditionStatus::Unknown,
                conditions::READY_UNKNOWN_REASON,
                "",
            ));
        }
    }
}

/// Mark a condition True with reason Ready
pub fn set_ready(status: &mut ClusterConnectStatus, type_: &str) {
    status.set_condition(Condition::new(
        type_,
        ConditionStatus::True,
        conditions::READY_REASON,
        "",
    ));
}

/// Mark a condition False with reason NotReady and a message
pub fn set_not_ready(status: &mut ClusterConnectStatus, type_: &str, message: impl Into<String>) {
    status.set_condition(Condition::new(
        type_,
        ConditionStatus::False,
        conditions::NOT_READY_REASON,
        message,
    ));
}

/// Set the probe condition from the probe outcome
pub fn set_probe(status: &mut ClusterConnectStatus, healthy: bool, message: impl Into<String>) {
    let (probe_status, reason) = if healthy {
        (ConditionStatus::True, conditions::PROBE_SUCCEEDED_REASON)
    } else {
        (ConditionStatus::False, conditions::PROBE_FAILED_REASON)
    };
    status.set_condition(Condition::new(
        conditions::CONNECTION_PROBE,
        probe_status,
        reason,
        message,
    ));
}

/// Recompute `status.ready`: every present condition except the probe must
/// be True. The probe is orthogonal to readiness.
pub fn compute_ready(status: &mut ClusterConnectStatus) {
    let ready = !status.conditions.is_empty()
        && status
            .conditions
            .iter()
            .filter(|c| c.type_ != conditions::CONNECTION_PROBE)
            .all(|c| c.status == ConditionStatus::True);
    status.ready = ready;
}
