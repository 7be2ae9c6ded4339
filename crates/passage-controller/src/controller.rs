//! ClusterConnect reconciliation
//!
//! Level-triggered state machine. On every observation the phases run in
//! order; a failing phase records its condition and stops, and the requeue
//! or a dynamic watch retries. The status is patched on every pass, success
//! or failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use passage_common::crd::{
    conditions as cond, ApiEndpoint, ClusterConnect, ClusterConnectStatus,
};
use passage_common::{Error, Result, TokenStore, MAX_TUNNEL_ID_LEN};

use crate::agent_manifest::AgentManifestRenderer;
use crate::cluster_api::{
    cluster_api_resource, connect_agent_variable, merge_variables, CapiCluster, TopologyVariable,
    CONNECT_AGENT_MANIFEST_VARIABLE,
};
use crate::conditions::{compute_ready, init_conditions, set_not_ready, set_probe, set_ready};
use crate::kubeconfig::{
    control_plane_endpoint_url, generate_admin_kubeconfig, secret_field, TLS_CRT_KEY, TLS_KEY_KEY,
};
use crate::provider::ProviderRegistry;
use crate::watches::WatchTracker;

/// Finalizer guarding ClusterConnect deletion
pub const FINALIZER: &str = "connect.passage.dev/connect-controller";

/// Requeue interval after a successful pass
const DEFAULT_REQUEUE: Duration = Duration::from_secs(60);

/// Default probe timeout: a tunnel without a successful probe for this long
/// is reported unhealthy
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Private-CA attachment settings
#[derive(Clone, Debug)]
pub struct PrivateCaConfig {
    /// Secret holding the orchestration-cluster CA
    pub secret_name: String,
    /// Namespace of that Secret
    pub secret_namespace: String,
}

/// Kubernetes operations the reconciler needs, abstracted for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeAccess: Send + Sync {
    /// Add a finalizer to a ClusterConnect
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from a ClusterConnect
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<()>;

    /// Patch the status subresource of a ClusterConnect
    async fn patch_status(&self, name: &str, status: &ClusterConnectStatus) -> Result<()>;

    /// Merge labels onto a ClusterConnect
    async fn set_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    /// Get the upstream cluster resource, None when absent
    async fn get_capi_cluster(&self, namespace: &str, name: &str) -> Result<Option<CapiCluster>>;

    /// Replace the upstream cluster's topology variables
    async fn patch_capi_cluster_variables(
        &self,
        namespace: &str,
        name: &str,
        variables: &[TopologyVariable],
    ) -> Result<()>;

    /// Get a Secret, None when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Replace a Secret
    async fn update_secret(&self, secret: &Secret) -> Result<()>;
}

/// Real KubeAccess over a kube client
pub struct KubeAccessImpl {
    client: Client,
}

impl KubeAccessImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn connects(&self) -> Api<ClusterConnect> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl KubeAccess for KubeAccessImpl {
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<()> {
        let api = self.connects();
        let cc = api.get(name).await?;
        let mut finalizers = cc.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            name,
            &PatchParams::apply("passage-controller"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<()> {
        let api = self.connects();
        let cc = match api.get(name).await {
            Ok(cc) => cc,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = cc
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            name,
            &PatchParams::apply("passage-controller"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &ClusterConnectStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.connects()
            .patch_status(
                name,
                &PatchParams::apply("passage-controller"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn set_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.connects()
            .patch(
                name,
                &PatchParams::apply("passage-controller"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn get_capi_cluster(&self, namespace: &str, name: &str) -> Result<Option<CapiCluster>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &cluster_api_resource());
        match api.get(name).await {
            Ok(obj) => Ok(Some(CapiCluster::from_dynamic(&obj)?)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_capi_cluster_variables(
        &self,
        namespace: &str,
        name: &str,
        variables: &[TopologyVariable],
    ) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &cluster_api_resource());
        let patch = serde_json::json!({
            "spec": { "topology": { "variables": variables } }
        });
        api.patch(
            name,
            &PatchParams::apply("passage-controller"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), secret).await?;
        Ok(())
    }
}

/// Shared context for the ClusterConnect controller
pub struct Context {
    /// Kubernetes access (trait object for testability)
    pub kube: Arc<dyn KubeAccess>,
    /// Per-tunnel token store
    pub tokens: Arc<dyn TokenStore>,
    /// Control-plane provider registry
    pub providers: ProviderRegistry,
    /// Agent manifest renderer
    pub manifest: AgentManifestRenderer,
    /// Control-plane endpoint from GATEWAY_INTERNAL_URL
    pub endpoint: ApiEndpoint,
    /// Probe timeout for the connection condition
    pub probe_timeout: Duration,
    /// Private CA attachment, when enabled
    pub private_ca: Option<PrivateCaConfig>,
    /// Dynamic watch installer
    pub watches: Arc<WatchTracker>,
}

/// Whether a phase chain continues or waits for an external event
enum Flow {
    Continue,
    Stop,
}

fn has_finalizer(cc: &ClusterConnect) -> bool {
    cc.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

/// Reconcile one ClusterConnect
#[instrument(
    skip(cc, ctx),
    fields(tunnel_id = %cc.name_any(), otel.kind = "internal")
)]
pub async fn reconcile(cc: Arc<ClusterConnect>, ctx: Arc<Context>) -> Result<Action> {
    let name = cc.tunnel_id();
    debug!("reconciling");

    // Tunnel ids above the limit would produce Secret names the backing
    // store rejects; refuse them at admission rather than truncating
    if name.len() > MAX_TUNNEL_ID_LEN {
        warn!(len = name.len(), "Rejecting over-long tunnel id");
        let mut status = cc.status.clone().unwrap_or_default();
        init_conditions(&mut status, cc.spec.cluster_ref.is_some());
        set_not_ready(
            &mut status,
            cond::AUTH_TOKEN_READY,
            format!("tunnel id exceeds {MAX_TUNNEL_ID_LEN} characters"),
        );
        compute_ready(&mut status);
        ctx.kube.patch_status(&name, &status).await?;
        return Ok(Action::await_change());
    }

    // Deletion: the token Secret is garbage-collected through its owner
    // reference; a live session dies by heartbeat timeout at the gateway
    if cc.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&cc) {
            info!("Releasing ClusterConnect");
            ctx.kube.remove_finalizer(&name, FINALIZER).await?;
        }
        return Ok(Action::await_change());
    }

    // Finalizer first, before anything that needs cleanup on delete
    if !has_finalizer(&cc) {
        ctx.kube.add_finalizer(&name, FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let has_cluster_ref = cc.spec.cluster_ref.is_some();
    let mut status = cc.status.clone().unwrap_or_default();
    init_conditions(&mut status, has_cluster_ref);

    let outcome = run_phases(&cc, &mut status, &ctx).await;

    // Always reconcile ready and patch the status, pass or fail
    compute_ready(&mut status);
    ctx.kube.patch_status(&name, &status).await?;

    outcome?;
    Ok(Action::requeue(DEFAULT_REQUEUE))
}

/// Error policy: log and retry with a short backoff
pub fn error_policy(cc: Arc<ClusterConnect>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        tunnel_id = %cc.name_any(),
        %error,
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn run_phases(
    cc: &ClusterConnect,
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<()> {
    if let Flow::Stop = reconcile_auth_token(cc, status, ctx).await? {
        return Ok(());
    }
    if let Flow::Stop = reconcile_agent_manifest(cc, status, ctx).await? {
        return Ok(());
    }
    if let Flow::Stop = reconcile_control_plane_endpoint(status, ctx)? {
        return Ok(());
    }
    if let Flow::Stop = reconcile_cluster_spec(cc, status, ctx).await? {
        return Ok(());
    }
    if let Flow::Stop = reconcile_topology(cc, status, ctx).await? {
        return Ok(());
    }
    if let Flow::Stop = reconcile_kubeconfig(cc, status, ctx).await? {
        return Ok(());
    }
    if let Flow::Stop = reconcile_connection_probe(status, ctx)? {
        return Ok(());
    }
    Ok(())
}

/// Phase 2: ensure the agent token exists (token mode only)
async fn reconcile_auth_token(
    cc: &ClusterConnect,
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<Flow> {
    let tunnel_id = cc.tunnel_id();

    if ctx.manifest.config().auth_mode == "jwt" {
        set_ready(status, cond::AUTH_TOKEN_READY);
        return Ok(Flow::Continue);
    }

    // A lookup failure keeps the condition Unknown and retries
    if ctx.tokens.token_exists(&tunnel_id).await? {
        set_ready(status, cond::AUTH_TOKEN_READY);
        return Ok(Flow::Continue);
    }

    match ctx.tokens.create_and_store_token(&tunnel_id, cc).await {
        Ok(()) => {
            set_ready(status, cond::AUTH_TOKEN_READY);
            Ok(Flow::Continue)
        }
        Err(e) => {
            set_not_ready(status, cond::AUTH_TOKEN_READY, "failed to create token");
            Err(e)
        }
    }
}

/// Phase 3: render and publish the agent manifest
async fn reconcile_agent_manifest(
    cc: &ClusterConnect,
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<Flow> {
    let tunnel_id = cc.tunnel_id();

    let token = if ctx.manifest.config().auth_mode == "jwt" {
        String::new()
    } else {
        ctx.tokens.get_token(&tunnel_id).await?.value
    };

    match ctx.manifest.render(&tunnel_id, &token) {
        Ok(manifest) => {
            status.agent_manifest = Some(manifest);
            set_ready(status, cond::AGENT_MANIFEST_GENERATED);
            Ok(Flow::Continue)
        }
        Err(e) => {
            set_not_ready(
                status,
                cond::AGENT_MANIFEST_GENERATED,
                "failed to generate agent manifest",
            );
            Err(e)
        }
    }
}

/// Phase 4: publish the control-plane endpoint from configuration
fn reconcile_control_plane_endpoint(
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<Flow> {
    status.control_plane_endpoint = Some(ctx.endpoint.clone());
    set_ready(status, cond::CONTROL_PLANE_ENDPOINT_SET);
    Ok(Flow::Continue)
}

/// Phase 5: inject the agent manifest into the upstream cluster topology
async fn reconcile_cluster_spec(
    cc: &ClusterConnect,
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<Flow> {
    let Some(cluster_ref) = &cc.spec.cluster_ref else {
        return Ok(Flow::Continue);
    };

    let cluster = match ctx
        .kube
        .get_capi_cluster(&cluster_ref.namespace, &cluster_ref.name)
        .await
    {
        Ok(Some(cluster)) => cluster,
        Ok(None) => {
            set_not_ready(status, cond::CLUSTER_SPEC_UPDATED, "Cluster object not found");
            return Err(Error::internal_with_context(
                "reconciler",
                format!(
                    "Cluster {}/{} not found yet",
                    cluster_ref.namespace, cluster_ref.name
                ),
            ));
        }
        Err(e) => {
            set_not_ready(status, cond::CLUSTER_SPEC_UPDATED, "failed to get Cluster object");
            return Err(e);
        }
    };

    let manifest = status.agent_manifest.clone().ok_or_else(|| {
        Error::internal_with_context("reconciler", "agent manifest missing from status")
    })?;

    let path = cluster
        .control_plane_kind
        .as_deref()
        .and_then(|kind| ctx.providers.static_pod_manifest_path(kind));
    let Some(path) = path else {
        // Unknown control-plane kinds get no injection, by design
        debug!(
            kind = cluster.control_plane_kind.as_deref().unwrap_or("<none>"),
            "No static-pod provider for control-plane kind, skipping injection"
        );
        set_ready(status, cond::CLUSTER_SPEC_UPDATED);
        return Ok(Flow::Continue);
    };

    let variable = connect_agent_variable(path, &manifest)?;
    let merged = merge_variables(cluster.variables.clone(), variable);

    match ctx
        .kube
        .patch_capi_cluster_variables(&cluster.namespace, &cluster.name, &merged)
        .await
    {
        Ok(()) => {
            set_ready(status, cond::CLUSTER_SPEC_UPDATED);
            Ok(Flow::Continue)
        }
        Err(e) => {
            set_not_ready(status, cond::CLUSTER_SPEC_UPDATED, "failed to patch Cluster");
            Err(e)
        }
    }
}

/// Phase 6: wait for the topology controller to observe the injection
async fn reconcile_topology(
    cc: &ClusterConnect,
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<Flow> {
    let Some(cluster_ref) = &cc.spec.cluster_ref else {
        return Ok(Flow::Continue);
    };

    let cluster = match ctx
        .kube
        .get_capi_cluster(&cluster_ref.namespace, &cluster_ref.name)
        .await
    {
        Ok(Some(cluster)) => cluster,
        Ok(None) | Err(_) => {
            set_not_ready(status, cond::TOPOLOGY_RECONCILED, "failed to get Cluster object");
            return Err(Error::internal_with_context(
                "reconciler",
                format!(
                    "Cluster {}/{} unavailable",
                    cluster_ref.namespace, cluster_ref.name
                ),
            ));
        }
    };

    if cluster.has_variable(CONNECT_AGENT_MANIFEST_VARIABLE) && cluster.is_topology_reconciled() {
        set_ready(status, cond::TOPOLOGY_RECONCILED);
        return Ok(Flow::Continue);
    }

    // Not observed yet: watch the Cluster and stop; the watch produces the
    // next reconcile
    set_not_ready(
        status,
        cond::TOPOLOGY_RECONCILED,
        "waiting for the topology controller to observe the injected manifest",
    );
    ctx.watches.watch_capi_cluster(
        &cluster_ref.namespace,
        &cluster_ref.name,
        ObjectRef::from_obj(cc),
    );
    Ok(Flow::Stop)
}

/// Phase 7: regenerate the kubeconfig Secret to route through the gateway
async fn reconcile_kubeconfig(
    cc: &ClusterConnect,
    status: &mut ClusterConnectStatus,
    ctx: &Context,
) -> Result<Flow> {
    let Some(cluster_ref) = &cc.spec.cluster_ref else {
        return Ok(Flow::Continue);
    };
    let tunnel_id = cc.tunnel_id();
    let cluster_name = &cluster_ref.name;
    let namespace = &cluster_ref.namespace;

    // Record the kubeconfig coordinates as labels so Secret events map back
    // to this object
    let mut labels = BTreeMap::new();
    labels.insert(
        passage_common::KUBECONFIG_NAME_LABEL.to_string(),
        format!("{cluster_name}-kubeconfig"),
    );
    labels.insert(
        passage_common::KUBECONFIG_NAMESPACE_LABEL.to_string(),
        namespace.clone(),
    );
    ctx.kube.set_labels(&tunnel_id, labels).await?;

    let secret_name = format!("{cluster_name}-kubeconfig");
    let Some(mut secret) = ctx.kube.get_secret(namespace, &secret_name).await? else {
        // Not created yet: watch it and stop
        debug!(secret = %secret_name, "Kubeconfig secret not found, installing watch");
        ctx.watches
            .watch_secret(namespace, &secret_name, ObjectRef::from_obj(cc));
        return Ok(Flow::Stop);
    };

    let server_ca = ctx
        .kube
        .get_secret(namespace, &format!("{cluster_name}-ca"))
        .await?
        .ok_or_else(|| Error::kubeconfig(&tunnel_id, "server CA secret not found"))?;
    let client_ca = ctx
        .kube
        .get_secret(namespace, &format!("{cluster_name}-cca"))
        .await?
        .ok_or_else(|| Error::kubeconfig(&tunnel_id, "client CA secret not found"))?;

    let server_url = control_plane_endpoint_url(&ctx.endpoint.host, ctx.endpoint.port, &tunnel_id);
    let kubeconfig_yaml = generate_admin_kubeconfig(
        &tunnel_id,
        cluster_name,
        &server_url,
        secret_field(&server_ca, TLS_CRT_KEY)?,
        &String::from_utf8_lossy(secret_field(&client_ca, TLS_CRT_KEY)?),
        &String::from_utf8_lossy(secret_field(&client_ca, TLS_KEY_KEY)?),
    )?;

    let mut data = BTreeMap::new();
    data.insert(
        passage_common::KUBECONFIG_DATA_KEY.to_string(),
        k8s_openapi::ByteString(kubeconfig_yaml.into_bytes()),
    );

    // A private CA lets in-cluster agents trust the orchestration API
    // server through the same kubeconfig Secret
    if let Some(private_ca) = &ctx.private_ca {
        let ca_secret = ctx
            .kube
            .get_secret(&private_ca.secret_namespace, &private_ca.secret_name)
            .await?
            .ok_or_else(|| Error::kubeconfig(&tunnel_id, "private CA secret not found"))?;
        let ca_pem = secret_field(&ca_secret, "ca.crt")
            .or_else(|_| secret_field(&ca_secret, TLS_CRT_KEY))?;
        data.insert(
            passage_common::API_SERVER_CA_KEY.to_string(),
            k8s_openapi::ByteString(ca_pem.to_vec()),
        );
    }

    secret.data = Some(data);
    match ctx.kube.update_secret(&secret).await {
        Ok(()) => {
            set_ready(status, cond::KUBECONFIG_READY);
            Ok(Flow::Continue)
        }
        Err(e) => {
            set_not_ready(status, cond::KUBECONFIG_READY, "failed to patch kubeconfig secret");
            Err(e)
        }
    }
}

/// Phase 8: derive the probe condition from the probe timestamps.
///
/// The gateway's sweeper owns the timestamps; this phase only interprets
/// them. Until the first successful probe the condition stays Unknown. Runs
/// last, so a cluster-ref phase that waits on a watch skips the refresh for
/// that pass.
fn reconcile_connection_probe(status: &mut ClusterConnectStatus, ctx: &Context) -> Result<Flow> {
    let probe = status.connection_probe.clone();
    let Some(last_success) = probe.last_probe_success_timestamp else {
        return Ok(Flow::Continue);
    };
    let last_probe = probe.last_probe_timestamp.unwrap_or(last_success);

    let elapsed = (last_probe - last_success)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed > ctx.probe_timeout {
        let message = format!(
            "Remote connection probe failed. Time since last successful probe: {}s. Last probe: {}, last successful probe: {}",
            elapsed.as_secs(),
            last_probe.to_rfc3339(),
            last_success.to_rfc3339(),
        );
        set_probe(status, false, message);
    } else {
        set_probe(status, true, "");
    }
    Ok(Flow::Continue)
}
