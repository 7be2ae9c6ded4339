//! Passage controller binary

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

use passage_common::crd::{ApiEndpoint, ClusterConnect};
use passage_common::telemetry::{init_telemetry, TelemetryConfig};
use passage_common::SecretTokenStore;
use passage_controller::agent_manifest::{AgentManifestConfig, AgentManifestRenderer};
use passage_controller::controller::{PrivateCaConfig, DEFAULT_PROBE_TIMEOUT};
use passage_controller::watches::WatchTracker;
use passage_controller::{error_policy, reconcile, Context, KubeAccessImpl, ProviderRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    passage_common::install_crypto_provider();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    init_telemetry(TelemetryConfig::new("passage-controller", log_level))?;

    let manifest_config =
        AgentManifestConfig::from_env().context("invalid agent manifest configuration")?;
    let endpoint = parse_internal_endpoint().context("invalid GATEWAY_INTERNAL_URL")?;
    let private_ca = parse_private_ca().context("invalid private CA configuration")?;
    let probe_timeout = parse_probe_timeout();

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    ensure_crd_installed(&client)
        .await
        .context("failed to install ClusterConnect CRD")?;

    let (watches, trigger_stream) = WatchTracker::new(client.clone());

    let ctx = Arc::new(Context {
        kube: Arc::new(KubeAccessImpl::new(client.clone())),
        tokens: Arc::new(SecretTokenStore::new(
            client.clone(),
            passage_common::secret_namespace(),
        )),
        providers: ProviderRegistry::with_defaults(),
        manifest: AgentManifestRenderer::new(manifest_config)?,
        endpoint,
        probe_timeout,
        private_ca,
        watches,
    });

    let connects: Api<ClusterConnect> = Api::all(client);
    info!("Starting ClusterConnect controller");

    Controller::new(connects, WatcherConfig::default())
        .reconcile_on(trigger_stream)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => info!(object = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

/// Install the CRD with server-side apply so its version always matches the
/// controller
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("passage-controller").force();

    info!("Installing ClusterConnect CRD");
    crds.patch(
        "clusterconnects.connect.passage.dev",
        &params,
        &Patch::Apply(&ClusterConnect::crd()),
    )
    .await?;
    Ok(())
}

/// Parse GATEWAY_INTERNAL_URL into host and port
fn parse_internal_endpoint() -> anyhow::Result<ApiEndpoint> {
    let raw = std::env::var("GATEWAY_INTERNAL_URL").context("GATEWAY_INTERNAL_URL is not set")?;
    let url = url::Url::parse(&raw).with_context(|| format!("cannot parse {raw}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("{raw} has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .with_context(|| format!("{raw} has no port"))?;
    Ok(ApiEndpoint { host, port })
}

/// Parse the private-CA settings; both name and namespace are required when
/// enabled
fn parse_private_ca() -> anyhow::Result<Option<PrivateCaConfig>> {
    if std::env::var("PRIVATE_CA_ENABLED").as_deref() != Ok("true") {
        return Ok(None);
    }
    let secret_name =
        std::env::var("PRIVATE_CA_SECRET_NAME").context("PRIVATE_CA_SECRET_NAME is not set")?;
    let secret_namespace = std::env::var("PRIVATE_CA_SECRET_NAMESPACE")
        .context("PRIVATE_CA_SECRET_NAMESPACE is not set")?;
    Ok(Some(PrivateCaConfig {
        secret_name,
        secret_namespace,
    }))
}

/// Probe timeout in seconds, defaulting to five minutes
fn parse_probe_timeout() -> Duration {
    std::env::var("CONNECTION_PROBE_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT)
}
