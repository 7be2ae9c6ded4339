//! Passage gateway binary

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use tracing::info;

use passage_gateway::authorizer::TunnelAuthMode;
use passage_gateway::opa::OpaConfig;
use passage_gateway::server::DEFAULT_CLEANUP_INTERVAL;
use passage_gateway::GatewayConfig;
use passage_common::telemetry::{init_telemetry, TelemetryConfig};

/// Connection gateway for network-isolated Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "passage-gateway", version, about, long_about = None)]
struct Cli {
    /// Address to listen on for the connection gateway
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port to listen on for the connection gateway
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Enable OIDC authentication on the external surface
    #[arg(long, default_value_t = false)]
    enable_auth: bool,

    /// Enable connection metrics
    #[arg(long, default_value_t = false)]
    enable_metrics: bool,

    /// Log levels: info, debug, trace, warn
    #[arg(long, default_value = "info")]
    log_level: String,

    /// OIDC issuer URL
    #[arg(long)]
    oidc_issuer_url: Option<String>,

    /// Skip OIDC signature verification (development only)
    #[arg(long, default_value_t = false)]
    oidc_insecure_skip_verify: bool,

    /// External host for the gateway
    #[arg(long)]
    external_host: Option<String>,

    /// Skip verification of remote API server certificates
    #[arg(long, default_value_t = true)]
    tls_insecure_skip_verify: bool,

    /// Address of the OPA policy engine
    #[arg(long, default_value = "http://localhost")]
    opa_address: String,

    /// Port of the OPA policy engine
    #[arg(long, default_value_t = 8181)]
    opa_port: u16,

    /// Authentication mode for tunnel connections: 'token' or 'jwt'
    #[arg(long, default_value = "token")]
    tunnel_auth_mode: TunnelAuthModeArg,
}

/// clap-parseable wrapper around the auth mode
#[derive(Clone, Debug)]
struct TunnelAuthModeArg(TunnelAuthMode);

impl std::str::FromStr for TunnelAuthModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TunnelAuthModeArg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    passage_common::install_crypto_provider();

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::new("passage-gateway", cli.log_level.clone()))?;
    info!(
        mode = ?cli.tunnel_auth_mode.0,
        "Agent authentication mode for tunnel connections"
    );

    let config = GatewayConfig {
        listen_addr: SocketAddr::new(cli.address, cli.port),
        enable_auth: cli.enable_auth,
        enable_metrics: cli.enable_metrics,
        external_host: cli.external_host,
        tunnel_auth_mode: cli.tunnel_auth_mode.0,
        oidc_issuer_url: cli.oidc_issuer_url,
        oidc_insecure_skip_verify: cli.oidc_insecure_skip_verify,
        tls_insecure_skip_verify: cli.tls_insecure_skip_verify,
        opa: cli.enable_auth.then(|| OpaConfig {
            address: cli.opa_address,
            port: cli.opa_port,
        }),
        client_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        probe_interval: Duration::from_secs(60),
    };

    passage_gateway::run(config).await
}
