//! Passage agent binary

use clap::Parser;
use tracing::error;

use passage_agent::{AgentAuthMode, AgentConfig};
use passage_common::telemetry::{init_telemetry, TelemetryConfig};

/// Connect agent: opens an outbound tunnel from a remote cluster to the
/// gateway
#[derive(Parser, Debug)]
#[command(name = "passage-agent", version, about, long_about = None)]
struct Cli {
    /// The URL of the gateway
    #[arg(long)]
    gateway_url: String,

    /// The tunnel ID
    #[arg(long)]
    tunnel_id: String,

    /// Skip TLS verification
    #[arg(long, default_value_t = true)]
    insecure_skip_verify: bool,

    /// Authentication mode for tunnel connections: 'token' or 'jwt'
    #[arg(long, default_value = "token")]
    tunnel_auth_mode: AgentAuthModeArg,

    /// The authentication token
    #[arg(long)]
    auth_token: Option<String>,

    /// Log levels: info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the JWT token
    #[arg(long, default_value = "./access_token")]
    token_path: String,

    /// Path to the static pod manifest
    #[arg(long, default_value = "/var/lib/kubelet/static-pods/connect-agent.yaml")]
    static_pod_path: String,
}

/// clap-parseable wrapper around the auth mode
#[derive(Clone, Debug)]
struct AgentAuthModeArg(AgentAuthMode);

impl std::str::FromStr for AgentAuthModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(AgentAuthModeArg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    passage_common::install_crypto_provider();

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::new("passage-agent", cli.log_level.clone()))?;

    let config = AgentConfig::new(
        &cli.gateway_url,
        &cli.tunnel_id,
        cli.insecure_skip_verify,
        cli.tunnel_auth_mode.0,
        cli.auth_token,
        cli.token_path,
        cli.static_pod_path,
    )?;

    // Any exit is terminal; the static-pod supervisor restarts the process
    if let Err(e) = passage_agent::run(config).await {
        error!(error = %e, "Tunnel terminated");
        return Err(e.into());
    }
    Ok(())
}
