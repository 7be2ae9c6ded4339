//! Connect-agent manifest rendering
//!
//! Renders the static-pod manifest the remote control plane writes to disk
//! so the kubelet launches the agent. Parameters come from the controller's
//! environment; tunnel id and token are per-object. Rendering is
//! deterministic: identical inputs produce identical YAML.

use minijinja::Environment;
use serde::Serialize;
use url::Url;

use passage_common::{Error, Result};

/// Environment variable names consumed by [`AgentManifestConfig::from_env`]
mod env_vars {
    pub const AGENT_IMAGE: &str = "AGENT_IMAGE";
    pub const GATEWAY_EXTERNAL_URL: &str = "GATEWAY_EXTERNAL_URL";
    pub const AGENT_JWT_TOKEN_PATH: &str = "AGENT_JWT_TOKEN_PATH";
    pub const INSECURE_SKIP_VERIFY: &str = "INSECURE_SKIP_VERIFY";
    pub const AGENT_LOG_LEVEL: &str = "AGENT_LOG_LEVEL";
    pub const HTTP_PROXY: &str = "HTTP_PROXY";
    pub const HTTPS_PROXY: &str = "HTTPS_PROXY";
    pub const NO_PROXY: &str = "NO_PROXY";
    pub const TLS_MODE: &str = "TLS_MODE";
    pub const AGENT_AUTH_MODE: &str = "AGENT_AUTH_MODE";
}

const AGENT_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: connect-agent
  namespace: kube-system
spec:
  containers:
  - name: connect-agent
    image: "{{ image }}"
{%- if http_proxy or https_proxy or no_proxy %}
    env:
{%- if http_proxy %}
    - name: HTTP_PROXY
      value: {{ http_proxy }}
{%- endif %}
{%- if https_proxy %}
    - name: HTTPS_PROXY
      value: {{ https_proxy }}
{%- endif %}
{%- if no_proxy %}
    - name: NO_PROXY
      value: {{ no_proxy }}
{%- endif %}
{%- endif %}
    command: [ "/passage-agent" ]
    args:
    - "--gateway-url={{ gateway_url }}"
    - "--tunnel-id={{ tunnel_id }}"
    - "--auth-token={{ token }}"
    - "--insecure-skip-verify={{ insecure_skip_verify }}"
    - "--log-level={{ log_level }}"
    - "--token-path={{ token_path }}"
    - "--tunnel-auth-mode={{ auth_mode }}"
    securityContext:
{%- if auth_mode == "jwt" %}
      runAsUser: 501
      runAsGroup: 500
{%- endif %}
      allowPrivilegeEscalation: false
      capabilities:
        drop:
        - ALL
      readOnlyRootFilesystem: true
      seccompProfile:
        type: RuntimeDefault
    resources:
      limits: {}
      requests:
        cpu: 100m
        memory: 128Mi
{%- if tls_mode == "system-store" or auth_mode == "jwt" %}
    volumeMounts:
{%- if tls_mode == "system-store" %}
    - name: server-ca
      mountPath: /etc/secrets/ca/cert
      readOnly: true
{%- endif %}
{%- if auth_mode == "jwt" %}
    - name: jwt-token
      mountPath: {{ token_path }}
      readOnly: true
{%- endif %}
  volumes:
{%- if tls_mode == "system-store" %}
  - name: server-ca
    hostPath:
      path: /usr/local/share/ca-certificates/ca.crt
      type: File
{%- endif %}
{%- if auth_mode == "jwt" %}
  - name: jwt-token
    hostPath:
      path: {{ token_path }}
      type: File
{%- endif %}
{%- endif %}
"#;

/// Static configuration for manifest rendering, read once at startup
#[derive(Clone, Debug)]
pub struct AgentManifestConfig {
    /// Agent container image
    pub image: String,
    /// Gateway tunnel URL, normalized to `ws[s]` with path `/connect`
    pub gateway_url: String,
    /// Path the JWT is mounted at inside the agent pod
    pub token_path: String,
    /// Rendered verbatim into `--insecure-skip-verify`
    pub insecure_skip_verify: String,
    /// Agent log level
    pub log_level: String,
    /// Proxy settings passed through to the agent pod
    pub http_proxy: String,
    /// HTTPS proxy
    pub https_proxy: String,
    /// Proxy exclusions
    pub no_proxy: String,
    /// `strict` or `system-store`
    pub tls_mode: String,
    /// `token` or `jwt`
    pub auth_mode: String,
}

impl AgentManifestConfig {
    /// Read the configuration from the environment.
    ///
    /// Mandatory variables (`AGENT_IMAGE`, `GATEWAY_EXTERNAL_URL`,
    /// `AGENT_JWT_TOKEN_PATH`) produce a fatal configuration error when
    /// absent.
    pub fn from_env() -> Result<Self> {
        let image = required(env_vars::AGENT_IMAGE)?;
        let gateway_url = rewrite_gateway_url(&required(env_vars::GATEWAY_EXTERNAL_URL)?)?;
        let token_path = required(env_vars::AGENT_JWT_TOKEN_PATH)?;

        Ok(Self {
            image,
            gateway_url,
            token_path,
            insecure_skip_verify: optional(env_vars::INSECURE_SKIP_VERIFY, "true"),
            log_level: optional(env_vars::AGENT_LOG_LEVEL, "info"),
            http_proxy: optional(env_vars::HTTP_PROXY, ""),
            https_proxy: optional(env_vars::HTTPS_PROXY, ""),
            no_proxy: optional(env_vars::NO_PROXY, ""),
            tls_mode: optional(env_vars::TLS_MODE, "strict"),
            auth_mode: optional(env_vars::AGENT_AUTH_MODE, "token"),
        })
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config(format!("{name} is not set")))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Rewrite the external gateway URL to the tunnel endpoint: scheme `ws[s]`,
/// path `/connect`
pub fn rewrite_gateway_url(raw: &str) -> Result<String> {
    let mut url =
        Url::parse(raw).map_err(|_| Error::config("GATEWAY_EXTERNAL_URL is invalid"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| Error::config("GATEWAY_EXTERNAL_URL is invalid"))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| Error::config("GATEWAY_EXTERNAL_URL is invalid"))?,
        _ => return Err(Error::config("GATEWAY_EXTERNAL_URL has unsupported scheme")),
    }
    url.set_path(passage_common::CONNECT_PATH);
    Ok(url.to_string())
}

/// Render context for the manifest template
#[derive(Serialize)]
struct ManifestContext<'a> {
    image: &'a str,
    gateway_url: &'a str,
    token_path: &'a str,
    insecure_skip_verify: &'a str,
    log_level: &'a str,
    http_proxy: &'a str,
    https_proxy: &'a str,
    no_proxy: &'a str,
    tls_mode: &'a str,
    auth_mode: &'a str,
    tunnel_id: &'a str,
    token: &'a str,
}

/// Renders connect-agent manifests for tunnel ids
pub struct AgentManifestRenderer {
    env: Environment<'static>,
    config: AgentManifestConfig,
}

impl AgentManifestRenderer {
    /// Compile the template with the given configuration
    pub fn new(config: AgentManifestConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("agent-pod", AGENT_TEMPLATE)
            .map_err(|e| Error::manifest(format!("invalid agent template: {e}")))?;
        Ok(Self { env, config })
    }

    /// The static configuration this renderer was built with
    pub fn config(&self) -> &AgentManifestConfig {
        &self.config
    }

    /// Render the manifest for a tunnel id and token
    pub fn render(&self, tunnel_id: &str, token: &str) -> Result<String> {
        let template = self
            .env
            .get_template("agent-pod")
            .map_err(|e| Error::manifest(e.to_string()))?;
        let context = ManifestContext {
            image: &self.config.image,
            gateway_url: &self.config.gateway_url,
            token_path: &self.config.token_path,
            insecure_skip_verify: &self.config.insecure_skip_verify,
            log_level: &self.config.log_level,
            http_proxy: &self.config.http_proxy,
            https_proxy: &self.config.https_proxy,
            no_proxy: &self.config.no_proxy,
            tls_mode: &self.config.tls_mode,
            auth_mode: &self.config.auth_mode,
            tunnel_id,
            token,
        };
        template
            .render(context)
            .map_err(|e| Error::manifest(format!("failed to render agent manifest: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AgentManifestConfig {
        AgentManifestConfig {
            image: "registry.example.com/passage-agent:0.3.1".to_string(),
            gateway_url: "wss://gateway.example.com/connect".to_string(),
            token_path: "/etc/intel_edge_node/tokens/connect-agent/access_token".to_string(),
            insecure_skip_verify: "true".to_string(),
            log_level: "info".to_string(),
            http_proxy: String::new(),
            https_proxy: String::new(),
            no_proxy: String::new(),
            tls_mode: "strict".to_string(),
            auth_mode: "token".to_string(),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        // Property 5: identical inputs render byte-identical manifests
        let renderer = AgentManifestRenderer::new(base_config()).unwrap();
        let first = renderer.render("c1", "token-value").unwrap();
        let second = renderer.render("c1", "token-value").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_contains_mandatory_args() {
        let renderer = AgentManifestRenderer::new(base_config()).unwrap();
        let manifest = renderer.render("c1", "tok").unwrap();

        assert!(manifest.contains("--gateway-url=wss://gateway.example.com/connect"));
        assert!(manifest.contains("--tunnel-id=c1"));
        assert!(manifest.contains("--auth-token=tok"));
        assert!(manifest.contains("--insecure-skip-verify=true"));
        assert!(manifest.contains("--log-level=info"));
        assert!(manifest.contains("--tunnel-auth-mode=token"));
        assert!(manifest.contains("readOnlyRootFilesystem: true"));
        assert!(manifest.contains("type: RuntimeDefault"));
        assert!(manifest.contains("cpu: 100m"));
        assert!(manifest.contains("memory: 128Mi"));
    }

    #[test]
    fn test_render_token_mode_runs_as_root_without_mounts() {
        let renderer = AgentManifestRenderer::new(base_config()).unwrap();
        let manifest = renderer.render("c1", "tok").unwrap();

        assert!(!manifest.contains("runAsUser"));
        assert!(!manifest.contains("volumeMounts"));
        assert!(!manifest.contains("volumes:"));
    }

    #[test]
    fn test_render_jwt_mode_drops_privileges_and_mounts_token() {
        let mut config = base_config();
        config.auth_mode = "jwt".to_string();
        let renderer = AgentManifestRenderer::new(config).unwrap();
        let manifest = renderer.render("c1", "").unwrap();

        assert!(manifest.contains("runAsUser: 501"));
        assert!(manifest.contains("runAsGroup: 500"));
        assert!(manifest.contains("name: jwt-token"));
        assert!(manifest
            .contains("mountPath: /etc/intel_edge_node/tokens/connect-agent/access_token"));
    }

    #[test]
    fn test_render_system_store_mounts_ca() {
        let mut config = base_config();
        config.tls_mode = "system-store".to_string();
        let renderer = AgentManifestRenderer::new(config).unwrap();
        let manifest = renderer.render("c1", "tok").unwrap();

        assert!(manifest.contains("mountPath: /etc/secrets/ca/cert"));
        assert!(manifest.contains("path: /usr/local/share/ca-certificates/ca.crt"));
    }

    #[test]
    fn test_render_proxy_env_only_when_set() {
        let mut config = base_config();
        config.http_proxy = "http://proxy.example.com:3128".to_string();
        config.no_proxy = "10.0.0.0/8".to_string();
        let renderer = AgentManifestRenderer::new(config).unwrap();
        let manifest = renderer.render("c1", "tok").unwrap();

        assert!(manifest.contains("HTTP_PROXY"));
        assert!(manifest.contains("http://proxy.example.com:3128"));
        assert!(manifest.contains("NO_PROXY"));
        assert!(!manifest.contains("HTTPS_PROXY"));
    }

    #[test]
    fn test_rewrite_gateway_url_schemes() {
        assert_eq!(
            rewrite_gateway_url("https://gw.example.com").unwrap(),
            "wss://gw.example.com/connect"
        );
        assert_eq!(
            rewrite_gateway_url("http://gw.example.com:8080").unwrap(),
            "ws://gw.example.com:8080/connect"
        );
        assert_eq!(
            rewrite_gateway_url("wss://gw.example.com/ignored").unwrap(),
            "wss://gw.example.com/connect"
        );
        assert!(rewrite_gateway_url("ftp://gw.example.com").is_err());
        assert!(rewrite_gateway_url("not a url").is_err());
    }
}
