//! Process options. Every option can also be set through a `VAULT_*` env var.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use vault_control::fleet::FleetManifest;
use vault_control::{ControlConfig, Environment, HttpServerConfig};
use vault_protocol::ConfigKind;

#[derive(Args, Debug, Clone)]
pub struct ControlOpts {
    /// Deployment environment: development, test or production (env: VAULT_ENV)
    #[arg(long, global = true, env = "VAULT_ENV", default_value = "development")]
    pub environment: Environment,

    /// SQLite database file (env: VAULT_DB)
    #[arg(long, global = true, env = "VAULT_DB", default_value = "vault-control.db")]
    pub db: PathBuf,

    /// Directory for published artifacts (env: VAULT_ARTIFACTS)
    #[arg(long, global = true, env = "VAULT_ARTIFACTS", default_value = "artifacts")]
    pub artifacts: PathBuf,

    /// Directory holding `<kind>.json` snapshot sources (env: VAULT_SOURCE)
    #[arg(long, global = true, env = "VAULT_SOURCE", default_value = "source")]
    pub source: PathBuf,

    /// Fleet manifest, JSON `{"nodes": [...]}` (env: VAULT_FLEET)
    #[arg(long, global = true, env = "VAULT_FLEET")]
    pub fleet: Option<PathBuf>,

    /// Configuration kinds, comma separated (env: VAULT_KINDS)
    #[arg(long, global = true, env = "VAULT_KINDS", value_delimiter = ',')]
    pub kinds: Vec<ConfigKind>,

    /// HTTP bind address (env: VAULT_BIND)
    #[arg(long, global = true, env = "VAULT_BIND")]
    pub bind: Option<SocketAddr>,

    /// Disable the HTTP surface
    #[arg(long, global = true)]
    pub no_http: bool,

    /// Operator service base URL; required for drift recovery (env: VAULT_OPERATOR_URL)
    #[arg(long, global = true, env = "VAULT_OPERATOR_URL")]
    pub operator_url: Option<String>,

    /// Bearer token for the operator service (env: VAULT_OPERATOR_TOKEN)
    #[arg(long, global = true, env = "VAULT_OPERATOR_TOKEN", hide_env_values = true)]
    pub operator_token: Option<String>,

    /// Allow drift recovery outside production (env: VAULT_ALLOW_DRIFT_RECOVERY)
    #[arg(long, global = true, env = "VAULT_ALLOW_DRIFT_RECOVERY")]
    pub allow_drift_recovery: bool,

    /// Artifact versions retained per kind (env: VAULT_RETENTION)
    #[arg(long, global = true, env = "VAULT_RETENTION")]
    pub retention: Option<usize>,

    /// Periodic sweep interval in milliseconds (env: VAULT_INTERVAL_MS)
    #[arg(long, global = true, env = "VAULT_INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// Liveness window in milliseconds, default 3x the interval (env: VAULT_LIVENESS_MS)
    #[arg(long, global = true, env = "VAULT_LIVENESS_MS")]
    pub liveness_ms: Option<u64>,

    /// Node health poll timeout in milliseconds (env: VAULT_POLL_TIMEOUT_MS)
    #[arg(long, global = true, env = "VAULT_POLL_TIMEOUT_MS")]
    pub poll_timeout_ms: Option<u64>,

    /// Drift recovery timeout in milliseconds (env: VAULT_RECOVERY_TIMEOUT_MS)
    #[arg(long, global = true, env = "VAULT_RECOVERY_TIMEOUT_MS")]
    pub recovery_timeout_ms: Option<u64>,

    /// Hours acknowledged notifications are kept (env: VAULT_NOTIFICATION_RETENTION_HOURS)
    #[arg(long, global = true, env = "VAULT_NOTIFICATION_RETENTION_HOURS")]
    pub notification_retention_hours: Option<u64>,
}

impl ControlOpts {
    pub fn config(&self) -> Result<ControlConfig> {
        let mut config = ControlConfig::for_environment(self.environment);
        if !self.kinds.is_empty() {
            config.kinds = self.kinds.clone();
        }
        if let Some(path) = &self.fleet {
            config.fleet = FleetManifest::load(path)
                .with_context(|| format!("load fleet manifest {}", path.display()))?
                .nodes;
        }
        if let Some(ms) = self.interval_ms {
            config.periodic_interval = Duration::from_millis(ms);
            config.liveness_window = config.periodic_interval * 3;
        }
        if let Some(ms) = self.liveness_ms {
            config.liveness_window = Duration::from_millis(ms);
        }
        if let Some(ms) = self.poll_timeout_ms {
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.recovery_timeout_ms {
            config.recovery_timeout = Duration::from_millis(ms);
        }
        if let Some(retention) = self.retention {
            config.artifact_retention = retention;
        }
        if let Some(hours) = self.notification_retention_hours {
            config.notification_retention = Duration::from_secs(hours * 60 * 60);
        }
        config.allow_drift_recovery = self.allow_drift_recovery;
        let mut http = HttpServerConfig {
            enabled: !self.no_http,
            ..HttpServerConfig::default()
        };
        if let Some(bind) = self.bind {
            http.bind = bind;
        }
        config.http_server = http;
        Ok(config)
    }
}
