use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use vault_protocol::ConfigKind;

use crate::fleet::FleetNode;

/// Deployment environment. Drives timer defaults and whether drift recovery
/// may run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    /// Interval between periodic poll/publish sweeps.
    pub fn default_periodic_interval(&self) -> Duration {
        match self {
            Environment::Development | Environment::Test => Duration::from_secs(2),
            Environment::Production => Duration::from_secs(30),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub environment: Environment,
    /// Configuration kinds this control plane versions and publishes.
    pub kinds: Vec<ConfigKind>,
    pub fleet: Vec<FleetNode>,
    pub periodic_interval: Duration,
    /// Rows not refreshed within this window are excluded from convergence.
    pub liveness_window: Duration,
    /// Per-node health query timeout.
    pub poll_timeout: Duration,
    /// Upper bound on one snapshot builder invocation.
    pub build_timeout: Duration,
    /// Upper bound on the whole drift recovery procedure.
    pub recovery_timeout: Duration,
    /// Pause between operator health probes while recovery waits for restart.
    pub recovery_probe_interval: Duration,
    /// Number of artifact versions retained per kind.
    pub artifact_retention: usize,
    /// Acknowledged notifications older than this are deleted by the poll cycle.
    pub notification_retention: Duration,
    pub allow_drift_recovery: bool,
    pub http_server: HttpServerConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

impl ControlConfig {
    pub fn for_environment(environment: Environment) -> Self {
        let periodic_interval = environment.default_periodic_interval();
        Self {
            environment,
            kinds: default_kinds(),
            fleet: Vec::new(),
            periodic_interval,
            liveness_window: periodic_interval * 3,
            poll_timeout: Duration::from_secs(3),
            build_timeout: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(60),
            recovery_probe_interval: Duration::from_millis(500),
            artifact_retention: 10,
            notification_retention: Duration::from_secs(7 * 24 * 60 * 60),
            allow_drift_recovery: false,
            http_server: HttpServerConfig::default(),
        }
    }

    /// Drift recovery is never allowed against production, whatever the flag says.
    pub fn drift_recovery_enabled(&self) -> bool {
        self.allow_drift_recovery && !self.environment.is_production()
    }
}

/// The two configuration consumers of the platform: the proxy's authorization map
/// and the key-server client list.
pub fn default_kinds() -> Vec<ConfigKind> {
    ["proxy-auth", "keyserver-clients"]
        .into_iter()
        .filter_map(|name| ConfigKind::new(name).ok())
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
        }
    }
}
