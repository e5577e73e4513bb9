use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use cluster_actuator::ActuatorConfig;
use sessiongate::controllers::SessionControllerConfig;
use sessiongate::proxy::ProxyConfig;
use sessiongate::util::telemetry::LogFormat;

/// Raw command-line and environment configuration. Every flag mirrors an
/// `ARO_HCP_*` environment variable. Nothing downstream reads this type:
/// `validate()` and `complete()` are the only ways out.
#[derive(Debug, Parser)]
#[command(name = "operator", about = "ARO HCP regional control plane operator")]
pub struct RawOptions {
    /// Session proxy listen port
    #[arg(long, env = "ARO_HCP_PORT", default_value_t = 8443)]
    pub port: u16,

    /// Health and diagnostics listen port
    #[arg(long, env = "ARO_HCP_HEALTH_PORT", default_value_t = 8444)]
    pub health_port: u16,

    /// Prometheus metrics listen port
    #[arg(long, env = "ARO_HCP_METRICS_PORT", default_value_t = 8445)]
    pub metrics_port: u16,

    /// Actuator workers per queue
    #[arg(long, env = "ARO_HCP_NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Full re-enumeration cadence for the actuator
    #[arg(long, env = "ARO_HCP_RELIST_INTERVAL", default_value = "10m", value_parser = humantime::parse_duration)]
    pub relist_interval: Duration,

    /// Relist-sourced reconciles inside this window are skipped
    #[arg(long, env = "ARO_HCP_MIN_RECONCILE_GAP", default_value = "30s", value_parser = humantime::parse_duration)]
    pub min_reconcile_gap: Duration,

    /// How long to wait for CSR approval and certificate issuance
    #[arg(long, env = "ARO_HCP_CSR_TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    pub csr_timeout: Duration,

    #[arg(long, env = "ARO_HCP_SESSION_MIN_TTL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub session_min_ttl: Duration,

    #[arg(long, env = "ARO_HCP_SESSION_MAX_TTL", default_value = "24h", value_parser = humantime::parse_duration)]
    pub session_max_ttl: Duration,

    /// Window before expiry in which a session reports Expiring
    #[arg(long, env = "ARO_HCP_SESSION_GRACE_WINDOW", default_value = "60s", value_parser = humantime::parse_duration)]
    pub session_grace_window: Duration,

    /// First path segment the session proxy serves under
    #[arg(long, env = "ARO_HCP_PROXY_PREFIX", default_value = "sg")]
    pub proxy_prefix: String,

    /// How long shutdown waits before severing in-flight connections
    #[arg(long, env = "ARO_HCP_SHUTDOWN_GRACE", default_value = "30s", value_parser = humantime::parse_duration)]
    pub shutdown_grace: Duration,

    /// Cluster-Service base URL (desired state authority)
    #[arg(
        long,
        env = "ARO_HCP_CLUSTER_SERVICE_URL",
        default_value = "http://clusters-service.cluster-service.svc.cluster.local:8000"
    )]
    pub cluster_service_url: String,

    /// Maestro base URL (realized state authority)
    #[arg(
        long,
        env = "ARO_HCP_MAESTRO_URL",
        default_value = "http://maestro.maestro.svc.cluster.local:8000"
    )]
    pub maestro_url: String,

    /// Per-call deadline for Cluster-Service and Maestro requests
    #[arg(long, env = "ARO_HCP_UPSTREAM_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub upstream_timeout: Duration,

    /// Log output format: compact or json
    #[arg(long, env = "ARO_HCP_LOG_FORMAT", default_value = "compact", value_parser = parse_log_format)]
    pub log_format: LogFormat,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value {
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {other:?} (expected compact or json)")),
    }
}

impl RawOptions {
    pub fn validate(self) -> anyhow::Result<ValidatedOptions> {
        if self.port == self.health_port
            || self.port == self.metrics_port
            || self.health_port == self.metrics_port
        {
            bail!("port, health-port and metrics-port must be distinct");
        }
        if self.num_workers == 0 {
            bail!("num-workers must be at least 1");
        }
        if self.session_min_ttl > self.session_max_ttl {
            bail!("session-min-ttl must not exceed session-max-ttl");
        }
        if self.csr_timeout < Duration::from_secs(1) {
            bail!("csr-timeout must be at least 1s");
        }
        if self.proxy_prefix.is_empty() || self.proxy_prefix.contains('/') {
            bail!("proxy-prefix must be a single path segment");
        }
        if self.cluster_service_url.is_empty() || self.maestro_url.is_empty() {
            bail!("cluster-service-url and maestro-url are required");
        }
        Ok(ValidatedOptions { raw: self })
    }
}

/// Proof that `validate()` ran; still not consumable by the controllers.
#[derive(Debug)]
pub struct ValidatedOptions {
    raw: RawOptions,
}

impl ValidatedOptions {
    pub fn complete(self) -> CompletedOptions {
        let raw = self.raw;
        CompletedOptions {
            proxy_addr: SocketAddr::from(([0, 0, 0, 0], raw.port)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], raw.health_port)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], raw.metrics_port)),
            actuator: ActuatorConfig {
                relist_interval: raw.relist_interval,
                min_reconcile_gap: raw.min_reconcile_gap,
                num_workers: raw.num_workers,
            },
            session: SessionControllerConfig {
                min_ttl: raw.session_min_ttl,
                max_ttl: raw.session_max_ttl,
                grace_window: raw.session_grace_window,
                csr_timeout: raw.csr_timeout,
            },
            proxy: ProxyConfig {
                prefix: raw.proxy_prefix,
                shutdown_grace: raw.shutdown_grace,
            },
            cluster_service_url: raw.cluster_service_url,
            maestro_url: raw.maestro_url,
            upstream_timeout: raw.upstream_timeout,
        }
    }
}

/// What the rest of the process runs on.
#[derive(Clone, Debug)]
pub struct CompletedOptions {
    pub proxy_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub actuator: ActuatorConfig,
    pub session: SessionControllerConfig,
    pub proxy: ProxyConfig,
    pub cluster_service_url: String,
    pub maestro_url: String,
    pub upstream_timeout: Duration,
}
