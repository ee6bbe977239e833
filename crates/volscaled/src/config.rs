//! volscaled configuration: optional TOML file overlaid by CLI flags.
//!
//! ```toml
//! [controller]
//! polling_interval = "30s"
//! reconcile_timeout = "1m"
//! retry_after = "5m"
//! max_concurrent_resizes = 8
//! rate_limit_base = "5ms"
//! rate_limit_max = "1000s"
//!
//! [metrics]
//! client = "prometheus"
//! url = "http://prometheus-server.monitoring.svc.cluster.local"
//! timeout = "5s"
//!
//! [log]
//! level = "info"
//! format = "json"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use warpgrid_volmetrics::MetricsBackend;
use warpgrid_volmetrics::prometheus::DEFAULT_QUERY_TIMEOUT;
use warpgrid_volscale::ControllerConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub controller: ControllerSection,
    pub metrics: MetricsSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSection {
    pub polling_interval: Option<String>,
    pub reconcile_timeout: Option<String>,
    pub retry_after: Option<String>,
    pub max_concurrent_resizes: Option<usize>,
    pub rate_limit_base: Option<String>,
    pub rate_limit_max: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSection {
    pub client: Option<String>,
    pub url: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }
}

/// Values given on the command line. `None` defers to the file, then to
/// the built-in default.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub polling_interval: Option<Duration>,
    pub reconcile_timeout: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub max_concurrent_resizes: Option<usize>,
    pub metrics_client: Option<MetricsBackend>,
    pub metrics_client_url: Option<String>,
    pub metrics_timeout: Option<Duration>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub controller: ControllerConfig,
    pub metrics_client: MetricsBackend,
    pub metrics_client_url: String,
    pub metrics_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn resolve(file: DaemonConfig, cli: Overrides) -> anyhow::Result<Self> {
        let defaults = ControllerConfig::default();
        let section = &file.controller;

        let controller = ControllerConfig {
            polling_interval: pick(
                cli.polling_interval,
                &section.polling_interval,
                "controller.polling_interval",
                defaults.polling_interval,
            )?,
            reconcile_timeout: pick(
                cli.reconcile_timeout,
                &section.reconcile_timeout,
                "controller.reconcile_timeout",
                defaults.reconcile_timeout,
            )?,
            retry_after: pick(
                cli.retry_after,
                &section.retry_after,
                "controller.retry_after",
                defaults.retry_after,
            )?,
            max_concurrent_resizes: cli
                .max_concurrent_resizes
                .or(section.max_concurrent_resizes)
                .unwrap_or(defaults.max_concurrent_resizes),
            rate_limit_base: pick(
                None,
                &section.rate_limit_base,
                "controller.rate_limit_base",
                defaults.rate_limit_base,
            )?,
            rate_limit_max: pick(
                None,
                &section.rate_limit_max,
                "controller.rate_limit_max",
                defaults.rate_limit_max,
            )?,
        };
        if controller.max_concurrent_resizes == 0 {
            anyhow::bail!("max_concurrent_resizes must be at least 1");
        }
        if controller.polling_interval.is_zero() {
            anyhow::bail!("polling_interval must be greater than zero");
        }

        let metrics_client = match (cli.metrics_client, &file.metrics.client) {
            (Some(backend), _) => backend,
            (None, Some(name)) => name
                .parse()
                .with_context(|| format!("invalid metrics.client {name:?}"))?,
            (None, None) => MetricsBackend::default(),
        };

        Ok(Self {
            controller,
            metrics_client,
            metrics_client_url: cli
                .metrics_client_url
                .or(file.metrics.url)
                .unwrap_or_default(),
            metrics_timeout: pick(
                cli.metrics_timeout,
                &file.metrics.timeout,
                "metrics.timeout",
                DEFAULT_QUERY_TIMEOUT,
            )?,
            log_level: cli
                .log_level
                .or(file.log.level)
                .unwrap_or_else(|| "info".to_string()),
            log_format: cli.log_format.or(file.log.format).unwrap_or_default(),
        })
    }
}

fn pick(
    cli: Option<Duration>,
    file: &Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    if let Some(value) = cli {
        return Ok(value);
    }
    match file {
        Some(raw) => parse_duration(raw).map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        None => Ok(default),
    }
}

/// Parse a duration like "500ms", "30s", "5m", "1h". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
    };
    Ok(duration)
}
