//! Prometheus usage source.
//!
//! Two instant queries per cycle over plain HTTP/1.1:
//!
//! ```text
//! GET {base}/api/v1/query?query=kubelet_volume_stats_used_bytes
//! GET {base}/api/v1/query?query=kubelet_volume_stats_capacity_bytes
//! ```
//!
//! Both results are vectors labelled with `namespace` and
//! `persistentvolumeclaim`. A volume appears in the merged batch only when
//! both series are present.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use serde::Deserialize;
use tracing::{debug, warn};

use warpgrid_volume::{UsageSample, UsageSamples, UsageSource, VolumeError, VolumeId, VolumeResult};

pub const USED_BYTES_QUERY: &str = "kubelet_volume_stats_used_bytes";
pub const CAPACITY_BYTES_QUERY: &str = "kubelet_volume_stats_capacity_bytes";

const NAMESPACE_LABEL: &str = "namespace";
const CLAIM_LABEL: &str = "persistentvolumeclaim";

/// Per-query timeout used when none is configured.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: Vec<VectorEntry>,
}

#[derive(Debug, Deserialize)]
struct VectorEntry {
    #[serde(default)]
    metric: HashMap<String, String>,
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

/// Parse an instant-query response body into per-volume byte values.
///
/// Series without both identity labels, or whose value is not a finite,
/// non-negative number, are skipped.
pub fn parse_vector(body: &[u8]) -> VolumeResult<HashMap<VolumeId, u64>> {
    let response: QueryResponse = serde_json::from_slice(body)
        .map_err(|e| VolumeError::Metrics(format!("malformed query response: {e}")))?;

    if response.status != "success" {
        return Err(VolumeError::Metrics(format!(
            "query failed ({}): {}",
            response.error_type.as_deref().unwrap_or("unknown"),
            response.error.as_deref().unwrap_or("no error message"),
        )));
    }
    for warning in &response.warnings {
        warn!(%warning, "prometheus query warning");
    }

    let data = response
        .data
        .ok_or_else(|| VolumeError::Metrics("query response has no data".to_string()))?;
    if data.result_type != "vector" {
        return Err(VolumeError::Metrics(format!(
            "unexpected result type {}",
            data.result_type
        )));
    }

    let mut values = HashMap::with_capacity(data.result.len());
    for entry in data.result {
        let (Some(namespace), Some(name)) = (
            entry.metric.get(NAMESPACE_LABEL),
            entry.metric.get(CLAIM_LABEL),
        ) else {
            continue;
        };
        let Ok(value) = entry.value.1.parse::<f64>() else {
            continue;
        };
        if !value.is_finite() || value < 0.0 {
            continue;
        }
        values.insert(VolumeId::new(namespace.as_str(), name.as_str()), value as u64);
    }
    Ok(values)
}

/// Join used and capacity series. Volumes missing either are dropped.
pub fn merge_samples(
    used: HashMap<VolumeId, u64>,
    mut capacity: HashMap<VolumeId, u64>,
) -> UsageSamples {
    used.into_iter()
        .filter_map(|(id, used_bytes)| {
            let capacity_bytes = capacity.remove(&id)?;
            Some((
                id,
                UsageSample {
                    used_bytes,
                    capacity_bytes,
                },
            ))
        })
        .collect()
}

/// Percent-encode a query string value.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// `UsageSource` backed by a Prometheus HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusUsageSource {
    /// `host:port` to connect to.
    address: String,
    /// Host header value.
    host: String,
    /// Path prefix without trailing slash (e.g. `/prometheus`).
    path_prefix: String,
    timeout: Duration,
}

impl PrometheusUsageSource {
    /// Build a client for `url` (`http://host[:port][/prefix]`).
    pub fn new(url: &str, timeout: Duration) -> VolumeResult<Self> {
        let invalid = |reason: &str| VolumeError::Metrics(format!("invalid metrics url {url:?}: {reason}"));

        let uri: http::Uri = url.trim().parse().map_err(|_| invalid("not a URI"))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme {other}"))),
            None => return Err(invalid("missing scheme")),
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let port = authority.port_u16().unwrap_or(80);

        Ok(Self {
            address: format!("{}:{port}", authority.host()),
            host: authority.as_str().to_string(),
            path_prefix: uri.path().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn query_path(&self, query: &str) -> String {
        format!(
            "{}/api/v1/query?query={}",
            self.path_prefix,
            encode_query_value(query)
        )
    }

    /// Run one instant query and return the raw response body.
    async fn get(&self, query: &str) -> VolumeResult<bytes::Bytes> {
        let path = self.query_path(query);
        let request = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| VolumeError::Metrics(format!("connect {}: {e}", self.address)))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| VolumeError::Metrics(format!("handshake: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method("GET")
                .uri(&path)
                .header("host", &self.host)
                .header("accept", "application/json")
                .header("user-agent", "warpgrid-volmetrics/0.1")
                .body(http_body_util::Empty::<bytes::Bytes>::new())
                .map_err(|e| VolumeError::Metrics(format!("build request: {e}")))?;

            let response = sender
                .send_request(req)
                .await
                .map_err(|e| VolumeError::Metrics(format!("request {path}: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| VolumeError::Metrics(format!("read body: {e}")))?
                .to_bytes();

            // Prometheus reports query errors as JSON with 4xx/5xx; let
            // the parser surface the message when there is one.
            if !status.is_success() && body.is_empty() {
                return Err(VolumeError::Metrics(format!("{path} returned {status}")));
            }
            Ok::<_, VolumeError>(body)
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| VolumeError::Metrics(format!("query {query} timed out")))?
    }

    async fn query_vector(&self, query: &str) -> VolumeResult<HashMap<VolumeId, u64>> {
        let body = self.get(query).await?;
        let values = parse_vector(&body)?;
        debug!(query, series = values.len(), "prometheus query complete");
        Ok(values)
    }
}

#[async_trait]
impl UsageSource for PrometheusUsageSource {
    async fn fetch_usage_samples(&self) -> VolumeResult<UsageSamples> {
        let used = self.query_vector(USED_BYTES_QUERY).await?;
        let capacity = self.query_vector(CAPACITY_BYTES_QUERY).await?;
        Ok(merge_samples(used, capacity))
    }
}
