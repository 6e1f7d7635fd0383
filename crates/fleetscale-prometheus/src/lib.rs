//! fleetscale-prometheus — PromQL metric collector.
//!
//! Runs an instant query against a Prometheus-compatible HTTP API and
//! returns the first sample of the result vector. The query may
//! reference the current app via `$APP_NAME` / `${APP_NAME}`.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use fleetscale_core::{expand_metric_query, MetricCollector};

const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Metric collector backed by a Prometheus instant query.
pub struct PrometheusCollector {
    name: String,
    address: String,
    query: String,
    token: String,
    http: reqwest::Client,
}

impl PrometheusCollector {
    /// `address` is the server base URL; `token`, when non-empty, is
    /// sent as a bearer token.
    pub fn new(name: &str, address: &str, query: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .context("build prometheus http client")?;

        Ok(Self {
            name: name.to_string(),
            address: address.trim_end_matches('/').to_string(),
            query: query.to_string(),
            token: token.to_string(),
            http,
        })
    }
}

#[async_trait]
impl MetricCollector for PrometheusCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, app_name: &str) -> Result<f64> {
        let query = expand_metric_query(&self.query, app_name);
        let url = format!("{}/api/v1/query", self.address);

        let mut req = self.http.get(&url).query(&[("query", query.as_str())]);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }

        let resp = req.send().await.context("prometheus query request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("prometheus returned {status}");
        }

        let body: QueryResponse = resp.json().await.context("decode prometheus response")?;
        if !body.warnings.is_empty() {
            warn!(warnings = ?body.warnings, metric = %self.name, "prometheus query warnings");
        }
        extract_value(&body)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    warnings: Vec<String>,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

/// Pull the float out of an instant-query response.
///
/// Only vector results are accepted; an empty vector is an error so a
/// mistyped query can never silently read as zero.
fn extract_value(resp: &QueryResponse) -> Result<f64> {
    if resp.status != "success" {
        bail!("prometheus query failed: status {:?}", resp.status);
    }

    match resp.data.result_type.as_str() {
        "vector" => {
            let samples = resp
                .data
                .result
                .as_array()
                .ok_or_else(|| anyhow!("malformed prometheus result"))?;
            let first = samples
                .first()
                .ok_or_else(|| anyhow!("empty prometheus result"))?;
            let value = first
                .get("value")
                .and_then(|v| v.get(1))
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("malformed prometheus sample"))?;
            value
                .parse::<f64>()
                .with_context(|| format!("cannot parse prometheus result as float: {value:?}"))
        }
        other => bail!("unexpected prometheus result type: {other:?}"),
    }
}
