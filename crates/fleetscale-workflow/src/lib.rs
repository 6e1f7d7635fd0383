//! fleetscale-workflow — workflow-engine execution-count collector.
//!
//! Reports the number of currently running workflow executions in a
//! namespace, optionally narrowed by a visibility query. Useful for
//! scaling workers to the live workload, e.g.
//! `min_started = "ceil(running_workflows / 10)"`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use fleetscale_core::{expand_metric_query, MetricCollector};

const COUNT_TIMEOUT: Duration = Duration::from_secs(15);

/// Metric collector backed by a workflow engine's count endpoint.
pub struct WorkflowCountCollector {
    name: String,
    address: String,
    namespace: String,
    query: String,
    token: String,
    http: reqwest::Client,
}

impl WorkflowCountCollector {
    pub fn new(
        name: &str,
        address: &str,
        namespace: &str,
        query: &str,
        token: &str,
    ) -> Result<Self> {
        if address.is_empty() {
            bail!("workflow engine address required");
        }
        if namespace.is_empty() {
            bail!("workflow engine namespace required");
        }

        let http = reqwest::Client::builder()
            .timeout(COUNT_TIMEOUT)
            .build()
            .context("build workflow http client")?;

        Ok(Self {
            name: name.to_string(),
            address: address.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            query: query.to_string(),
            token: token.to_string(),
            http,
        })
    }
}

#[async_trait]
impl MetricCollector for WorkflowCountCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, app_name: &str) -> Result<f64> {
        let filter = count_filter(&expand_metric_query(&self.query, app_name));
        let url = format!(
            "{}/api/v1/namespaces/{}/workflow-count",
            self.address, self.namespace
        );

        let mut req = self.http.get(&url).query(&[("query", filter.as_str())]);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }

        let resp = req.send().await.context("workflow count request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("workflow engine returned {status}");
        }

        let body: CountResponse = resp.json().await.context("decode workflow count")?;
        Ok(body.count as f64)
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Build the visibility filter: always restricted to running
/// executions, AND-combined with the user query when one is set.
fn count_filter(query: &str) -> String {
    let base = r#"ExecutionStatus="Running""#;
    if query.is_empty() {
        base.to_string()
    } else {
        format!("{base} AND ({query})")
    }
}
