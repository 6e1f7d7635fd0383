//! Daemon configuration.
//!
//! Settings come from a TOML file (with `${VAR}` environment expansion
//! applied to the raw contents) layered over `FS_*` environment
//! variables: a value present in the file wins, env fills the gaps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use fleetscale_core::{
    BoundExpressions, FleetApiFactory, MachineState, MetricCollector, PlatformApi,
    DEFAULT_PROCESS_GROUP,
};
use fleetscale_prometheus::PrometheusCollector;
use fleetscale_workflow::WorkflowCountCollector;

const DEFAULT_API_ADDRESS: &str = "https://api.fleetscale.io";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    /// App to scale; `*` wildcards select multiple apps in one org.
    pub app_name: String,
    /// Organization slug, required when the app name has a wildcard.
    pub org: String,
    /// Regions for created machines, round-robined.
    pub regions: Vec<String>,
    pub process_group: String,

    /// Shorthand setting both min and max created counts.
    pub created_machine_count: String,
    pub min_created_machine_count: String,
    pub max_created_machine_count: String,
    /// `started` or `stopped`.
    pub initial_machine_state: String,

    /// Shorthand setting both min and max started counts.
    pub started_machine_count: String,
    pub min_started_machine_count: String,
    pub max_started_machine_count: String,

    pub concurrency: usize,
    pub interval: String,
    pub timeout: String,
    pub app_list_refresh_interval: String,

    pub api_address: String,
    pub api_token: String,
    pub metrics_addr: String,
    pub verbose: bool,

    pub metric_collectors: Vec<MetricCollectorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            org: String::new(),
            regions: Vec::new(),
            process_group: DEFAULT_PROCESS_GROUP.to_string(),
            created_machine_count: String::new(),
            min_created_machine_count: String::new(),
            max_created_machine_count: String::new(),
            initial_machine_state: "started".to_string(),
            started_machine_count: String::new(),
            min_started_machine_count: String::new(),
            max_started_machine_count: String::new(),
            concurrency: fleetscale_core::DEFAULT_CONCURRENCY,
            interval: "15s".to_string(),
            timeout: "30s".to_string(),
            app_list_refresh_interval: "60s".to_string(),
            api_address: DEFAULT_API_ADDRESS.to_string(),
            api_token: String::new(),
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            verbose: false,
            metric_collectors: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, filling gaps from
    /// `FS_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                let expanded = expand_env_with(&raw, |name| std::env::var(name).ok());
                toml::from_str(&expanded)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Fill unset fields from environment variables.
    fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        fill_string(&mut self.app_name, "", get("FS_APP_NAME"));
        fill_string(&mut self.org, "", get("FS_ORG"));
        fill_string(&mut self.process_group, DEFAULT_PROCESS_GROUP, get("FS_PROCESS_GROUP"));
        fill_string(&mut self.created_machine_count, "", get("FS_CREATED_MACHINE_COUNT"));
        fill_string(
            &mut self.min_created_machine_count,
            "",
            get("FS_MIN_CREATED_MACHINE_COUNT"),
        );
        fill_string(
            &mut self.max_created_machine_count,
            "",
            get("FS_MAX_CREATED_MACHINE_COUNT"),
        );
        fill_string(&mut self.started_machine_count, "", get("FS_STARTED_MACHINE_COUNT"));
        fill_string(
            &mut self.min_started_machine_count,
            "",
            get("FS_MIN_STARTED_MACHINE_COUNT"),
        );
        fill_string(
            &mut self.max_started_machine_count,
            "",
            get("FS_MAX_STARTED_MACHINE_COUNT"),
        );
        fill_string(&mut self.api_token, "", get("FS_API_TOKEN"));
        fill_string(&mut self.api_address, DEFAULT_API_ADDRESS, get("FS_API_ADDRESS"));
        fill_string(&mut self.metrics_addr, DEFAULT_METRICS_ADDR, get("FS_METRICS_ADDR"));

        if let Some(state) = get("FS_INITIAL_MACHINE_STATE") {
            if self.initial_machine_state == "started" {
                self.initial_machine_state = state;
            }
        }

        if self.regions.is_empty() {
            if let Some(regions) = get("FS_REGIONS") {
                self.regions = regions
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect();
            }
        }

        if self.concurrency == fleetscale_core::DEFAULT_CONCURRENCY {
            if let Some(concurrency) = get("FS_CONCURRENCY") {
                self.concurrency = concurrency
                    .parse()
                    .with_context(|| format!("cannot parse FS_CONCURRENCY as integer: {concurrency:?}"))?;
            }
        }

        fill_string(&mut self.interval, "15s", get("FS_INTERVAL"));
        fill_string(&mut self.timeout, "30s", get("FS_TIMEOUT"));
        fill_string(
            &mut self.app_list_refresh_interval,
            "60s",
            get("FS_APP_LIST_REFRESH_INTERVAL"),
        );

        if self.metric_collectors.is_empty() {
            if let Some(address) = get("FS_PROMETHEUS_ADDRESS") {
                self.metric_collectors.push(MetricCollectorConfig {
                    kind: "prometheus".to_string(),
                    metric_name: get("FS_PROMETHEUS_METRIC_NAME").unwrap_or_default(),
                    query: get("FS_PROMETHEUS_QUERY").unwrap_or_default(),
                    address,
                    token: get("FS_PROMETHEUS_TOKEN").unwrap_or_default(),
                    namespace: String::new(),
                });
            }
            if let Some(address) = get("FS_WORKFLOW_ADDRESS") {
                self.metric_collectors.push(MetricCollectorConfig {
                    kind: "workflow".to_string(),
                    metric_name: get("FS_WORKFLOW_METRIC_NAME").unwrap_or_default(),
                    query: get("FS_WORKFLOW_QUERY").unwrap_or_default(),
                    address,
                    token: get("FS_WORKFLOW_TOKEN").unwrap_or_default(),
                    namespace: get("FS_WORKFLOW_NAMESPACE").unwrap_or_default(),
                });
            }
        }

        Ok(())
    }

    // ── Bound shorthands ───────────────────────────────────────────

    pub fn is_created_count_defined(&self) -> bool {
        !self.created_machine_count.is_empty()
            || !self.min_created_machine_count.is_empty()
            || !self.max_created_machine_count.is_empty()
    }

    pub fn is_started_count_defined(&self) -> bool {
        !self.started_machine_count.is_empty()
            || !self.min_started_machine_count.is_empty()
            || !self.max_started_machine_count.is_empty()
    }

    pub fn min_created_expr(&self) -> &str {
        if !self.created_machine_count.is_empty() {
            &self.created_machine_count
        } else {
            &self.min_created_machine_count
        }
    }

    pub fn max_created_expr(&self) -> &str {
        if !self.created_machine_count.is_empty() {
            &self.created_machine_count
        } else {
            &self.max_created_machine_count
        }
    }

    pub fn min_started_expr(&self) -> &str {
        if !self.started_machine_count.is_empty() {
            &self.started_machine_count
        } else {
            &self.min_started_machine_count
        }
    }

    pub fn max_started_expr(&self) -> &str {
        if !self.started_machine_count.is_empty() {
            &self.started_machine_count
        } else {
            &self.max_started_machine_count
        }
    }

    pub fn bounds(&self) -> BoundExpressions {
        BoundExpressions {
            min_created: self.min_created_expr().to_string(),
            max_created: self.max_created_expr().to_string(),
            min_started: self.min_started_expr().to_string(),
            max_started: self.max_started_expr().to_string(),
        }
    }

    pub fn initial_state(&self) -> MachineState {
        MachineState::from(self.initial_machine_state.clone())
    }

    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.interval).context("parse interval")
    }

    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.timeout).context("parse timeout")
    }

    pub fn app_list_refresh_interval(&self) -> Result<Duration> {
        parse_duration(&self.app_list_refresh_interval).context("parse app-list-refresh-interval")
    }

    // ── Validation ─────────────────────────────────────────────────

    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            bail!("app name required");
        }

        if !self.is_created_count_defined() && !self.is_started_count_defined() {
            bail!("must define either created machine count or started machine count");
        }
        self.validate_created_count()?;
        self.validate_started_count()?;

        if !matches!(self.initial_machine_state.as_str(), "started" | "stopped") {
            bail!("initial machine state must be either 'started' or 'stopped'");
        }

        self.interval()?;
        self.timeout()?;
        self.app_list_refresh_interval()?;

        for (i, collector) in self.metric_collectors.iter().enumerate() {
            collector
                .validate()
                .with_context(|| format!("metric-collectors[{i}]"))?;
        }
        Ok(())
    }

    fn validate_created_count(&self) -> Result<()> {
        if !self.is_created_count_defined() {
            return Ok(());
        }
        if !self.created_machine_count.is_empty()
            && (!self.min_created_machine_count.is_empty()
                || !self.max_created_machine_count.is_empty())
        {
            bail!("cannot define created machine count and min/max created machine count");
        }
        if !self.min_created_machine_count.is_empty() && self.max_created_machine_count.is_empty() {
            bail!("max created machine count required if min created machine count is defined");
        }
        if self.min_created_machine_count.is_empty() && !self.max_created_machine_count.is_empty() {
            bail!("min created machine count required if max created machine count is defined");
        }
        Ok(())
    }

    fn validate_started_count(&self) -> Result<()> {
        if !self.is_started_count_defined() {
            return Ok(());
        }
        if !self.started_machine_count.is_empty()
            && (!self.min_started_machine_count.is_empty()
                || !self.max_started_machine_count.is_empty())
        {
            bail!("cannot define started machine count and min/max started machine count");
        }
        if !self.min_started_machine_count.is_empty() && self.max_started_machine_count.is_empty() {
            bail!("max started machine count required if min started machine count is defined");
        }
        if self.min_started_machine_count.is_empty() && !self.max_started_machine_count.is_empty() {
            bail!("min started machine count required if max started machine count is defined");
        }
        Ok(())
    }

    // ── Client constructors ────────────────────────────────────────

    pub fn new_platform_client(&self) -> Result<Arc<dyn PlatformApi>> {
        let client = fleetscale_api::PlatformHttpClient::new(&self.api_address, &self.api_token)?;
        Ok(Arc::new(client))
    }

    pub fn new_fleet_api_factory(&self) -> Result<FleetApiFactory> {
        if self.api_token.is_empty() {
            bail!("api token required");
        }
        Ok(fleetscale_api::http_fleet_api_factory(
            &self.api_address,
            &self.api_token,
        ))
    }

    pub fn new_metric_collectors(&self) -> Result<Vec<Arc<dyn MetricCollector>>> {
        let mut collectors: Vec<Arc<dyn MetricCollector>> = Vec::new();
        for (i, config) in self.metric_collectors.iter().enumerate() {
            collectors.push(
                config
                    .new_metric_collector()
                    .with_context(|| format!("metric collector[{i}]"))?,
            );
        }
        Ok(collectors)
    }
}

/// One metric source feeding the bound expressions.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct MetricCollectorConfig {
    /// `prometheus` or `workflow`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Metric key the collector publishes into expressions.
    pub metric_name: String,
    pub query: String,
    pub address: String,
    pub token: String,
    /// Workflow engine namespace.
    pub namespace: String,
}

impl MetricCollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.metric_name.is_empty() {
            bail!("metric name required");
        }
        match self.kind.as_str() {
            "prometheus" => {
                if self.address.is_empty() {
                    bail!("prometheus address required");
                }
                if self.query.is_empty() {
                    bail!("prometheus query required");
                }
                Ok(())
            }
            "workflow" => {
                if self.address.is_empty() {
                    bail!("workflow engine address required");
                }
                if self.namespace.is_empty() {
                    bail!("workflow engine namespace required");
                }
                Ok(())
            }
            "" => bail!("type required"),
            kind => bail!("invalid type: {kind:?}"),
        }
    }

    pub fn new_metric_collector(&self) -> Result<Arc<dyn MetricCollector>> {
        match self.kind.as_str() {
            "prometheus" => Ok(Arc::new(PrometheusCollector::new(
                &self.metric_name,
                &self.address,
                &self.query,
                &self.token,
            )?)),
            "workflow" => Ok(Arc::new(WorkflowCountCollector::new(
                &self.metric_name,
                &self.address,
                &self.namespace,
                &self.query,
                &self.token,
            )?)),
            kind => bail!("invalid type: {kind:?}"),
        }
    }
}

fn fill_string(field: &mut String, default: &str, value: Option<String>) {
    if field == default {
        if let Some(value) = value {
            *field = value;
        }
    }
}

/// Expand `${VAR}` / `$VAR` in raw config contents. Unset variables
/// expand to the empty string.
fn expand_env_with(raw: &str, get: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        if let Some(&'{') = chars.peek() {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = get(&name) {
            out.push_str(&value);
        }
    }

    out
}

/// Parse a duration string like "500ms", "15s", "2m", "1h".
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse_u64(ms, s)?));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(parse_u64(secs, s)?));
    }
    if let Some(mins) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(parse_u64(mins, s)? * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return Ok(Duration::from_secs(parse_u64(hours, s)? * 3600));
    }
    Ok(Duration::from_secs(parse_u64(s, s)?))
}

fn parse_u64(digits: &str, original: &str) -> Result<u64> {
    digits
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid duration: {original:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse(raw: &str) -> Config {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.interval().unwrap(), Duration::from_secs(15));
        assert_eq!(config.timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(
            config.app_list_refresh_interval().unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(config.process_group, "app");
        assert_eq!(config.initial_machine_state, "started");
    }

    #[test]
    fn parse_full_file() {
        let config = parse(
            r#"
app-name = "my-app-*"
org = "myorg"
regions = ["fra", "ord"]
started-machine-count = "ceil(queue_depth / 10)"
min-created-machine-count = "1"
max-created-machine-count = "10"
concurrency = 4
interval = "30s"

[[metric-collectors]]
type = "prometheus"
metric-name = "queue_depth"
address = "http://prom:9090"
query = 'sum(queue_depth{app="$APP_NAME"})'
"#,
        );

        assert_eq!(config.app_name, "my-app-*");
        assert_eq!(config.regions, vec!["fra", "ord"]);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.metric_collectors.len(), 1);
        config.validate().unwrap();

        let bounds = config.bounds();
        assert_eq!(bounds.min_started, "ceil(queue_depth / 10)");
        assert_eq!(bounds.max_started, "ceil(queue_depth / 10)");
        assert_eq!(bounds.min_created, "1");
        assert_eq!(bounds.max_created, "10");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = toml::from_str(r#"app-nome = "typo""#);
        assert!(result.is_err());
    }

    #[test]
    fn env_expansion_in_file_contents() {
        let get = |name: &str| match name {
            "SCALE_TARGET" => Some("5".to_string()),
            _ => None,
        };
        let expanded = expand_env_with(
            r#"started-machine-count = "${SCALE_TARGET}" # $UNSET_VAR"#,
            get,
        );
        assert_eq!(expanded, r#"started-machine-count = "5" # "#);
    }

    #[test]
    fn env_fills_unset_fields() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FS_APP_NAME", "env-app"),
            ("FS_REGIONS", "fra, ord"),
            ("FS_CONCURRENCY", "8"),
            ("FS_STARTED_MACHINE_COUNT", "2"),
            ("FS_API_TOKEN", "secret"),
        ]);
        let get = |name: &str| env.get(name).map(|v| v.to_string());

        let mut config = Config::default();
        config.apply_env_with(get).unwrap();

        assert_eq!(config.app_name, "env-app");
        assert_eq!(config.regions, vec!["fra", "ord"]);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.started_machine_count, "2");
        config.validate().unwrap();
    }

    #[test]
    fn file_values_win_over_env() {
        let mut config = parse(r#"app-name = "file-app""#);
        config
            .apply_env_with(|name| match name {
                "FS_APP_NAME" => Some("env-app".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.app_name, "file-app");
    }

    #[test]
    fn env_builds_prometheus_collector() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FS_PROMETHEUS_ADDRESS", "http://prom:9090"),
            ("FS_PROMETHEUS_METRIC_NAME", "load"),
            ("FS_PROMETHEUS_QUERY", "sum(load)"),
        ]);
        let mut config = Config::default();
        config
            .apply_env_with(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.metric_collectors.len(), 1);
        assert_eq!(config.metric_collectors[0].kind, "prometheus");
        config.metric_collectors[0].validate().unwrap();
    }

    #[test]
    fn bad_concurrency_env_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(|name| match name {
                "FS_CONCURRENCY" => Some("many".to_string()),
                _ => None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("FS_CONCURRENCY"));
    }

    #[test]
    fn validate_requires_app_name() {
        let mut config = Config::default();
        config.started_machine_count = "1".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("app name"));
    }

    #[test]
    fn validate_requires_some_bound() {
        let mut config = Config::default();
        config.app_name = "a".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must define either"));
    }

    #[test]
    fn validate_rejects_shorthand_and_min_max() {
        let mut config = Config::default();
        config.app_name = "a".to_string();
        config.started_machine_count = "1".to_string();
        config.min_started_machine_count = "1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_min_max_pairing() {
        let mut config = Config::default();
        config.app_name = "a".to_string();
        config.min_started_machine_count = "1".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app_name = "a".to_string();
        config.max_created_machine_count = "5".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_initial_state() {
        let mut config = Config::default();
        config.app_name = "a".to_string();
        config.started_machine_count = "1".to_string();
        config.initial_machine_state = "paused".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn collector_validation() {
        let mut c = MetricCollectorConfig::default();
        assert!(c.validate().is_err()); // no metric name

        c.metric_name = "load".to_string();
        assert!(c.validate().is_err()); // no type

        c.kind = "prometheus".to_string();
        assert!(c.validate().is_err()); // no address

        c.address = "http://prom:9090".to_string();
        assert!(c.validate().is_err()); // no query

        c.query = "sum(load)".to_string();
        c.validate().unwrap();

        c.kind = "nope".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn shorthand_counts_expand_to_both_bounds() {
        let mut config = Config::default();
        config.created_machine_count = "3".to_string();
        assert_eq!(config.min_created_expr(), "3");
        assert_eq!(config.max_created_expr(), "3");

        let mut config = Config::default();
        config.min_started_machine_count = "1".to_string();
        config.max_started_machine_count = "5".to_string();
        assert_eq!(config.min_started_expr(), "1");
        assert_eq!(config.max_started_expr(), "5");
    }

    #[test]
    fn no_env_leaves_defaults() {
        let mut config = Config::default();
        config.apply_env_with(no_env).unwrap();
        assert_eq!(config, Config::default());
    }
}
