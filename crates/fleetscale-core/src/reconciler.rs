//! Per-app reconciliation.
//!
//! One tick: clear and re-collect the metric environment, evaluate the
//! four bound expressions, snapshot the app's machines, and issue at
//! most one bulk action — create, destroy, start, or stop, in that
//! priority order. The engine never waits for machines to settle;
//! effects are observed on the next tick.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::client::FleetApi;
use crate::collector::MetricCollector;
use crate::error::{ExprError, ReconcileError};
use crate::expr;
use crate::machine::{DestroyRequest, LaunchRequest, Machine, MachineState, StopRequest};
use crate::stats::ReconcilerStats;

/// Default process group stamped into cloned machine configs.
pub const DEFAULT_PROCESS_GROUP: &str = "app";

/// The four bound expressions controlling a fleet.
///
/// An empty string means the bound is inactive.
#[derive(Debug, Clone, Default)]
pub struct BoundExpressions {
    pub min_created: String,
    pub max_created: String,
    pub min_started: String,
    pub max_started: String,
}

/// Executes reconciliation ticks for one app at a time.
///
/// A reconciler is built once per pool worker and rebound to a new app
/// for each work item; its metric environment is rebuilt from scratch
/// every tick so values never leak between apps.
pub struct Reconciler {
    app_name: String,
    client: Option<Arc<dyn FleetApi>>,
    metrics: HashMap<String, f64>,
    stats: Arc<ReconcilerStats>,
    region_cursor: u64,

    pub bounds: BoundExpressions,
    pub collectors: Vec<Arc<dyn MetricCollector>>,
    /// Regions for newly created machines, round-robined. Empty means
    /// "reuse the template's region".
    pub regions: Vec<String>,
    /// State newly created machines should come up in.
    pub initial_state: MachineState,
    pub process_group: String,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            app_name: String::new(),
            client: None,
            metrics: HashMap::new(),
            stats: Arc::new(ReconcilerStats::new()),
            region_cursor: 0,
            bounds: BoundExpressions::default(),
            collectors: Vec::new(),
            regions: Vec::new(),
            initial_state: MachineState::Started,
            process_group: DEFAULT_PROCESS_GROUP.to_string(),
        }
    }

    /// Rebind this reconciler to an app and its API client.
    pub fn bind(&mut self, app_name: impl Into<String>, client: Arc<dyn FleetApi>) {
        self.app_name = app_name.into();
        self.client = Some(client);
    }

    /// Set the app name without a client (one-shot evaluation).
    pub fn set_app_name(&mut self, app_name: impl Into<String>) {
        self.app_name = app_name.into();
    }

    /// Share a stats aggregate across reconcilers (set by the pool).
    pub fn set_stats(&mut self, stats: Arc<ReconcilerStats>) {
        self.stats = stats;
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Value of a named metric, if collected.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Set a named metric directly (tests and one-shot evaluation).
    pub fn set_value(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    /// Rebuild the metric environment from all collectors.
    ///
    /// The environment is cleared first; a collector failure aborts the
    /// tick with whatever was already collected discarded on the next
    /// call.
    pub async fn collect_metrics(&mut self) -> Result<(), ReconcileError> {
        self.metrics.clear();
        for collector in &self.collectors {
            let value = collector.collect(&self.app_name).await.map_err(|source| {
                ReconcileError::Collect {
                    name: collector.name().to_string(),
                    source,
                }
            })?;
            self.metrics.insert(collector.name().to_string(), value);
        }
        Ok(())
    }

    pub fn calc_min_created(&self) -> Result<Option<u64>, ExprError> {
        expr::eval_created_bound(&self.bounds.min_created, &self.metrics)
    }

    pub fn calc_max_created(&self) -> Result<Option<u64>, ExprError> {
        expr::eval_created_bound(&self.bounds.max_created, &self.metrics)
    }

    pub fn calc_min_started(&self) -> Result<Option<u64>, ExprError> {
        expr::eval_bound(&self.bounds.min_started, &self.metrics)
    }

    pub fn calc_max_started(&self) -> Result<Option<u64>, ExprError> {
        expr::eval_bound(&self.bounds.max_started, &self.metrics)
    }

    /// Run one reconciliation tick against the bound app.
    pub async fn reconcile(&mut self) -> Result<(), ReconcileError> {
        let client = self.client.clone().ok_or(ReconcileError::NotBound)?;

        let min_created = self.calc_min_created().map_err(bound_err("min created"))?;
        let max_created = self.calc_max_created().map_err(bound_err("max created"))?;
        let min_started = self.calc_min_started().map_err(bound_err("min started"))?;
        let max_started = self.calc_max_started().map_err(bound_err("max started"))?;

        let machines = client
            .list()
            .await
            .map_err(|source| ReconcileError::List { source })?;
        let total = machines.len();
        let observed = Observed::partition(machines);
        let reachable_n = observed.reachable_count();
        let started_n = observed.started.len() as u64;

        info!(
            app = %self.app_name,
            started = observed.started.len(),
            stopped = observed.stopped.len(),
            created = observed.created.len(),
            unreachable = total - reachable_n as usize,
            min_created = ?min_created,
            max_created = ?max_created,
            min_started = ?min_started,
            max_started = ?max_started,
            "reconciling"
        );

        if let Some(min) = min_created {
            if reachable_n < min {
                return self
                    .bulk_create(&client, observed, min - reachable_n)
                    .await;
            }
        }
        if let Some(max) = max_created {
            if reachable_n > max {
                return self
                    .bulk_destroy(&client, observed, reachable_n - max)
                    .await;
            }
        }
        if let Some(min) = min_started {
            if started_n < min {
                return self
                    .bulk_start(&client, observed.stopped, min - started_n)
                    .await;
            }
        }
        if let Some(max) = max_started {
            if started_n > max {
                return self
                    .bulk_stop(&client, observed.started, started_n - max)
                    .await;
            }
        }

        self.stats.no_scale.fetch_add(1, Ordering::Relaxed);
        debug!(app = %self.app_name, "fleet within bounds, no scaling");
        Ok(())
    }

    /// Create `n` machines cloned from an existing reachable machine.
    ///
    /// The first launch failure aborts the remainder of the bulk; create
    /// is the one action where over-shooting is impossible and
    /// under-shooting is recovered next tick.
    async fn bulk_create(
        &mut self,
        client: &Arc<dyn FleetApi>,
        observed: Observed,
        n: u64,
    ) -> Result<(), ReconcileError> {
        let template = observed
            .template()
            .cloned()
            .ok_or(ReconcileError::NoTemplateMachine)?;
        self.stats.bulk_create.fetch_add(1, Ordering::Relaxed);

        info!(app = %self.app_name, n, template = %template.id, "begin machine create");

        let mut created = 0u64;
        for _ in 0..n {
            let region = self.next_region(&template);
            let mut config = template.config.clone();
            if !self.process_group.is_empty() {
                config
                    .metadata
                    .insert("process_group".to_string(), self.process_group.clone());
            }
            let req = LaunchRequest {
                config,
                region: region.clone(),
                skip_launch: self.initial_state == MachineState::Stopped,
            };

            match client.launch(req).await {
                Ok(machine) => {
                    self.stats.machine_created.fetch_add(1, Ordering::Relaxed);
                    info!(app = %self.app_name, id = %machine.id, %region, "machine created");
                    created += 1;
                }
                Err(err) => {
                    self.stats
                        .machine_create_failed
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        app = %self.app_name,
                        %region,
                        error = %err,
                        "cannot create machine, aborting bulk create"
                    );
                    break;
                }
            }
        }

        info!(app = %self.app_name, n = created, "machine create completed");
        Ok(())
    }

    /// Destroy `n` machines, preferring already-idle ones.
    ///
    /// A failed destroy still counts against `n` so a persistent API
    /// failure can never kill more machines than requested.
    async fn bulk_destroy(
        &mut self,
        client: &Arc<dyn FleetApi>,
        observed: Observed,
        n: u64,
    ) -> Result<(), ReconcileError> {
        self.stats.bulk_destroy.fetch_add(1, Ordering::Relaxed);

        info!(app = %self.app_name, n, "begin machine destroy");

        let mut candidates = observed.stopped;
        candidates.extend(observed.created);
        candidates.extend(observed.started);

        let mut destroyed = 0u64;
        for machine in candidates.into_iter().take(n as usize) {
            let req = DestroyRequest {
                id: machine.id.clone(),
                kill: true,
            };
            match client.destroy(req).await {
                Ok(()) => {
                    self.stats.machine_destroyed.fetch_add(1, Ordering::Relaxed);
                    info!(app = %self.app_name, id = %machine.id, "machine destroyed");
                    destroyed += 1;
                }
                Err(err) => {
                    self.stats
                        .machine_destroy_failed
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        app = %self.app_name,
                        id = %machine.id,
                        error = %err,
                        "cannot destroy machine, counting as progress"
                    );
                }
            }
        }

        info!(app = %self.app_name, n = destroyed, "machine destroy completed");
        Ok(())
    }

    /// Start `n` machines from the stopped set, in id order.
    ///
    /// A failed start does not count against `n`: the next candidate is
    /// tried within the same tick. Losing one start is cheap.
    async fn bulk_start(
        &mut self,
        client: &Arc<dyn FleetApi>,
        mut stopped: Vec<Machine>,
        n: u64,
    ) -> Result<(), ReconcileError> {
        self.stats.bulk_start.fetch_add(1, Ordering::Relaxed);

        info!(app = %self.app_name, n, "begin machine start");

        if (stopped.len() as u64) < n {
            warn!(
                app = %self.app_name,
                "not enough stopped machines available to reach target, please create more machines"
            );
        }

        stopped.sort_by(|a, b| a.id.cmp(&b.id));

        let mut remaining = n;
        for machine in &stopped {
            if remaining == 0 {
                break;
            }
            match client.start(&machine.id).await {
                Ok(_) => {
                    self.stats.machine_started.fetch_add(1, Ordering::Relaxed);
                    info!(app = %self.app_name, id = %machine.id, "machine started");
                    remaining -= 1;
                }
                Err(err) => {
                    self.stats
                        .machine_start_failed
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        app = %self.app_name,
                        id = %machine.id,
                        error = %err,
                        "cannot start machine, skipping"
                    );
                }
            }
        }

        info!(app = %self.app_name, n = n - remaining, "machine start completed");
        Ok(())
    }

    /// Stop `n` machines from the started set, in id order.
    async fn bulk_stop(
        &mut self,
        client: &Arc<dyn FleetApi>,
        mut started: Vec<Machine>,
        n: u64,
    ) -> Result<(), ReconcileError> {
        self.stats.bulk_stop.fetch_add(1, Ordering::Relaxed);

        info!(app = %self.app_name, n, "begin machine stop");

        started.sort_by(|a, b| a.id.cmp(&b.id));

        let mut remaining = n;
        for machine in &started {
            if remaining == 0 {
                break;
            }
            let req = StopRequest {
                id: machine.id.clone(),
            };
            match client.stop(req).await {
                Ok(()) => {
                    self.stats.machine_stopped.fetch_add(1, Ordering::Relaxed);
                    info!(app = %self.app_name, id = %machine.id, "machine stopped");
                    remaining -= 1;
                }
                Err(err) => {
                    self.stats
                        .machine_stop_failed
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        app = %self.app_name,
                        id = %machine.id,
                        error = %err,
                        "cannot stop machine, skipping"
                    );
                }
            }
        }

        info!(app = %self.app_name, n = n - remaining, "machine stop completed");
        Ok(())
    }

    fn next_region(&mut self, template: &Machine) -> String {
        if self.regions.is_empty() {
            return template.region.clone();
        }
        let index = (self.region_cursor % self.regions.len() as u64) as usize;
        self.region_cursor += 1;
        self.regions[index].clone()
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn bound_err(bound: &'static str) -> impl FnOnce(ExprError) -> ReconcileError {
    move |source| ReconcileError::Bound { bound, source }
}

/// Reachable machines partitioned by state.
#[derive(Debug, Default)]
struct Observed {
    created: Vec<Machine>,
    started: Vec<Machine>,
    stopped: Vec<Machine>,
    other: Vec<Machine>,
}

impl Observed {
    /// Drop unreachable machines and bucket the rest by state.
    fn partition(machines: Vec<Machine>) -> Self {
        let mut observed = Observed::default();
        for machine in machines {
            if !machine.is_reachable() {
                continue;
            }
            match machine.state {
                MachineState::Created => observed.created.push(machine),
                MachineState::Started => observed.started.push(machine),
                MachineState::Stopped => observed.stopped.push(machine),
                MachineState::Other(_) => observed.other.push(machine),
            }
        }
        observed
    }

    fn reachable_count(&self) -> u64 {
        (self.created.len() + self.started.len() + self.stopped.len() + self.other.len()) as u64
    }

    /// An arbitrary reachable machine to clone from.
    fn template(&self) -> Option<&Machine> {
        self.started
            .first()
            .or_else(|| self.stopped.first())
            .or_else(|| self.created.first())
            .or_else(|| self.other.first())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mock::{machine, MockFleetApi};

    fn bind(r: &mut Reconciler, client: MockFleetApi) {
        r.bind("test-app", Arc::new(client));
    }

    #[test]
    fn set_and_get_value() {
        let mut r = Reconciler::new();
        r.set_value("foo", 100.0);
        assert_eq!(r.value("foo"), Some(100.0));
        assert_eq!(r.value("bar"), None);
    }

    #[test]
    fn calc_bounds_through_metrics() {
        let mut r = Reconciler::new();
        r.set_value("x", 4.0);
        r.set_value("y", 7.0);

        r.bounds.min_started = "x + y + 2".to_string();
        assert_eq!(r.calc_min_started().unwrap(), Some(13));

        r.bounds.min_started = "min(x, y)".to_string();
        assert_eq!(r.calc_min_started().unwrap(), Some(4));

        r.bounds.min_started = "max(x, y)".to_string();
        assert_eq!(r.calc_min_started().unwrap(), Some(7));

        r.bounds.min_started = "-2".to_string();
        assert_eq!(r.calc_min_started().unwrap(), Some(0));

        // Created bounds clamp to one.
        r.bounds.min_created = "-2".to_string();
        assert_eq!(r.calc_min_created().unwrap(), Some(1));
    }

    #[test]
    fn calc_bound_nan_and_inf() {
        let mut r = Reconciler::new();
        r.set_value("x", f64::NAN);
        r.bounds.min_started = "x + 1".to_string();
        assert_eq!(r.calc_min_started().unwrap_err(), ExprError::Nan);

        r.bounds.min_started = "1 / 0".to_string();
        assert_eq!(r.calc_min_started().unwrap_err(), ExprError::Inf);
    }

    #[tokio::test]
    async fn no_scale_when_within_bounds() {
        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Started),
                machine("2", MachineState::Stopped),
            ])
        }));
        client.start_fn = Some(Box::new(|_| panic!("expected no start")));
        client.stop_fn = Some(Box::new(|_| panic!("expected no stop")));

        let mut r = Reconciler::new();
        r.bounds.min_started = "1".to_string();
        r.bounds.max_started = "2".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(r.stats().no_scale.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().bulk_start.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn scale_up_starts_machines_in_id_order() {
        let started_ids = Arc::new(Mutex::new(Vec::new()));
        let record = started_ids.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Started),
                machine("2", MachineState::Stopped),
                machine("3", MachineState::Stopped),
                machine("4", MachineState::Stopped),
            ])
        }));
        client.start_fn = Some(Box::new(move |id| {
            record.lock().unwrap().push(id.to_string());
            Ok(Default::default())
        }));

        let mut r = Reconciler::new();
        r.bounds.min_started = "foo + 2".to_string();
        r.bounds.max_started = r.bounds.min_started.clone();
        bind(&mut r, client);
        r.set_value("foo", 1.0);

        r.reconcile().await.unwrap();
        assert_eq!(*started_ids.lock().unwrap(), vec!["2", "3"]);
        assert_eq!(r.stats().bulk_start.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().machine_started.load(Ordering::Relaxed), 2);
        assert_eq!(r.stats().machine_start_failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn scale_up_retries_next_candidate_on_failure() {
        let started_ids = Arc::new(Mutex::new(Vec::new()));
        let record = started_ids.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Stopped),
                machine("2", MachineState::Stopped),
                machine("3", MachineState::Stopped),
                machine("4", MachineState::Stopped),
            ])
        }));
        client.start_fn = Some(Box::new(move |id| {
            record.lock().unwrap().push(id.to_string());
            if id == "2" {
                anyhow::bail!("marker");
            }
            Ok(Default::default())
        }));

        let mut r = Reconciler::new();
        r.bounds.min_started = "2".to_string();
        r.bounds.max_started = r.bounds.min_started.clone();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(*started_ids.lock().unwrap(), vec!["1", "2", "3"]);
        assert_eq!(r.stats().machine_started.load(Ordering::Relaxed), 2);
        assert_eq!(r.stats().machine_start_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn scale_down_stops_machines_in_id_order() {
        let stopped_ids = Arc::new(Mutex::new(Vec::new()));
        let record = stopped_ids.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Started),
                machine("2", MachineState::Started),
                machine("3", MachineState::Started),
                machine("4", MachineState::Stopped),
            ])
        }));
        client.stop_fn = Some(Box::new(move |req| {
            record.lock().unwrap().push(req.id);
            Ok(())
        }));

        let mut r = Reconciler::new();
        r.bounds.min_started = "1".to_string();
        r.bounds.max_started = "1".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(*stopped_ids.lock().unwrap(), vec!["1", "2"]);
        assert_eq!(r.stats().bulk_stop.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().machine_stopped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn stop_failure_retries_next_candidate() {
        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Started),
                machine("2", MachineState::Started),
                machine("3", MachineState::Started),
                machine("4", MachineState::Stopped),
            ])
        }));
        client.stop_fn = Some(Box::new(|req| {
            if req.id == "2" {
                anyhow::bail!("marker");
            }
            Ok(())
        }));

        let mut r = Reconciler::new();
        r.bounds.min_started = "1".to_string();
        r.bounds.max_started = "1".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(r.stats().machine_stopped.load(Ordering::Relaxed), 2);
        assert_eq!(r.stats().machine_stop_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn destroy_prefers_idle_and_counts_failures_as_progress() {
        let destroyed_ids = Arc::new(Mutex::new(Vec::new()));
        let record = destroyed_ids.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Started),
                machine("2", MachineState::Started),
                machine("3", MachineState::Stopped),
                machine("4", MachineState::Created),
            ])
        }));
        client.destroy_fn = Some(Box::new(move |req| {
            assert!(req.kill);
            record.lock().unwrap().push(req.id);
            Ok(())
        }));

        // max_created=0 clamps to 1, so 3 of 4 machines are destroyed:
        // stopped first, then created, then started.
        let mut r = Reconciler::new();
        r.bounds.max_created = "0".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(*destroyed_ids.lock().unwrap(), vec!["3", "4", "1"]);
        assert_eq!(r.stats().bulk_destroy.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().machine_destroyed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn destroy_failure_does_not_overrun_target() {
        let destroy_calls = Arc::new(Mutex::new(0u32));
        let record = destroy_calls.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![
                machine("1", MachineState::Stopped),
                machine("2", MachineState::Stopped),
                machine("3", MachineState::Stopped),
            ])
        }));
        client.destroy_fn = Some(Box::new(move |_| {
            *record.lock().unwrap() += 1;
            anyhow::bail!("marker")
        }));

        let mut r = Reconciler::new();
        r.bounds.max_created = "1".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        // Two destroys attempted, both failed, none retried.
        assert_eq!(*destroy_calls.lock().unwrap(), 2);
        assert_eq!(r.stats().machine_destroyed.load(Ordering::Relaxed), 0);
        assert_eq!(r.stats().machine_destroy_failed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn create_clones_template_with_round_robin_regions() {
        let launches = Arc::new(Mutex::new(Vec::new()));
        let record = launches.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            let mut template = machine("1", MachineState::Started);
            template.region = "ams".to_string();
            template.config.image = "registry.example.com/app:v3".to_string();
            Ok(vec![template])
        }));
        client.launch_fn = Some(Box::new(move |req| {
            record.lock().unwrap().push(req.clone());
            Ok(machine("new", MachineState::Started))
        }));

        let mut r = Reconciler::new();
        r.bounds.min_created = "4".to_string();
        r.regions = vec!["fra".to_string(), "ord".to_string()];
        bind(&mut r, client);

        r.reconcile().await.unwrap();

        let launches = launches.lock().unwrap();
        assert_eq!(launches.len(), 3);
        let regions: Vec<&str> = launches.iter().map(|l| l.region.as_str()).collect();
        assert_eq!(regions, vec!["fra", "ord", "fra"]);
        for launch in launches.iter() {
            assert_eq!(launch.config.image, "registry.example.com/app:v3");
            assert_eq!(launch.config.metadata["process_group"], "app");
            assert!(!launch.skip_launch);
        }
        assert_eq!(r.stats().bulk_create.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().machine_created.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn create_without_regions_reuses_template_region() {
        let launches = Arc::new(Mutex::new(Vec::new()));
        let record = launches.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            let mut template = machine("1", MachineState::Stopped);
            template.region = "syd".to_string();
            Ok(vec![template])
        }));
        client.launch_fn = Some(Box::new(move |req| {
            record.lock().unwrap().push(req);
            Ok(machine("new", MachineState::Stopped))
        }));

        let mut r = Reconciler::new();
        r.bounds.min_created = "2".to_string();
        r.initial_state = MachineState::Stopped;
        bind(&mut r, client);

        r.reconcile().await.unwrap();

        let launches = launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].region, "syd");
        assert!(launches[0].skip_launch);
    }

    #[tokio::test]
    async fn create_failure_aborts_remaining_bulk() {
        let launch_calls = Arc::new(Mutex::new(0u32));
        let record = launch_calls.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| Ok(vec![machine("1", MachineState::Started)])));
        client.launch_fn = Some(Box::new(move |_| {
            *record.lock().unwrap() += 1;
            anyhow::bail!("marker")
        }));

        let mut r = Reconciler::new();
        r.bounds.min_created = "5".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(*launch_calls.lock().unwrap(), 1);
        assert_eq!(r.stats().machine_create_failed.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().machine_created.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn create_without_template_is_rejected() {
        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| Ok(vec![])));
        client.launch_fn = Some(Box::new(|_| panic!("expected no launch")));

        let mut r = Reconciler::new();
        r.bounds.min_created = "1".to_string();
        bind(&mut r, client);

        let err = r.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoTemplateMachine));
        assert_eq!(err.to_string(), "no machine available to clone for scale up");
        // Pre-flight rejection: not a launch failure.
        assert_eq!(r.stats().machine_create_failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unreachable_machines_are_invisible() {
        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            let mut degraded = machine("2", MachineState::Started);
            degraded.host_status = crate::machine::HostStatus::Other("degraded".to_string());
            Ok(vec![machine("1", MachineState::Started), degraded])
        }));
        client.stop_fn = Some(Box::new(|_| panic!("expected no stop")));

        let mut r = Reconciler::new();
        r.bounds.max_started = "1".to_string();
        bind(&mut r, client);

        // Two started machines listed, but only one is reachable.
        r.reconcile().await.unwrap();
        assert_eq!(r.stats().no_scale.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn create_takes_priority_over_start() {
        let launches = Arc::new(Mutex::new(0u32));
        let record = launches.clone();

        let mut client = MockFleetApi::default();
        client.list_fn = Some(Box::new(|| {
            Ok(vec![machine("1", MachineState::Stopped)])
        }));
        client.launch_fn = Some(Box::new(move |_| {
            *record.lock().unwrap() += 1;
            Ok(machine("new", MachineState::Started))
        }));
        client.start_fn = Some(Box::new(|_| panic!("expected no start this tick")));

        let mut r = Reconciler::new();
        r.bounds.min_created = "2".to_string();
        r.bounds.min_started = "1".to_string();
        bind(&mut r, client);

        r.reconcile().await.unwrap();
        assert_eq!(*launches.lock().unwrap(), 1);
        assert_eq!(r.stats().bulk_create.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats().bulk_start.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn collector_failure_aborts_collection() {
        use crate::mock::MockCollector;

        let mut r = Reconciler::new();
        r.collectors = vec![
            Arc::new(MockCollector::constant("good", 1.0)),
            Arc::new(MockCollector::new("bad", |_| anyhow::bail!("boom"))),
        ];
        r.bind("test-app", Arc::new(MockFleetApi::default()));

        let err = r.collect_metrics().await.unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test]
    async fn collection_clears_previous_environment() {
        use crate::mock::MockCollector;

        let mut r = Reconciler::new();
        r.collectors = vec![Arc::new(MockCollector::constant("target", 2.0))];
        r.bind("app-a", Arc::new(MockFleetApi::default()));

        // A value left over from a previous app binding.
        r.set_value("stale", 99.0);
        r.collect_metrics().await.unwrap();

        assert_eq!(r.value("target"), Some(2.0));
        assert_eq!(r.value("stale"), None);
    }
}
