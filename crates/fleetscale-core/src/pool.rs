//! Reconciler pool — multi-app scheduling with bounded concurrency.
//!
//! The pool owns three kinds of background tasks:
//!
//! ```text
//! refresher (wildcard only)
//!   └── periodically matches org apps against the wildcard and
//!       rebuilds the app-map, then spawns the…
//! generator
//!   └── every reconcile interval, pushes each known app onto the
//!       work channel (capacity 1, so saturated workers exert
//!       backpressure and late apps are simply retried next tick)
//! workers (one per concurrency slot)
//!   └── pop an app, rebind their reconciler, run one tick under the
//!       reconcile timeout
//! ```
//!
//! All tasks honor a shared shutdown signal; `PoolHandle::close` waits
//! for every one of them to exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{FleetApi, FleetApiFactory, PlatformApi};
use crate::error::PoolError;
use crate::reconciler::Reconciler;
use crate::stats::ReconcilerStats;

/// Pool defaults.
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_APP_LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// An app known to the pool: its name plus the API client built for it.
#[derive(Clone)]
pub struct AppInfo {
    pub name: String,
    pub client: Arc<dyn FleetApi>,
}

/// Shared app-map: the refresher swaps the whole `Arc` so readers can
/// snapshot it and iterate without holding the lock.
type AppMap = Arc<Mutex<Arc<HashMap<String, AppInfo>>>>;

/// Constructor for the pool's reconcilers, called once per worker.
pub type ReconcilerFactory = Box<dyn Fn() -> Reconciler + Send + Sync>;

/// A set of reconcilers acting as a worker pool.
///
/// Distributes scaling work across multiple applications while limiting
/// the concurrency of in-flight reconciliations.
pub struct ReconcilerPool {
    platform: Arc<dyn PlatformApi>,
    concurrency: usize,
    stats: Arc<ReconcilerStats>,

    /// Time allowed to reconcile a single app.
    pub reconcile_timeout: Duration,
    /// Frequency of the per-app reconciliation loop.
    pub reconcile_interval: Duration,
    /// Frequency of wildcard app-list refreshes.
    pub app_list_refresh_interval: Duration,
    /// App to scale; `*` wildcards select multiple apps in one org.
    pub app_name: String,
    /// Organization slug; required when `app_name` has a wildcard.
    pub org_slug: String,
    /// Builds a `FleetApi` client for a discovered app.
    pub client_factory: Option<FleetApiFactory>,
    /// Builds the pool's reconcilers.
    pub reconciler_factory: Option<ReconcilerFactory>,
}

impl ReconcilerPool {
    pub fn new(platform: Arc<dyn PlatformApi>, concurrency: usize) -> Self {
        Self {
            platform,
            concurrency: concurrency.max(1),
            stats: Arc::new(ReconcilerStats::new()),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            app_list_refresh_interval: DEFAULT_APP_LIST_REFRESH_INTERVAL,
            app_name: String::new(),
            org_slug: String::new(),
            client_factory: None,
            reconciler_factory: None,
        }
    }

    /// Stats aggregate shared with every reconciler in the pool.
    pub fn stats(&self) -> Arc<ReconcilerStats> {
        self.stats.clone()
    }

    /// Validate configuration and start the pool's tasks.
    pub async fn open(mut self) -> Result<PoolHandle, PoolError> {
        if self.app_name.is_empty() {
            return Err(PoolError::AppNameRequired);
        }
        let client_factory = self
            .client_factory
            .take()
            .ok_or(PoolError::ClientFactoryRequired)?;
        let reconciler_factory = self
            .reconciler_factory
            .take()
            .ok_or(PoolError::ReconcilerFactoryRequired)?;

        let wildcard = self.app_name.contains('*');
        if wildcard && self.org_slug.is_empty() {
            return Err(PoolError::OrgSlugRequired);
        }

        // A single literal app never benefits from parallel workers.
        let concurrency = if wildcard { self.concurrency } else { 1 };

        let (work_tx, work_rx) = mpsc::channel::<AppInfo>(1);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let apps: AppMap = Arc::new(Mutex::new(Arc::new(HashMap::new())));

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for worker_id in 0..concurrency {
            let mut reconciler = (reconciler_factory)();
            reconciler.set_stats(self.stats.clone());
            tasks.push(tokio::spawn(run_worker(
                worker_id,
                reconciler,
                work_rx.clone(),
                shutdown_rx.clone(),
                self.reconcile_timeout,
            )));
        }

        if wildcard {
            tasks.push(tokio::spawn(run_refresher(Refresher {
                platform: self.platform.clone(),
                client_factory,
                apps,
                app_name: self.app_name.clone(),
                org_slug: self.org_slug.clone(),
                refresh_interval: self.app_list_refresh_interval,
                reconcile_interval: self.reconcile_interval,
                work_tx,
                shutdown_rx,
            })));
        } else {
            // Literal app: build its client eagerly so a bad token or
            // app name fails at open, not mid-loop.
            let client = (client_factory)(&self.app_name)
                .await
                .map_err(PoolError::Client)?;
            let mut map = HashMap::new();
            map.insert(
                self.app_name.clone(),
                AppInfo {
                    name: self.app_name.clone(),
                    client,
                },
            );
            *apps.lock().await = Arc::new(map);

            tasks.push(tokio::spawn(run_generator(
                apps,
                work_tx,
                shutdown_rx,
                self.reconcile_interval,
            )));
        }

        info!(
            app = %self.app_name,
            concurrency,
            interval = ?self.reconcile_interval,
            timeout = ?self.reconcile_timeout,
            "reconciler pool opened"
        );

        Ok(PoolHandle {
            shutdown_tx,
            tasks,
            stats: self.stats,
        })
    }
}

/// Handle to a running pool. Dropping it without `close` leaves the
/// tasks running until the runtime shuts down.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<ReconcilerStats>,
}

impl PoolHandle {
    pub fn stats(&self) -> Arc<ReconcilerStats> {
        self.stats.clone()
    }

    /// Signal shutdown and wait for every task to exit.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("reconciler pool closed");
    }
}

// ── Workers ────────────────────────────────────────────────────────

async fn run_worker(
    worker_id: usize,
    mut reconciler: Reconciler,
    work_rx: Arc<Mutex<mpsc::Receiver<AppInfo>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconcile_timeout: Duration,
) {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            }
        };

        reconciler.bind(item.name.as_str(), item.client.clone());

        let tick = async {
            reconciler.collect_metrics().await?;
            reconciler.reconcile().await
        };
        match tokio::time::timeout(reconcile_timeout, tick).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(worker = worker_id, app = %item.name, error = %err, "reconciliation failed");
            }
            Err(_) => {
                error!(worker = worker_id, app = %item.name, "reconciliation timeout");
            }
        }
    }
}

// ── Generator ──────────────────────────────────────────────────────

/// Push every known app onto the work channel once per interval.
///
/// The send blocks until a worker receives; when all workers are busy
/// the rest of the tick's apps wait, and shutdown aborts the send.
async fn run_generator(
    apps: AppMap,
    work_tx: mpsc::Sender<AppInfo>,
    mut shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let snapshot = { apps.lock().await.clone() };
        for info in snapshot.values() {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                sent = work_tx.send(info.clone()) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// ── Refresher ──────────────────────────────────────────────────────

struct Refresher {
    platform: Arc<dyn PlatformApi>,
    client_factory: FleetApiFactory,
    apps: AppMap,
    app_name: String,
    org_slug: String,
    refresh_interval: Duration,
    reconcile_interval: Duration,
    work_tx: mpsc::Sender<AppInfo>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Keep the app-map in sync with the wildcard-matched set.
///
/// The generator is started after the first refresh attempt so the
/// first reconcile tick sees a populated map.
async fn run_refresher(ctx: Refresher) {
    let Refresher {
        platform,
        client_factory,
        apps,
        app_name,
        org_slug,
        refresh_interval,
        reconcile_interval,
        work_tx,
        mut shutdown_rx,
    } = ctx;

    let pattern = format_wildcard_as_regex(&app_name);
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(err) => {
            error!(app = %app_name, error = %err, "cannot compile wildcard as regex");
            return;
        }
    };

    let mut generator: Option<JoinHandle<()>> = None;
    let mut org_id: Option<String> = None;

    loop {
        if let Err(err) = refresh_app_list(
            platform.as_ref(),
            &client_factory,
            &apps,
            &re,
            &org_slug,
            &mut org_id,
        )
        .await
        {
            error!(error = %err, "app list update failed");
        }

        if generator.is_none() {
            generator = Some(tokio::spawn(run_generator(
                apps.clone(),
                work_tx.clone(),
                shutdown_rx.clone(),
                reconcile_interval,
            )));
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(refresh_interval) => {}
        }
    }

    if let Some(handle) = generator {
        let _ = handle.await;
    }
}

async fn refresh_app_list(
    platform: &dyn PlatformApi,
    client_factory: &FleetApiFactory,
    apps: &AppMap,
    re: &Regex,
    org_slug: &str,
    org_id: &mut Option<String>,
) -> anyhow::Result<()> {
    // The org id never changes; look it up once and cache it.
    let id = match org_id {
        Some(id) => id.clone(),
        None => {
            let org = platform.get_org(org_slug).await?;
            *org_id = Some(org.id.clone());
            org.id
        }
    };

    let app_list = platform.list_apps(&id).await?;

    let current = { apps.lock().await.clone() };
    let mut next = HashMap::new();
    for app in app_list {
        if !re.is_match(&app.name) {
            continue;
        }

        // Reuse the existing client when the app survived the refresh.
        if let Some(info) = current.get(&app.name) {
            next.insert(app.name, info.clone());
            continue;
        }

        let client = (client_factory)(&app.name).await?;
        info!(app = %app.name, "app matched wildcard, client created");
        next.insert(
            app.name.clone(),
            AppInfo {
                name: app.name,
                client,
            },
        );
    }

    for name in current.keys() {
        if !next.contains_key(name) {
            warn!(app = %name, "app no longer matches wildcard, dropping");
        }
    }

    *apps.lock().await = Arc::new(next);
    Ok(())
}

/// Translate a `*` wildcard into an anchored regular expression.
///
/// Literal segments are escaped, so regex metacharacters in app names
/// match themselves.
pub fn format_wildcard_as_regex(s: &str) -> String {
    if s.is_empty() {
        return ".*".to_string();
    }

    let escaped: Vec<String> = s.split('*').map(|part| regex::escape(part)).collect();
    format!("^{}$", escaped.join(".*"))
}
