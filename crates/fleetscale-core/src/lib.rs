//! fleetscale-core — the reconciliation engine.
//!
//! Drives a fleet of machines toward operator-supplied bounds evaluated
//! over externally collected metrics.
//!
//! # Architecture
//!
//! ```text
//! ReconcilerPool
//!   ├── refresher  — wildcard app discovery (org apps → app-map)
//!   ├── generator  — emits each known app per reconcile interval
//!   └── workers    — bounded concurrency; each owns a Reconciler
//!
//! Reconciler (per tick)
//!   ├── collect_metrics()  — MetricCollector fan-in, fresh env
//!   ├── eval bounds        — expr over the metric env
//!   └── reconcile()        — list → filter → one bulk action
//! ```
//!
//! The Fleet API and metric sources are trait objects; concrete clients
//! live in sibling crates.

pub mod client;
pub mod collector;
pub mod error;
pub mod expr;
pub mod machine;
pub mod mock;
pub mod pool;
pub mod reconciler;
pub mod stats;

pub use client::{fleet_api_factory, App, FleetApi, FleetApiFactory, Org, PlatformApi};
pub use collector::{expand_metric_query, MetricCollector};
pub use error::{ExprError, PoolError, ReconcileError};
pub use machine::{
    DestroyRequest, HostStatus, LaunchRequest, Machine, MachineConfig, MachineId, MachineState,
    StartResponse, StopRequest,
};
pub use pool::{
    format_wildcard_as_regex, AppInfo, PoolHandle, ReconcilerPool, DEFAULT_APP_LIST_REFRESH_INTERVAL,
    DEFAULT_CONCURRENCY, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RECONCILE_TIMEOUT,
};
pub use reconciler::{BoundExpressions, Reconciler, DEFAULT_PROCESS_GROUP};
pub use stats::ReconcilerStats;
