//! Abstract Fleet API capabilities consumed by the reconciliation engine.
//!
//! `FleetApi` is the per-app machine-lifecycle surface; `PlatformApi` is
//! the org/app-listing surface used only by the wildcard refresher. Both
//! are trait objects so the engine can run against the HTTP client, a
//! mock, or anything else.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::machine::{DestroyRequest, LaunchRequest, Machine, StartResponse, StopRequest};

/// An application owning a set of machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
}

/// An organization, looked up by slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Org {
    pub id: String,
    pub slug: String,
}

/// Machine-lifecycle operations, scoped to a single app.
///
/// Every call is fire-and-observe: failures are surfaced to the caller
/// and never retried here.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Full current snapshot of the app's machines.
    async fn list(&self) -> anyhow::Result<Vec<Machine>>;

    /// Create a new machine cloned from the supplied config.
    async fn launch(&self, req: LaunchRequest) -> anyhow::Result<Machine>;

    /// Remove a machine; must succeed even if started when `kill` is set.
    async fn destroy(&self, req: DestroyRequest) -> anyhow::Result<()>;

    /// Transition `stopped → started`.
    async fn start(&self, id: &str) -> anyhow::Result<StartResponse>;

    /// Transition `started → stopped`.
    async fn stop(&self, req: StopRequest) -> anyhow::Result<()>;
}

/// Org and app discovery, used by the wildcard refresher.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn get_org(&self, slug: &str) -> anyhow::Result<Org>;

    async fn list_apps(&self, org_id: &str) -> anyhow::Result<Vec<App>>;
}

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Constructor for building a `FleetApi` client for a given app.
///
/// The pool calls this lazily, once per discovered app, and caches the
/// result until the app leaves the matched set.
pub type FleetApiFactory =
    Arc<dyn Fn(&str) -> BoxFuture<anyhow::Result<Arc<dyn FleetApi>>> + Send + Sync>;

/// Wrap an async closure as a [`FleetApiFactory`].
pub fn fleet_api_factory<F, Fut>(f: F) -> FleetApiFactory
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Arc<dyn FleetApi>>> + Send + 'static,
{
    Arc::new(
        move |app_name: &str| -> BoxFuture<anyhow::Result<Arc<dyn FleetApi>>> {
            Box::pin(f(app_name.to_string()))
        },
    )
}
