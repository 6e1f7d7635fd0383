//! Closure-backed mock clients and collectors.
//!
//! Each mock exposes optional function fields; unset operations fail so
//! a test only stubs what it exercises.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::client::{App, FleetApi, Org, PlatformApi};
use crate::collector::MetricCollector;
use crate::machine::{
    DestroyRequest, LaunchRequest, Machine, MachineState, StartResponse, StopRequest,
};

type ListFn = dyn Fn() -> Result<Vec<Machine>> + Send + Sync;
type LaunchFn = dyn Fn(LaunchRequest) -> Result<Machine> + Send + Sync;
type DestroyFn = dyn Fn(DestroyRequest) -> Result<()> + Send + Sync;
type StartFn = dyn Fn(&str) -> Result<StartResponse> + Send + Sync;
type StopFn = dyn Fn(StopRequest) -> Result<()> + Send + Sync;

/// Mock machine-lifecycle client.
#[derive(Default)]
pub struct MockFleetApi {
    pub list_fn: Option<Box<ListFn>>,
    pub launch_fn: Option<Box<LaunchFn>>,
    pub destroy_fn: Option<Box<DestroyFn>>,
    pub start_fn: Option<Box<StartFn>>,
    pub stop_fn: Option<Box<StopFn>>,
}

#[async_trait]
impl FleetApi for MockFleetApi {
    async fn list(&self) -> Result<Vec<Machine>> {
        match &self.list_fn {
            Some(f) => f(),
            None => Err(anyhow!("list not mocked")),
        }
    }

    async fn launch(&self, req: LaunchRequest) -> Result<Machine> {
        match &self.launch_fn {
            Some(f) => f(req),
            None => Err(anyhow!("launch not mocked")),
        }
    }

    async fn destroy(&self, req: DestroyRequest) -> Result<()> {
        match &self.destroy_fn {
            Some(f) => f(req),
            None => Err(anyhow!("destroy not mocked")),
        }
    }

    async fn start(&self, id: &str) -> Result<StartResponse> {
        match &self.start_fn {
            Some(f) => f(id),
            None => Err(anyhow!("start not mocked")),
        }
    }

    async fn stop(&self, req: StopRequest) -> Result<()> {
        match &self.stop_fn {
            Some(f) => f(req),
            None => Err(anyhow!("stop not mocked")),
        }
    }
}

type GetOrgFn = dyn Fn(&str) -> Result<Org> + Send + Sync;
type ListAppsFn = dyn Fn(&str) -> Result<Vec<App>> + Send + Sync;

/// Mock org/app discovery client.
#[derive(Default)]
pub struct MockPlatformApi {
    pub get_org_fn: Option<Box<GetOrgFn>>,
    pub list_apps_fn: Option<Box<ListAppsFn>>,
}

#[async_trait]
impl PlatformApi for MockPlatformApi {
    async fn get_org(&self, slug: &str) -> Result<Org> {
        match &self.get_org_fn {
            Some(f) => f(slug),
            None => Err(anyhow!("get_org not mocked")),
        }
    }

    async fn list_apps(&self, org_id: &str) -> Result<Vec<App>> {
        match &self.list_apps_fn {
            Some(f) => f(org_id),
            None => Err(anyhow!("list_apps not mocked")),
        }
    }
}

type CollectFn = dyn Fn(&str) -> Result<f64> + Send + Sync;

/// Mock metric collector backed by a closure.
pub struct MockCollector {
    name: String,
    collect_fn: Box<CollectFn>,
}

impl MockCollector {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&str) -> Result<f64> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            collect_fn: Box::new(f),
        }
    }

    /// A collector that always returns the same value.
    pub fn constant(name: &str, value: f64) -> Self {
        Self::new(name, move |_| Ok(value))
    }
}

#[async_trait]
impl MetricCollector for MockCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, app_name: &str) -> Result<f64> {
        (self.collect_fn)(app_name)
    }
}

/// Build a reachable machine with the given id and state.
pub fn machine(id: &str, state: MachineState) -> Machine {
    Machine {
        id: id.to_string(),
        state,
        region: "fra".to_string(),
        host_status: Default::default(),
        config: Default::default(),
    }
}

/// Wrap a shared [`MockFleetApi`] in the factory type the pool expects.
pub fn fixed_fleet_api_factory(client: Arc<dyn FleetApi>) -> crate::client::FleetApiFactory {
    crate::client::fleet_api_factory(move |_app_name| {
        let client = client.clone();
        async move { Ok(client) }
    })
}
