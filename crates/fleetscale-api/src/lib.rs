//! fleetscale-api — HTTP client for the machine-orchestration API.
//!
//! Implements the core `FleetApi` (per-app machine lifecycle) and
//! `PlatformApi` (org/app discovery) traits against the REST surface:
//!
//! ```text
//! GET    /v1/apps/{app}/machines
//! POST   /v1/apps/{app}/machines
//! DELETE /v1/apps/{app}/machines/{id}?kill=true
//! POST   /v1/apps/{app}/machines/{id}/start
//! POST   /v1/apps/{app}/machines/{id}/stop
//! GET    /v1/orgs/{slug}
//! GET    /v1/orgs/{id}/apps
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use fleetscale_core::{
    fleet_api_factory, App, DestroyRequest, FleetApi, FleetApiFactory, LaunchRequest, Machine,
    Org, PlatformApi, StartResponse, StopRequest,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Machine-lifecycle client scoped to one app.
pub struct FleetHttpClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    app_name: String,
}

impl FleetHttpClient {
    pub fn new(base_url: &str, token: &str, app_name: &str) -> Result<Self> {
        if token.is_empty() {
            bail!("api token required");
        }
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            app_name: app_name.to_string(),
        })
    }

    fn machines_url(&self) -> String {
        format!("{}/v1/apps/{}/machines", self.base_url, self.app_name)
    }

    fn machine_url(&self, id: &str) -> String {
        format!("{}/{}", self.machines_url(), id)
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("{what} request"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{what} failed: {status}: {body}");
        }
        Ok(resp)
    }
}

#[async_trait]
impl FleetApi for FleetHttpClient {
    async fn list(&self) -> Result<Vec<Machine>> {
        let resp = self
            .send(self.http.get(self.machines_url()), "list machines")
            .await?;
        resp.json().await.context("decode machine list")
    }

    async fn launch(&self, req: LaunchRequest) -> Result<Machine> {
        let resp = self
            .send(
                self.http.post(self.machines_url()).json(&req),
                "launch machine",
            )
            .await?;
        resp.json().await.context("decode launched machine")
    }

    async fn destroy(&self, req: DestroyRequest) -> Result<()> {
        self.send(
            self.http
                .delete(self.machine_url(&req.id))
                .query(&[("kill", req.kill)]),
            "destroy machine",
        )
        .await?;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<StartResponse> {
        let resp = self
            .send(
                self.http.post(format!("{}/start", self.machine_url(id))),
                "start machine",
            )
            .await?;
        resp.json().await.context("decode start response")
    }

    async fn stop(&self, req: StopRequest) -> Result<()> {
        self.send(
            self.http.post(format!("{}/stop", self.machine_url(&req.id))),
            "stop machine",
        )
        .await?;
        Ok(())
    }
}

/// Org/app discovery client, used by the wildcard refresher.
pub struct PlatformHttpClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PlatformHttpClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        if token.is_empty() {
            bail!("api token required");
        }
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String, what: &str) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("{what} request"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("{what} failed: {status}");
        }
        resp.json().await.with_context(|| format!("decode {what}"))
    }
}

#[async_trait]
impl PlatformApi for PlatformHttpClient {
    async fn get_org(&self, slug: &str) -> Result<Org> {
        self.get_json(format!("{}/v1/orgs/{slug}", self.base_url), "get organization")
            .await
    }

    async fn list_apps(&self, org_id: &str) -> Result<Vec<App>> {
        self.get_json(
            format!("{}/v1/orgs/{org_id}/apps", self.base_url),
            "list organization apps",
        )
        .await
    }
}

/// Factory building a [`FleetHttpClient`] per discovered app.
pub fn http_fleet_api_factory(base_url: &str, token: &str) -> FleetApiFactory {
    let base_url = base_url.to_string();
    let token = token.to_string();
    fleet_api_factory(move |app_name: String| {
        let base_url = base_url.clone();
        let token = token.clone();
        async move {
            let client = FleetHttpClient::new(&base_url, &token, &app_name)?;
            Ok(Arc::new(client) as Arc<dyn FleetApi>)
        }
    })
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("build http client")
}
