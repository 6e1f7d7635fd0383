//! The eval command: collect metrics once and print the evaluated
//! bounds as JSON. No scaling is performed — this is for testing a
//! configuration before letting it drive a fleet.

use anyhow::{Context, Result};
use serde::Serialize;

use fleetscale_core::Reconciler;

use crate::config::Config;

#[derive(Debug, Default, Serialize)]
struct Range {
    min: Option<u64>,
    max: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct Output {
    created: Range,
    started: Range,
}

pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let collectors = config
        .new_metric_collectors()
        .context("cannot create metrics collectors")?;

    let mut reconciler = Reconciler::new();
    reconciler.set_app_name(&config.app_name);
    reconciler.bounds = config.bounds();
    reconciler.collectors = collectors;

    reconciler
        .collect_metrics()
        .await
        .context("metrics collection failed")?;

    let out = Output {
        created: Range {
            min: reconciler
                .calc_min_created()
                .context("cannot calculate min created machine count")?,
            max: reconciler
                .calc_max_created()
                .context("cannot calculate max created machine count")?,
        },
        started: Range {
            min: reconciler
                .calc_min_started()
                .context("cannot calculate min started machine count")?,
            max: reconciler
                .calc_max_started()
                .context("cannot calculate max started machine count")?,
        },
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
