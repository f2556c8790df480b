//! Seeds the policy store with one `_all_apis_` tuple per protected route.
//!
//! Takes no arguments; configuration comes from the same sources as the
//! server. Exits non-zero on any failure.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use crm_auth::{RouteEntry, SUPER_ADMIN_ROLE};
use crm_infra::{Config, PolicySeeder, Runtime, SeedReport};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("policy seeding failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<SeedReport> {
    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    crm_observability::init(&config.logging);

    let runtime = Runtime::start(config.clone())
        .await
        .context("failed to start runtime")?;

    let routes = crm_api::app::route_catalog();
    println!("discovered {} routes", routes.len());

    let result = seed(&runtime, &config, &routes).await;

    let closed = runtime.shutdown().await;
    let report = result?;
    closed.context("failed to close resources")?;
    Ok(report)
}

async fn seed(runtime: &Runtime, config: &Config, routes: &[RouteEntry]) -> anyhow::Result<SeedReport> {
    let seeder = PolicySeeder::from_config(runtime.engine()?, config);
    tokio::time::timeout(config.lifecycle.init_timeout(), seeder.seed(routes))
        .await
        .context("seeding exceeded the deadline")?
        .context("failed to seed policies")
}

fn print_report(report: &SeedReport) {
    println!(
        "{} under the API prefix, {} public, {} elsewhere",
        report.discovered - report.outside_prefix - report.public,
        report.public,
        report.outside_prefix
    );
    if report.is_up_to_date() {
        println!("policies are up to date ({} already present)", report.already_present);
        return;
    }
    println!("added {} policies ({} already present)", report.added, report.already_present);
    if report.granted > 0 {
        println!("granted {} endpoints to `{SUPER_ADMIN_ROLE}`", report.granted);
    }
    println!("saved: {}", if report.saved { "yes" } else { "no" });
}
