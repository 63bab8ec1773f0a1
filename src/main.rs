/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* Archive: src/main.rs
*
* Entry point for the rbac-manager controller. Follows the standard
* `kube-rs` operator structure:
* 1. Parse configuration from CLI flags / environment.
* 2. Initialize structured logging.
* 3. Either print the RBACDefinition CRD manifest and exit, or start the
*    controller and its metrics server concurrently.
*
* SPDX-License-Identifier: Apache-2.0 */

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;
use warp::Filter;

mod config;
mod crds;
mod differ;
mod labels;
mod metrics;
mod owner;
mod parser;
mod reconciler;
mod selector;
mod telemetry;
mod controllers {
    pub mod rbac_definition_controller;
}

use config::Config;
use crds::RBACDefinition;

/// Renders the registry into the Prometheus text exposition format.
async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder
        .encode(&registry.gather(), &mut buffer)
        .expect("Prometheus encoding cannot fail for a well-formed registry");

    let response = String::from_utf8(buffer).expect("Prometheus text format is always valid UTF-8");
    Ok(warp::reply::with_header(response, "Content-Type", encoder.format_type()))
}

/// Runs the HTTP server exposing the `/metrics` endpoint.
async fn run_metrics_server(registry: Arc<Registry>, addr: std::net::SocketAddr) {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    info!(%addr, "starting metrics server");
    warp::serve(metrics_route).run(addr).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    if config.print_crds {
        let crd = RBACDefinition::crd();
        print!("{}", serde_yaml::to_string(&crd)?);
        return Ok(());
    }

    telemetry::init(config.log_format);
    info!("rbac-manager starting");

    let client = Client::try_default().await?;

    let registry = Arc::new(metrics::create_and_register_metrics()?);
    info!("custom metrics registered");

    tokio::join!(
        run_metrics_server(registry, config.metrics_addr),
        controllers::rbac_definition_controller::run(client, config.requeue_duration()),
    );

    info!("rbac-manager shutting down");
    Ok(())
}
