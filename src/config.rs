/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* Process configuration, read from environment variables and CLI flags via
* `clap`'s `env` feature — the same env-driven configuration style
* `main.rs` already used for `PROMETHEUS_ENDPOINT`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "rbac-manager", about = "Reconciles RBACDefinitions into ServiceAccounts, RoleBindings and ClusterRoleBindings")]
pub struct Config {
    /// Print the RBACDefinition CustomResourceDefinition as YAML and exit,
    /// instead of starting the controller loop.
    #[arg(long)]
    pub print_crds: bool,

    /// Bind address for the /metrics HTTP server.
    #[arg(long, env = "RBAC_MANAGER_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: std::net::SocketAddr,

    /// tracing-subscriber formatter selection.
    #[arg(long, env = "RBAC_MANAGER_LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Fallback periodic reconcile interval, applied as `Action::requeue`
    /// after a successful reconcile so definitions are re-verified even
    /// with no incoming events.
    #[arg(long, env = "RBAC_MANAGER_REQUEUE_SECS", default_value_t = 300)]
    pub requeue_secs: u64,
}

impl Config {
    pub fn requeue_duration(&self) -> tokio::time::Duration {
        tokio::time::Duration::from_secs(self.requeue_secs)
    }
}
