/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* Defines and registers the Prometheus metrics this controller exposes.
* `lazy_static` ensures each metric is created once and shared safely across
* every concurrent reconcile.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{opts, register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec, Registry};

lazy_static! {
    /// Total API errors encountered while applying or deleting a managed
    /// object. Incremented by `crate::differ::apply`.
    pub static ref RBAC_MANAGER_ERRORS_TOTAL: IntCounter =
        register_int_counter!(opts!(
            "rbac_manager_errors_total",
            "Total number of API errors encountered while reconciling RBACDefinitions."
        )).unwrap();

    /// Total creates/deletes performed against managed objects, labeled by
    /// resource kind and action.
    pub static ref RBAC_MANAGER_CHANGES_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "rbac_manager_changes_total",
            "Total number of managed objects created or deleted.",
            &["resource", "action"]
        ).unwrap();

    /// Total reconcile passes, labeled by outcome.
    pub static ref RBAC_MANAGER_RECONCILES_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "rbac_manager_reconciles_total",
            "Total number of reconcile passes, by result.",
            &["result"]
        ).unwrap();
}

/// Creates a new Prometheus registry and registers all custom metrics.
/// Called once at startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(RBAC_MANAGER_ERRORS_TOTAL.clone()))?;
    r.register(Box::new(RBAC_MANAGER_CHANGES_TOTAL.clone()))?;
    r.register(Box::new(RBAC_MANAGER_RECONCILES_TOTAL.clone()))?;
    Ok(r)
}

pub fn record_change(resource: &str, action: &str) {
    RBAC_MANAGER_CHANGES_TOTAL.with_label_values(&[resource, action]).inc();
}

pub fn record_error() {
    RBAC_MANAGER_ERRORS_TOTAL.inc();
}

pub fn record_reconcile(result: &str) {
    RBAC_MANAGER_RECONCILES_TOTAL.with_label_values(&[result]).inc();
}
