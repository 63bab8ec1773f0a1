/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/rbac_definition_controller.rs
*
* Event Adapters (component C6). Wires the `RBACDefinition` primary
* Controller plus the secondary watch streams (Namespace, ServiceAccount,
* RoleBinding, ClusterRoleBinding) into the reconciler facade in
* `crate::reconciler`.
*
* Architecture: the primary stream runs through a standard
* `kube_runtime::Controller`, matching the style of this codebase's other
* controllers (`rbac_policy_controller.rs`, `cluster.rs` in the reference
* pack). The four secondary streams drive a *different* primary type
* (RBACDefinition) than the one they watch, which the `Controller` builder's
* `.owns()`/`.watches()` model is not a good fit for here since
* ClusterRoleBinding and Namespace are cluster-scoped while RoleBinding and
* ServiceAccount are namespaced with no direct namespace relationship to
* their owning definition; each is run as its own `watcher` stream that
* calls directly into the matching `crate::reconciler` entry point instead
* of funneling through a shared `reconcile(RBACDefinition)` callback.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use chrono::Utc;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::crds::{RBACDefinition, RBACDefinitionStatus, StatusCondition};
use crate::labels::FIELD_MANAGER;
use crate::parser;
use crate::reconciler::{self, ReconcileError, ResourceKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

pub struct Context {
    pub client: Client,
    pub requeue_after: Duration,
}

/// Starts the primary `RBACDefinition` controller and the four secondary
/// watch loops concurrently. Returns only on shutdown signal or fatal error.
pub async fn run(client: Client, requeue_after: Duration) {
    let definitions: Api<RBACDefinition> = Api::all(client.clone());
    let context = Arc::new(Context { client: client.clone(), requeue_after });

    let primary = Controller::new(definitions, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("reconciled RBACDefinition: {:?}", o),
                Err(e) => error!("RBACDefinition reconcile error: {}", e),
            }
        });

    tokio::join!(
        primary,
        watch_namespaces(client.clone()),
        watch_managed::<ServiceAccount>(client.clone(), ResourceKind::ServiceAccount),
        watch_managed::<RoleBinding>(client.clone(), ResourceKind::RoleBinding),
        watch_managed::<ClusterRoleBinding>(client.clone(), ResourceKind::ClusterRoleBinding),
    );
}

async fn reconcile(def: Arc<RBACDefinition>, ctx: Arc<Context>) -> Result<Action, Error> {
    let result = reconciler::reconcile(&ctx.client, &def).await;
    crate::metrics::record_reconcile(match &result {
        Ok(_) => "success",
        Err(ReconcileError::Parse(_)) => "parse_error",
        Err(_) => "error",
    });

    let summary = result?;
    let status = RBACDefinitionStatus {
        service_accounts: summary.service_accounts,
        role_bindings: summary.role_bindings,
        cluster_role_bindings: summary.cluster_role_bindings,
        conditions: vec![StatusCondition::ready(
            "RBACDefinition reconciled successfully.",
            &Utc::now().to_rfc3339(),
        )],
    };
    if let Err(e) = update_status(&ctx.client, &def, status).await {
        warn!(definition = %def.name_any(), error = %e, "failed to update status after successful reconcile");
    }

    Ok(Action::requeue(ctx.requeue_after))
}

fn error_policy(def: Arc<RBACDefinition>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(definition = %def.name_any(), error = %error, "reconcile failed, will retry");
    crate::metrics::record_reconcile("requeue");

    let status = RBACDefinitionStatus {
        service_accounts: def.status.as_ref().map(|s| s.service_accounts).unwrap_or_default(),
        role_bindings: def.status.as_ref().map(|s| s.role_bindings).unwrap_or_default(),
        cluster_role_bindings: def.status.as_ref().map(|s| s.cluster_role_bindings).unwrap_or_default(),
        conditions: vec![StatusCondition::not_ready(
            format!("Reconciliation failed: {error}"),
            &Utc::now().to_rfc3339(),
        )],
    };
    let client = ctx.client.clone();
    tokio::spawn(async move {
        if let Err(e) = update_status(&client, &def, status).await {
            warn!(error = %e, "failed to update status on error");
        }
    });

    Action::requeue(Duration::from_secs(60))
}

async fn update_status(client: &Client, def: &RBACDefinition, status: RBACDefinitionStatus) -> Result<(), kube::Error> {
    let api: Api<RBACDefinition> = Api::all(client.clone());
    let patch = json!({ "status": status });
    api.patch_status(&def.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Every namespace create/modify/delete is evaluated against every
/// `RBACDefinition` that carries a namespace selector: `reconciler` cheaply
/// no-ops for definitions whose resolved namespace set is unaffected.
/// `touched_objects()`, not `applied_objects()` — the latter drops Delete
/// events, and a deleted namespace must still trigger re-evaluation.
async fn watch_namespaces(client: Client) {
    let api: Api<Namespace> = Api::all(client.clone());
    let definitions: Api<RBACDefinition> = Api::all(client.clone());

    let mut events = Box::pin(watcher::watcher(api, watcher::Config::default()).touched_objects());
    while let Some(event) = events.next().await {
        let ns = match event {
            Ok(ns) => ns,
            Err(e) => {
                warn!(error = %e, "namespace watch error");
                continue;
            }
        };
        let ns_name = ns.name_any();

        let all_defs = match definitions.list(&Default::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!(error = %e, "failed to list RBACDefinitions for namespace-change fan-out");
                continue;
            }
        };

        for def in all_defs.iter().filter(|d| parser::has_namespace_selectors(d)) {
            if let Err(e) = reconciler::reconcile_namespace_change(&client, def, &ns_name).await {
                warn!(definition = %def.name_any(), namespace = %ns_name, error = %e, "namespace-triggered reconcile failed");
            }
        }
    }
}

/// Shared watch loop for the three managed-object kinds: on every event,
/// reads the object's own owner references and repairs only the resource
/// class `kind` concerns for the owning definition(s). Uses
/// `touched_objects()` rather than `applied_objects()` so an out-of-band
/// delete of a managed object reaches `reconcile_owners` and gets recreated,
/// not just creates/updates.
async fn watch_managed<K>(client: Client, kind: ResourceKind)
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let api: Api<K> = Api::all(client.clone());
    let mut events = Box::pin(watcher::watcher(api, watcher::Config::default()).touched_objects());

    while let Some(event) = events.next().await {
        let obj = match event {
            Ok(obj) => obj,
            Err(e) => {
                warn!(error = %e, "managed-object watch error");
                continue;
            }
        };
        let owner_refs = obj.owner_references().to_vec();
        if let Err(e) = reconciler::reconcile_owners(&client, &owner_refs, kind).await {
            warn!(error = %e, "owner-triggered reconcile failed");
        }
    }
}
