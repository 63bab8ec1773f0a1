/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/reconciler.rs
*
* Reconciler Facade (component C5). Exposes the three entry points the
* controller wiring in `crate::controllers` calls into, and owns the single
* process-wide lock that serializes every reconcile so that no two passes
* ever observe interleaved API states.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crds::RBACDefinition;
use crate::differ::{self, ApplyError};
use crate::parser::{self, DesiredClusterRoleBinding, DesiredRoleBinding, DesiredServiceAccount, ParseError};

/// Serializes the whole body of every reconcile entry point. A
/// `tokio::sync::Mutex`, not `std::sync::Mutex`, because the critical
/// section awaits API calls.
static GLOBAL_LOCK: LazyLock<tokio::sync::Mutex<()>> = LazyLock::new(|| tokio::sync::Mutex::new(()));

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to parse RBACDefinition: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to apply desired state: {0}")]
    Apply(#[from] ApplyError),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Identifies which managed-object watch stream triggered `reconcile_owners`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ServiceAccount,
    RoleBinding,
    ClusterRoleBinding,
}

async fn list_namespaces(client: &Client) -> Result<Vec<Namespace>, kube::Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    Ok(api.list(&ListParams::default()).await?.items)
}

fn log_automount_conflicts(conflicts: &[(String, String)]) {
    for (namespace, name) in conflicts {
        warn!(namespace, name, "conflicting automountServiceAccountToken values across subjects; first occurrence wins");
    }
}

/// A list failure aborts planning for this one namespace group only: no plan
/// can be formed without knowing what already exists, but other groups (and
/// other resource classes) still get a chance to converge.
async fn reconcile_service_accounts(client: &Client, def: &RBACDefinition, desired: &[DesiredServiceAccount]) {
    let mut by_namespace: BTreeMap<&str, Vec<DesiredServiceAccount>> = BTreeMap::new();
    for d in desired {
        by_namespace.entry(d.namespace.as_str()).or_default().push(d.clone());
    }

    for (namespace, group) in by_namespace {
        let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
        let existing = match differ::list_managed(&api).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(namespace, error = %e, "failed to list existing ServiceAccounts, skipping this namespace");
                crate::metrics::record_error();
                continue;
            }
        };
        let plan = differ::plan(&group, &existing, def);
        differ::apply(&api, def, plan, "ServiceAccount").await;
    }
}

async fn reconcile_role_bindings(client: &Client, def: &RBACDefinition, desired: &[DesiredRoleBinding]) {
    let mut by_namespace: BTreeMap<&str, Vec<DesiredRoleBinding>> = BTreeMap::new();
    for d in desired {
        by_namespace.entry(d.namespace.as_str()).or_default().push(d.clone());
    }

    for (namespace, group) in by_namespace {
        let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
        let existing = match differ::list_managed(&api).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(namespace, error = %e, "failed to list existing RoleBindings, skipping this namespace");
                crate::metrics::record_error();
                continue;
            }
        };
        let plan = differ::plan(&group, &existing, def);
        differ::apply(&api, def, plan, "RoleBinding").await;
    }
}

async fn reconcile_cluster_role_bindings(client: &Client, def: &RBACDefinition, desired: &[DesiredClusterRoleBinding]) {
    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    let existing = match differ::list_managed(&api).await {
        Ok(existing) => existing,
        Err(e) => {
            warn!(error = %e, "failed to list existing ClusterRoleBindings, skipping this class");
            crate::metrics::record_error();
            return;
        }
    };
    let plan = differ::plan(desired, &existing, def);
    differ::apply(&api, def, plan, "ClusterRoleBinding").await;
}

/// Observed counts after a successful `reconcile`, used by the controller
/// wiring to populate `RBACDefinitionStatus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileSummary {
    pub service_accounts: u32,
    pub role_bindings: u32,
    pub cluster_role_bindings: u32,
}

/// Called on create/modify of an RBACDefinition. Runs the full pipeline in
/// the order SA -> CRB -> RB: a RoleBinding referencing a ServiceAccount
/// should find it already created, though the API server tolerates the
/// reverse.
pub async fn reconcile(client: &Client, def: &RBACDefinition) -> Result<ReconcileSummary, ReconcileError> {
    let _guard = GLOBAL_LOCK.lock().await;
    info!(definition = %def.name_any(), "reconciling RBACDefinition");

    let namespaces = list_namespaces(client).await?;
    let parsed = parser::parse(def, &namespaces)?;
    log_automount_conflicts(&parsed.automount_conflicts);

    let summary = ReconcileSummary {
        service_accounts: parsed.service_accounts.len() as u32,
        role_bindings: parsed.role_bindings.len() as u32,
        cluster_role_bindings: parsed.cluster_role_bindings.len() as u32,
    };

    reconcile_service_accounts(client, def, &parsed.service_accounts).await;
    reconcile_cluster_role_bindings(client, def, &parsed.cluster_role_bindings).await;
    reconcile_role_bindings(client, def, &parsed.role_bindings).await;
    Ok(summary)
}

/// Called on any namespace create/delete when `def` carries at least one
/// namespace-selector RoleBinding spec. `namespace` is informational only:
/// correctness does not depend on it since the parser re-enumerates all
/// matching namespaces from scratch. ClusterRoleBindings are skipped - they
/// never depend on namespace population.
pub async fn reconcile_namespace_change(
    client: &Client,
    def: &RBACDefinition,
    namespace: &str,
) -> Result<(), ReconcileError> {
    let _guard = GLOBAL_LOCK.lock().await;
    info!(definition = %def.name_any(), namespace, "namespace change triggers selector re-evaluation");

    let namespaces = list_namespaces(client).await?;
    let parsed = parser::parse(def, &namespaces)?;
    log_automount_conflicts(&parsed.automount_conflicts);

    reconcile_service_accounts(client, def, &parsed.service_accounts).await;
    reconcile_role_bindings(client, def, &parsed.role_bindings).await;
    Ok(())
}

/// Called when a managed object of `kind` is modified or deleted
/// out-of-band. For each owner reference whose kind is `RBACDefinition`,
/// looks up that definition and repairs only the resource class `kind`
/// concerns. A definition that no longer exists is skipped silently: it was
/// deleted, and garbage collection via owner references will clean up its
/// children.
pub async fn reconcile_owners(
    client: &Client,
    owner_refs: &[OwnerReference],
    kind: ResourceKind,
) -> Result<(), ReconcileError> {
    let defs: Api<RBACDefinition> = Api::all(client.clone());

    for owner in owner_refs {
        if owner.kind != "RBACDefinition" {
            continue;
        }

        let def = match defs.get(&owner.name).await {
            Ok(def) => def,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(definition = owner.name, "owning RBACDefinition no longer exists, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let _guard = GLOBAL_LOCK.lock().await;
        match kind {
            ResourceKind::ServiceAccount => {
                let namespaces = list_namespaces(client).await?;
                let parsed = parser::parse(&def, &namespaces)?;
                log_automount_conflicts(&parsed.automount_conflicts);
                reconcile_service_accounts(client, &def, &parsed.service_accounts).await;
            }
            ResourceKind::RoleBinding => {
                let namespaces = list_namespaces(client).await?;
                let role_bindings = parser::parse_role_bindings_only(&def, &namespaces)?;
                reconcile_role_bindings(client, &def, &role_bindings).await;
            }
            ResourceKind::ClusterRoleBinding => {
                let crbs = parser::parse_cluster_role_bindings_only_for_def(&def)?;
                reconcile_cluster_role_bindings(client, &def, &crbs).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::pin_mut;
    use http::{Request, Response};
    use kube::client::Body;
    use kube::core::{ObjectList, ObjectMeta, TypeMeta};
    use serde_json::json;
    use tower_test::mock;

    use crate::crds::RBACDefinitionSpec;

    /// An in-memory stand-in for the Kubernetes API server: a `kube::Client`
    /// backed by a `tower_test` mock service instead of a real connection.
    /// Each test drives the mock from a spawned task while the reconciler
    /// code under test runs on the calling task, matching the harness
    /// `tembo-operator`'s `fixtures.rs`/`controller.rs` tests use.
    fn mock_client() -> (Client, mock::Handle<Request<Body>, Response<Body>>) {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(service, "default".to_string()), handle)
    }

    async fn join(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("mock api server scenario timed out")
            .expect("mock api server scenario task panicked");
    }

    fn def(name: &str) -> RBACDefinition {
        RBACDefinition {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some("11111111-1111-1111-1111-111111111111".to_string()),
                ..Default::default()
            },
            spec: RBACDefinitionSpec { rbac_bindings: vec![] },
            status: None,
        }
    }

    fn status_body(code: u16, reason: &str, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        }))
        .unwrap()
    }

    fn empty_list_body(kind: &str) -> Vec<u8> {
        let list: ObjectList<ServiceAccount> = ObjectList {
            metadata: Default::default(),
            items: vec![],
            types: TypeMeta { kind: kind.to_string(), api_version: "v1".to_string() },
        };
        serde_json::to_vec(&list).unwrap()
    }

    fn service_account_body(namespace: &str, name: &str) -> Vec<u8> {
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some("22222222-2222-2222-2222-222222222222".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        serde_json::to_vec(&sa).unwrap()
    }

    #[tokio::test]
    async fn reconcile_owners_makes_no_api_calls_when_there_is_nothing_to_do() {
        let (client, _handle) = mock_client();

        assert!(reconcile_owners(&client, &[], ResourceKind::ServiceAccount).await.is_ok());

        let unrelated = vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "irrelevant".to_string(),
            uid: "33333333-3333-3333-3333-333333333333".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }];
        assert!(reconcile_owners(&client, &unrelated, ResourceKind::ServiceAccount).await.is_ok());
    }

    #[tokio::test]
    async fn reconcile_owners_skips_a_definition_that_no_longer_exists() {
        let (client, handle) = mock_client();
        let owners = vec![OwnerReference {
            api_version: "rbac-manager.ph.io/v1alpha1".to_string(),
            kind: "RBACDefinition".to_string(),
            name: "missing".to_string(),
            uid: "44444444-4444-4444-4444-444444444444".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }];

        let scenario = tokio::spawn(async move {
            pin_mut!(handle);
            let (request, send) = handle.next_request().await.expect("definition lookup");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(status_body(404, "NotFound", "rbacdefinitions.rbac-manager.ph.io \"missing\" not found")))
                    .unwrap(),
            );
        });

        let result = reconcile_owners(&client, &owners, ResourceKind::RoleBinding).await;
        assert!(result.is_ok());
        join(scenario).await;
    }

    /// The central promise of the per-namespace-group isolation in
    /// `reconcile_service_accounts`: a list failure for one namespace must
    /// not prevent another namespace's group from being planned and applied.
    /// `"bar"` sorts before `"foo"` in the `BTreeMap`, so the mock expects
    /// that order.
    #[tokio::test]
    async fn a_list_failure_in_one_namespace_does_not_block_another() {
        let d = def("team-a");
        let desired = vec![
            DesiredServiceAccount { namespace: "bar".to_string(), name: "unreachable".to_string(), automount_service_account_token: None },
            DesiredServiceAccount { namespace: "foo".to_string(), name: "bob".to_string(), automount_service_account_token: None },
        ];
        let (client, handle) = mock_client();

        let scenario = tokio::spawn(async move {
            pin_mut!(handle);

            let (request, send) = handle.next_request().await.expect("list in bar");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(
                Response::builder()
                    .status(500)
                    .body(Body::from(status_body(500, "InternalError", "etcd unavailable")))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("list in foo");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(Response::builder().body(Body::from(empty_list_body("ServiceAccountList"))).unwrap());

            let (request, send) = handle.next_request().await.expect("create in foo");
            assert_eq!(request.method(), http::Method::POST);
            send.send_response(Response::builder().status(201).body(Body::from(service_account_body("foo", "bob"))).unwrap());
        });

        reconcile_service_accounts(&client, &d, &desired).await;
        join(scenario).await;
    }
}
