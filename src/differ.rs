/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/differ.rs
*
* Differ/Applier (component C4). Three specializations — ServiceAccount,
* RoleBinding, ClusterRoleBinding — share one generic algorithm parameterized
* over the `Reconcilable` trait. `plan()` is a pure function over the desired
* and existing lists, so the hardest invariants (idempotence, convergence,
* non-interference, subject-multiset equality) are unit-testable without a
* live cluster. `apply()` is the only half that talks to `kube::Api<T>`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeSet;

use k8s_openapi::api::rbac::v1 as rbac;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use thiserror::Error;
use tracing::warn;

use crate::crds::RBACDefinition;
use crate::labels::{managed_labels, managed_list_params};
use crate::metrics;
use crate::owner::{is_owned_by, owner_reference};
use crate::parser::{DesiredClusterRoleBinding, DesiredRoleBinding, DesiredServiceAccount, DesiredSubject};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Anything C4 can create, delete, and test for identity against an existing
/// cluster object of the matching kind.
pub trait Reconcilable: Clone {
    type Existing: Clone + ResourceExt;

    fn to_existing_shape(&self, def: &RBACDefinition) -> Self::Existing;
    fn identity_matches(&self, existing: &Self::Existing) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<D, E> {
    pub to_create: Vec<D>,
    pub to_delete: Vec<E>,
}

/// Pure planning phase (phases 1-2 from the design): classifies every
/// desired object as matched-or-missing and every owned existing object as
/// still-requested-or-orphaned. Never touches the network.
pub fn plan<D, E>(desired: &[D], existing: &[E], def: &RBACDefinition) -> Plan<D, E>
where
    D: Reconcilable<Existing = E> + Clone,
    E: Clone + ResourceExt,
{
    let mut matched = vec![false; existing.len()];
    let mut to_create = Vec::new();

    for d in desired {
        match existing.iter().position(|e| d.identity_matches(e)) {
            Some(index) => matched[index] = true,
            None => to_create.push(d.clone()),
        }
    }

    let to_delete = existing
        .iter()
        .zip(matched.iter())
        .filter(|(e, was_matched)| is_owned_by(*e, def) && !**was_matched)
        .map(|(e, _)| e.clone())
        .collect();

    Plan { to_create, to_delete }
}

fn subjects_match(a: &[DesiredSubject], b: &[rbac::Subject]) -> bool {
    let a_set: BTreeSet<(String, String, String)> = a
        .iter()
        .map(|s| (s.kind.as_str().to_string(), s.name.clone(), s.namespace.clone().unwrap_or_default()))
        .collect();
    let b_set: BTreeSet<(String, String, String)> = b
        .iter()
        .map(|s| (s.kind.clone(), s.name.clone(), s.namespace.clone().unwrap_or_default()))
        .collect();
    a_set == b_set
}

fn to_rbac_subjects(subjects: &[DesiredSubject]) -> Vec<rbac::Subject> {
    subjects
        .iter()
        .map(|s| rbac::Subject {
            kind: s.kind.as_str().to_string(),
            name: s.name.clone(),
            namespace: s.namespace.clone(),
            api_group: Some(s.kind.api_group().to_string()),
        })
        .collect()
}

impl Reconcilable for DesiredServiceAccount {
    type Existing = ServiceAccount;

    fn to_existing_shape(&self, def: &RBACDefinition) -> ServiceAccount {
        ServiceAccount {
            metadata: kube::core::ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(managed_labels()),
                owner_references: Some(vec![owner_reference(def)]),
                ..Default::default()
            },
            automount_service_account_token: self.automount_service_account_token,
            ..Default::default()
        }
    }

    fn identity_matches(&self, existing: &ServiceAccount) -> bool {
        existing.metadata.namespace.as_deref() == Some(self.namespace.as_str())
            && existing.metadata.name.as_deref() == Some(self.name.as_str())
    }
}

impl Reconcilable for DesiredRoleBinding {
    type Existing = rbac::RoleBinding;

    fn to_existing_shape(&self, def: &RBACDefinition) -> rbac::RoleBinding {
        rbac::RoleBinding {
            metadata: kube::core::ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(managed_labels()),
                owner_references: Some(vec![owner_reference(def)]),
                ..Default::default()
            },
            role_ref: rbac::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: self.role_ref.kind().to_string(),
                name: self.role_ref.name().to_string(),
            },
            subjects: Some(to_rbac_subjects(&self.subjects)),
        }
    }

    fn identity_matches(&self, existing: &rbac::RoleBinding) -> bool {
        existing.metadata.namespace.as_deref() == Some(self.namespace.as_str())
            && existing.metadata.name.as_deref() == Some(self.name.as_str())
            && existing.role_ref.kind == self.role_ref.kind()
            && existing.role_ref.name == self.role_ref.name()
            && subjects_match(&self.subjects, existing.subjects.as_deref().unwrap_or_default())
    }
}

impl Reconcilable for DesiredClusterRoleBinding {
    type Existing = rbac::ClusterRoleBinding;

    fn to_existing_shape(&self, def: &RBACDefinition) -> rbac::ClusterRoleBinding {
        rbac::ClusterRoleBinding {
            metadata: kube::core::ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(managed_labels()),
                owner_references: Some(vec![owner_reference(def)]),
                ..Default::default()
            },
            role_ref: rbac::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: self.role_ref.kind().to_string(),
                name: self.role_ref.name().to_string(),
            },
            subjects: Some(to_rbac_subjects(&self.subjects)),
        }
    }

    fn identity_matches(&self, existing: &rbac::ClusterRoleBinding) -> bool {
        existing.metadata.name.as_deref() == Some(self.name.as_str())
            && existing.role_ref.kind == self.role_ref.kind()
            && existing.role_ref.name == self.role_ref.name()
            && subjects_match(&self.subjects, existing.subjects.as_deref().unwrap_or_default())
    }
}

/// Phase 3: executes a plan against the cluster — deletes before creates,
/// per class, in list order. Each API error is logged and counted but does
/// not abort the remaining items in the class.
///
/// Creation goes through `Api::create`, not a server-side-apply patch: a
/// plain create is the only way to guarantee that colliding with a
/// pre-existing object this controller does not own surfaces as a hard
/// `AlreadyExists` and leaves that object untouched, rather than silently
/// grafting our owner reference and fields onto it.
pub async fn apply<D>(api: &Api<D::Existing>, def: &RBACDefinition, plan: Plan<D, D::Existing>, resource: &str)
where
    D: Reconcilable,
    D::Existing: serde::Serialize + std::fmt::Debug,
{
    for existing in &plan.to_delete {
        let name = existing.name_any();
        match api.delete(&name, &Default::default()).await {
            Ok(_) => metrics::record_change(resource, "delete"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => {
                warn!(resource, name, error = %e, "failed to delete orphaned object");
                metrics::record_error();
            }
        }
    }

    for desired in &plan.to_create {
        let shape = desired.to_existing_shape(def);
        let name = shape.name_any();
        match api.create(&PostParams::default(), &shape).await {
            Ok(_) => metrics::record_change(resource, "create"),
            Err(e) => {
                warn!(resource, name, error = %e, "failed to create desired object");
                metrics::record_error();
            }
        }
    }
}

/// Lists every object of `D::Existing` carrying the manager label, narrowed
/// to `namespace` when given. Used by C5 before calling `plan`.
pub async fn list_managed<K>(api: &Api<K>) -> Result<Vec<K>, ApplyError>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let list = api.list(&managed_list_params()).await?;
    Ok(list.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{RBACDefinitionSpec, SubjectKind};
    use kube::core::ObjectMeta;

    fn def() -> RBACDefinition {
        RBACDefinition {
            metadata: ObjectMeta {
                name: Some("team-a".to_string()),
                uid: Some("11111111-1111-1111-1111-111111111111".to_string()),
                ..Default::default()
            },
            spec: RBACDefinitionSpec { rbac_bindings: vec![] },
            status: None,
        }
    }

    fn existing_sa(namespace: &str, name: &str, owned: bool, def: &RBACDefinition) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: if owned { Some(vec![owner_reference(def)]) } else { None },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn matching_service_account_is_neither_created_nor_deleted() {
        let d = def();
        let desired = vec![DesiredServiceAccount {
            namespace: "foo".to_string(),
            name: "alice".to_string(),
            automount_service_account_token: None,
        }];
        let existing = vec![existing_sa("foo", "alice", true, &d)];
        let result = plan(&desired, &existing, &d);
        assert!(result.to_create.is_empty());
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn missing_service_account_is_planned_for_creation() {
        let d = def();
        let desired = vec![DesiredServiceAccount {
            namespace: "foo".to_string(),
            name: "alice".to_string(),
            automount_service_account_token: None,
        }];
        let result: Plan<DesiredServiceAccount, ServiceAccount> = plan(&desired, &[], &d);
        assert_eq!(result.to_create.len(), 1);
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn owned_and_no_longer_desired_service_account_is_planned_for_deletion() {
        let d = def();
        let existing = vec![existing_sa("foo", "stale", true, &d)];
        let result = plan(&[], &existing, &d);
        assert!(result.to_create.is_empty());
        assert_eq!(result.to_delete.len(), 1);
    }

    #[test]
    fn unowned_service_account_with_the_same_name_is_never_deleted() {
        let d = def();
        let existing = vec![existing_sa("foo", "collision", false, &d)];
        let result: Plan<DesiredServiceAccount, ServiceAccount> = plan(&[], &existing, &d);
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn reordered_subjects_do_not_trigger_delete_then_create() {
        let d = def();
        let role_ref = crate::parser::RoleRef::Role("reader".to_string());
        let x = DesiredSubject { kind: SubjectKind::ServiceAccount, name: "x".to_string(), namespace: Some("foo".to_string()) };
        let y = DesiredSubject { kind: SubjectKind::ServiceAccount, name: "y".to_string(), namespace: Some("foo".to_string()) };

        let desired_rb = DesiredRoleBinding {
            name: "team-a-bind1".to_string(),
            namespace: "foo".to_string(),
            role_ref: role_ref.clone(),
            subjects: vec![x.clone(), y.clone()],
        };

        let mut existing_shape = desired_rb.to_existing_shape(&d);
        existing_shape.subjects = Some(to_rbac_subjects(&[y, x]));

        let result = plan(&[desired_rb], &[existing_shape], &d);
        assert!(result.to_create.is_empty());
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn changing_the_role_ref_forces_delete_then_create() {
        let d = def();
        let old = DesiredRoleBinding {
            name: "team-a-bind1".to_string(),
            namespace: "foo".to_string(),
            role_ref: crate::parser::RoleRef::Role("reader".to_string()),
            subjects: vec![],
        };
        let existing_shape = old.to_existing_shape(&d);

        let new = DesiredRoleBinding {
            name: "team-a-bind1".to_string(),
            namespace: "foo".to_string(),
            role_ref: crate::parser::RoleRef::Role("writer".to_string()),
            subjects: vec![],
        };

        let result = plan(&[new], &[existing_shape], &d);
        assert_eq!(result.to_create.len(), 1);
        assert_eq!(result.to_delete.len(), 1);
    }
}
