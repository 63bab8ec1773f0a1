/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/parser.rs
*
* Parser (component C2). Expands an `RBACDefinition` into three flat,
* deduplicated lists: desired ServiceAccounts, desired RoleBindings, and
* desired ClusterRoleBindings. Namespace-selector resolution is delegated to
* `crate::selector` (C1); this module stays a pure function of
* `(&RBACDefinition, &[Namespace])` so it is directly unit-testable without a
* live cluster.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Namespace;
use thiserror::Error;

use kube::ResourceExt;

use crate::crds::{RBACDefinition, RbacBinding, Subject, SubjectKind};

use crate::selector::{self, SelectorError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("binding name '{0}' is used more than once in this definition")]
    DuplicateBindingName(String),

    #[error("roleBinding in binding '{0}' must set exactly one of role/clusterRole")]
    AmbiguousRoleRef(String),

    #[error("roleBinding in binding '{0}' must set exactly one of namespace/namespaceSelector")]
    AmbiguousNamespaceScope(String),

    #[error("subject '{0}' of kind ServiceAccount in binding '{1}' has no namespace and the binding only carries a ClusterRoleBinding spec")]
    ServiceAccountMissingNamespace(String, String),

    #[error("binding '{0}': {1}")]
    Selector(String, SelectorError),
}

/// A role reference resolved to exactly one kind, the way the API server's
/// `RoleRef.kind` field expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleRef {
    Role(String),
    ClusterRole(String),
}

impl RoleRef {
    pub fn kind(&self) -> &'static str {
        match self {
            RoleRef::Role(_) => "Role",
            RoleRef::ClusterRole(_) => "ClusterRole",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RoleRef::Role(n) | RoleRef::ClusterRole(n) => n,
        }
    }
}

/// A subject inlined into a generated RoleBinding/ClusterRoleBinding, after
/// namespace qualification.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DesiredSubject {
    pub kind: SubjectKind,
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredServiceAccount {
    pub namespace: String,
    pub name: String,
    pub automount_service_account_token: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRoleBinding {
    pub name: String,
    pub namespace: String,
    pub role_ref: RoleRef,
    pub subjects: Vec<DesiredSubject>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredClusterRoleBinding {
    pub name: String,
    pub role_ref: RoleRef,
    pub subjects: Vec<DesiredSubject>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDesiredState {
    pub service_accounts: Vec<DesiredServiceAccount>,
    pub role_bindings: Vec<DesiredRoleBinding>,
    pub cluster_role_bindings: Vec<DesiredClusterRoleBinding>,
    /// `(namespace, name)` pairs where two subjects disagreed on
    /// `automountServiceAccountToken`; the first occurrence won. Purely
    /// informational — the reconciler logs these, parsing never fails for
    /// them (see the open question in DESIGN.md).
    pub automount_conflicts: Vec<(String, String)>,
}

/// True if any `roleBindings` entry in `def` uses `namespaceSelector`. Gates
/// the namespace-event entry point in `crate::reconciler`.
pub fn has_namespace_selectors(def: &RBACDefinition) -> bool {
    def.spec
        .rbac_bindings
        .iter()
        .any(|b| b.role_bindings.iter().any(|rb| rb.has_selector()))
}

fn role_ref_of(
    binding_name: &str,
    role: &Option<String>,
    cluster_role: &Option<String>,
) -> Result<RoleRef, ParseError> {
    match (role, cluster_role) {
        (Some(r), None) => Ok(RoleRef::Role(r.clone())),
        (None, Some(cr)) => Ok(RoleRef::ClusterRole(cr.clone())),
        _ => Err(ParseError::AmbiguousRoleRef(binding_name.to_string())),
    }
}

/// Qualifies a binding's subjects for use inside a RoleBinding in
/// `namespace`: a ServiceAccount subject with no explicit namespace inherits
/// the RoleBinding's namespace.
fn qualify_for_role_binding(subjects: &[Subject], namespace: &str) -> Vec<DesiredSubject> {
    subjects
        .iter()
        .map(|s| DesiredSubject {
            kind: s.kind,
            name: s.name.clone(),
            namespace: match s.kind {
                SubjectKind::ServiceAccount => {
                    Some(s.namespace.clone().unwrap_or_else(|| namespace.to_string()))
                }
                _ => None,
            },
        })
        .collect()
}

/// Qualifies a binding's subjects for use inside a ClusterRoleBinding: a
/// ServiceAccount subject with no explicit namespace is a parse error, since
/// there is no enclosing namespace to inherit from.
fn qualify_for_cluster_role_binding(
    subjects: &[Subject],
    binding_name: &str,
) -> Result<Vec<DesiredSubject>, ParseError> {
    subjects
        .iter()
        .map(|s| match s.kind {
            SubjectKind::ServiceAccount => {
                let namespace = s.namespace.clone().ok_or_else(|| {
                    ParseError::ServiceAccountMissingNamespace(s.name.clone(), binding_name.to_string())
                })?;
                Ok(DesiredSubject {
                    kind: s.kind,
                    name: s.name.clone(),
                    namespace: Some(namespace),
                })
            }
            _ => Ok(DesiredSubject {
                kind: s.kind,
                name: s.name.clone(),
                namespace: None,
            }),
        })
        .collect()
}

fn resolve_namespaces(
    binding_name: &str,
    spec: &crate::crds::RoleBindingSpec,
    namespaces: &[Namespace],
) -> Result<Vec<String>, ParseError> {
    match (&spec.namespace, &spec.namespace_selector) {
        (Some(ns), None) => Ok(vec![ns.clone()]),
        (None, Some(sel)) => selector::select_namespaces(sel, namespaces)
            .map(|names| names.into_iter().map(str::to_string).collect())
            .map_err(|e| ParseError::Selector(binding_name.to_string(), e)),
        _ => Err(ParseError::AmbiguousNamespaceScope(binding_name.to_string())),
    }
}

/// Records the ServiceAccounts a RoleBinding's subjects imply, in `namespace`.
/// Reads `automountServiceAccountToken` from the authored `Subject`s, not
/// from the already-qualified `DesiredSubject` list, since `DesiredSubject`
/// carries no automount field — it is only ever destined for the wire
/// `subjects` of a RoleBinding/ClusterRoleBinding, which has no such field
/// either.
fn collect_service_accounts_from_role_binding(
    into: &mut BTreeMap<(String, String), DesiredServiceAccount>,
    conflicts: &mut Vec<(String, String)>,
    subjects: &[Subject],
    namespace: &str,
) {
    for s in subjects {
        if s.kind != SubjectKind::ServiceAccount {
            continue;
        }
        let ns = s.namespace.clone().unwrap_or_else(|| namespace.to_string());
        record_service_account(into, conflicts, ns, s.name.clone(), s.automount_service_account_token);
    }
}

fn record_service_account(
    into: &mut BTreeMap<(String, String), DesiredServiceAccount>,
    conflicts: &mut Vec<(String, String)>,
    namespace: String,
    name: String,
    automount: Option<bool>,
) {
    let key = (namespace.clone(), name.clone());
    into.entry(key.clone())
        .and_modify(|existing| {
            if let (Some(a), Some(b)) = (existing.automount_service_account_token, automount) {
                if a != b {
                    conflicts.push(key.clone());
                }
            } else if existing.automount_service_account_token.is_none() && automount.is_some() {
                existing.automount_service_account_token = automount;
            }
        })
        .or_insert(DesiredServiceAccount {
            namespace,
            name,
            automount_service_account_token: automount,
        });
}

/// Full expansion: `parse(def)` → desired ServiceAccounts, RoleBindings, and
/// ClusterRoleBindings, per the ordered rules in SPEC_FULL.md §4.2.
pub fn parse(def: &RBACDefinition, namespaces: &[Namespace]) -> Result<ParsedDesiredState, ParseError> {
    let mut seen_names = HashSet::new();
    for binding in &def.spec.rbac_bindings {
        if !seen_names.insert(binding.name.clone()) {
            return Err(ParseError::DuplicateBindingName(binding.name.clone()));
        }
    }

    let mut service_accounts: BTreeMap<(String, String), DesiredServiceAccount> = BTreeMap::new();
    let mut conflicts = Vec::new();
    let mut role_bindings = Vec::new();
    let mut cluster_role_bindings = Vec::new();

    for binding in &def.spec.rbac_bindings {
        // Authored automount flags, recorded regardless of which binding
        // kind (RB or CRB) first mentions the subject.
        for s in &binding.subjects {
            if s.kind == SubjectKind::ServiceAccount {
                if let Some(ns) = &s.namespace {
                    record_service_account(
                        &mut service_accounts,
                        &mut conflicts,
                        ns.clone(),
                        s.name.clone(),
                        s.automount_service_account_token,
                    );
                }
            }
        }

        for rb_spec in &binding.role_bindings {
            let role_ref = role_ref_of(&binding.name, &rb_spec.role, &rb_spec.cluster_role)?;
            let resolved = resolve_namespaces(&binding.name, rb_spec, namespaces)?;
            for ns in resolved {
                let subjects = qualify_for_role_binding(&binding.subjects, &ns);
                collect_service_accounts_from_role_binding(&mut service_accounts, &mut conflicts, &binding.subjects, &ns);
                role_bindings.push(DesiredRoleBinding {
                    name: format!("{}-{}", def.name_any(), binding.name),
                    namespace: ns,
                    role_ref: role_ref.clone(),
                    subjects,
                });
            }
        }

        let crb_specs = &binding.cluster_role_bindings;
        for (index, crb_spec) in crb_specs.iter().enumerate() {
            let subjects = qualify_for_cluster_role_binding(&binding.subjects, &binding.name)?;
            let name = if crb_specs.len() > 1 {
                format!("{}-{}-{}", def.name_any(), binding.name, index)
            } else {
                format!("{}-{}", def.name_any(), binding.name)
            };
            cluster_role_bindings.push(DesiredClusterRoleBinding {
                name,
                role_ref: RoleRef::ClusterRole(crb_spec.cluster_role.clone()),
                subjects,
            });
        }
    }

    Ok(ParsedDesiredState {
        service_accounts: service_accounts.into_values().collect(),
        role_bindings,
        cluster_role_bindings,
        automount_conflicts: conflicts,
    })
}

/// Narrow parse variant used by `reconcile_owners` for `RoleBinding` events:
/// produces only the RoleBinding list, skipping ServiceAccount synthesis.
pub fn parse_role_bindings_only(
    def: &RBACDefinition,
    namespaces: &[Namespace],
) -> Result<Vec<DesiredRoleBinding>, ParseError> {
    Ok(parse(def, namespaces)?.role_bindings)
}

/// Narrow parse variant used by `reconcile_owners` for `ClusterRoleBinding`
/// events: produces only the ClusterRoleBinding list. Unlike RoleBindings,
/// this needs no namespace list since CRBs never depend on namespace
/// population.
pub fn parse_cluster_role_bindings_only(
    def: &RBACDefinition,
    binding: &RbacBinding,
) -> Result<Vec<DesiredClusterRoleBinding>, ParseError> {
    let mut out = Vec::new();
    for (index, crb_spec) in binding.cluster_role_bindings.iter().enumerate() {
        let subjects = qualify_for_cluster_role_binding(&binding.subjects, &binding.name)?;
        let name = if binding.cluster_role_bindings.len() > 1 {
            format!("{}-{}-{}", def.name_any(), binding.name, index)
        } else {
            format!("{}-{}", def.name_any(), binding.name)
        };
        out.push(DesiredClusterRoleBinding {
            name,
            role_ref: RoleRef::ClusterRole(crb_spec.cluster_role.clone()),
            subjects,
        });
    }
    Ok(out)
}

/// Same as `parse_cluster_role_bindings_only` but across every binding in
/// `def` — used by `reconcile_owners` for `ClusterRoleBinding` events, where
/// the triggering object's own binding is not known ahead of time.
pub fn parse_cluster_role_bindings_only_for_def(
    def: &RBACDefinition,
) -> Result<Vec<DesiredClusterRoleBinding>, ParseError> {
    let mut out = Vec::new();
    for binding in &def.spec.rbac_bindings {
        out.extend(parse_cluster_role_bindings_only(def, binding)?);
    }
    Ok(out)
}
