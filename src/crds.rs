/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to the
* `RBACDefinition` Custom Resource Definition. By using the
* `kube::CustomResource` derive macro, we create a strongly-typed
* representation of the custom API, enabling safe and idiomatic interaction
* with the Kubernetes API server.
*
* Architecture:
* - `RBACDefinition` is cluster-scoped: a single definition can target many
*   namespaces, so it does not make sense to pin it to one.
* - The spec is an ordered list of `RbacBinding`s. Each binding carries the
*   subjects once and fans out to zero-or-more RoleBindings and zero-or-more
*   ClusterRoleBindings, per the parser rules in `crate::parser`.
* - `serde` attributes map between idiomatic Rust `snake_case` and idiomatic
*   Kubernetes `camelCase`.
* - `schemars` generates the OpenAPI v3 schema embedded into the CRD
*   manifest for server-side structural validation.
*
* SPDX-License-Identifier: Apache-2.0
*/

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `RBACDefinition` custom resource. A single definition declares an
/// ordered list of bindings; the controller expands it into ServiceAccounts,
/// RoleBindings and ClusterRoleBindings (see `crate::parser`).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rbac-manager.ph.io",
    version = "v1alpha1",
    kind = "RBACDefinition",
    scope = "Cluster",
    status = "RBACDefinitionStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[-1:].type"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "rbacdef"
)]
#[serde(rename_all = "camelCase")]
pub struct RBACDefinitionSpec {
    #[serde(default)]
    pub rbac_bindings: Vec<RbacBinding>,
}

/// One entry in an `RBACDefinition`. Has a name unique within the
/// definition, a shared subject list, and zero-or-more RoleBinding /
/// ClusterRoleBinding specs that the subjects get bound through.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RbacBinding {
    pub name: String,

    #[serde(default)]
    pub subjects: Vec<Subject>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_role_bindings: Vec<ClusterRoleBindingSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_bindings: Vec<RoleBindingSpec>,
}

/// An identity to bind a role to: a ServiceAccount, a User, or a Group.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Only meaningful for `ServiceAccount` subjects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubjectKind {
    ServiceAccount,
    User,
    Group,
}

impl SubjectKind {
    /// The `apiGroup` the Kubernetes RBAC API expects for a subject of this
    /// kind; `ServiceAccount` subjects live in the core API group.
    pub fn api_group(self) -> &'static str {
        match self {
            SubjectKind::ServiceAccount => "",
            SubjectKind::User | SubjectKind::Group => "rbac.authorization.k8s.io",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::ServiceAccount => "ServiceAccount",
            SubjectKind::User => "User",
            SubjectKind::Group => "Group",
        }
    }
}

/// A single `clusterRoleBindings` entry on an `RbacBinding`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBindingSpec {
    pub cluster_role: String,
}

/// A single `roleBindings` entry on an `RbacBinding`. Exactly one of
/// `cluster_role`/`role` and exactly one of `namespace`/`namespace_selector`
/// must be set; `crate::parser` rejects specs that violate this.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

impl RoleBindingSpec {
    pub fn has_selector(&self) -> bool {
        self.namespace_selector.is_some()
    }
}

/// Observed state of an `RBACDefinition`, updated after every reconcile.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RBACDefinitionStatus {
    #[serde(default)]
    pub service_accounts: u32,
    #[serde(default)]
    pub role_bindings: u32,
    #[serde(default)]
    pub cluster_role_bindings: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub message: String,
    pub last_transition_time: String,
}

impl StatusCondition {
    pub fn ready(message: impl Into<String>, now: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            message: message.into(),
            last_transition_time: now.to_string(),
        }
    }

    pub fn not_ready(message: impl Into<String>, now: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            message: message.into(),
            last_transition_time: now.to_string(),
        }
    }
}
