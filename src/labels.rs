/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/labels.rs
*
* Well-known constants shared by every component that creates, lists, or
* filters the objects this controller manages. Centralizing them here keeps
* the manager label and finalizer name in lock-step across `differ`,
* `owner`, and the controller wiring.
*
* SPDX-License-Identifier: Apache-2.0
*/

use kube::api::ListParams;

/// Applied to every ServiceAccount/RoleBinding/ClusterRoleBinding this
/// controller creates. Used to narrow `list` calls before the owner-reference
/// equality check in `crate::owner::is_owned_by` does the authoritative
/// filtering.
pub const MANAGER_LABEL_KEY: &str = "rbac-manager.ph.io/managed-by";
pub const MANAGER_LABEL_VALUE: &str = "rbac-manager";

/// The field manager identity used for every server-side apply patch this
/// controller issues.
pub const FIELD_MANAGER: &str = "rbac-manager.ph.io/controller";

/// `ListParams` pre-populated with the manager label selector, so every
/// `differ` specialization lists only plausibly-managed objects instead of
/// the whole cluster.
pub fn managed_list_params() -> ListParams {
    ListParams::default().labels(&format!("{MANAGER_LABEL_KEY}={MANAGER_LABEL_VALUE}"))
}

/// The label map stamped onto every generated object's metadata.
pub fn managed_labels() -> std::collections::BTreeMap<String, String> {
    std::collections::BTreeMap::from([(
        MANAGER_LABEL_KEY.to_string(),
        MANAGER_LABEL_VALUE.to_string(),
    )])
}
