/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/owner.rs
*
* Owner-Reference Stamper (component C3). Builds the single controller
* owner-reference every generated object carries back to the RBACDefinition
* that produced it, and the exact-equality predicate the differ (C4) uses to
* decide whether an existing object is one this controller is allowed to
* touch.
*
* SPDX-License-Identifier: Apache-2.0
*/

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crds::RBACDefinition;

/// Builds the one-element owner-reference set every desired object is
/// stamped with. Panics only if `def` is missing required metadata (name,
/// uid) — which cannot happen for an object freshly read back from the API
/// server, matching the `.controller_owner_ref(&()).unwrap()` convention
/// used elsewhere in this codebase.
pub fn owner_reference(def: &RBACDefinition) -> OwnerReference {
    def.controller_owner_ref(&())
        .expect("RBACDefinition read from the API server always has name and uid set")
}

/// True iff `existing` carries exactly the one-element owner-reference set
/// that `def` would stamp — deep equality, not subset containment, so that
/// jointly-owned objects are never mistaken for objects this controller
/// alone owns.
pub fn is_owned_by<K>(existing: &K, def: &RBACDefinition) -> bool
where
    K: ResourceExt,
{
    let expected = owner_reference(def);
    match existing.owner_references() {
        [single] => owner_refs_eq(single, &expected),
        _ => false,
    }
}

fn owner_refs_eq(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.api_version == b.api_version
        && a.kind == b.kind
        && a.name == b.name
        && a.uid == b.uid
        && a.controller == b.controller
        && a.block_owner_deletion == b.block_owner_deletion
}
