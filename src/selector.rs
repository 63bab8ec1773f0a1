/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/selector.rs
*
* Namespace Selector (component C1). Resolves a Kubernetes `LabelSelector`
* against a live namespace list. Kept a pure function over a caller-supplied
* namespace slice so it is directly unit-testable and so `crate::parser` can
* call it without owning an API client.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label selector requirement for key '{0}' has unknown operator '{1}'")]
    UnknownOperator(String, String),

    #[error("label selector requirement for key '{0}' with operator '{1}' requires at least one value")]
    MissingValues(String, String),
}

/// True when the selector has neither `matchLabels` nor `matchExpressions`.
/// Per the namespace-selector contract, such a selector is invalid input and
/// matches nothing — it is never treated as "select all namespaces".
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(BTreeMap::is_empty)
        && selector.match_expressions.as_ref().is_none_or(Vec::is_empty)
}

/// Resolves `selector` against `namespaces`, returning the matching
/// namespace names in the order they appear in `namespaces`.
pub fn select_namespaces<'a>(
    selector: &LabelSelector,
    namespaces: &'a [Namespace],
) -> Result<Vec<&'a str>, SelectorError> {
    if is_empty(selector) {
        return Ok(Vec::new());
    }

    let mut matched = Vec::new();
    for ns in namespaces {
        let empty = BTreeMap::new();
        let labels = ns.metadata.labels.as_ref().unwrap_or(&empty);
        if matches(selector, labels)? {
            if let Some(name) = ns.metadata.name.as_deref() {
                matched.push(name);
            }
        }
    }
    Ok(matched)
}

/// Evaluates a single `LabelSelector` against a label map. `matchLabels` and
/// `matchExpressions` are implicitly AND-ed together, per Kubernetes
/// selector semantics.
pub fn matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            if !evaluate_expression(expr, labels)? {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn evaluate_expression(
    expr: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    let key = &expr.key;
    match expr.operator.as_str() {
        "In" => {
            let values = expr
                .values
                .as_ref()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SelectorError::MissingValues(key.clone(), expr.operator.clone()))?;
            Ok(labels.get(key).is_some_and(|v| values.contains(v)))
        }
        "NotIn" => {
            let values = expr
                .values
                .as_ref()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SelectorError::MissingValues(key.clone(), expr.operator.clone()))?;
            Ok(!labels.get(key).is_some_and(|v| values.contains(v)))
        }
        "Exists" => Ok(labels.contains_key(key)),
        "DoesNotExist" => Ok(!labels.contains_key(key)),
        other => Err(SelectorError::UnknownOperator(key.clone(), other.to_string())),
    }
}
