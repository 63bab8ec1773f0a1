/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/telemetry.rs
*
* Structured logging setup via `tracing-subscriber`. No OpenTelemetry/Jaeger
* export here: unlike the preview/DR controllers this codebase also runs,
* RBACDefinition reconciliation has no inbound HTTP request to propagate a
* trace context from, so a local span tree with no exporter is all that's
* useful.
*
* SPDX-License-Identifier: Apache-2.0
*/

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
