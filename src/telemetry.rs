/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/telemetry.rs
 *
 * Structured logging initialization. Unlike `ph_operator`'s long-running
 * controller manager, this process has no span collector to export to, so
 * `init_telemetry` here is trimmed down to `tracing-subscriber`'s `EnvFilter`
 * plus a human-readable formatter. There is no `Uninstall` guard to return:
 * nothing needs a clean shutdown handshake on a one-shot CLI.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global `tracing` subscriber. Respects `RUST_LOG`; falls
/// back to `info` level for the orchestrator's own crate and `warn` for
/// dependencies, so a default run isn't drowned in `kube`/`tower` chatter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,orchestrator=info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok();
}
