/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cli.rs
 *
 * The CLI surface (spec.md §6): one binary, subcommands for the two
 * cluster pipelines plus the cross-cluster `verify` and the per-cluster
 * maintenance commands (`destroy`, `suspend`/`resume`, `sync-secrets`,
 * `install-cilium`, and the external-task-runner passthroughs). Declarative,
 * struct-based `clap` definitions, matching the shape the corpus already
 * uses for its own CLI surface.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::ClusterId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Two-cluster bootstrap orchestrator.
#[derive(Parser, Debug)]
#[command(name = "orchestrator", author, version, about, long_about = None)]
pub struct Cli {
    /// Project root containing `configs/`, `infrastructure/`, `.env`, and
    /// `cacerts/`. Defaults to the current working directory.
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the storage-cluster pipeline.
    Nas {
        #[command(subcommand)]
        action: ClusterAction,
    },
    /// Run the compute-cluster pipeline.
    Homelab {
        #[command(subcommand)]
        action: ClusterAction,
    },
    /// Run the cross-cluster acceptance checks (§8).
    Verify,
    /// Strip finalizers from every non-system namespace and attempt
    /// deletion, without running the rest of the destroy pipeline.
    ForceCleanupNamespaces {
        /// Which cluster to clean up.
        #[arg(value_enum)]
        cluster: ClusterId,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClusterAction {
    /// Run prerequisite checks (delegated to an external task runner).
    Check,
    /// Run the declared bootstrap pipeline for this cluster.
    Install {
        /// Suppress the interactive TUI presentation layer, if any.
        #[arg(long)]
        no_tui: bool,
    },
    /// Read-only sync-status check.
    Validate,
    /// Run the destruction pipeline.
    Destroy,
    /// Delegate to the external task runner's `up` task.
    Up,
    /// Delegate to the external task runner's `status` task.
    Status,
    /// Delegate to the external task runner's `uninstall` task.
    Uninstall,
    /// Delegate to the external task runner's `vault-setup` task.
    VaultSetup,
    /// Suspend GitOps reconciliation for every known sync-unit kind.
    Suspend,
    /// Resume GitOps reconciliation and trigger an immediate reconcile.
    Resume,
    /// Rerun the secrets-setup step in isolation.
    SyncSecrets,
    /// Rerun the CNI-install step in isolation.
    InstallCilium,
}
