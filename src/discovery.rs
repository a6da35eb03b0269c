/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/discovery.rs
 *
 * Cluster discovery (C4): scans a priority-ordered list of candidate
 * kubeconfig paths, maps each discovered context name to a logical cluster
 * identity, and picks the preferred source when the same identity is found
 * more than once. There is no dynamic cluster registry here either — the
 * output is always keyed by `ClusterId::Nas` / `ClusterId::Homelab`.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::ClusterId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where a discovered kubeconfig record came from, used to break ties when
/// the same logical cluster appears in more than one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Unknown,
    UserDefault,
    PerCluster,
    Merged,
}

#[derive(Debug, Clone)]
pub struct DiscoveredCluster {
    pub id: ClusterId,
    pub context: Option<String>,
    pub path: PathBuf,
    pub source: Source,
}

/// Scans, in priority order: a merged kubeconfig at
/// `<root>/infrastructure/kubeconfig`, per-cluster kubeconfigs at
/// `<root>/infrastructure/<cluster>/kubeconfig.yaml`, explicit
/// `<CLUSTER>_KUBECONFIG_PATH`/`KUBECONFIG` environment overrides, then the
/// user's default kubeconfig (`~/.kube/config`). Later-found records for an
/// already-discovered identity only replace the existing one when the new
/// source outranks it (merged > per-cluster > user-default > unknown).
pub fn discover(project_root: &Path) -> BTreeMap<ClusterId, DiscoveredCluster> {
    let mut found: BTreeMap<ClusterId, DiscoveredCluster> = BTreeMap::new();

    let merged_path = project_root.join("infrastructure/kubeconfig");
    scan_path(&merged_path, Source::Merged, None, &mut found);

    for cluster in [ClusterId::Nas, ClusterId::Homelab] {
        let per_cluster_path = project_root
            .join("infrastructure")
            .join(cluster.as_str())
            .join("kubeconfig.yaml");
        scan_path(&per_cluster_path, Source::PerCluster, Some(cluster), &mut found);
    }

    for cluster in [ClusterId::Nas, ClusterId::Homelab] {
        let env_key = format!("{}_KUBECONFIG_PATH", cluster.as_str().to_uppercase());
        if let Ok(path) = std::env::var(&env_key) {
            scan_path(Path::new(&path), Source::PerCluster, Some(cluster), &mut found);
        }
    }

    if let Ok(path) = std::env::var("KUBECONFIG") {
        scan_path(Path::new(&path), Source::UserDefault, None, &mut found);
    }

    if let Some(home) = dirs_home() {
        scan_path(&home.join(".kube/config"), Source::UserDefault, None, &mut found);
    }

    found
}

/// Returns the kubeconfig path to use for `cluster`: the discovered record
/// if present, otherwise the per-cluster default layout path (which the
/// caller will then fail to read with a `ConfigError`, the expected
/// behavior when nothing was ever provisioned for that cluster).
pub fn resolve_path(project_root: &Path, cluster: ClusterId, discovered: &BTreeMap<ClusterId, DiscoveredCluster>) -> (PathBuf, Option<String>) {
    if let Some(record) = discovered.get(&cluster) {
        return (record.path.clone(), record.context.clone());
    }
    (
        project_root
            .join("infrastructure")
            .join(cluster.as_str())
            .join("kubeconfig.yaml"),
        None,
    )
}

fn scan_path(
    path: &Path,
    source: Source,
    forced_identity: Option<ClusterId>,
    found: &mut BTreeMap<ClusterId, DiscoveredCluster>,
) {
    let Ok(kubeconfig) = kube::config::Kubeconfig::read_from(path) else {
        return;
    };

    for context in &kubeconfig.contexts {
        let identity = forced_identity.or_else(|| ClusterId::from_context_name(&context.name));
        let Some(identity) = identity else {
            continue;
        };
        let candidate = DiscoveredCluster {
            id: identity,
            context: Some(context.name.clone()),
            path: path.to_path_buf(),
            source,
        };
        match found.get(&identity) {
            Some(existing) if existing.source >= source => continue,
            _ => {
                found.insert(identity, candidate);
            }
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_priority_orders_merged_highest() {
        assert!(Source::Merged > Source::PerCluster);
        assert!(Source::PerCluster > Source::UserDefault);
        assert!(Source::UserDefault > Source::Unknown);
    }

    #[test]
    fn resolve_path_falls_back_to_default_layout_when_undiscovered() {
        let root = Path::new("/tmp/project");
        let discovered = BTreeMap::new();
        let (path, context) = resolve_path(root, ClusterId::Nas, &discovered);
        assert_eq!(path, root.join("infrastructure/nas/kubeconfig.yaml"));
        assert!(context.is_none());
    }
}
