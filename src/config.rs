/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/config.rs
 *
 * Declarative per-cluster configuration, loaded from
 * `<projectRoot>/configs/{nas,homelab}.yaml`. This is a thin, validated
 * wrapper: the orchestrator core consumes it but does not design its
 * schema beyond what it needs (kubeconfig location, fallback hosts, git
 * coordinates, downstream sync units).
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::cluster::ClusterId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_sync_path")]
    pub path: String,
    /// Name of an environment variable holding a Git access token, if the
    /// repository requires authentication.
    pub token_env: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_sync_path() -> String {
    "./".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub kubeconfig_path: PathBuf,
    pub context: Option<String>,
    #[serde(default)]
    pub fallback_hosts: Vec<String>,
    /// Only meaningful for `homelab`; `nas` is always mesh-enabled.
    #[serde(default)]
    pub mesh_enabled: Option<bool>,
    pub git: GitConfig,
    #[serde(default)]
    pub downstream_sync_units: Vec<String>,
}

impl ClusterConfig {
    pub fn load(project_root: &Path, cluster: ClusterId) -> Result<Self> {
        let path = project_root
            .join("configs")
            .join(format!("{}.yaml", cluster.as_str()));
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ClusterConfig = serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate(cluster)?;
        Ok(config)
    }

    fn validate(&self, cluster: ClusterId) -> Result<()> {
        if self.kubeconfig_path.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "cluster '{}': kubeconfigPath must not be empty",
                cluster
            )));
        }
        if self.git.url.trim().is_empty() {
            return Err(Error::Config(format!(
                "cluster '{}': git.url must not be empty",
                cluster
            )));
        }
        Ok(())
    }

    /// Mesh is always enabled on the storage cluster; on the compute
    /// cluster it is driven by the config flag (default disabled).
    pub fn mesh_enabled(&self, cluster: ClusterId) -> bool {
        crate::mesh::mesh_enabled(cluster, self.mesh_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_parses_minimal_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("configs")).unwrap();
        let mut f = std::fs::File::create(dir.path().join("configs/nas.yaml")).unwrap();
        writeln!(
            f,
            "kubeconfigPath: /tmp/kubeconfig.yaml\ngit:\n  url: https://example.invalid/repo.git\n"
        )
        .unwrap();

        let cfg = ClusterConfig::load(dir.path(), ClusterId::Nas).unwrap();
        assert_eq!(cfg.git.branch, "main");
        assert!(cfg.mesh_enabled(ClusterId::Nas));
    }

    #[test]
    fn load_rejects_missing_git_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("configs")).unwrap();
        let mut f = std::fs::File::create(dir.path().join("configs/homelab.yaml")).unwrap();
        writeln!(f, "kubeconfigPath: /tmp/kubeconfig.yaml\ngit:\n  url: \"\"\n").unwrap();

        let err = ClusterConfig::load(dir.path(), ClusterId::Homelab).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn mesh_disabled_by_default_on_homelab() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("configs")).unwrap();
        let mut f = std::fs::File::create(dir.path().join("configs/homelab.yaml")).unwrap();
        writeln!(
            f,
            "kubeconfigPath: /tmp/kubeconfig.yaml\ngit:\n  url: https://example.invalid/repo.git\n"
        )
        .unwrap();

        let cfg = ClusterConfig::load(dir.path(), ClusterId::Homelab).unwrap();
        assert!(!cfg.mesh_enabled(ClusterId::Homelab));
    }
}
