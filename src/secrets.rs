/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/secrets.rs
 *
 * The secret manager (C3). Materializes the `cluster-vars` Secret from the
 * merged env (base + generated + built-in defaults) and owns the mesh
 * "pending" remote-secret markers. Every write here is an idempotent upsert;
 * nothing in this file ever deletes `cluster-vars` itself.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::client::ClusterClient;
use crate::cluster::ClusterId;
use crate::envstore::{self, EnvStore};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;

pub const CLUSTER_VARS_SECRET: &str = "cluster-vars";
const UPDATE_CLUSTER_VARS_TIMEOUT: Duration = Duration::from_secs(30);

/// The secret-reflector annotation pair, shared by every reflected Secret
/// this crate writes (`cluster-vars`, the transit-unseal token).
pub fn reflector_annotations() -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert("reflection-allowed".to_string(), "true".to_string());
    annotations.insert("reflection-auto-enabled".to_string(), "true".to_string());
    annotations
}

pub struct SecretManager<'a> {
    client: &'a ClusterClient,
    base: &'a EnvStore,
    generated: &'a EnvStore,
    cluster: ClusterId,
    mesh_namespace: String,
}

impl<'a> SecretManager<'a> {
    pub fn new(
        client: &'a ClusterClient,
        base: &'a EnvStore,
        generated: &'a EnvStore,
        cluster: ClusterId,
        mesh_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base,
            generated,
            cluster,
            mesh_namespace: mesh_namespace.into(),
        }
    }

    fn reflector_annotations(&self) -> BTreeMap<String, String> {
        reflector_annotations()
    }

    /// Upserts `cluster-vars` in `namespace` from the merged env.
    pub async fn create_cluster_vars(&self, namespace: &str) -> Result<()> {
        let merged = envstore::merge(self.base, self.generated, self.cluster);
        let data: BTreeMap<String, Vec<u8>> = merged
            .into_iter()
            .map(|(k, v)| (k, v.into_bytes()))
            .collect();

        self.client
            .create_or_update_secret(
                namespace,
                CLUSTER_VARS_SECRET,
                data,
                None,
                None,
                Some(self.reflector_annotations()),
            )
            .await?;
        tracing::info!(namespace, "cluster-vars upserted");
        Ok(())
    }

    /// Read-modify-write merge of `kv` into the existing `cluster-vars`
    /// Secret's `data`, bounded to 30s. If the secret doesn't exist yet,
    /// delegates to `create_cluster_vars` (which already includes the
    /// merged env, so `kv` is folded in by writing it to `generated` first).
    pub async fn update_cluster_vars(&self, namespace: &str, kv: &BTreeMap<String, String>) -> Result<()> {
        tokio::time::timeout(UPDATE_CLUSTER_VARS_TIMEOUT, self.update_cluster_vars_inner(namespace, kv))
            .await
            .map_err(|_| Error::Timeout(format!("update_cluster_vars on {} timed out", namespace)))?
    }

    async fn update_cluster_vars_inner(&self, namespace: &str, kv: &BTreeMap<String, String>) -> Result<()> {
        let existing = self.client.get_secret(namespace, CLUSTER_VARS_SECRET).await?;
        let Some(existing) = existing else {
            return self.create_cluster_vars(namespace).await;
        };

        let mut data: BTreeMap<String, Vec<u8>> = existing
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        for (k, v) in kv {
            data.insert(k.clone(), v.clone().into_bytes());
        }

        self.client
            .create_or_update_secret(
                namespace,
                CLUSTER_VARS_SECRET,
                data,
                existing.type_,
                existing.metadata.labels,
                Some(self.reflector_annotations()),
            )
            .await?;
        Ok(())
    }

    fn pending_secret_name(cluster: ClusterId) -> String {
        format!("istio-remote-secret-{}-pending", cluster.as_str())
    }

    /// Upserts (or, if `payload_b64` is empty, deletes) the `-pending`
    /// marker for `cluster` in the local mesh namespace.
    pub async fn store_pending_remote_secret(&self, cluster: ClusterId, payload_b64: &str) -> Result<()> {
        let name = Self::pending_secret_name(cluster);
        if payload_b64.is_empty() {
            return self.clear_pending_remote_secret(cluster).await;
        }
        let mut data = BTreeMap::new();
        data.insert("payload".to_string(), payload_b64.as_bytes().to_vec());
        self.client
            .create_or_update_secret(&self.mesh_namespace, &name, data, None, None, None)
            .await?;
        Ok(())
    }

    /// Returns `""` on not-found, never an error — callers treat an absent
    /// pending marker the same as an empty one.
    pub async fn fetch_pending_remote_secret(&self, cluster: ClusterId) -> Result<String> {
        let name = Self::pending_secret_name(cluster);
        match self.client.get_secret(&self.mesh_namespace, &name).await? {
            Some(secret) => {
                let payload = secret
                    .data
                    .and_then(|mut d| d.remove("payload"))
                    .map(|b| String::from_utf8_lossy(&b.0).into_owned())
                    .unwrap_or_default();
                Ok(payload)
            }
            None => Ok(String::new()),
        }
    }

    pub async fn clear_pending_remote_secret(&self, cluster: ClusterId) -> Result<()> {
        let name = Self::pending_secret_name(cluster);
        let api: kube::Api<k8s_openapi::api::core::v1::Secret> =
            kube::Api::namespaced(self.client.inner().clone(), &self.mesh_namespace);
        match api.delete(&name, &kube::api::DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if crate::error::is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delegates to the generated env store; a no-op for an empty batch, and
    /// always persists after applying every change (no batch deferral).
    pub fn update_generated_env(&self, kv: &BTreeMap<String, String>) -> Result<()> {
        self.generated.set_all(kv)?;
        Ok(())
    }

    /// Reads an ad hoc side-channel key (e.g. `EASTWEST_CERT_B64`,
    /// `ISTIO_REMOTE_SECRET_<CLUSTER>_B64`): generated wins, base is the
    /// fallback.
    pub fn env_get(&self, key: &str) -> Option<String> {
        self.generated.get(key).or_else(|| self.base.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_secret_name_is_suffixed_per_cluster() {
        assert_eq!(
            SecretManager::pending_secret_name(ClusterId::Nas),
            "istio-remote-secret-nas-pending"
        );
        assert_eq!(
            SecretManager::pending_secret_name(ClusterId::Homelab),
            "istio-remote-secret-homelab-pending"
        );
    }
}
