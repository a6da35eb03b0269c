/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/mesh/mod.rs
 *
 * The mesh coordinator (C6): root-CA reconciliation, cross-cluster
 * remote-secret exchange with deferred delivery, gateway TLS minting,
 * sidecar-injector webhook repoint, and gateway endpoint discovery with
 * variable publication. Split across two entry points per the two-phase
 * cross-cluster handshake: `ensure_prereqs` runs before the GitOps controller
 * has materialized anything, `finalize` runs after — gateway IPs don't exist
 * until the control plane is up.
 *
 * Grounded on `multi_cluster_orchestrator/src/cluster_manager.rs`'s
 * health-wait polling shape and `release_orchestrator/src/mesh/argo.rs`'s
 * external-tool-with-in-process-fallback pattern.
 *
 * SPDX-License-Identifier: Apache-2.0 */

pub mod cert;
pub mod endpoint;

use crate::client::{ClusterClient, FIELD_MANAGER};
use crate::cluster::ClusterId;
use crate::error::{is_not_found, Error, Result};
use crate::gitops::GitOpsClient;
use crate::secrets::SecretManager;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ServiceReference, WebhookClientConfig,
};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MESH_NAMESPACE: &str = "istio-system";
pub const CONTROL_PLANE_SERVICE: &str = "istiod";
const CACERTS_SECRET: &str = "cacerts";
const REMOTE_SECRET_PREFIX: &str = "istio-remote-secret";
const GATEWAY_SERVICE: &str = "istio-eastwestgateway";
const GATEWAY_CERTS_SECRET: &str = "istio-eastwestgateway-certs";
const SIDECAR_INJECTOR_WEBHOOK: &str = "istio-sidecar-injector";
const ZTUNNEL_DAEMONSET: &str = "ztunnel";

const DEPLOYMENT_WAIT: Duration = Duration::from_secs(300);
const DAEMONSET_WAIT: Duration = Duration::from_secs(300);

/// The mesh-enabled predicate: always true on the storage cluster, otherwise
/// driven by the cluster's config flag.
pub fn mesh_enabled(cluster: ClusterId, config_flag: Option<bool>) -> bool {
    cluster.is_storage() || config_flag.unwrap_or(false)
}

pub struct MeshCoordinator<'a> {
    local: &'a ClusterClient,
    peer: Option<&'a ClusterClient>,
    cluster: ClusterId,
    controller_namespace: String,
    cacerts_dir: PathBuf,
    fallback_hosts: Vec<String>,
    local_kubeconfig_path: PathBuf,
    local_context: Option<String>,
    peer_kubeconfig_path: Option<PathBuf>,
    peer_context: Option<String>,
}

impl<'a> MeshCoordinator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: &'a ClusterClient,
        peer: Option<&'a ClusterClient>,
        cluster: ClusterId,
        controller_namespace: impl Into<String>,
        cacerts_dir: PathBuf,
        fallback_hosts: Vec<String>,
        local_kubeconfig_path: PathBuf,
        local_context: Option<String>,
        peer_kubeconfig_path: Option<PathBuf>,
        peer_context: Option<String>,
    ) -> Self {
        Self {
            local,
            peer,
            cluster,
            controller_namespace: controller_namespace.into(),
            cacerts_dir,
            fallback_hosts,
            local_kubeconfig_path,
            local_context,
            peer_kubeconfig_path,
            peer_context,
        }
    }

    /// `ensureIstioPrereqs`: root-CA reconciliation, then remote-secret
    /// placement. Returns `Error::Mismatch` if the two clusters' CA
    /// fingerprints disagree; every other failure mode here is either
    /// best-effort (peer unreachable) or "await an external job" (no CA
    /// bundle yet).
    pub async fn ensure_prereqs(&self, secrets: &SecretManager<'_>) -> Result<()> {
        self.reconcile_root_ca().await?;
        self.place_remote_secrets(secrets).await
    }

    /// Rollback for `ensure_prereqs`: clears the peer's pending
    /// remote-secret marker only. The CA upsert is never rolled back —
    /// idempotent convergence is preferred over strict rollback here.
    pub async fn rollback_prereqs(&self, secrets: &SecretManager<'_>) -> Result<()> {
        secrets.clear_pending_remote_secret(self.cluster.peer()).await
    }

    async fn reconcile_root_ca(&self) -> Result<()> {
        let existing = self.local.get_secret(MESH_NAMESPACE, CACERTS_SECRET).await?;
        let bundle = match existing {
            Some(secret) => {
                let data = secret.data.unwrap_or_default();
                let root = data.get("root-cert.pem").map(|b| b.0.clone()).unwrap_or_default();
                let key = data.get("key.pem").map(|b| b.0.clone()).unwrap_or_default();
                if root.is_empty() || key.is_empty() {
                    tracing::warn!("cacerts incomplete in {}; awaiting external CA job", MESH_NAMESPACE);
                    return Ok(());
                }
                let chain = data.get("cert-chain.pem").map(|b| b.0.clone()).unwrap_or_default();
                (root, chain, key)
            }
            None => match self.read_cacerts_bundle()? {
                Some(bundle) => {
                    self.local.create_namespace(MESH_NAMESPACE).await?;
                    self.upsert_cacerts(self.local, &bundle).await?;
                    bundle
                }
                None => {
                    tracing::info!("no cacerts bundle on disk; awaiting external CA job");
                    return Ok(());
                }
            },
        };

        let local_fp = cert::fingerprint(&bundle.0);

        if let Some(peer) = self.peer {
            match peer.get_secret(MESH_NAMESPACE, CACERTS_SECRET).await {
                Ok(Some(peer_secret)) => {
                    let peer_root = peer_secret
                        .data
                        .as_ref()
                        .and_then(|d| d.get("root-cert.pem"))
                        .map(|b| b.0.clone())
                        .unwrap_or_default();
                    if !peer_root.is_empty() {
                        let peer_fp = cert::fingerprint(&peer_root);
                        if peer_fp != local_fp {
                            return Err(Error::Mismatch(format!(
                                "cacerts fingerprint mismatch: local={} peer={}",
                                local_fp, peer_fp
                            )));
                        }
                    }
                }
                Ok(None) => {
                    peer.create_namespace(MESH_NAMESPACE).await?;
                    self.upsert_cacerts(peer, &bundle).await?;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "peer unreachable during CA reconciliation; skipping comparison");
                }
            }
        }

        Ok(())
    }

    fn read_cacerts_bundle(&self) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>> {
        let dir = std::env::var("CACERTS_DIR").map(PathBuf::from).unwrap_or_else(|_| self.cacerts_dir.clone());
        let root_path = dir.join("root-cert.pem");
        let key_path = dir.join("key.pem");
        if !root_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        let root = std::fs::read(&root_path)?;
        let key = std::fs::read(&key_path)?;
        let chain = std::fs::read(dir.join("cert-chain.pem")).unwrap_or_default();
        Ok(Some((root, chain, key)))
    }

    async fn upsert_cacerts(&self, client: &ClusterClient, bundle: &(Vec<u8>, Vec<u8>, Vec<u8>)) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("root-cert.pem".to_string(), bundle.0.clone());
        data.insert("cert-chain.pem".to_string(), bundle.1.clone());
        data.insert("key.pem".to_string(), bundle.2.clone());
        client
            .create_or_update_secret(MESH_NAMESPACE, CACERTS_SECRET, data, None, None, None)
            .await
    }

    async fn place_remote_secrets(&self, secrets: &SecretManager<'_>) -> Result<()> {
        let peer_id = self.cluster.peer();

        let cached_key = format!("ISTIO_REMOTE_SECRET_{}_B64", peer_id.as_str().to_uppercase());
        if let Some(cached) = secrets.env_get(&cached_key) {
            if !cached.trim().is_empty() {
                match STANDARD.decode(cached.trim()).ok().and_then(|b| String::from_utf8(b).ok()) {
                    Some(yaml) => {
                        if let Err(e) = self.apply_yaml_secret(self.local, &yaml).await {
                            tracing::warn!(error = %e, "failed to apply cached peer remote-secret payload");
                        }
                    }
                    None => tracing::warn!("cached peer remote-secret payload is not valid base64/utf8"),
                }
            }
        }

        let (local_yaml, local_b64) = self
            .construct_remote_secret(self.cluster, &self.local_kubeconfig_path, self.local_context.as_deref())
            .await?;

        let local_key = format!("ISTIO_REMOTE_SECRET_{}_B64", self.cluster.as_str().to_uppercase());
        let mut kv = BTreeMap::new();
        kv.insert(local_key, local_b64.clone());
        secrets.update_generated_env(&kv)?;

        let peer_reachable = match self.peer {
            None => false,
            Some(p) => p.is_ready().await.is_ok(),
        };

        if !peer_reachable {
            secrets.store_pending_remote_secret(self.cluster, &local_b64).await?;
            return Ok(());
        }
        let peer = self.peer.expect("peer_reachable implies peer is Some");
        let peer_kubeconfig_path = self
            .peer_kubeconfig_path
            .as_ref()
            .ok_or_else(|| Error::PeerUnavailable("peer kubeconfig path missing".to_string()))?;

        let (peer_yaml, _peer_b64) = self
            .construct_remote_secret(peer_id, peer_kubeconfig_path, self.peer_context.as_deref())
            .await?;

        self.apply_yaml_secret(self.local, &peer_yaml).await?;
        self.apply_yaml_secret(peer, &local_yaml).await?;
        secrets.clear_pending_remote_secret(self.cluster).await
    }

    /// Builds the remote-secret YAML describing `describes`, preferring
    /// `istioctl x create-remote-secret` and falling back to an in-process
    /// `Secret` wrapping the trimmed kubeconfig bytes.
    async fn construct_remote_secret(
        &self,
        describes: ClusterId,
        kubeconfig_path: &Path,
        context: Option<&str>,
    ) -> Result<(String, String)> {
        let kubeconfig_bytes = std::fs::read(kubeconfig_path)?;
        let kubeconfig_trimmed = String::from_utf8_lossy(&kubeconfig_bytes).trim().to_string();

        let path_str = kubeconfig_path.to_string_lossy().to_string();
        let mut args = vec!["x", "create-remote-secret", "--kubeconfig", path_str.as_str(), "--name", describes.as_str()];
        if let Some(ctx) = context {
            args.push("--context");
            args.push(ctx);
        }

        let tool_output = if crate::external::is_available("istioctl") {
            crate::external::run("istioctl", &args).await.ok().filter(|s| !s.trim().is_empty())
        } else {
            None
        };

        let yaml = match tool_output {
            Some(output) => output,
            None => {
                let name = format!("{}-{}", REMOTE_SECRET_PREFIX, describes.as_str());
                let secret = json!({
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {
                        "name": name,
                        "namespace": MESH_NAMESPACE,
                        "labels": {"multiCluster": "true"},
                    },
                    "type": "Opaque",
                    "stringData": { describes.as_str(): kubeconfig_trimmed },
                });
                serde_yaml::to_string(&secret)?
            }
        };

        let b64 = STANDARD.encode(yaml.as_bytes());
        Ok((yaml, b64))
    }

    async fn apply_yaml_secret(&self, client: &ClusterClient, yaml: &str) -> Result<()> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        let secret: k8s_openapi::api::core::v1::Secret = serde_json::from_value(value)
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid remote-secret manifest: {}", e)))?;
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("remote-secret manifest missing metadata.name")))?;
        let api: Api<k8s_openapi::api::core::v1::Secret> = Api::namespaced(client.inner().clone(), MESH_NAMESPACE);
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    /// `finalizeIstioMesh`: gateway TLS ensure, webhook repoint, endpoint
    /// discovery and publication, downstream reconcile trigger, infra wait.
    pub async fn finalize(
        &self,
        secrets: &SecretManager<'_>,
        gitops: &GitOpsClient<'_>,
        downstream_sync_units: &[String],
    ) -> Result<()> {
        self.ensure_gateway_tls(secrets).await?;
        self.repoint_sidecar_injector_webhook().await?;

        let local_endpoint = endpoint::discover(self.local, MESH_NAMESPACE, GATEWAY_SERVICE, &self.fallback_hosts).await?;
        let peer_endpoint = match self.peer {
            Some(peer) => match endpoint::discover(peer, MESH_NAMESPACE, GATEWAY_SERVICE, &self.fallback_hosts).await {
                Ok(ep) => Some(ep),
                Err(e) => {
                    tracing::warn!(error = %e, "peer gateway endpoint discovery failed (best-effort)");
                    None
                }
            },
            None => None,
        };

        let mut kv = BTreeMap::new();
        kv.insert(
            format!("{}_EW_GATEWAY_ADDR", self.cluster.as_str().to_uppercase()),
            local_endpoint.host.clone(),
        );
        kv.insert(
            format!("{}_EW_GATEWAY_PORT", self.cluster.as_str().to_uppercase()),
            local_endpoint.port.to_string(),
        );
        if let Some(ep) = &peer_endpoint {
            let peer_id = self.cluster.peer();
            kv.insert(format!("{}_EW_GATEWAY_ADDR", peer_id.as_str().to_uppercase()), ep.host.clone());
            kv.insert(format!("{}_EW_GATEWAY_PORT", peer_id.as_str().to_uppercase()), ep.port.to_string());
        }

        secrets.update_cluster_vars(&self.controller_namespace, &kv).await?;
        secrets.update_generated_env(&kv)?;

        for unit in downstream_sync_units {
            if let Err(e) = gitops.trigger_reconcile(&self.controller_namespace, unit).await {
                tracing::warn!(error = %e, unit, "failed to trigger reconcile for downstream sync unit");
            }
        }

        self.local.wait_for_deployment(MESH_NAMESPACE, CONTROL_PLANE_SERVICE, DEPLOYMENT_WAIT).await?;
        self.local.wait_for_deployment(MESH_NAMESPACE, GATEWAY_SERVICE, DEPLOYMENT_WAIT).await?;
        if let Err(e) = self.local.wait_for_daemonset(MESH_NAMESPACE, ZTUNNEL_DAEMONSET, DAEMONSET_WAIT).await {
            tracing::warn!(error = %e, "ztunnel daemonset not ready (downgraded to warning)");
        }

        Ok(())
    }

    async fn ensure_gateway_tls(&self, secrets: &SecretManager<'_>) -> Result<()> {
        let cert_b64 = secrets.env_get("EASTWEST_CERT_B64");
        let key_b64 = secrets.env_get("EASTWEST_KEY_B64");

        let (cert_pem, key_pem) = match (cert_b64, key_b64) {
            (Some(c), Some(k)) if !c.trim().is_empty() && !k.trim().is_empty() => {
                let cert_bytes = STANDARD
                    .decode(c.trim())
                    .map_err(|e| Error::Other(anyhow::anyhow!("invalid EASTWEST_CERT_B64: {}", e)))?;
                let key_bytes = STANDARD
                    .decode(k.trim())
                    .map_err(|e| Error::Other(anyhow::anyhow!("invalid EASTWEST_KEY_B64: {}", e)))?;
                let cert = String::from_utf8(cert_bytes)
                    .map_err(|e| Error::Other(anyhow::anyhow!("EASTWEST_CERT_B64 is not valid utf8: {}", e)))?;
                let key = String::from_utf8(key_bytes)
                    .map_err(|e| Error::Other(anyhow::anyhow!("EASTWEST_KEY_B64 is not valid utf8: {}", e)))?;
                (cert, key)
            }
            _ => {
                if !self.cluster.is_storage() {
                    return Ok(());
                }
                let cn = secrets
                    .env_get("EASTWEST_CERT_CN")
                    .unwrap_or_else(|| format!("{}.{}.svc", CONTROL_PLANE_SERVICE, MESH_NAMESPACE));
                let minted = cert::mint_gateway_cert(&cn, CONTROL_PLANE_SERVICE, MESH_NAMESPACE)?;
                let mut kv = BTreeMap::new();
                kv.insert("EASTWEST_CERT_B64".to_string(), STANDARD.encode(minted.cert_pem.as_bytes()));
                kv.insert("EASTWEST_KEY_B64".to_string(), STANDARD.encode(minted.key_pem.as_bytes()));
                secrets.update_generated_env(&kv)?;
                (minted.cert_pem, minted.key_pem)
            }
        };

        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), cert_pem.into_bytes());
        data.insert("tls.key".to_string(), key_pem.into_bytes());
        self.local
            .create_or_update_secret(
                MESH_NAMESPACE,
                GATEWAY_CERTS_SECRET,
                data,
                Some("kubernetes.io/tls".to_string()),
                None,
                None,
            )
            .await
    }

    async fn repoint_sidecar_injector_webhook(&self) -> Result<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.local.inner().clone());
        let mwc = match api.get(SIDECAR_INJECTOR_WEBHOOK).await {
            Ok(mwc) => mwc,
            Err(e) if is_not_found(&e) => {
                tracing::debug!("sidecar-injector webhook not found; skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let target = ServiceReference {
            name: CONTROL_PLANE_SERVICE.to_string(),
            namespace: MESH_NAMESPACE.to_string(),
            path: Some("/inject".to_string()),
            port: Some(443),
        };

        let mut webhooks = mwc.webhooks.unwrap_or_default();
        let mut changed = false;
        for webhook in webhooks.iter_mut() {
            if rewrite_webhook_client_config(&mut webhook.client_config, &target) {
                changed = true;
            }
        }

        if changed {
            let patch = json!({"webhooks": webhooks});
            api.patch(SIDECAR_INJECTOR_WEBHOOK, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }
}

/// Rewrites a single webhook's `clientConfig` to point at `target`, clearing
/// any URL form. Returns `true` iff a change was made.
fn rewrite_webhook_client_config(client_config: &mut WebhookClientConfig, target: &ServiceReference) -> bool {
    let needs_rewrite = match &client_config.url {
        Some(url) if !url.is_empty() => true,
        _ => !matches!(&client_config.service, Some(svc) if svc == target),
    };
    if needs_rewrite {
        client_config.url = None;
        client_config.service = Some(target.clone());
    }
    needs_rewrite
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ServiceReference {
        ServiceReference {
            name: "istiod".to_string(),
            namespace: "istio-system".to_string(),
            path: Some("/inject".to_string()),
            port: Some(443),
        }
    }

    #[test]
    fn rewrite_clears_url_and_sets_service() {
        let mut client_config = WebhookClientConfig {
            url: Some("https://x".to_string()),
            service: None,
            ca_bundle: None,
        };
        let changed = rewrite_webhook_client_config(&mut client_config, &target());
        assert!(changed);
        assert!(client_config.url.is_none());
        assert_eq!(client_config.service, Some(target()));
    }

    #[test]
    fn rewrite_is_noop_when_already_correct() {
        let mut client_config = WebhookClientConfig {
            url: None,
            service: Some(target()),
            ca_bundle: None,
        };
        assert!(!rewrite_webhook_client_config(&mut client_config, &target()));
    }

    #[test]
    fn rewrite_fixes_a_mismatched_service_reference() {
        let mut client_config = WebhookClientConfig {
            url: None,
            service: Some(ServiceReference {
                name: "old-ctrl".to_string(),
                namespace: "old-ns".to_string(),
                path: Some("/inject".to_string()),
                port: Some(443),
            }),
            ca_bundle: None,
        };
        assert!(rewrite_webhook_client_config(&mut client_config, &target()));
        assert_eq!(client_config.service, Some(target()));
    }

    #[test]
    fn mesh_enabled_is_always_true_for_storage_cluster() {
        assert!(mesh_enabled(ClusterId::Nas, Some(false)));
        assert!(!mesh_enabled(ClusterId::Homelab, None));
        assert!(mesh_enabled(ClusterId::Homelab, Some(true)));
    }
}
