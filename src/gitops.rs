/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/gitops.rs
 *
 * The GitOps client (C5). Installs the CD controller (a GitOps toolkit
 * deployment: source, kustomize, helm and notification controllers, plus
 * image-reflector/image-automation extras), creates the root sync unit pair
 * (a Git source plus a Kustomization bound to it) and child sync units,
 * triggers on-demand reconciliation, and reads/mutates suspend state.
 *
 * Manifest application follows the same server-side-apply-over-a-dynamic-
 * discovered-GVK shape used throughout the corpus
 * (`k8s_sync_manager/src/apply.rs`, `controllers/gitsync_controller.rs`):
 * deserialize YAML/JSON into a `DynamicObject`, resolve its GVK against
 * cluster discovery, patch with `Patch::Apply` under the crate's field
 * manager.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::client::{ClusterClient, FIELD_MANAGER};
use crate::config::GitConfig;
use crate::error::{swallow_already_exists, Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const RECONCILE_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";
pub const ROOT_SOURCE_NAME: &str = "flux-system";
pub const ROOT_KUSTOMIZATION_NAME: &str = "flux-system";
/// Namespace the CD controller (and its root sync unit pair) lives in.
pub const CONTROLLER_NAMESPACE: &str = "flux-system";

const SOURCE_GVK_GIT_REPOSITORY: (&str, &str, &str) = ("source.toolkit.fluxcd.io", "v1", "GitRepository");
const KUSTOMIZATION_GVK: (&str, &str, &str) = ("kustomize.toolkit.fluxcd.io", "v1", "Kustomization");
const HELMRELEASE_GVK: (&str, &str, &str) = ("helm.toolkit.fluxcd.io", "v2", "HelmRelease");

/// One controller Deployment this client installs and waits on. `name` is
/// both the Deployment name and, combined with `namespace`, the readiness
/// target `Install` blocks on.
const CONTROLLER_DEPLOYMENTS: &[&str] = &[
    "source-controller",
    "kustomize-controller",
    "helm-controller",
    "notification-controller",
    "image-reflector-controller",
    "image-automation-controller",
];

/// Group/version/resource triples whose finalizers are stripped during the
/// pre-install cleanup pass, covering the controller's source, kustomize,
/// helm, notification and image groups.
const CLEANUP_GVKS: &[(&str, &str, &str)] = &[
    ("source.toolkit.fluxcd.io", "v1", "GitRepository"),
    ("source.toolkit.fluxcd.io", "v1", "HelmRepository"),
    ("source.toolkit.fluxcd.io", "v1", "HelmChart"),
    ("source.toolkit.fluxcd.io", "v1", "Bucket"),
    ("kustomize.toolkit.fluxcd.io", "v1", "Kustomization"),
    ("helm.toolkit.fluxcd.io", "v2", "HelmRelease"),
    ("notification.toolkit.fluxcd.io", "v1beta3", "Provider"),
    ("notification.toolkit.fluxcd.io", "v1beta3", "Alert"),
    ("image.toolkit.fluxcd.io", "v1beta2", "ImageRepository"),
    ("image.toolkit.fluxcd.io", "v1beta2", "ImagePolicy"),
    ("image.toolkit.fluxcd.io", "v1beta1", "ImageUpdateAutomation"),
];

pub struct GitOpsClient<'a> {
    client: &'a ClusterClient,
}

impl<'a> GitOpsClient<'a> {
    pub fn new(client: &'a ClusterClient) -> Self {
        Self { client }
    }

    /// Installs the CD controller into `namespace`: best-effort cleanup of a
    /// prior install, namespace creation, default manifest apply, and a
    /// readiness wait per controller Deployment.
    pub async fn install(&self, namespace: &str) -> Result<()> {
        self.cleanup_prior_install(namespace).await;

        self.client.create_namespace(namespace).await?;

        for manifest in self.render_install_manifests(namespace) {
            self.apply_value(&manifest, Some(namespace)).await?;
        }

        for deployment in CONTROLLER_DEPLOYMENTS {
            self.client
                .wait_for_deployment(namespace, deployment, Duration::from_secs(300))
                .await?;
        }
        Ok(())
    }

    /// Best-effort: strip finalizers from every known CD resource kind, then
    /// if the controller namespace is `Terminating`, strip its own
    /// finalizers and wait up to 30s for it to vanish. Any failure here is
    /// swallowed — a fresh install on a namespace that was never previously
    /// installed has nothing to clean up.
    async fn cleanup_prior_install(&self, namespace: &str) {
        for (group, version, kind) in CLEANUP_GVKS {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            if let Ok((api, _)) = self.client.dynamic_api(&gvk, Some(namespace)).await {
                if let Ok(list) = api.list(&Default::default()).await {
                    for obj in list.items {
                        let name = obj.name_any();
                        let _ = strip_finalizers_dynamic(&api, &name).await;
                    }
                }
            }
        }

        let ns_api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(self.client.inner().clone());
        if let Ok(ns) = ns_api.get(namespace).await {
            let terminating = ns
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|p| p == "Terminating")
                .unwrap_or(false);
            if terminating {
                let patch = json!({"metadata": {"finalizers": null}});
                let _ = ns_api
                    .patch(namespace, &PatchParams::default(), &Patch::Merge(&patch))
                    .await;
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                while tokio::time::Instant::now() < deadline {
                    if ns_api.get(namespace).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    fn render_install_manifests(&self, namespace: &str) -> Vec<Value> {
        CONTROLLER_DEPLOYMENTS
            .iter()
            .map(|name| {
                json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {
                        "name": name,
                        "namespace": namespace,
                        "labels": {"app.kubernetes.io/part-of": "flux"}
                    },
                    "spec": {
                        "replicas": 1,
                        "selector": {"matchLabels": {"app": name}},
                        "template": {
                            "metadata": {"labels": {"app": name}},
                            "spec": {
                                "containers": [{
                                    "name": name,
                                    "image": format!("ghcr.io/fluxcd/{}:latest", name),
                                }]
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Creates the root sync unit pair: a `GitRepository` bound to
    /// `git.url`/`git.branch` (with an optional secret reference if a token
    /// is configured) and a `Kustomization` pointing at `git.path`. Polls
    /// the `GitRepository` for a `Ready=True` condition with a 5-minute
    /// budget.
    pub async fn bootstrap(&self, namespace: &str, git: &GitConfig) -> Result<()> {
        let mut source_spec = json!({
            "interval": "1m",
            "url": git.url,
            "ref": {"branch": git.branch},
        });

        if let Some(token_env) = &git.token_env {
            if let Ok(token) = std::env::var(token_env) {
                self.create_git_credentials_secret(namespace, &token).await?;
                source_spec["secretRef"] = json!({"name": "flux-system"});
            }
        }

        let git_repository = json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "GitRepository",
            "metadata": {"name": ROOT_SOURCE_NAME, "namespace": namespace},
            "spec": source_spec,
        });
        self.apply_value(&git_repository, Some(namespace)).await?;

        let kustomization = json!({
            "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
            "kind": "Kustomization",
            "metadata": {"name": ROOT_KUSTOMIZATION_NAME, "namespace": namespace},
            "spec": {
                "interval": "5m",
                "path": git.path,
                "prune": true,
                "sourceRef": {"kind": "GitRepository", "name": ROOT_SOURCE_NAME},
            },
        });
        self.apply_value(&kustomization, Some(namespace)).await?;

        self.wait_for_source_ready(namespace, ROOT_SOURCE_NAME, Duration::from_secs(300))
            .await
    }

    async fn create_git_credentials_secret(&self, namespace: &str, token: &str) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("username".to_string(), b"git".to_vec());
        data.insert("password".to_string(), token.as_bytes().to_vec());
        self.client
            .create_or_update_secret(namespace, "flux-system", data, Some("Opaque".to_string()), None, None)
            .await
    }

    async fn wait_for_source_ready(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let gvk = GroupVersionKind::gvk(
            SOURCE_GVK_GIT_REPOSITORY.0,
            SOURCE_GVK_GIT_REPOSITORY.1,
            SOURCE_GVK_GIT_REPOSITORY.2,
        );
        let (api, _) = self.client.dynamic_api(&gvk, Some(namespace)).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(obj) = api.get(name).await {
                if is_ready_condition_true(&obj) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "GitRepository {}/{} never became Ready within {:?}",
                    namespace, name, timeout
                )));
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    /// Creates the cluster-type-specific child `Kustomization` that
    /// downstream steps reconcile, pointing at the per-cluster platform
    /// foundation path under the root source.
    pub async fn bootstrap_platform_foundation(&self, namespace: &str, cluster_type: &str) -> Result<()> {
        let name = format!("platform-foundation-{}", cluster_type);
        let kustomization = json!({
            "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
            "kind": "Kustomization",
            "metadata": {"name": name, "namespace": namespace},
            "spec": {
                "interval": "5m",
                "path": format!("./clusters/{}", cluster_type),
                "prune": true,
                "sourceRef": {"kind": "GitRepository", "name": ROOT_SOURCE_NAME},
                "dependsOn": [{"name": ROOT_KUSTOMIZATION_NAME}],
            },
        });
        self.apply_value(&kustomization, Some(namespace)).await
    }

    /// Forces a fresh sync by annotating the named `GitRepository` with
    /// `reconcile.fluxcd.io/requestedAt = <RFC3339 now>`.
    pub async fn trigger_reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let gvk = GroupVersionKind::gvk(
            SOURCE_GVK_GIT_REPOSITORY.0,
            SOURCE_GVK_GIT_REPOSITORY.1,
            SOURCE_GVK_GIT_REPOSITORY.2,
        );
        let (api, _) = self.client.dynamic_api(&gvk, Some(namespace)).await?;
        let now = chrono::Utc::now().to_rfc3339();
        let patch = json!({"metadata": {"annotations": {RECONCILE_ANNOTATION: now}}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    /// Sets `spec.suspend` across every known sync kind: namespace-scoped in
    /// the controller namespace for `GitRepository`, cluster-wide for
    /// `Kustomization`/`HelmRelease`.
    pub async fn suspend_reconciliation(&self, namespace: &str) -> Result<()> {
        self.set_suspend(namespace, true).await
    }

    /// Unsuspends every sync kind, then annotates the root source to trigger
    /// an immediate reconcile rather than waiting for its poll interval.
    pub async fn resume_reconciliation(&self, namespace: &str) -> Result<()> {
        self.set_suspend(namespace, false).await?;
        self.trigger_reconcile(namespace, ROOT_SOURCE_NAME).await
    }

    async fn set_suspend(&self, namespace: &str, suspend: bool) -> Result<()> {
        let patch = json!({"spec": {"suspend": suspend}});

        let gvk = GroupVersionKind::gvk(
            SOURCE_GVK_GIT_REPOSITORY.0,
            SOURCE_GVK_GIT_REPOSITORY.1,
            SOURCE_GVK_GIT_REPOSITORY.2,
        );
        if let Ok((api, _)) = self.client.dynamic_api(&gvk, Some(namespace)).await {
            if let Ok(list) = api.list(&Default::default()).await {
                for obj in list.items {
                    let _ = api
                        .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                        .await;
                }
            }
        }

        for (group, version, kind) in [KUSTOMIZATION_GVK, HELMRELEASE_GVK] {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            if let Ok((api, _)) = self.client.dynamic_api(&gvk, None).await {
                if let Ok(list) = api.list(&Default::default()).await {
                    for obj in list.items {
                        let _ = api
                            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Read-only: the namespace exists and every controller Deployment
    /// exists ⇒ Ready; otherwise a descriptive, non-fatal message.
    pub async fn get_sync_status(&self, namespace: &str) -> Result<SyncStatus> {
        let ns_api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(self.client.inner().clone());
        if ns_api.get(namespace).await.is_err() {
            return Ok(SyncStatus {
                ready: false,
                message: format!("namespace {} does not exist", namespace),
            });
        }

        let deployments: Api<Deployment> = Api::namespaced(self.client.inner().clone(), namespace);
        for name in CONTROLLER_DEPLOYMENTS {
            if deployments.get(name).await.is_err() {
                return Ok(SyncStatus {
                    ready: false,
                    message: format!("controller deployment {} is missing", name),
                });
            }
        }
        Ok(SyncStatus {
            ready: true,
            message: "all controller deployments present".to_string(),
        })
    }

    async fn apply_value(&self, value: &Value, namespace: Option<&str>) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(value.clone())
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid manifest: {}", e)))?;
        let gvk = obj
            .types
            .as_ref()
            .and_then(|t| GroupVersionKind::try_from(t).ok())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("manifest missing apiVersion/kind")))?;
        let name = obj.name_any();

        let retry_deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            match self.client.dynamic_api(&gvk, namespace).await {
                Ok((api, _)) => {
                    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
                        .await?;
                    return Ok(());
                }
                Err(_) if tokio::time::Instant::now() < retry_deadline => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn strip_finalizers_dynamic(api: &Api<DynamicObject>, name: &str) -> Result<()> {
    let patch = json!({"metadata": {"finalizers": null}});
    match api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
        Ok(_) => Ok(()),
        Err(e) => swallow_already_exists(e),
    }
}

fn is_ready_condition_true(obj: &DynamicObject) -> bool {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

pub struct SyncStatus {
    pub ready: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn is_ready_condition_true_detects_ready_condition() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "GitRepository",
            "metadata": {"name": "flux-system"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }))
        .unwrap();
        assert!(is_ready_condition_true(&obj));
    }

    #[test]
    fn is_ready_condition_true_is_false_without_status() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "GitRepository",
            "metadata": {"name": "flux-system"},
        }))
        .unwrap();
        assert!(!is_ready_condition_true(&obj));
    }
}
