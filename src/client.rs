/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/client.rs
 *
 * The cluster client (C1): typed read/write of Kubernetes resources plus a
 * dynamic accessor for arbitrary GVKs, used by every other component that
 * touches a cluster (C3, C5, C6, C8). One `ClusterClient` wraps exactly one
 * `kube::Client` built from a single kubeconfig path and optional context
 * override; the mesh coordinator holds one for the local cluster and,
 * opportunistically, one for the peer.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::error::{is_not_found, swallow_already_exists, Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, Node, Secret, Service};
use kube::api::{Api, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{discovery, Client, Config};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Stable server-side-apply field manager shared by every writer in this
/// crate. Co-existing with controllers that adopt their own fields after
/// install is intentional — SSA allocates ownership per field, not per
/// object (see SPEC_FULL.md §9 on server-side apply).
pub const FIELD_MANAGER: &str = "homelab-bootstrap";

pub const CLUSTER_READY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Builds a client from `kubeconfig_path`, overriding the current
    /// context with `context` when provided.
    pub async fn new(kubeconfig_path: &Path, context: Option<&str>) -> Result<Self> {
        let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path)
            .map_err(|e| Error::Config(format!("failed to read kubeconfig {}: {}", kubeconfig_path.display(), e)))?;

        let options = kube::config::KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::Config(format!("failed to build client config: {}", e)))?;
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Fetches the server version within `CLUSTER_READY_TIMEOUT`, logging the
    /// version string on success as an ambient diagnostic.
    pub async fn is_ready(&self) -> Result<()> {
        let version = tokio::time::timeout(CLUSTER_READY_TIMEOUT, self.client.apiserver_version())
            .await
            .map_err(|_| Error::NotReady("timed out contacting API server".into()))?
            .map_err(|e| Error::NotReady(format!("API server unreachable: {}", e)))?;
        tracing::info!(server_version = %version.git_version, "cluster reachable");
        Ok(())
    }

    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(e) => swallow_already_exists(e),
        }
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upserts a Secret by name/namespace. Only `data`/`type_`/`labels`/
    /// `annotations` are replaced; other server-managed fields are left
    /// alone by constructing a fresh object and applying it with SSA, which
    /// only touches the fields present in the patch.
    pub async fn create_or_update_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
        type_: Option<String>,
        labels: Option<BTreeMap<String, String>>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels,
                annotations,
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, k8s_openapi::ByteString(v)))
                    .collect(),
            ),
            type_,
            ..Default::default()
        };
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    pub async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(service) => Ok(Some(service)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ready iff `readyReplicas >= spec.replicas` (default 1), polled every
    /// 5s until `timeout` elapses.
    pub async fn wait_for_deployment(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(dep) = api.get(name).await {
                let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let ready = dep.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                if ready >= desired {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "deployment {}/{} not ready after {:?}",
                    namespace, name, timeout
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Ready iff `numberReady == desiredNumberScheduled`.
    pub async fn wait_for_daemonset(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(ds) = api.get(name).await {
                if let Some(status) = &ds.status {
                    if status.number_ready == status.desired_number_scheduled {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "daemonset {}/{} not ready after {:?}",
                    namespace, name, timeout
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_nodes(&self, expected: usize, timeout: Duration) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(nodes) = api.list(&Default::default()).await {
                let ready = nodes
                    .items
                    .iter()
                    .filter(|n| {
                        n.status
                            .as_ref()
                            .and_then(|s| s.conditions.as_ref())
                            .map(|conds| {
                                conds
                                    .iter()
                                    .any(|c| c.type_ == "Ready" && c.status == "True")
                            })
                            .unwrap_or(false)
                    })
                    .count();
                if ready >= expected {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "fewer than {} ready nodes after {:?}",
                    expected, timeout
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Resolves `gvk` against cluster discovery and returns a dynamic API
    /// handle, namespaced if `namespace` is given. Used by the GitOps client
    /// for CRDs that may not exist yet (retried by the caller).
    pub async fn dynamic_api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource)> {
        let (ar, _caps) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| Error::NotFound(format!("GVK {} not discoverable: {}", gvk, e)))?;
        let api = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }
}
