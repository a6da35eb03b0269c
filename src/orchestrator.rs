/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/orchestrator.rs
 *
 * The top-level orchestrator (C7): builds a `Context` per cluster, wires it
 * into the declared storage-cluster (8-step) or compute-cluster (12-step)
 * pipeline, and runs the separate read-only `verify` command across both
 * clusters. The per-cluster step closures are thin — they borrow `Context`
 * and delegate straight into C1/C3/C5/C6; this file owns ordering and wiring,
 * not behavior.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::client::ClusterClient;
use crate::cluster::ClusterId;
use crate::config::ClusterConfig;
use crate::discovery;
use crate::envstore::EnvStore;
use crate::error::{Error, Result};
use crate::gitops::{GitOpsClient, CONTROLLER_NAMESPACE};
use crate::mesh::{self, MeshCoordinator};
use crate::secrets::{self, SecretManager, CLUSTER_VARS_SECRET};
use crate::steps::{render_summary, BootstrapStep, StepEngine, StepRecord};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Namespaces the transit-unseal token secret is mirrored into. The
/// specification names "two namespaces" without naming them; the CD
/// controller namespace (where `cluster-vars` already lives) and the mesh
/// secrets-store namespace are the two places that plausibly need it.
const TRANSIT_UNSEAL_NAMESPACES: [&str; 2] = [CONTROLLER_NAMESPACE, "vault"];
const TRANSIT_UNSEAL_SECRET: &str = "transit-unseal-token";
const NODE_WAIT: Duration = Duration::from_secs(600);

/// The secrets-store oracle service scenario V7 probes from a pod on the
/// compute cluster, reaching directly into the storage cluster rather than
/// through the mesh (the cyclic-CA-graph design note: the secrets store
/// reaches its unseal oracle before the mesh exists to carry the traffic).
const STORAGE_SERVICE_NAME: &str = "vault";
const STORAGE_SERVICE_NAMESPACE: &str = "vault";
const STORAGE_SERVICE_PORT: u16 = 8200;

/// Everything a step closure needs. Built once per `install` invocation and
/// borrowed by every step; mesh/GitOps/secret-manager helper wrappers are
/// constructed on demand inside each closure since they only borrow `self`.
pub struct Context {
    pub cluster: ClusterId,
    pub project_root: PathBuf,
    pub config: ClusterConfig,
    pub local: ClusterClient,
    pub peer: Option<ClusterClient>,
    pub peer_kubeconfig_path: Option<PathBuf>,
    pub peer_context: Option<String>,
    pub base: EnvStore,
    pub generated: EnvStore,
}

impl Context {
    pub async fn load(project_root: &Path, cluster: ClusterId) -> Result<Self> {
        let config = ClusterConfig::load(project_root, cluster)?;
        let discovered = discovery::discover(project_root);

        let (local_path, local_context) = discovery::resolve_path(project_root, cluster, &discovered);
        let local = ClusterClient::new(&local_path, local_context.as_deref()).await?;

        let peer_id = cluster.peer();
        let (peer_path, peer_context) = discovery::resolve_path(project_root, peer_id, &discovered);
        let peer = if peer_path.exists() {
            ClusterClient::new(&peer_path, peer_context.as_deref()).await.ok()
        } else {
            None
        };

        let base = EnvStore::load(project_root.join(".env"))?;
        let generated = EnvStore::load(project_root.join(".env.generated"))?;

        Ok(Self {
            cluster,
            project_root: project_root.to_path_buf(),
            config,
            local,
            peer,
            peer_kubeconfig_path: if peer_path.exists() { Some(peer_path) } else { None },
            peer_context,
            base,
            generated,
        })
    }

    pub(crate) fn secrets(&self) -> SecretManager<'_> {
        SecretManager::new(&self.local, &self.base, &self.generated, self.cluster, mesh::MESH_NAMESPACE)
    }

    pub(crate) fn gitops(&self) -> GitOpsClient<'_> {
        GitOpsClient::new(&self.local)
    }

    pub(crate) fn mesh(&self) -> MeshCoordinator<'_> {
        MeshCoordinator::new(
            &self.local,
            self.peer.as_ref(),
            self.cluster,
            CONTROLLER_NAMESPACE,
            self.project_root.join("cacerts"),
            self.config.fallback_hosts.clone(),
            self.config.kubeconfig_path.clone(),
            self.config.context.clone(),
            self.peer_kubeconfig_path.clone(),
            self.peer_context.clone(),
        )
    }

    pub(crate) async fn run_task(&self, task: &str) -> Result<String> {
        let path = self
            .project_root
            .join("infrastructure")
            .join(self.cluster.as_str())
            .join(task);
        crate::external::run(&path.to_string_lossy(), &[]).await
    }
}

/// Runs the declared pipeline for `ctx.cluster` (storage or compute, chosen
/// by `ClusterId::is_storage`). Returns the step records for the timing
/// summary and the first fatal error, if any.
pub async fn install(ctx: &Context) -> (Vec<StepRecord>, Option<Error>) {
    let engine = if ctx.cluster.is_storage() {
        storage_pipeline()
    } else {
        compute_pipeline()
    };
    engine.run(ctx).await
}

fn storage_pipeline() -> StepEngine<Context> {
    StepEngine::new(vec![
        BootstrapStep::new("verify-cluster", "confirm the API server is reachable", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.local.is_ready().await })
        })),
        BootstrapStep::new("install-cd-controller", "install the GitOps toolkit controllers", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.gitops().install(CONTROLLER_NAMESPACE).await })
        })),
        BootstrapStep::new("bootstrap-gitops-root", "create the root Git source and Kustomization", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.gitops().bootstrap(CONTROLLER_NAMESPACE, &ctx.config.git).await })
        })),
        BootstrapStep::new("setup-secrets", "materialize cluster-vars in the controller namespace", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                ctx.local.create_namespace(CONTROLLER_NAMESPACE).await?;
                ctx.secrets().create_cluster_vars(CONTROLLER_NAMESPACE).await
            })
        })),
        BootstrapStep::new("ensure-mesh-prereqs", "reconcile the mesh root CA and remote-secrets", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                if !ctx.config.mesh_enabled(ctx.cluster) {
                    tracing::info!("mesh disabled for this cluster; skipping prereqs");
                    return Ok(());
                }
                ctx.mesh().ensure_prereqs(&ctx.secrets()).await
            })
        }))
        .with_rollback(Box::new(|ctx: &Context| Box::pin(async move { ctx.mesh().rollback_prereqs(&ctx.secrets()).await }))),
        BootstrapStep::new("wait-for-infrastructure", "bootstrap the platform-foundation sync unit", false, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.gitops().bootstrap_platform_foundation(CONTROLLER_NAMESPACE, ctx.cluster.as_str()).await })
        })),
        BootstrapStep::new("finalize-mesh", "mint gateway TLS, repoint the webhook, publish endpoints", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                if !ctx.config.mesh_enabled(ctx.cluster) {
                    tracing::info!("mesh disabled for this cluster; skipping finalize");
                    return Ok(());
                }
                ctx.mesh()
                    .finalize(&ctx.secrets(), &ctx.gitops(), &ctx.config.downstream_sync_units)
                    .await
            })
        })),
        BootstrapStep::new("validate-deployment", "read back the GitOps sync status", false, Box::new(|ctx: &Context| {
            Box::pin(async move {
                let status = ctx.gitops().get_sync_status(CONTROLLER_NAMESPACE).await?;
                tracing::info!(ready = status.ready, message = %status.message, "gitops sync status");
                Ok(())
            })
        })),
    ])
}

fn compute_pipeline() -> StepEngine<Context> {
    StepEngine::new(vec![
        BootstrapStep::new("verify-cluster", "confirm the API server is reachable", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.local.is_ready().await })
        })),
        BootstrapStep::new("install-cni", "run the cluster's CNI install task", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.run_task("install-cilium").await.map(|_| ()) })
        })),
        BootstrapStep::new("wait-for-nodes", "wait for every node to report Ready", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                let expected = expected_node_count(ctx.cluster);
                ctx.local.wait_for_nodes(expected, NODE_WAIT).await
            })
        })),
        BootstrapStep::new("install-cd-controller", "install the GitOps toolkit controllers", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.gitops().install(CONTROLLER_NAMESPACE).await })
        })),
        BootstrapStep::new("bootstrap-gitops-root", "create the root Git source and Kustomization", true, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.gitops().bootstrap(CONTROLLER_NAMESPACE, &ctx.config.git).await })
        })),
        BootstrapStep::new("setup-secrets", "materialize cluster-vars and the transit-unseal token", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                ctx.local.create_namespace(CONTROLLER_NAMESPACE).await?;
                ctx.secrets().create_cluster_vars(CONTROLLER_NAMESPACE).await?;
                if let Err(e) = ensure_transit_unseal_secret(ctx).await {
                    tracing::warn!(error = %e, "transit-unseal token provisioning failed; continuing");
                }
                Ok(())
            })
        })),
        BootstrapStep::new("store-discovery-info", "record discovered cluster context names", false, Box::new(|ctx: &Context| {
            Box::pin(async move {
                let discovered = discovery::discover(&ctx.project_root);
                if let Some(record) = discovered.get(&ctx.cluster) {
                    if let Some(context) = &record.context {
                        let mut kv = std::collections::BTreeMap::new();
                        kv.insert(
                            format!("{}_DISCOVERED_CONTEXT", ctx.cluster.as_str().to_uppercase()),
                            context.clone(),
                        );
                        ctx.secrets().update_generated_env(&kv)?;
                    }
                }
                Ok(())
            })
        })),
        BootstrapStep::new("ensure-mesh-prereqs", "reconcile the mesh root CA and remote-secrets", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                if !ctx.config.mesh_enabled(ctx.cluster) {
                    tracing::info!("mesh disabled for this cluster; skipping prereqs");
                    return Ok(());
                }
                ctx.mesh().ensure_prereqs(&ctx.secrets()).await
            })
        }))
        .with_rollback(Box::new(|ctx: &Context| Box::pin(async move { ctx.mesh().rollback_prereqs(&ctx.secrets()).await }))),
        BootstrapStep::new("wait-for-infrastructure", "bootstrap the platform-foundation sync unit", false, Box::new(|ctx: &Context| {
            Box::pin(async move { ctx.gitops().bootstrap_platform_foundation(CONTROLLER_NAMESPACE, ctx.cluster.as_str()).await })
        })),
        BootstrapStep::new("finalize-mesh", "mint gateway TLS, repoint the webhook, publish endpoints", true, Box::new(|ctx: &Context| {
            Box::pin(async move {
                if !ctx.config.mesh_enabled(ctx.cluster) {
                    tracing::info!("mesh disabled for this cluster; skipping finalize");
                    return Ok(());
                }
                ctx.mesh()
                    .finalize(&ctx.secrets(), &ctx.gitops(), &ctx.config.downstream_sync_units)
                    .await
            })
        })),
        BootstrapStep::new("validate-deployment", "read back the GitOps sync status", false, Box::new(|ctx: &Context| {
            Box::pin(async move {
                let status = ctx.gitops().get_sync_status(CONTROLLER_NAMESPACE).await?;
                tracing::info!(ready = status.ready, message = %status.message, "gitops sync status");
                Ok(())
            })
        })),
        BootstrapStep::new("comprehensive-health-check", "probe mesh proxy status on both clusters", false, Box::new(|ctx: &Context| {
            Box::pin(async move {
                if crate::external::is_available("istioctl") {
                    let path = ctx.config.kubeconfig_path.to_string_lossy().to_string();
                    crate::external::run("istioctl", &["proxy-status", "--kubeconfig", path.as_str()])
                        .await
                        .map(|_| ())
                } else {
                    Ok(())
                }
            })
        })),
    ])
}

/// `<CLUSTER>_EXPECTED_NODES`, default 1. The data model leaves this input
/// unnamed; a per-cluster environment override is this crate's choice.
fn expected_node_count(cluster: ClusterId) -> usize {
    std::env::var(format!("{}_EXPECTED_NODES", cluster.as_str().to_uppercase()))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

async fn ensure_transit_unseal_secret(ctx: &Context) -> Result<()> {
    let local_secrets = ctx.secrets();
    let mut token = local_secrets.env_get("VAULT_UNSEAL_TOKEN").filter(|t| !t.is_empty());

    if token.is_none() {
        if let Some(peer) = &ctx.peer {
            if let Ok(Some(secret)) = peer.get_secret(CONTROLLER_NAMESPACE, CLUSTER_VARS_SECRET).await {
                token = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get("VAULT_UNSEAL_TOKEN"))
                    .map(|b| String::from_utf8_lossy(&b.0).into_owned())
                    .filter(|t| !t.is_empty());
            }
        }
    }

    let token = token.unwrap_or_else(generate_unseal_token);

    for namespace in TRANSIT_UNSEAL_NAMESPACES {
        ctx.local.create_namespace(namespace).await?;
        let mut data = std::collections::BTreeMap::new();
        data.insert("token".to_string(), token.clone().into_bytes());
        ctx.local
            .create_or_update_secret(namespace, TRANSIT_UNSEAL_SECRET, data, None, None, Some(secrets::reflector_annotations()))
            .await?;
    }
    Ok(())
}

fn generate_unseal_token() -> String {
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    if let Ok(duration) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        hasher.update(duration.as_nanos().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Runs the read-only cross-cluster acceptance checks (scenarios V1–V5 are
/// fatal; V6 (`istioctl proxy-status`) and V7 (the storage oracle health
/// probe from a compute-cluster pod) are external-tool-backed and
/// downgraded to warnings, per the design notes on external-tool
/// fallbacks).
pub async fn verify(project_root: &Path) -> Result<Vec<(String, bool, String)>> {
    let mut results = Vec::new();

    let discovered = discovery::discover(project_root);
    let mut clients = std::collections::BTreeMap::new();
    for cluster in [ClusterId::Nas, ClusterId::Homelab] {
        let (path, context) = discovery::resolve_path(project_root, cluster, &discovered);
        let client = ClusterClient::new(&path, context.as_deref()).await?;
        clients.insert(cluster, (client, path));
    }

    for (cluster, (client, _)) in &clients {
        let deployments: Api<Deployment> = Api::namespaced(client.inner().clone(), mesh::MESH_NAMESPACE);

        match deployments.get(mesh::CONTROL_PLANE_SERVICE).await {
            Ok(dep) => {
                let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let ready = dep.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                results.push((format!("V1 control-plane ready ({})", cluster), ready >= desired, String::new()));
            }
            Err(e) => results.push((format!("V1 control-plane ready ({})", cluster), false, e.to_string())),
        }

        match deployments.get("istio-eastwestgateway").await {
            Ok(dep) => {
                let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let ready = dep.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                results.push((format!("V2 gateway ready ({})", cluster), ready >= desired, String::new()));
            }
            Err(e) => results.push((format!("V2 gateway ready ({})", cluster), false, e.to_string())),
        }

        let pods: Api<Pod> = Api::namespaced(client.inner().clone(), mesh::MESH_NAMESPACE);
        match pods.list(&ListParams::default().labels("app=istio-eastwestgateway")).await {
            Ok(list) => {
                let ok = !list.items.is_empty()
                    && list
                        .items
                        .iter()
                        .all(|p| p.spec.as_ref().map(|s| s.containers.len() == 1).unwrap_or(false));
                results.push((format!("V3 gateway pods single-container ({})", cluster), ok, String::new()));
            }
            Err(e) => results.push((format!("V3 gateway pods single-container ({})", cluster), false, e.to_string())),
        }

        let remote_secret_name = format!("istio-remote-secret-{}", cluster.peer().as_str());
        match client.get_secret(mesh::MESH_NAMESPACE, &remote_secret_name).await {
            Ok(Some(secret)) => {
                let ok = secret.data.map(|d| !d.is_empty()).unwrap_or(false);
                results.push((format!("V4 peer remote-secret present ({})", cluster), ok, String::new()));
            }
            Ok(None) => results.push((format!("V4 peer remote-secret present ({})", cluster), false, "not found".to_string())),
            Err(e) => results.push((format!("V4 peer remote-secret present ({})", cluster), false, e.to_string())),
        }

        match client.get_secret(mesh::MESH_NAMESPACE, "istio-eastwestgateway-certs").await {
            Ok(Some(secret)) => {
                let data = secret.data.unwrap_or_default();
                let ok = data.get("tls.crt").map(|b| !b.0.is_empty()).unwrap_or(false)
                    && data.get("tls.key").map(|b| !b.0.is_empty()).unwrap_or(false);
                results.push((format!("V5 gateway TLS secret populated ({})", cluster), ok, String::new()));
            }
            Ok(None) => results.push((format!("V5 gateway TLS secret populated ({})", cluster), false, "not found".to_string())),
            Err(e) => results.push((format!("V5 gateway TLS secret populated ({})", cluster), false, e.to_string())),
        }
    }

    for (cluster, (_, path)) in &clients {
        if crate::external::is_available("istioctl") {
            let path_str = path.to_string_lossy().to_string();
            let ok = crate::external::run("istioctl", &["proxy-status", "--kubeconfig", path_str.as_str()])
                .await
                .is_ok();
            results.push((format!("V6 proxy-status (best-effort, {})", cluster), ok, String::new()));
        }
    }

    if let Some((homelab_client, homelab_path)) = clients.get(&ClusterId::Homelab) {
        match probe_storage_health(homelab_client, homelab_path).await {
            Ok(body) => {
                let ok = body.contains("\"initialized\":true") || body.contains("\"initialized\": true");
                let message = if ok { String::new() } else { body };
                results.push(("V7 storage oracle health (best-effort)".to_string(), ok, message));
            }
            Err(e) => results.push(("V7 storage oracle health (best-effort)".to_string(), false, e.to_string())),
        }
    }

    Ok(results)
}

/// Scenario V7: execs into a running pod in the compute cluster's CD
/// controller namespace and curls the storage cluster's secrets-store
/// oracle health endpoint directly, verifying `"initialized":true` in the
/// response body within the external-tool budget.
async fn probe_storage_health(homelab_client: &ClusterClient, homelab_kubeconfig: &Path) -> Result<String> {
    if !crate::external::is_available("kubectl") {
        return Err(Error::ExternalTool("kubectl not installed".to_string()));
    }

    let pods: Api<Pod> = Api::namespaced(homelab_client.inner().clone(), CONTROLLER_NAMESPACE);
    let list = pods.list(&ListParams::default()).await?;
    let pod_name = list
        .items
        .into_iter()
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .and_then(|p| p.metadata.name)
        .ok_or_else(|| Error::NotFound(format!("no running pod in {} to exec the health check from", CONTROLLER_NAMESPACE)))?;

    let cacerts_dir = std::env::var("CACERTS_DIR").unwrap_or_else(|_| "cacerts".to_string());
    let cacert_path = format!("{}/root-cert.pem", cacerts_dir.trim_end_matches('/'));
    let fqdn = format!("{}.{}.svc.cluster.local", STORAGE_SERVICE_NAME, STORAGE_SERVICE_NAMESPACE);
    let url = format!("https://{}:{}/v1/sys/health", fqdn, STORAGE_SERVICE_PORT);
    let kubeconfig_str = homelab_kubeconfig.to_string_lossy().to_string();

    crate::external::run(
        "kubectl",
        &[
            "--kubeconfig",
            kubeconfig_str.as_str(),
            "exec",
            "-n",
            CONTROLLER_NAMESPACE,
            pod_name.as_str(),
            "--",
            "curl",
            "-sf",
            "--cacert",
            cacert_path.as_str(),
            url.as_str(),
        ],
    )
    .await
}
