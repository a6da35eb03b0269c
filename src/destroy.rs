/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/destroy.rs
 *
 * The destroyer (C8): a seven-phase tear-down pipeline, each phase
 * best-effort and logging-and-continuing rather than halting on the first
 * failure — unlike the install pipeline in `steps.rs`, destroy has no
 * required/optional distinction and no rollback, since there is nothing
 * left to roll back to.
 *
 * Finalizer-stripping is grounded on `gitops.rs::strip_finalizers_dynamic`'s
 * JSON-patch-then-merge-patch fallback, generalized here to every namespaced
 * API resource rather than a fixed GVK list.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::client::ClusterClient;
use crate::error::{is_not_found, Error, Result};
use crate::gitops::{GitOpsClient, CONTROLLER_NAMESPACE};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::discovery::{self, Scope};
use kube::ResourceExt;
use serde_json::json;
use std::time::Duration;

const ROOT_SYNC_UNITS_REVERSE_ORDER: &[&str] = &["apps", "infrastructure", "infrastructure-core"];
const PRESERVED_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease", "default"];
const PRESERVED_CRD_PATTERNS: &[&str] = &[
    "k8s.io",
    "kubernetes.io",
    "metrics.k8s.io",
    "apiregistration.k8s.io",
    "admissionregistration.k8s.io",
];

const STORAGE_NAMESPACE: &str = "rook-ceph";
/// Group/version/kind triples for the storage-layer resources torn down in
/// phase 3, ordered block-pool/filesystem/object-store before the cluster
/// resource that owns them.
const STORAGE_GVKS: &[(&str, &str, &str)] = &[
    ("ceph.rook.io", "v1", "CephBlockPool"),
    ("ceph.rook.io", "v1", "CephFilesystem"),
    ("ceph.rook.io", "v1", "CephObjectStore"),
];
const STORAGE_CLUSTER_GVK: (&str, &str, &str) = ("ceph.rook.io", "v1", "CephCluster");

pub async fn run(client: &ClusterClient) -> Result<()> {
    suspend_all_sync_units(client).await;
    delete_root_sync_units(client).await;
    prune_storage_layer(client).await;
    cleanup_namespaces(client).await;
    strip_released_pv_finalizers(client).await;
    prune_crds(client).await;
    force_finalize_controller_namespace(client).await;
    Ok(())
}

/// Phase 1: merge-patch `spec.suspend=true` on every sync-unit kind in every
/// namespace, then sleep 5s to let in-flight reconciles wind down.
async fn suspend_all_sync_units(client: &ClusterClient) {
    let gitops = GitOpsClient::new(client);
    if let Err(e) = gitops.suspend_reconciliation(CONTROLLER_NAMESPACE).await {
        tracing::warn!(error = %e, "failed to suspend sync units; continuing");
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
}

/// Phase 2: delete the named root sync units in reverse dependency order,
/// then `DeleteCollection` any residual `Kustomization`s with `Background`
/// propagation.
async fn delete_root_sync_units(client: &ClusterClient) {
    let gvk = GroupVersionKind::gvk("kustomize.toolkit.fluxcd.io", "v1", "Kustomization");
    let Ok((api, _)) = client.dynamic_api(&gvk, Some(CONTROLLER_NAMESPACE)).await else {
        return;
    };

    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };

    for name in ROOT_SYNC_UNITS_REVERSE_ORDER {
        match api.delete(name, &dp).await {
            Ok(_) | Err(kube::Error::Api(_)) => {}
            Err(e) => tracing::warn!(error = %e, name, "failed to delete root sync unit"),
        }
    }

    if let Err(e) = api.delete_collection(&dp, &ListParams::default()).await {
        tracing::warn!(error = %e, "failed to delete residual sync units");
    }
}

/// Phase 3: strip finalizers then force-delete each storage-layer kind
/// (block pools, filesystems, object stores), sleep 5s, repeat for the
/// cluster resource, then drop all jobs and OSD-prepare pods.
async fn prune_storage_layer(client: &ClusterClient) {
    for (group, version, kind) in STORAGE_GVKS {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        if let Ok((api, _)) = client.dynamic_api(&gvk, Some(STORAGE_NAMESPACE)).await {
            force_delete_all(&api).await;
        }
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let gvk = GroupVersionKind::gvk(STORAGE_CLUSTER_GVK.0, STORAGE_CLUSTER_GVK.1, STORAGE_CLUSTER_GVK.2);
    if let Ok((api, _)) = client.dynamic_api(&gvk, Some(STORAGE_NAMESPACE)).await {
        force_delete_all(&api).await;
    }

    let jobs_gvk = GroupVersionKind::gvk("batch", "v1", "Job");
    if let Ok((api, _)) = client.dynamic_api(&jobs_gvk, Some(STORAGE_NAMESPACE)).await {
        let _ = api
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await;
    }

    let pods: Api<Pod> = Api::namespaced(client.inner().clone(), STORAGE_NAMESPACE);
    let _ = pods
        .delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels("app=rook-ceph-osd-prepare"),
        )
        .await;
}

async fn force_delete_all(api: &Api<DynamicObject>) {
    let Ok(list) = api.list(&ListParams::default()).await else {
        return;
    };
    let dp = DeleteParams {
        grace_period_seconds: Some(0),
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };
    for obj in list.items {
        let name = obj.name_any();
        strip_finalizers(api, &name).await;
        if let Err(e) = api.delete(&name, &dp).await {
            tracing::warn!(error = %e, name, "force-delete failed");
        }
    }
}

/// Phase 4: for every namespace other than the preserved system namespaces
/// and the CD controller namespace (handled last in phase 7), drop all pods,
/// strip finalizers from every namespaced resource kind the API server
/// advertises, then delete the namespace itself.
pub(crate) async fn cleanup_namespaces(client: &ClusterClient) {
    let ns_api: Api<Namespace> = Api::all(client.inner().clone());
    let Ok(namespaces) = ns_api.list(&ListParams::default()).await else {
        return;
    };

    let groups = match discovery::Discovery::new(client.inner().clone()).run().await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "API discovery failed; namespace cleanup will only drop pods");
            return cleanup_pods_only(client, &namespaces.items).await;
        }
    };

    for ns in &namespaces.items {
        let name = ns.name_any();
        if PRESERVED_NAMESPACES.contains(&name.as_str()) || name == CONTROLLER_NAMESPACE {
            continue;
        }

        let pods: Api<Pod> = Api::namespaced(client.inner().clone(), &name);
        let _ = pods
            .delete_collection(
                &DeleteParams {
                    grace_period_seconds: Some(0),
                    ..Default::default()
                },
                &ListParams::default(),
            )
            .await;

        for group in groups.groups() {
            for (ar, caps) in group.recommended_resources() {
                if caps.scope != Scope::Namespaced || !caps.supports_operation("list") || !caps.supports_operation("patch") {
                    continue;
                }
                let api: Api<DynamicObject> = Api::namespaced_with(client.inner().clone(), &name, &ar);
                let Ok(list) = api.list(&ListParams::default()).await else {
                    continue;
                };
                for obj in list.items {
                    strip_finalizers(&api, &obj.name_any()).await;
                }
            }
        }

        match ns_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) | Err(kube::Error::Api(_)) => {}
            Err(e) => tracing::warn!(error = %e, namespace = %name, "failed to delete namespace"),
        }
    }
}

async fn cleanup_pods_only(client: &ClusterClient, namespaces: &[Namespace]) {
    for ns in namespaces {
        let name = ns.name_any();
        if PRESERVED_NAMESPACES.contains(&name.as_str()) || name == CONTROLLER_NAMESPACE {
            continue;
        }
        let pods: Api<Pod> = Api::namespaced(client.inner().clone(), &name);
        let _ = pods
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await;
    }
}

/// Phase 5: strip finalizers from every PV in phase `Released` or
/// `Terminating`, freeing the underlying storage to be reclaimed.
async fn strip_released_pv_finalizers(client: &ClusterClient) {
    let api: Api<PersistentVolume> = Api::all(client.inner().clone());
    let Ok(list) = api.list(&ListParams::default()).await else {
        return;
    };
    for pv in list.items {
        let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
        if phase == "Released" || phase == "Terminating" {
            let patch = json!({"metadata": {"finalizers": null}});
            let _ = api
                .patch(&pv.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await;
        }
    }
}

/// Phase 6: list CRDs, skip any whose name contains a preserved pattern
/// (built-in/aggregated-API groups this process must never touch), delete
/// the rest.
async fn prune_crds(client: &ClusterClient) {
    let gvk = GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
    let Ok((api, _)) = client.dynamic_api(&gvk, None).await else {
        return;
    };
    let Ok(list) = api.list(&ListParams::default()).await else {
        return;
    };
    for crd in list.items {
        let name = crd.name_any();
        if PRESERVED_CRD_PATTERNS.iter().any(|p| name.contains(p)) {
            continue;
        }
        if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
            tracing::warn!(error = %e, crd = %name, "failed to delete CRD");
        }
    }
}

/// Phase 7: the CD controller namespace is skipped by phase 4 so its own
/// sync units can be suspended and deleted cleanly first; now strip every
/// resource's finalizers, then the namespace's own, then force-finalize via
/// the `/finalize` subresource if it's still stuck `Terminating` after that.
async fn force_finalize_controller_namespace(client: &ClusterClient) {
    let ns_api: Api<Namespace> = Api::all(client.inner().clone());
    if ns_api.get(CONTROLLER_NAMESPACE).await.is_err() {
        return;
    }

    if let Ok(groups) = discovery::Discovery::new(client.inner().clone()).run().await {
        for group in groups.groups() {
            for (ar, caps) in group.recommended_resources() {
                if caps.scope != Scope::Namespaced || !caps.supports_operation("list") || !caps.supports_operation("patch") {
                    continue;
                }
                let api: Api<DynamicObject> = Api::namespaced_with(client.inner().clone(), CONTROLLER_NAMESPACE, &ar);
                let Ok(list) = api.list(&ListParams::default()).await else {
                    continue;
                };
                for obj in list.items {
                    strip_finalizers(&api, &obj.name_any()).await;
                }
            }
        }
    }

    let patch = json!({"metadata": {"finalizers": null}});
    let _ = ns_api
        .patch(CONTROLLER_NAMESPACE, &PatchParams::default(), &Patch::Merge(&patch))
        .await;

    let Ok(mut ns) = ns_api.get(CONTROLLER_NAMESPACE).await else {
        return;
    };

    // The namespace's own `kubernetes` finalizer lives under `spec`, and the
    // apiserver only honors clearing it through the `/finalize` subresource
    // — a merge-patch against the main resource endpoint is a no-op here.
    if let Some(spec) = ns.spec.as_mut() {
        spec.finalizers = Some(Vec::new());
    }
    if let Err(e) = put_namespace_finalize_subresource(client, &ns).await {
        tracing::debug!(error = %e, namespace = CONTROLLER_NAMESPACE, "finalize subresource PUT failed");
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    if ns_api.get(CONTROLLER_NAMESPACE).await.is_ok() {
        tracing::warn!(namespace = CONTROLLER_NAMESPACE, "namespace still present after force-finalize");
    }
}

/// PUTs `namespace` to its `/finalize` subresource (spec §4.8 phase 7):
/// the only endpoint the apiserver honors a namespace finalizer clear
/// through. `kube`'s typed `Api` has no dedicated method for this
/// subresource, so the request is built directly the way
/// `examples/request_raw.rs` builds any other raw API call.
async fn put_namespace_finalize_subresource(client: &ClusterClient, ns: &Namespace) -> Result<()> {
    let url = format!("/api/v1/namespaces/{}/finalize", CONTROLLER_NAMESPACE);
    let body = serde_json::to_vec(ns).map_err(|e| Error::Other(anyhow::anyhow!("failed to encode namespace body: {}", e)))?;
    let request = http::Request::put(url)
        .header("content-type", "application/json")
        .body(body)
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to build finalize subresource request: {}", e)))?;
    let _: Namespace = client.inner().request(request).await?;
    Ok(())
}

/// Same merge-patch-to-null shape as `gitops::strip_finalizers_dynamic`,
/// reused here across every namespaced resource kind discovery advertises
/// rather than a fixed GVK list.
async fn strip_finalizers(api: &Api<DynamicObject>, name: &str) {
    let patch = json!({"metadata": {"finalizers": null}});
    match api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {}
        Err(e) => tracing::debug!(error = %e, name, "finalizer strip failed"),
    }
}
