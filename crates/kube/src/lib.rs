//! svcbind kube integration – live capability layer and watcher wiring.
//!
//! Implements `ClusterOps`/`WatchSink` over kube-rs: discovery-based type
//! resolution, dynamic object access, CRD and CSV descriptor lookup,
//! owned-resource listing and watch streams translated into deltas.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use svcbind_api::{BindError, BindResult, ClusterOps, ResourceKind, ResourceType, WatchSink};
use svcbind_core::{Delta, DeltaKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Process-wide kube client, created on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let c = Client::try_default().await.context("creating kube client")?;
    let _ = CLIENT.set(c.clone());
    Ok(c)
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!(
            "invalid gvk key: {} (expect v1/Kind or group/v1/Kind)",
            key
        )),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!(
        "GVK not found: {}/{}/{}",
        gvk.group,
        gvk.version,
        gvk.kind
    ))
}

async fn find_by_plural(client: Client, rt: &ResourceType) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == rt.group && ar.version == rt.version && ar.plural == rt.resource {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!(
        "resource not found: {}/{}/{}",
        rt.group,
        rt.version,
        rt.resource
    ))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<svcbind_core::Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

fn delta_from(obj: &DynamicObject, kind: DeltaKind) -> Result<Delta> {
    let uid_str = obj
        .metadata
        .uid
        .as_deref()
        .ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let uid = to_uid(uid_str)?;
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Delta { uid, kind, raw })
}

fn capability(e: impl std::fmt::Display) -> BindError {
    BindError::Capability(e.to_string())
}

/// 404 is absence; everything else is an infrastructure failure.
fn fetch_error(e: kube::Error, what: String) -> BindError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => BindError::NotFound(what),
        _ => BindError::Capability(format!("{what}: {e}")),
    }
}

/// Live `ClusterOps` over the current kube context.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeCluster;

impl KubeCluster {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeCluster {
    async fn resolve_type(&self, gvk_key: &str) -> BindResult<ResourceType> {
        let client = get_kube_client().await.map_err(capability)?;
        let gvk =
            parse_gvk_key(gvk_key).map_err(|e| BindError::TypeResolution(e.to_string()))?;
        let (ar, _) = find_api_resource(client, &gvk)
            .await
            .map_err(|e| BindError::TypeResolution(e.to_string()))?;
        Ok(ResourceType {
            group: ar.group,
            version: ar.version,
            resource: ar.plural,
        })
    }

    async fn resolve_kind(&self, rt: &ResourceType) -> BindResult<ResourceKind> {
        let client = get_kube_client().await.map_err(capability)?;
        let (ar, namespaced) = find_by_plural(client, rt)
            .await
            .map_err(|e| BindError::TypeResolution(e.to_string()))?;
        Ok(ResourceKind {
            group: ar.group,
            version: ar.version,
            kind: ar.kind,
            namespaced,
        })
    }

    async fn fetch_object(
        &self,
        namespace: &str,
        rt: &ResourceType,
        name: &str,
    ) -> BindResult<Json> {
        let client = get_kube_client().await.map_err(capability)?;
        let (ar, namespaced) = find_by_plural(client.clone(), rt)
            .await
            .map_err(|e| BindError::TypeResolution(e.to_string()))?;
        let api: Api<DynamicObject> = if namespaced {
            Api::namespaced_with(client, namespace, &ar)
        } else {
            Api::all_with(client, &ar)
        };
        let what = format!("{}/{} {:?}", namespace, ar.plural, name);
        let obj = api
            .get_opt(name)
            .await
            .map_err(|e| fetch_error(e, what.clone()))?
            .ok_or(BindError::NotFound(what))?;
        let mut raw = serde_json::to_value(&obj).map_err(capability)?;
        stamp_type_meta(&mut raw, &ar);
        strip_managed_fields(&mut raw);
        Ok(raw)
    }

    async fn fetch_crd(&self, kind: &ResourceKind) -> BindResult<Option<Json>> {
        use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;

        if kind.group.is_empty() {
            // builtins have no CRD
            return Ok(None);
        }
        let client = get_kube_client().await.map_err(capability)?;
        let api: Api<apiextv1::CustomResourceDefinition> = Api::all(client);
        let crds = api
            .list(&ListParams::default())
            .await
            .map_err(|e| fetch_error(e, "listing CustomResourceDefinitions".into()))?;
        for crd in crds {
            let v = serde_json::to_value(&crd).map_err(capability)?;
            let spec = match v.get("spec") {
                Some(s) => s,
                None => continue,
            };
            let g = spec.get("group").and_then(|s| s.as_str()).unwrap_or("");
            let k = spec
                .get("names")
                .and_then(|n| n.get("kind"))
                .and_then(|s| s.as_str())
                .unwrap_or("");
            if g == kind.group && k == kind.kind {
                return Ok(Some(v));
            }
        }
        Err(BindError::NotFound(format!("CRD for {}", kind.gvk_key())))
    }

    async fn fetch_crd_description(
        &self,
        namespace: &str,
        kind: &ResourceKind,
        crd: &Json,
    ) -> BindResult<Option<Json>> {
        let crd_name = crd
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default();
        let client = get_kube_client().await.map_err(capability)?;
        let api = csv_api(client, namespace);
        let csvs = api
            .list(&ListParams::default())
            .await
            .map_err(|e| fetch_error(e, format!("listing CSVs in {namespace}")))?;
        for csv in csvs {
            let v = serde_json::to_value(&csv).map_err(capability)?;
            for entry in owned_descriptors(&v) {
                let name = entry.get("name").and_then(|n| n.as_str()).unwrap_or("");
                let k = entry.get("kind").and_then(|x| x.as_str()).unwrap_or("");
                if name == crd_name || k == kind.kind {
                    return Ok(Some(entry.clone()));
                }
            }
        }
        Err(BindError::NotFound(format!(
            "CRDDescription for {}",
            kind.gvk_key()
        )))
    }

    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> BindResult<Vec<Json>> {
        let client = get_kube_client()
            .await
            .map_err(|e| BindError::OwnedListing(e.to_string()))?;
        let mut out = Vec::new();
        for gvk in owned_scan_kinds() {
            let ar = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
            let list = api.list(&ListParams::default()).await.map_err(|e| {
                BindError::OwnedListing(format!("listing {} in {}: {}", ar.plural, namespace, e))
            })?;
            for obj in list {
                let mut raw = serde_json::to_value(&obj)
                    .map_err(|e| BindError::OwnedListing(e.to_string()))?;
                if !owner_matches(&raw, owner_uid) {
                    continue;
                }
                stamp_type_meta(&mut raw, &ar);
                strip_managed_fields(&mut raw);
                out.push(raw);
            }
        }
        Ok(out)
    }

    async fn list_csv_kinds(&self, namespace: &str, name: &str) -> BindResult<Vec<ResourceKind>> {
        let client = get_kube_client().await.map_err(capability)?;
        let api = csv_api(client, namespace);
        let what = format!("csv {namespace}/{name}");
        let csv = api
            .get_opt(name)
            .await
            .map_err(|e| fetch_error(e, what.clone()))?
            .ok_or(BindError::NotFound(what))?;
        let v = serde_json::to_value(&csv).map_err(capability)?;

        let mut kinds = Vec::new();
        for entry in owned_descriptors(&v) {
            let full_name = entry.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let version = entry.get("version").and_then(|x| x.as_str()).unwrap_or("");
            let kind = entry.get("kind").and_then(|x| x.as_str()).unwrap_or("");
            let group = full_name.split_once('.').map(|(_, g)| g).unwrap_or("");
            if version.is_empty() || kind.is_empty() || group.is_empty() {
                warn!(csv = %name, entry = %full_name, "skipping malformed owned CRD entry");
                continue;
            }
            kinds.push(ResourceKind {
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
                namespaced: true,
            });
        }
        Ok(kinds)
    }
}

fn csv_api(client: Client, namespace: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind {
        group: "operators.coreos.com".into(),
        version: "v1alpha1".into(),
        kind: "ClusterServiceVersion".into(),
    };
    let ar = ApiResource::from_gvk(&gvk);
    Api::namespaced_with(client, namespace, &ar)
}

fn owned_descriptors(csv: &Json) -> impl Iterator<Item = &Json> {
    csv.get("spec")
        .and_then(|s| s.get("customresourcedefinitions"))
        .and_then(|c| c.get("owned"))
        .and_then(|o| o.as_array())
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

/// Kinds scanned for owner references. Operators materialize their
/// services' child objects as these core kinds.
fn owned_scan_kinds() -> [GroupVersionKind; 3] {
    [
        GroupVersionKind {
            group: String::new(),
            version: "v1".into(),
            kind: "Secret".into(),
        },
        GroupVersionKind {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
        },
        GroupVersionKind {
            group: String::new(),
            version: "v1".into(),
            kind: "Service".into(),
        },
    ]
}

/// List items come back without their TypeMeta; re-stamp it.
fn stamp_type_meta(raw: &mut Json, ar: &ApiResource) {
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Json::String(ar.api_version.clone()));
        map.entry("kind")
            .or_insert_with(|| Json::String(ar.kind.clone()));
    }
}

fn owner_matches(raw: &Json, owner_uid: &str) -> bool {
    raw.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|o| o.as_array())
        .map(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(owner_uid))
        })
        .unwrap_or(false)
}

// ----------------- Watch sink -----------------

/// `WatchSink` that spawns a watcher per registered kind, forwarding
/// deltas into a shared channel.
pub struct KubeWatchSink {
    namespace: Option<String>,
    delta_tx: mpsc::Sender<Delta>,
}

impl KubeWatchSink {
    pub fn new(namespace: Option<String>, delta_tx: mpsc::Sender<Delta>) -> Self {
        Self {
            namespace,
            delta_tx,
        }
    }
}

#[async_trait::async_trait]
impl WatchSink for KubeWatchSink {
    async fn register_watch(&self, kind: &ResourceKind) -> BindResult<()> {
        let client = get_kube_client().await.map_err(capability)?;
        let gvk = GroupVersionKind {
            group: kind.group.clone(),
            version: kind.version.clone(),
            kind: kind.kind.clone(),
        };
        // resolve up front so registration failures surface to the mapper
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk)
            .await
            .map_err(capability)?;
        let api: Api<DynamicObject> = if namespaced {
            match self.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::all_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        let key = kind.gvk_key();
        let tx = self.delta_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_watcher(api, &key, tx).await {
                warn!(gvk = %key, error = %e, "watcher task failed");
            }
        });
        Ok(())
    }
}

/// Run the watch stream for an already-resolved resource, sending
/// coalesced deltas into the channel.
async fn run_watcher(
    api: Api<DynamicObject>,
    gvk_key: &str,
    delta_tx: mpsc::Sender<Delta>,
) -> Result<()> {
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let d = delta_from(&o, DeltaKind::Applied)?;
                counter!("svcbind_watch_deltas", 1u64);
                let _ = delta_tx.send(d).await;
            }
            Event::Deleted(o) => {
                let d = delta_from(&o, DeltaKind::Deleted)?;
                counter!("svcbind_watch_deltas", 1u64);
                let _ = delta_tx.send(d).await;
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list.iter() {
                    let d = delta_from(o, DeltaKind::Applied)?;
                    let _ = delta_tx.send(d).await;
                }
            }
        }
    }
    warn!(gvk = %gvk_key, "watcher stream ended");
    Ok(())
}
