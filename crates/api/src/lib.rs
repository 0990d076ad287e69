//! svcbind capability traits and shared API types.
//!
//! The binding engine consumes the cluster only through the narrow traits
//! defined here. Implementations can be live (kube) or in-memory (mock);
//! the engine itself never talks to a transport directly.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;

/// A served Kubernetes resource kind (incl. CRDs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Concrete resource identifier a selector resolves to (group/version/plural).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub resource: String,
}

/// Declarative reference to a backing service a workload wants bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSelector {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    /// Overrides the binding's default namespace when set and non-empty.
    pub namespace: Option<String>,
    /// Optional name the service can be referred by in naming templates.
    pub id: Option<String>,
}

impl ServiceSelector {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Errors crossing the engine's seams; suitable for transport.
///
/// Classes map to recovery behavior: `TypeResolution`, `OwnedListing` and
/// `Merge` abort the whole build; `EmptyAnnotationName` and
/// `HandlerNotFound` abandon the current selector only; `HandlerExecution`
/// drops a single annotation. `NotFound` signals absence on best-effort
/// fetches and `Capability` wraps transport failures from the live layer.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum BindError {
    #[error("type resolution: {0}")]
    TypeResolution(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("empty annotation name: {0}")]
    EmptyAnnotationName(String),
    #[error("handler not found: {0}")]
    HandlerNotFound(String),
    #[error("handler execution: {0}")]
    HandlerExecution(String),
    #[error("merge: {0}")]
    Merge(String),
    #[error("listing owned resources: {0}")]
    OwnedListing(String),
    #[error("capability: {0}")]
    Capability(String),
}

impl BindError {
    /// Recoverable at the selectors loop: abandon this selector, keep going.
    pub fn is_skip_selector(&self) -> bool {
        matches!(
            self,
            BindError::EmptyAnnotationName(_) | BindError::HandlerNotFound(_)
        )
    }
}

pub type BindResult<T> = Result<T, BindError>;

/// Cluster access consumed by the binding engine.
///
/// All calls are plain request/response; retries and timeouts are the
/// surrounding framework's business.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Resolve a gvk key ("v1/Kind" or "group/v1/Kind") to a concrete type.
    async fn resolve_type(&self, gvk_key: &str) -> BindResult<ResourceType>;

    /// Resolve a concrete type back to its served kind.
    async fn resolve_kind(&self, rt: &ResourceType) -> BindResult<ResourceKind>;

    /// Fetch a live object by namespace/type/name.
    async fn fetch_object(&self, namespace: &str, rt: &ResourceType, name: &str)
        -> BindResult<Json>;

    /// Fetch the CRD backing a kind. Ok(None) for builtin kinds; a custom
    /// kind without a CRD yields `NotFound`.
    async fn fetch_crd(&self, kind: &ResourceKind) -> BindResult<Option<Json>>;

    /// Fetch the CRDDescription a CSV in `namespace` declares for this CRD,
    /// if any. `NotFound` when no CSV describes it.
    async fn fetch_crd_description(
        &self,
        namespace: &str,
        kind: &ResourceKind,
        crd: &Json,
    ) -> BindResult<Option<Json>>;

    /// List namespaced resources whose owner reference matches `owner_uid`.
    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> BindResult<Vec<Json>>;

    /// Resource kinds a named CSV declares ownership of.
    async fn list_csv_kinds(&self, namespace: &str, name: &str) -> BindResult<Vec<ResourceKind>>;
}

/// Side-effect sink for dynamic watch registration.
#[async_trait::async_trait]
pub trait WatchSink: Send + Sync {
    async fn register_watch(&self, kind: &ResourceKind) -> BindResult<()>;
}

// ----------------- Mock implementation -----------------

/// In-memory `ClusterOps` for tests and offline runs.
#[derive(Default)]
pub struct MockCluster {
    types: HashMap<String, (ResourceType, ResourceKind)>,
    objects: HashMap<(String, String, String), Json>,
    crds: HashMap<String, Json>,
    descriptions: HashMap<String, Json>,
    owned: HashMap<(String, String), Vec<Json>>,
    csv_kinds: HashMap<(String, String), Vec<ResourceKind>>,
    pub fail_owned_listing: bool,
    pub fail_csv_listing: bool,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind under its gvk key and return it for convenience.
    pub fn add_kind(
        &mut self,
        group: &str,
        version: &str,
        kind: &str,
        plural: &str,
    ) -> ResourceKind {
        let rk = ResourceKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespaced: true,
        };
        let rt = ResourceType {
            group: group.to_string(),
            version: version.to_string(),
            resource: plural.to_string(),
        };
        self.types.insert(rk.gvk_key(), (rt, rk.clone()));
        rk
    }

    pub fn add_object(&mut self, namespace: &str, plural: &str, name: &str, doc: Json) {
        self.objects
            .insert((namespace.to_string(), plural.to_string(), name.to_string()), doc);
    }

    pub fn add_crd(&mut self, kind: &ResourceKind, doc: Json) {
        self.crds.insert(kind.gvk_key(), doc);
    }

    pub fn add_description(&mut self, kind: &ResourceKind, doc: Json) {
        self.descriptions.insert(kind.gvk_key(), doc);
    }

    pub fn add_owned(&mut self, namespace: &str, owner_uid: &str, doc: Json) {
        self.owned
            .entry((namespace.to_string(), owner_uid.to_string()))
            .or_default()
            .push(doc);
    }

    pub fn add_csv(&mut self, namespace: &str, name: &str, kinds: Vec<ResourceKind>) {
        self.csv_kinds
            .insert((namespace.to_string(), name.to_string()), kinds);
    }
}

#[async_trait::async_trait]
impl ClusterOps for MockCluster {
    async fn resolve_type(&self, gvk_key: &str) -> BindResult<ResourceType> {
        self.types
            .get(gvk_key)
            .map(|(rt, _)| rt.clone())
            .ok_or_else(|| BindError::TypeResolution(format!("unknown gvk key: {gvk_key}")))
    }

    async fn resolve_kind(&self, rt: &ResourceType) -> BindResult<ResourceKind> {
        self.types
            .values()
            .find(|(t, _)| t == rt)
            .map(|(_, k)| k.clone())
            .ok_or_else(|| {
                BindError::TypeResolution(format!(
                    "no kind for resource {}/{}/{}",
                    rt.group, rt.version, rt.resource
                ))
            })
    }

    async fn fetch_object(
        &self,
        namespace: &str,
        rt: &ResourceType,
        name: &str,
    ) -> BindResult<Json> {
        self.objects
            .get(&(namespace.to_string(), rt.resource.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                BindError::NotFound(format!("{}/{} {:?}", namespace, rt.resource, name))
            })
    }

    async fn fetch_crd(&self, kind: &ResourceKind) -> BindResult<Option<Json>> {
        if kind.group.is_empty() {
            return Ok(None);
        }
        self.crds
            .get(&kind.gvk_key())
            .cloned()
            .map(Some)
            .ok_or_else(|| BindError::NotFound(format!("CRD for {}", kind.gvk_key())))
    }

    async fn fetch_crd_description(
        &self,
        _namespace: &str,
        kind: &ResourceKind,
        _crd: &Json,
    ) -> BindResult<Option<Json>> {
        self.descriptions
            .get(&kind.gvk_key())
            .cloned()
            .map(Some)
            .ok_or_else(|| BindError::NotFound(format!("CRDDescription for {}", kind.gvk_key())))
    }

    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> BindResult<Vec<Json>> {
        if self.fail_owned_listing {
            return Err(BindError::OwnedListing("mock listing failure".into()));
        }
        Ok(self
            .owned
            .get(&(namespace.to_string(), owner_uid.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_csv_kinds(&self, namespace: &str, name: &str) -> BindResult<Vec<ResourceKind>> {
        if self.fail_csv_listing {
            return Err(BindError::Capability("mock csv listing failure".into()));
        }
        self.csv_kinds
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| BindError::NotFound(format!("csv {namespace}/{name}")))
    }
}

/// `WatchSink` that records registrations; can fail a configured gvk key.
#[derive(Default)]
pub struct RecordingSink {
    pub registered: std::sync::Mutex<Vec<String>>,
    pub fail_gvk: Option<String>,
}

#[async_trait::async_trait]
impl WatchSink for RecordingSink {
    async fn register_watch(&self, kind: &ResourceKind) -> BindResult<()> {
        let key = kind.gvk_key();
        if self.fail_gvk.as_deref() == Some(key.as_str()) {
            return Err(BindError::Capability(format!("refusing to watch {key}")));
        }
        self.registered.lock().unwrap().push(key);
        Ok(())
    }
}
