//! Binding annotation collection, grammar and handlers.
//!
//! Annotations are layered from up to three sources per resource (CSV
//! CRDDescription, CRD, instance; instance wins) and each binding key is
//! dispatched to one of a closed set of handler families producing a
//! structured contribution for the merge engine.

#![forbid(unsafe_code)]

use base64::Engine as _;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use svcbind_api::{BindError, BindResult, ClusterOps, ResourceType};
use tracing::debug;

/// Fixed prefix binding annotation keys carry.
pub const BINDING_PREFIX: &str = "service.binding";

// ----------------- Annotation collector -----------------

/// Merge the three annotation layers with instance-top precedence.
///
/// Override replaces the whole value; a missing description or CRD layer is
/// simply empty. The BTreeMap result also fixes the lexicographic key order
/// the builder processes annotations in.
pub fn collect_annotations(
    description: Option<&Json>,
    crd: Option<&Json>,
    instance: &Json,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(desc) = description {
        overlay(&mut out, description_annotations(desc));
    }
    if let Some(crd) = crd {
        overlay(&mut out, metadata_annotations(crd));
    }
    overlay(&mut out, metadata_annotations(instance));
    out
}

fn overlay(dst: &mut BTreeMap<String, String>, src: BTreeMap<String, String>) {
    for (k, v) in src {
        dst.insert(k, v);
    }
}

fn metadata_annotations(doc: &Json) -> BTreeMap<String, String> {
    doc.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Convert a CSV CRDDescription into binding annotations.
///
/// Spec/status descriptors carrying a `service.binding` x-descriptor become
/// `service.binding/<displayName-or-path-tail>` keys; the descriptor's path
/// is rooted under `.spec`/`.status`, and the secret/configmap descriptor
/// variants add the matching `objectType`.
pub fn description_annotations(desc: &Json) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (field, root) in [("specDescriptors", "spec"), ("statusDescriptors", "status")] {
        let items = match desc.get(field).and_then(|v| v.as_array()) {
            Some(items) => items,
            None => continue,
        };
        for d in items {
            let path = match d.get("path").and_then(|p| p.as_str()) {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };
            let xs = match d.get("x-descriptors").and_then(|x| x.as_array()) {
                Some(xs) => xs,
                None => continue,
            };
            for x in xs.iter().filter_map(|x| x.as_str()) {
                if !x.starts_with(BINDING_PREFIX) {
                    continue;
                }
                let name = d
                    .get("displayName")
                    .and_then(|n| n.as_str())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| path.rsplit('.').next().unwrap_or(path).to_string());
                let mut value = format!("path={{.{root}.{path}}}");
                if x.ends_with(":secret") {
                    value.push_str(",objectType=Secret");
                } else if x.ends_with(":configmap") {
                    value.push_str(",objectType=ConfigMap");
                }
                out.insert(format!("{BINDING_PREFIX}/{name}"), value);
            }
        }
    }
    out
}

// ----------------- Key/value grammar -----------------

/// Parsed binding annotation key: `service.binding/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingKey {
    pub name: String,
}

/// Parse an annotation key. Failures land in exactly two recoverable
/// classes: keys outside the binding convention are `HandlerNotFound`,
/// binding keys with an empty name are `EmptyAnnotationName`.
pub fn parse_key(key: &str) -> BindResult<BindingKey> {
    let rest = match key.strip_prefix(BINDING_PREFIX) {
        Some(rest) => rest,
        None => {
            return Err(BindError::HandlerNotFound(format!(
                "no handler for annotation {key:?}"
            )))
        }
    };
    match rest.strip_prefix('/') {
        Some("") => Err(BindError::EmptyAnnotationName(format!(
            "annotation {key:?} names no variable"
        ))),
        Some(name) => Ok(BindingKey {
            name: name.to_string(),
        }),
        None if rest.is_empty() => Err(BindError::EmptyAnnotationName(format!(
            "annotation {key:?} names no variable"
        ))),
        // Prefix matched but the key continues without a slash
        // ("service.bindingfoo"): a different convention entirely.
        None => Err(BindError::HandlerNotFound(format!(
            "no handler for annotation {key:?}"
        ))),
    }
}

/// Parsed binding annotation value: comma-separated `attr=val` items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSpec {
    /// Normalized dotted path into the instance document.
    pub path: String,
    pub object_type: Option<String>,
    /// Narrow a map-shaped referent down to one entry.
    pub source_key: Option<String>,
    /// Literal-type hint; accepted and carried, not interpreted here.
    pub element_type: Option<String>,
}

/// Parse an annotation value. Shape problems here are handler-execution
/// failures (the annotation is dropped, the build continues).
pub fn parse_value(value: &str) -> BindResult<BindingSpec> {
    if value.trim().is_empty() {
        return Err(BindError::HandlerExecution("empty annotation value".into()));
    }
    let mut spec = BindingSpec::default();
    for item in value.split(',') {
        let (attr, val) = item
            .split_once('=')
            .ok_or_else(|| BindError::HandlerExecution(format!("malformed item {item:?}")))?;
        match attr.trim() {
            "path" => spec.path = normalize_path_expr(val)?,
            "objectType" => spec.object_type = Some(val.trim().to_string()),
            "sourceKey" => spec.source_key = Some(val.trim().to_string()),
            "elementType" => spec.element_type = Some(val.trim().to_string()),
            other => {
                return Err(BindError::HandlerExecution(format!(
                    "unknown attribute {other:?}"
                )))
            }
        }
    }
    if spec.path.is_empty() {
        return Err(BindError::HandlerExecution(format!(
            "value {value:?} carries no path"
        )));
    }
    Ok(spec)
}

/// Accept `{.status.host}`, `.status.host` or `status.host`; yield the bare
/// dotted form.
fn normalize_path_expr(expr: &str) -> BindResult<String> {
    let s = expr.trim();
    let s = s
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(s);
    let s = s.strip_prefix('.').unwrap_or(s);
    if s.is_empty() || s.split('.').any(|seg| seg.is_empty()) {
        return Err(BindError::HandlerExecution(format!(
            "bad path expression {expr:?}"
        )));
    }
    Ok(s.to_string())
}

// ----------------- Path extraction -----------------

/// Extract the value at a dotted path; a segment may carry one trailing
/// `[index]`, e.g. `spec.hosts[0]`.
pub fn extract_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        let (key, idx_opt) = if let Some(brk) = seg.find('[') {
            let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
            let idx: usize = seg[brk + 1..end].parse().ok()?;
            (&seg[..brk], Some(idx))
        } else {
            (seg, None)
        };
        match cur {
            Json::Object(map) => {
                cur = map.get(key)?;
            }
            _ => return None,
        }
        if let Some(i) = idx_opt {
            match cur {
                Json::Array(arr) => {
                    cur = arr.get(i)?;
                }
                _ => return None,
            }
        }
    }
    Some(cur)
}

/// Build the nested object that places `value` back at `path`. Indexed
/// segments have no sparse graft shape; those paths contribute env data
/// only and graft an empty patch.
fn graft(path: &str, value: Json) -> Json {
    if path.split('.').any(|seg| seg.contains('[')) {
        debug!(path, "skipping object graft for indexed path");
        return Json::Object(Map::new());
    }
    let mut cur = value;
    for seg in path.rsplit('.') {
        let mut m = Map::new();
        m.insert(seg.to_string(), cur);
        cur = Json::Object(m);
    }
    cur
}

// ----------------- Handler dispatch -----------------

/// One annotation's structured contribution: a partial object patch and the
/// derived variables. Transient; consumed by the merge engine.
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub raw_data: Json,
    pub data: BTreeMap<String, Json>,
}

/// Closed set of binding handler families.
pub enum Handler<'a> {
    /// Plain field read from the instance document.
    Attribute {
        name: String,
        path: String,
        instance: &'a Json,
    },
    /// The field names a Secret whose decoded data is the bound value.
    Secret {
        name: String,
        path: String,
        source_key: Option<String>,
        namespace: &'a str,
        instance: &'a Json,
        ops: &'a dyn ClusterOps,
    },
    /// The field names a ConfigMap whose data is the bound value.
    ConfigMap {
        name: String,
        path: String,
        source_key: Option<String>,
        namespace: &'a str,
        instance: &'a Json,
        ops: &'a dyn ClusterOps,
    },
}

/// Resolve one annotation pair to its handler. `EmptyAnnotationName` and
/// `HandlerNotFound` from here abandon the selector; anything else drops
/// only this annotation.
pub fn dispatch<'a>(
    ops: &'a dyn ClusterOps,
    namespace: &'a str,
    key: &str,
    value: &str,
    instance: &'a Json,
) -> BindResult<Handler<'a>> {
    let bk = parse_key(key)?;
    let spec = parse_value(value)?;
    match spec.object_type.as_deref() {
        None => Ok(Handler::Attribute {
            name: bk.name,
            path: spec.path,
            instance,
        }),
        Some("Secret") => Ok(Handler::Secret {
            name: bk.name,
            path: spec.path,
            source_key: spec.source_key,
            namespace,
            instance,
            ops,
        }),
        Some("ConfigMap") => Ok(Handler::ConfigMap {
            name: bk.name,
            path: spec.path,
            source_key: spec.source_key,
            namespace,
            instance,
            ops,
        }),
        Some(other) => Err(BindError::HandlerNotFound(format!(
            "no handler family for objectType {other:?} ({key:?})"
        ))),
    }
}

impl Handler<'_> {
    pub async fn handle(&self) -> BindResult<HandlerResult> {
        match self {
            Handler::Attribute {
                name,
                path,
                instance,
            } => {
                let value = extract_path(instance, path)
                    .ok_or_else(|| {
                        BindError::HandlerExecution(format!("path {path:?} not found"))
                    })?
                    .clone();
                Ok(HandlerResult {
                    raw_data: graft(path, value.clone()),
                    data: BTreeMap::from([(name.clone(), value)]),
                })
            }
            Handler::Secret {
                name,
                path,
                source_key,
                namespace,
                instance,
                ops,
            } => {
                let data =
                    referent_data(*ops, namespace, instance, path, "secrets", true).await?;
                narrowed(name, path, source_key.as_deref(), data)
            }
            Handler::ConfigMap {
                name,
                path,
                source_key,
                namespace,
                instance,
                ops,
            } => {
                let data =
                    referent_data(*ops, namespace, instance, path, "configmaps", false).await?;
                narrowed(name, path, source_key.as_deref(), data)
            }
        }
    }
}

/// Follow `path` to a referent name, fetch it and return its `data` map
/// (base64-decoded for secrets).
async fn referent_data(
    ops: &dyn ClusterOps,
    namespace: &str,
    instance: &Json,
    path: &str,
    plural: &str,
    decode: bool,
) -> BindResult<Map<String, Json>> {
    let referent = extract_path(instance, path)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            BindError::HandlerExecution(format!("path {path:?} does not name a {plural} entry"))
        })?;
    let rt = ResourceType {
        group: String::new(),
        version: "v1".into(),
        resource: plural.into(),
    };
    let doc = ops
        .fetch_object(namespace, &rt, referent)
        .await
        .map_err(|e| BindError::HandlerExecution(format!("fetching {plural}/{referent}: {e}")))?;
    let data = doc
        .get("data")
        .and_then(|d| d.as_object())
        .cloned()
        .unwrap_or_default();
    if !decode {
        return Ok(data);
    }
    let mut out = Map::new();
    for (k, v) in data {
        let s = v.as_str().ok_or_else(|| {
            BindError::HandlerExecution(format!("{plural}/{referent} data {k:?} is not a string"))
        })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| {
                BindError::HandlerExecution(format!("{plural}/{referent} data {k:?}: {e}"))
            })?;
        let text = String::from_utf8(bytes).map_err(|e| {
            BindError::HandlerExecution(format!("{plural}/{referent} data {k:?}: {e}"))
        })?;
        out.insert(k, Json::String(text));
    }
    Ok(out)
}

fn narrowed(
    name: &str,
    path: &str,
    source_key: Option<&str>,
    data: Map<String, Json>,
) -> BindResult<HandlerResult> {
    let bound = match source_key {
        Some(sk) => data
            .get(sk)
            .cloned()
            .ok_or_else(|| BindError::HandlerExecution(format!("sourceKey {sk:?} absent")))?,
        None => Json::Object(data.clone()),
    };
    Ok(HandlerResult {
        raw_data: graft(path, Json::Object(data)),
        data: BTreeMap::from([(name.to_string(), bound)]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use svcbind_api::MockCluster;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn parse_key_classifies_failures() {
        assert_eq!(
            parse_key("service.binding/host").unwrap(),
            BindingKey { name: "host".into() }
        );
        assert!(matches!(
            parse_key("service.binding"),
            Err(BindError::EmptyAnnotationName(_))
        ));
        assert!(matches!(
            parse_key("service.binding/"),
            Err(BindError::EmptyAnnotationName(_))
        ));
        assert!(matches!(
            parse_key("example.com/foo"),
            Err(BindError::HandlerNotFound(_))
        ));
        assert!(matches!(
            parse_key("service.bindingish/foo"),
            Err(BindError::HandlerNotFound(_))
        ));
    }

    #[test]
    fn parse_value_accepts_the_grammar() {
        let spec = parse_value("path={.status.host}").unwrap();
        assert_eq!(spec.path, "status.host");
        assert_eq!(spec.object_type, None);

        let spec =
            parse_value("path={.status.creds},objectType=Secret,sourceKey=user").unwrap();
        assert_eq!(spec.path, "status.creds");
        assert_eq!(spec.object_type.as_deref(), Some("Secret"));
        assert_eq!(spec.source_key.as_deref(), Some("user"));

        assert!(matches!(
            parse_value(""),
            Err(BindError::HandlerExecution(_))
        ));
        assert!(matches!(
            parse_value("objectType=Secret"),
            Err(BindError::HandlerExecution(_))
        ));
        assert!(matches!(
            parse_value("path={.a..b}"),
            Err(BindError::HandlerExecution(_))
        ));
    }

    #[test]
    fn extract_path_walks_objects_and_arrays() {
        let doc = json!({"spec": {"hosts": ["a", "b"], "replicas": 3}});
        assert_eq!(extract_path(&doc, "spec.hosts[1]"), Some(&json!("b")));
        assert_eq!(extract_path(&doc, "spec.replicas"), Some(&json!(3)));
        assert_eq!(extract_path(&doc, "spec.missing"), None);
        assert_eq!(extract_path(&doc, "spec.replicas[0]"), None);
    }

    #[test]
    fn collector_layers_with_instance_top_precedence() {
        let desc = json!({
            "statusDescriptors": [
                {"path": "host", "x-descriptors": ["service.binding"]},
                {"path": "port", "x-descriptors": ["service.binding"]}
            ]
        });
        let crd = json!({"metadata": {"annotations": {
            "service.binding/host": "path={.status.hostFromCrd}",
            "service.binding/user": "path={.status.user}"
        }}});
        let instance = json!({"metadata": {"annotations": {
            "service.binding/host": "path={.status.hostFromInstance}"
        }}});

        let anns = collect_annotations(Some(&desc), Some(&crd), &instance);
        assert_eq!(
            anns.get("service.binding/host").unwrap(),
            "path={.status.hostFromInstance}"
        );
        assert_eq!(
            anns.get("service.binding/user").unwrap(),
            "path={.status.user}"
        );
        assert_eq!(
            anns.get("service.binding/port").unwrap(),
            "path={.status.port}"
        );
    }

    #[test]
    fn description_annotations_mark_secret_descriptors() {
        let desc = json!({
            "specDescriptors": [{
                "path": "dbCredentials",
                "displayName": "credentials",
                "x-descriptors": ["service.binding:secret"]
            }]
        });
        let anns = description_annotations(&desc);
        assert_eq!(
            anns.get("service.binding/credentials").unwrap(),
            "path={.spec.dbCredentials},objectType=Secret"
        );
    }

    #[tokio::test]
    async fn attribute_handler_reads_and_grafts() {
        let ops = MockCluster::new();
        let instance = json!({"status": {"host": "db.example.com"}});
        let h = dispatch(
            &ops,
            "ns1",
            "service.binding/host",
            "path={.status.host}",
            &instance,
        )
        .unwrap();
        let r = h.handle().await.unwrap();
        assert_eq!(r.data.get("host"), Some(&json!("db.example.com")));
        assert_eq!(r.raw_data, json!({"status": {"host": "db.example.com"}}));
    }

    #[tokio::test]
    async fn secret_handler_resolves_and_decodes() {
        let mut ops = MockCluster::new();
        ops.add_object(
            "ns1",
            "secrets",
            "db-creds",
            json!({"apiVersion": "v1", "kind": "Secret",
                   "data": {"user": b64("admin"), "password": b64("s3cr3t")}}),
        );
        let instance = json!({"status": {"creds": "db-creds"}});
        let h = dispatch(
            &ops,
            "ns1",
            "service.binding/credentials",
            "path={.status.creds},objectType=Secret",
            &instance,
        )
        .unwrap();
        let r = h.handle().await.unwrap();
        assert_eq!(
            r.data.get("credentials"),
            Some(&json!({"user": "admin", "password": "s3cr3t"}))
        );
        assert_eq!(
            r.raw_data,
            json!({"status": {"creds": {"user": "admin", "password": "s3cr3t"}}})
        );
    }

    #[tokio::test]
    async fn secret_handler_narrows_by_source_key() {
        let mut ops = MockCluster::new();
        ops.add_object(
            "ns1",
            "secrets",
            "db-creds",
            json!({"data": {"user": b64("admin")}}),
        );
        let instance = json!({"status": {"creds": "db-creds"}});
        let h = dispatch(
            &ops,
            "ns1",
            "service.binding/username",
            "path={.status.creds},objectType=Secret,sourceKey=user",
            &instance,
        )
        .unwrap();
        let r = h.handle().await.unwrap();
        assert_eq!(r.data.get("username"), Some(&json!("admin")));
    }

    #[tokio::test]
    async fn missing_referent_is_an_execution_failure() {
        let ops = MockCluster::new();
        let instance = json!({"status": {"creds": "nope"}});
        let h = dispatch(
            &ops,
            "ns1",
            "service.binding/credentials",
            "path={.status.creds},objectType=Secret",
            &instance,
        )
        .unwrap();
        assert!(matches!(
            h.handle().await,
            Err(BindError::HandlerExecution(_))
        ));
    }

    #[test]
    fn unknown_object_type_is_handler_not_found() {
        let ops = MockCluster::new();
        let instance = json!({});
        assert!(matches!(
            dispatch(
                &ops,
                "ns1",
                "service.binding/x",
                "path={.spec.x},objectType=Endpoint",
                &instance
            ),
            Err(BindError::HandlerNotFound(_))
        ));
    }
}
