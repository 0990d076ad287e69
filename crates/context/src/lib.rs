//! Service context construction: merge engine, builder and owned-resource
//! walker.

#![forbid(unsafe_code)]

use metrics::counter;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use svcbind_annotations::{collect_annotations, dispatch, HandlerResult};
use svcbind_api::{BindError, BindResult, ClusterOps, ServiceSelector};
use svcbind_core::{ServiceContext, ServiceContextList};
use tracing::{debug, warn};

// ----------------- Merge engine -----------------

/// Fold a fresh handler patch over the accumulated output document.
///
/// The patch wins for every key it explicitly sets; the accumulated
/// document fills the keys the patch left out and re-asserts itself over
/// nulls the patch produced. Nested objects merge recursively, arrays and
/// scalars are taken whole from whichever side wins. Both roots must be
/// objects; anything else is the fatal merge class.
pub fn merge_object(acc: &Json, patch: &Json) -> BindResult<Json> {
    if !patch.is_object() || !acc.is_object() {
        return Err(BindError::Merge(
            "expected object documents on both sides".into(),
        ));
    }
    let mut merged = patch.clone();
    fold_under(&mut merged, acc);
    Ok(merged)
}

fn fold_under(dst: &mut Json, src: &Json) {
    use serde_json::map::Entry;
    let (dst_map, src_map) = match (dst.as_object_mut(), src.as_object()) {
        (Some(d), Some(s)) => (d, s),
        _ => return,
    };
    for (k, sv) in src_map {
        match dst_map.entry(k.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(sv.clone());
            }
            Entry::Occupied(mut slot) => {
                let dv = slot.get_mut();
                if dv.is_null() {
                    // prior state re-asserts itself over fresh nulls
                    *dv = sv.clone();
                } else if dv.is_object() && sv.is_object() {
                    fold_under(dv, sv);
                }
                // patch set a concrete value here; it stays
            }
        }
    }
}

/// Merge variable contributions into the accumulated map: override on
/// conflict for scalars, append on conflict for lists, recursive merge for
/// nested maps. A map meeting a list is the one shape conflict that cannot
/// be reconciled and aborts the build.
pub fn merge_env(
    acc: &mut BTreeMap<String, Json>,
    src: BTreeMap<String, Json>,
) -> BindResult<()> {
    use std::collections::btree_map::Entry;
    for (k, sv) in src {
        match acc.entry(k) {
            Entry::Vacant(slot) => {
                slot.insert(sv);
            }
            Entry::Occupied(mut slot) => {
                let name = slot.key().clone();
                merge_env_value(&name, slot.get_mut(), sv)?;
            }
        }
    }
    Ok(())
}

fn merge_env_value(key: &str, dst: &mut Json, src: Json) -> BindResult<()> {
    if dst.is_array() && src.is_array() {
        if let (Json::Array(d), Json::Array(s)) = (dst, src) {
            d.extend(s);
        }
        return Ok(());
    }
    if dst.is_object() && src.is_object() {
        use serde_json::map::Entry;
        if let (Json::Object(d), Json::Object(s)) = (dst, src) {
            for (k, sv) in s {
                match d.entry(k) {
                    Entry::Vacant(slot) => {
                        slot.insert(sv);
                    }
                    Entry::Occupied(mut slot) => {
                        let name = slot.key().clone();
                        merge_env_value(&name, slot.get_mut(), sv)?;
                    }
                }
            }
        }
        return Ok(());
    }
    if (dst.is_object() && src.is_array()) || (dst.is_array() && src.is_object()) {
        return Err(BindError::Merge(format!(
            "variable {key:?}: cannot reconcile a map with a list"
        )));
    }
    *dst = src;
    Ok(())
}

// ----------------- Service context builder -----------------

/// Build one ServiceContext for a resource addressed by gvk key and name.
///
/// Type resolution and the instance fetch are fatal; the CRD and
/// CRDDescription layers are best-effort. Annotation keys are processed in
/// lexicographic order; handler execution failures drop that annotation,
/// dispatcher classification failures abandon the whole selector, merge
/// failures abort everything.
pub async fn build_service_context(
    ops: &dyn ClusterOps,
    ns: &str,
    gvk_key: &str,
    name: &str,
    naming_template: &str,
    bind_as_files: bool,
    id: Option<String>,
    env_prefix: Option<&str>,
) -> BindResult<ServiceContext> {
    let rt = ops.resolve_type(gvk_key).await?;
    let kind = ops.resolve_kind(&rt).await?;
    let obj = ops.fetch_object(ns, &rt, name).await?;

    let crd = match ops.fetch_crd(&kind).await {
        Ok(crd) => crd,
        Err(BindError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let description = match &crd {
        Some(crd) => match ops.fetch_crd_description(ns, &kind, crd).await {
            Ok(desc) => desc,
            Err(BindError::NotFound(_)) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };

    let anns = collect_annotations(description.as_ref(), crd.as_ref(), &obj);

    // output accumulates handler patches; the fetched object stays untouched.
    let mut output = obj.clone();
    let mut env_vars: BTreeMap<String, Json> = BTreeMap::new();

    for (key, value) in &anns {
        let handler = match dispatch(ops, ns, key, value, &obj) {
            Ok(h) => h,
            Err(e) if e.is_skip_selector() => return Err(e),
            Err(e) => {
                debug!(key = %key, error = %e, "dropping annotation");
                counter!("svcbind_annotations_dropped", 1u64);
                continue;
            }
        };
        let result = match handler.handle().await {
            Ok(r) => r,
            Err(e) => {
                debug!(key = %key, error = %e, "handler failed; dropping annotation");
                counter!("svcbind_annotations_dropped", 1u64);
                continue;
            }
        };
        apply_result(&mut output, &mut env_vars, result, env_prefix)?;
    }

    counter!("svcbind_contexts_built", 1u64);
    Ok(ServiceContext {
        service: output,
        env_vars,
        naming_template: naming_template.to_string(),
        bind_as_files,
        id,
    })
}

fn apply_result(
    output: &mut Json,
    env_vars: &mut BTreeMap<String, Json>,
    result: HandlerResult,
    env_prefix: Option<&str>,
) -> BindResult<()> {
    *output = merge_object(output, &result.raw_data)?;
    let data = match env_prefix {
        Some(prefix) => result
            .data
            .into_iter()
            .map(|(name, v)| (format!("{prefix}_{name}"), v))
            .collect(),
        None => result.data,
    };
    merge_env(env_vars, data)
}

/// Build contexts for all selectors, best-effort across selectors.
///
/// A selector failing with one of the two recoverable dispatch classes is
/// logged and skipped; every other failure aborts. With `include_owned`,
/// each selector's context is followed by contexts for the resources it
/// owns.
pub async fn build_service_contexts(
    ops: &dyn ClusterOps,
    default_ns: &str,
    selectors: &[ServiceSelector],
    include_owned: bool,
    bind_as_files: bool,
    naming_template: &str,
) -> BindResult<ServiceContextList> {
    let mut out = ServiceContextList::default();
    for sel in selectors {
        let ns = sel
            .namespace
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(default_ns);
        let ctx = match build_service_context(
            ops,
            ns,
            &sel.gvk_key(),
            &sel.name,
            naming_template,
            bind_as_files,
            sel.id.clone(),
            None,
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) if e.is_skip_selector() => {
                debug!(selector = %sel.name, error = %e, "skipping selector");
                counter!("svcbind_selectors_skipped", 1u64);
                continue;
            }
            Err(e) => return Err(e),
        };

        let owner_uid = object_uid(&ctx.service);
        out.push(ctx);

        if include_owned {
            match owner_uid {
                Some(uid) => {
                    let owned =
                        find_owned_contexts(ops, ns, &uid, naming_template, bind_as_files).await?;
                    out.extend(owned);
                }
                None => warn!(selector = %sel.name, "service has no uid; skipping owned walk"),
            }
        }
    }
    Ok(out)
}

fn object_uid(doc: &Json) -> Option<String> {
    doc.get("metadata")
        .and_then(|m| m.get("uid"))
        .and_then(|u| u.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

// ----------------- Owned resource walker -----------------

/// Build one context per resource owned by `owner_uid` in `ns`.
///
/// Listing failure is fatal for the selector's whole expansion. Derived
/// variables take the owned resource's own lower-cased kind as name prefix,
/// keeping them apart from the parent's. One owner level only.
pub async fn find_owned_contexts(
    ops: &dyn ClusterOps,
    ns: &str,
    owner_uid: &str,
    naming_template: &str,
    bind_as_files: bool,
) -> BindResult<ServiceContextList> {
    let owned = match ops.list_owned(ns, owner_uid).await {
        Ok(docs) => docs,
        Err(BindError::OwnedListing(e)) => return Err(BindError::OwnedListing(e)),
        Err(e) => return Err(BindError::OwnedListing(e.to_string())),
    };

    let mut out = ServiceContextList::default();
    for doc in owned {
        let (gvk_key, kind, name) = owned_identity(&doc)?;
        let prefix = kind.to_ascii_lowercase();
        let ctx = build_service_context(
            ops,
            ns,
            &gvk_key,
            &name,
            naming_template,
            bind_as_files,
            None,
            Some(&prefix),
        )
        .await?;
        out.push(ctx);
    }
    Ok(out)
}

fn owned_identity(doc: &Json) -> BindResult<(String, String, String)> {
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str());
    let kind = doc.get("kind").and_then(|v| v.as_str());
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str());
    match (api_version, kind, name) {
        (Some(av), Some(k), Some(n)) => Ok((format!("{av}/{k}"), k.to_string(), n.to_string())),
        _ => Err(BindError::OwnedListing(
            "owned resource missing apiVersion/kind/name".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_merge_patch_wins_for_its_keys() {
        let acc = json!({"status": {"host": "old", "port": 5432}});
        let patch = json!({"status": {"host": "new"}});
        let merged = merge_object(&acc, &patch).unwrap();
        assert_eq!(
            merged,
            json!({"status": {"host": "new", "port": 5432}})
        );
    }

    #[test]
    fn object_merge_reasserts_accumulated_over_patch_nulls() {
        let acc = json!({"status": {"host": "kept"}});
        let patch = json!({"status": {"host": null}, "spec": {"x": 1}});
        let merged = merge_object(&acc, &patch).unwrap();
        assert_eq!(
            merged,
            json!({"status": {"host": "kept"}, "spec": {"x": 1}})
        );
    }

    #[test]
    fn object_merge_keeps_patch_shape_on_mismatch() {
        // accumulated scalar vs patch map: the patch's concrete value stays
        let acc = json!({"status": {"creds": "secret-name"}});
        let patch = json!({"status": {"creds": {"user": "admin"}}});
        let merged = merge_object(&acc, &patch).unwrap();
        assert_eq!(merged, json!({"status": {"creds": {"user": "admin"}}}));
    }

    #[test]
    fn object_merge_requires_object_roots() {
        assert!(matches!(
            merge_object(&json!({}), &json!("scalar")),
            Err(BindError::Merge(_))
        ));
        assert!(matches!(
            merge_object(&json!([1]), &json!({})),
            Err(BindError::Merge(_))
        ));
    }

    #[test]
    fn env_merge_overrides_scalars_and_appends_lists() {
        let mut acc = BTreeMap::from([
            ("host".to_string(), json!("old")),
            ("tags".to_string(), json!(["a"])),
        ]);
        merge_env(
            &mut acc,
            BTreeMap::from([
                ("host".to_string(), json!("new")),
                ("tags".to_string(), json!(["b", "c"])),
            ]),
        )
        .unwrap();
        assert_eq!(acc.get("host"), Some(&json!("new")));
        assert_eq!(acc.get("tags"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn env_merge_recurses_into_maps() {
        let mut acc = BTreeMap::from([("creds".to_string(), json!({"user": "a", "keep": true}))]);
        merge_env(
            &mut acc,
            BTreeMap::from([("creds".to_string(), json!({"user": "b"}))]),
        )
        .unwrap();
        assert_eq!(acc.get("creds"), Some(&json!({"user": "b", "keep": true})));
    }

    #[test]
    fn env_merge_rejects_map_list_conflict() {
        let mut acc = BTreeMap::from([("v".to_string(), json!({"k": 1}))]);
        let err = merge_env(&mut acc, BTreeMap::from([("v".to_string(), json!([1]))]));
        assert!(matches!(err, Err(BindError::Merge(_))));
    }

    #[test]
    fn env_merge_is_cumulative_across_contributions() {
        // two handler results for the same list-shaped variable concatenate
        let mut acc = BTreeMap::new();
        merge_env(&mut acc, BTreeMap::from([("uris".to_string(), json!(["a"]))])).unwrap();
        merge_env(&mut acc, BTreeMap::from([("uris".to_string(), json!(["b"]))])).unwrap();
        assert_eq!(acc.get("uris"), Some(&json!(["a", "b"])));
    }
}
