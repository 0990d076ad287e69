//! svcbind core types: service contexts and watch deltas.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Uid = [u8; 16];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub uid: Uid,
    pub kind: DeltaKind,
    /// Raw object (managedFields stripped by the producer)
    pub raw: serde_json::Value,
}

/// Resolved binding data for one service resource.
///
/// `service` holds a patched copy of the resource; the object fetched from
/// the cluster is never mutated. `env_vars` values may be scalars, lists or
/// nested maps; the final flattening into env assignments or file
/// projections happens outside this engine, driven by `naming_template`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceContext {
    pub service: serde_json::Value,
    pub env_vars: BTreeMap<String, serde_json::Value>,
    pub naming_template: String,
    pub bind_as_files: bool,
    /// Optional name the service can be referred by in custom variables.
    pub id: Option<String>,
}

/// Ordered collection of contexts: selector declaration order, then
/// owned-resource discovery order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceContextList(pub Vec<ServiceContext>);

impl ServiceContextList {
    pub fn push(&mut self, ctx: ServiceContext) {
        self.0.push(ctx);
    }

    pub fn extend(&mut self, other: ServiceContextList) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceContext> {
        self.0.iter()
    }

    /// Service snapshots in context order.
    pub fn services(&self) -> Vec<&serde_json::Value> {
        self.0.iter().map(|c| &c.service).collect()
    }
}

impl IntoIterator for ServiceContextList {
    type Item = ServiceContext;
    type IntoIter = std::vec::IntoIter<ServiceContext>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

pub mod prelude {
    pub use super::{Delta, DeltaKind, ServiceContext, ServiceContextList, Uid};
}
