//! kdns core types: reduced objects for the DNS watch-cache.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::core::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};

pub mod meta;
pub mod service;

pub use meta::Meta;
pub use service::{parse_service_key, service_key, to_service, KeyError, Service, ServicePort, ServiceProjector, ServiceType, TargetPort};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A change to one cached object, addressed by its index key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta<T> {
    pub key: String,
    pub kind: DeltaKind,
    /// Reduced object; `None` for deletions.
    pub obj: Option<T>,
}

impl<T: Meta> Delta<T> {
    pub fn applied(obj: T) -> Self {
        Self { key: obj.key(), kind: DeltaKind::Applied, obj: Some(obj) }
    }

    pub fn deleted(key: impl Into<String>) -> Self {
        Self { key: key.into(), kind: DeltaKind::Deleted, obj: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot<T> {
    pub epoch: u64,
    /// Items ordered by index key.
    pub items: BTreeMap<String, T>,
}

impl<T> Default for WorldSnapshot<T> {
    fn default() -> Self {
        Self { epoch: 0, items: BTreeMap::new() }
    }
}

impl<T> WorldSnapshot<T> {
    pub fn get(&self, key: &str) -> Option<&T> { self.items.get(key) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// Projector reduces a watched object into a cache record.
///
/// The watcher hands every object it sees to the same projector regardless of
/// kind; objects the projector does not handle yield `None` and are skipped.
pub trait Projector: Send + Sync {
    type Output: Meta + Clone + Send + Sync + 'static;

    /// API resource the watcher should list and watch for this projector.
    fn api_resource(&self) -> ApiResource;

    fn project(&self, obj: DynamicObject) -> Option<Self::Output>;
}

pub mod prelude {
    pub use super::{service_key, to_service, Delta, DeltaKind, Meta, Projector, Service, ServicePort, ServiceProjector, ServiceType, TargetPort, WorldSnapshot};
}
