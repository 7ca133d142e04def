//! Object metadata accessors shared by every reduced kind.

/// Minimal metadata surface a cached object exposes so the store can hold
/// different reduced kinds uniformly.
pub trait Meta {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);

    fn namespace(&self) -> &str;
    fn set_namespace(&mut self, namespace: &str);

    /// Opaque revision token, compared for equality only.
    fn resource_version(&self) -> &str;
    fn set_resource_version(&mut self, version: &str);

    /// Index key of the object in the cache.
    fn key(&self) -> String {
        crate::service_key(self.namespace(), self.name())
    }
}
