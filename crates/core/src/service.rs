//! Reduced `v1/Service`: only what the DNS side reads.

use std::fmt;

use k8s_openapi::api::core::v1 as api;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::Resource;
use kube::core::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{Meta, Projector};

/// Cluster IP value marking a headless service.
pub const CLUSTER_IP_NONE: &str = "None";

/// Port number of the placeholder entry stored for services without ports.
pub const SENTINEL_PORT: i32 = -1;

/// Stripped down `v1/Service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub version: String,
    pub name: String,
    pub namespace: String,
    pub index: String,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    #[serde(rename = "type")]
    pub type_: ServiceType,
    pub external_name: String,
    /// Never empty; see [`ServicePort::sentinel`].
    pub ports: SmallVec<[ServicePort; 2]>,
}

impl Service {
    pub fn is_headless(&self) -> bool { self.cluster_ip == CLUSTER_IP_NONE }

    pub fn is_external_name(&self) -> bool { self.type_ == ServiceType::ExternalName }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<TargetPort>,
}

impl ServicePort {
    /// Stand-in for "no declared ports" so port lists are never empty.
    pub fn sentinel() -> Self {
        Self { name: None, protocol: None, port: SENTINEL_PORT, target_port: None }
    }

    pub fn is_sentinel(&self) -> bool { self.port == SENTINEL_PORT }
}

impl From<api::ServicePort> for ServicePort {
    fn from(p: api::ServicePort) -> Self {
        Self {
            name: p.name,
            protocol: p.protocol,
            port: p.port,
            target_port: p.target_port.map(TargetPort::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetPort {
    Int(i32),
    Name(String),
}

impl From<IntOrString> for TargetPort {
    fn from(v: IntOrString) -> Self {
        match v {
            IntOrString::Int(n) => TargetPort::Int(n),
            IntOrString::String(s) => TargetPort::Name(s),
        }
    }
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Int(n) => write!(f, "{}", n),
            TargetPort::Name(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
    /// Any type string this crate does not know, kept verbatim.
    Other(String),
}

impl ServiceType {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ExternalName => "ExternalName",
            ServiceType::Other(s) => s,
        }
    }
}

impl From<String> for ServiceType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ClusterIP" => ServiceType::ClusterIP,
            "NodePort" => ServiceType::NodePort,
            "LoadBalancer" => ServiceType::LoadBalancer,
            "ExternalName" => ServiceType::ExternalName,
            _ => ServiceType::Other(s),
        }
    }
}

// The API server defaults an unset type to ClusterIP.
impl From<Option<String>> for ServiceType {
    fn from(s: Option<String>) -> Self {
        s.map(ServiceType::from).unwrap_or(ServiceType::ClusterIP)
    }
}

impl From<ServiceType> for String {
    fn from(t: ServiceType) -> Self {
        match t {
            ServiceType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Index key for a service: `namespace/name`.
pub fn service_key(namespace: &str, name: &str) -> String {
    let mut key = String::with_capacity(namespace.len() + name.len() + 1);
    key.push_str(namespace);
    key.push('/');
    key.push_str(name);
    key
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key {0:?}: expected namespace/name")]
    MissingSeparator(String),
    #[error("invalid key {0:?}: namespace and name must be non-empty and contain no '/'")]
    Malformed(String),
}

/// Split a key produced by [`service_key`] back into `(namespace, name)`.
pub fn parse_service_key(key: &str) -> Result<(&str, &str), KeyError> {
    let (namespace, name) = key.split_once('/').ok_or_else(|| KeyError::MissingSeparator(key.to_string()))?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return Err(KeyError::Malformed(key.to_string()));
    }
    Ok((namespace, name))
}

impl From<api::Service> for Service {
    fn from(svc: api::Service) -> Self {
        let meta = svc.metadata;
        let spec = svc.spec.unwrap_or_default();
        let name = meta.name.unwrap_or_default();
        let namespace = meta.namespace.unwrap_or_default();

        let ports: SmallVec<[ServicePort; 2]> = match spec.ports {
            Some(ports) if !ports.is_empty() => ports.into_iter().map(ServicePort::from).collect(),
            _ => smallvec![ServicePort::sentinel()],
        };

        Service {
            version: meta.resource_version.unwrap_or_default(),
            index: service_key(&namespace, &name),
            name,
            namespace,
            cluster_ip: spec.cluster_ip.unwrap_or_default(),
            type_: ServiceType::from(spec.type_),
            external_name: spec.external_name.unwrap_or_default(),
            ports,
        }
    }
}

fn is_service(obj: &DynamicObject) -> bool {
    obj.types
        .as_ref()
        .map(|t| t.api_version == api::Service::API_VERSION && t.kind == api::Service::KIND)
        .unwrap_or(false)
}

/// Reduce a watched object to a [`Service`].
///
/// Returns `None` for any object that is not a `v1/Service`; callers dispatch
/// every watched kind through here and skip the misses. The input is consumed,
/// so nothing can observe it after the call.
pub fn to_service(obj: DynamicObject) -> Option<Service> {
    if !is_service(&obj) {
        trace!(kind = ?obj.types.as_ref().map(|t| t.kind.as_str()), "not a service; skipping");
        return None;
    }
    let name = obj.metadata.name.clone();
    let decoded = serde_json::to_value(obj).and_then(serde_json::from_value::<api::Service>);
    match decoded {
        Ok(svc) => Some(Service::from(svc)),
        Err(e) => {
            warn!(name = ?name, error = %e, "failed to decode service body");
            None
        }
    }
}

impl Meta for Service {
    fn name(&self) -> &str { &self.name }
    fn set_name(&mut self, _name: &str) {}

    fn namespace(&self) -> &str { &self.namespace }
    fn set_namespace(&mut self, _namespace: &str) {}

    fn resource_version(&self) -> &str { &self.version }
    fn set_resource_version(&mut self, _version: &str) {}

    fn key(&self) -> String { self.index.clone() }
}

/// Projector for `v1/Service`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceProjector;

impl Projector for ServiceProjector {
    type Output = Service;

    fn api_resource(&self) -> ApiResource { ApiResource::erase::<api::Service>(&()) }

    fn project(&self, obj: DynamicObject) -> Option<Service> { to_service(obj) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ports: &[i32]) -> Service {
        Service {
            version: "7".into(),
            name: "web".into(),
            namespace: "default".into(),
            index: service_key("default", "web"),
            cluster_ip: "10.0.0.5".into(),
            type_: ServiceType::ClusterIP,
            external_name: String::new(),
            ports: ports.iter().map(|p| ServicePort { name: None, protocol: Some("TCP".into()), port: *p, target_port: None }).collect(),
        }
    }

    #[test]
    fn key_is_namespace_then_name() {
        assert_eq!(service_key("ns", "svc"), "ns/svc");
        assert_eq!(service_key("", ""), "/");
    }

    #[test]
    fn parse_key_roundtrips_and_rejects_garbage() {
        assert_eq!(parse_service_key("ns/svc"), Ok(("ns", "svc")));
        assert_eq!(parse_service_key("svc"), Err(KeyError::MissingSeparator("svc".into())));
        assert_eq!(parse_service_key("/svc"), Err(KeyError::Malformed("/svc".into())));
        assert_eq!(parse_service_key("a/b/c"), Err(KeyError::Malformed("a/b/c".into())));
    }

    #[test]
    fn setters_do_not_mutate() {
        let mut s = record(&[80]);
        s.set_name("other");
        s.set_namespace("kube-system");
        s.set_resource_version("99");
        assert_eq!(s.name(), "web");
        assert_eq!(s.namespace(), "default");
        assert_eq!(s.resource_version(), "7");
        assert_eq!(s.key(), "default/web");
    }

    #[test]
    fn clone_has_independent_ports() {
        let original = record(&[80, 443]);
        let mut copy = original.clone();
        assert_eq!(copy, original);
        copy.ports[0].port = 8080;
        copy.ports.push(ServicePort::sentinel());
        assert_eq!(original.ports.len(), 2);
        assert_eq!(original.ports[0].port, 80);
    }

    #[test]
    fn service_type_keeps_unknown_strings() {
        assert_eq!(ServiceType::from(None::<String>), ServiceType::ClusterIP);
        assert_eq!(ServiceType::from(Some("ExternalName".to_string())), ServiceType::ExternalName);
        let t = ServiceType::from("Weird".to_string());
        assert_eq!(t, ServiceType::Other("Weird".into()));
        assert_eq!(String::from(t), "Weird");
    }

    #[test]
    fn headless_detection() {
        let mut s = record(&[53]);
        assert!(!s.is_headless());
        s.cluster_ip = CLUSTER_IP_NONE.into();
        assert!(s.is_headless());
    }

    #[test]
    fn serializes_with_wire_names() {
        let v = serde_json::to_value(record(&[80])).unwrap();
        assert_eq!(v["clusterIP"], "10.0.0.5");
        assert_eq!(v["type"], "ClusterIP");
        assert_eq!(v["index"], "default/web");
        assert_eq!(v["ports"][0]["port"], 80);
    }
}
