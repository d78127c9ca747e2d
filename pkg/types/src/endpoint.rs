use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::{Protocol, ServiceKey};

/// An address of a backend pod serving a Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub pod_id: Option<String>,
    /// Not-ready addresses stay in the object but receive no traffic.
    #[serde(default = "default_ready")]
    pub ready: bool,
    /// Relative traffic share among ready addresses.
    #[serde(default = "default_weight")]
    pub weight: u16,
}

fn default_ready() -> bool {
    true
}

fn default_weight() -> u16 {
    pkg_constants::proxy::DEFAULT_ENDPOINT_WEIGHT
}

/// A port exposed by a backend pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Endpoint represents the set of backend addresses for a Service.
/// Equivalent to an EndpointSlice in Kubernetes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub namespace: String,
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    /// Key of the owning Service.
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.service_name)
    }

    /// Backend port for a Service port: the endpoint port with the same name,
    /// falling back to the Service's target port.
    pub fn port_for(&self, name: &str, protocol: Protocol, target_port: u16) -> u16 {
        self.ports
            .iter()
            .find(|p| p.name == name && p.protocol == protocol)
            .map(|p| p.port)
            .unwrap_or(target_port)
    }

    /// Addresses that may receive traffic.
    pub fn ready_addresses(&self) -> impl Iterator<Item = &EndpointAddress> {
        self.addresses.iter().filter(|a| a.ready)
    }
}
