use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::service::{Service, ServiceKey};

/// Kind of object carried by an [`ObjectEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Service,
    Endpoint,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Service => write!(f, "Service"),
            ObjectKind::Endpoint => write!(f, "Endpoint"),
        }
    }
}

/// Type of change delivered by the watch source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

/// Snapshot of a watched object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    Service(Service),
    Endpoint(Endpoint),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Service(_) => ObjectKind::Service,
            Object::Endpoint(_) => ObjectKind::Endpoint,
        }
    }

    /// Key of the Service this object belongs to.
    pub fn service_key(&self) -> ServiceKey {
        match self {
            Object::Service(svc) => svc.key(),
            Object::Endpoint(ep) => ep.service_key(),
        }
    }
}

/// A single object-state change, ordered per Service key and delivered
/// at least once.
///
/// Deletes may omit the snapshot; the key alone identifies what to remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub kind: ObjectKind,
    pub key: ServiceKey,
    pub event_type: EventType,
    #[serde(default)]
    pub object: Option<Object>,
}

impl ObjectEvent {
    pub fn add(object: Object) -> Self {
        Self::with_object(EventType::Add, object)
    }

    pub fn update(object: Object) -> Self {
        Self::with_object(EventType::Update, object)
    }

    pub fn delete(kind: ObjectKind, key: ServiceKey) -> Self {
        Self {
            kind,
            key,
            event_type: EventType::Delete,
            object: None,
        }
    }

    fn with_object(event_type: EventType, object: Object) -> Self {
        Self {
            kind: object.kind(),
            key: object.service_key(),
            event_type,
            object: Some(object),
        }
    }

    /// Terminal events supersede queued work for the same key.
    pub fn is_service_delete(&self) -> bool {
        self.kind == ObjectKind::Service && self.event_type == EventType::Delete
    }
}

/// Mutation type of a raw registry record on the API server watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEventType {
    Put,
    Delete,
}

/// A raw registry record as streamed by `/api/v1/watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub seq: u64,
    pub event_type: RegistryEventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}
