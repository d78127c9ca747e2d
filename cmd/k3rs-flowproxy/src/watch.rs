//! API server watch client: turns the registry SSE stream into object events.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use pkg_constants::network::{ENDPOINTS_PREFIX, SERVICES_PREFIX, WATCH_PATH};
use pkg_types::endpoint::Endpoint;
use pkg_types::service::{Service, ServiceKey};
use pkg_types::watch::{Object, ObjectEvent, ObjectKind, RegistryEvent, RegistryEventType};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Splits a byte stream into SSE `data` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // Comments (keep-alives) and other fields are ignored.
        }
        events
    }
}

/// Maps registry records to Service-keyed object events.
///
/// Registry keys name objects by id, so the translator remembers which
/// Service each key belongs to in order to route deletes.
#[derive(Debug, Default)]
pub struct RegistryTranslator {
    known: HashMap<String, ServiceKey>,
}

impl RegistryTranslator {
    /// `Ok(None)` for records outside Services and Endpoints, or deletes of
    /// keys never seen.
    pub fn translate(&mut self, event: &RegistryEvent) -> anyhow::Result<Option<ObjectEvent>> {
        let kind = if event.key.starts_with(SERVICES_PREFIX) {
            ObjectKind::Service
        } else if event.key.starts_with(ENDPOINTS_PREFIX) {
            ObjectKind::Endpoint
        } else {
            return Ok(None);
        };

        match event.event_type {
            RegistryEventType::Delete => match self.known.remove(&event.key) {
                Some(key) => Ok(Some(ObjectEvent::delete(kind, key))),
                None => {
                    debug!("Delete of unknown registry key {}", event.key);
                    Ok(None)
                }
            },
            RegistryEventType::Put => {
                let value = event
                    .value
                    .as_deref()
                    .with_context(|| format!("put without value: {}", event.key))?;
                let object = match kind {
                    ObjectKind::Service => Object::Service(
                        serde_json::from_slice::<Service>(value)
                            .with_context(|| format!("decoding {}", event.key))?,
                    ),
                    ObjectKind::Endpoint => Object::Endpoint(
                        serde_json::from_slice::<Endpoint>(value)
                            .with_context(|| format!("decoding {}", event.key))?,
                    ),
                };
                let key = object.service_key();
                let seen = self.known.insert(event.key.clone(), key).is_some();
                Ok(Some(if seen {
                    ObjectEvent::update(object)
                } else {
                    ObjectEvent::add(object)
                }))
            }
        }
    }
}

/// Long-lived subscription to the API server watch stream.
pub struct WatchClient {
    client: reqwest::Client,
    server: String,
    token: String,
}

impl WatchClient {
    pub fn new(server: &str, token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Stream events into `tx` until the receiver goes away, reconnecting
    /// with backoff and resuming after the last sequence number seen.
    pub async fn run(self, tx: mpsc::Sender<ObjectEvent>) {
        let mut translator = RegistryTranslator::default();
        let mut last_seq = 0u64;
        let mut delay = RECONNECT_INITIAL_DELAY;

        loop {
            match self.stream(&mut translator, &mut last_seq, &tx).await {
                Ok(()) => {
                    info!("Watch stream closed by server (last seq {})", last_seq);
                    delay = RECONNECT_INITIAL_DELAY;
                }
                Err(e) => warn!("Watch stream failed: {:#}", e),
            }
            if tx.is_closed() {
                info!("Event consumer gone, stopping watch");
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }

    async fn stream(
        &self,
        translator: &mut RegistryTranslator,
        last_seq: &mut u64,
        tx: &mpsc::Sender<ObjectEvent>,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}{}?prefix=/registry/&seq={}",
            self.server, WATCH_PATH, last_seq
        );
        info!("Watching {}", url);
        let mut resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await?
            .error_for_status()?;

        let mut decoder = SseDecoder::default();
        while let Some(chunk) = resp.chunk().await? {
            for data in decoder.push(&chunk) {
                let event: RegistryEvent = match serde_json::from_str(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping undecodable watch event: {}", e);
                        continue;
                    }
                };
                if event.seq <= *last_seq && *last_seq != 0 {
                    continue;
                }
                *last_seq = event.seq;
                match translator.translate(&event) {
                    Ok(Some(object_event)) => {
                        if tx.send(object_event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Skipping registry event {}: {:#}", event.seq, e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::service::{ServiceSpec, ServiceType, SessionAffinity};
    use pkg_types::watch::EventType;

    fn service_record(seq: u64, event_type: RegistryEventType, with_value: bool) -> RegistryEvent {
        let svc = Service {
            id: "abc".to_string(),
            name: "nginx".to_string(),
            namespace: "default".to_string(),
            spec: ServiceSpec {
                selector: Default::default(),
                ports: vec![],
                service_type: ServiceType::ClusterIP,
                session_affinity: SessionAffinity::None,
                session_affinity_config: None,
            },
            cluster_ip: Some("10.96.0.10".to_string()),
            created_at: Utc::now(),
        };
        RegistryEvent {
            seq,
            event_type,
            key: "/registry/services/default/abc".to_string(),
            value: with_value.then(|| serde_json::to_vec(&svc).unwrap()),
        }
    }

    #[test]
    fn test_sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert!(decoder.push(b"1}\n").is_empty());
        assert_eq!(decoder.push(b"\n:keep-alive\n\ndata:x\r\n\r\n"), vec![
            "{\"a\":1}".to_string(),
            "x".to_string()
        ]);
    }

    #[test]
    fn test_put_then_put_then_delete() {
        let mut translator = RegistryTranslator::default();
        let key = ServiceKey::new("default", "nginx");

        let add = translator
            .translate(&service_record(1, RegistryEventType::Put, true))
            .unwrap()
            .unwrap();
        assert_eq!(add.event_type, EventType::Add);
        assert_eq!(add.key, key);

        let update = translator
            .translate(&service_record(2, RegistryEventType::Put, true))
            .unwrap()
            .unwrap();
        assert_eq!(update.event_type, EventType::Update);

        let delete = translator
            .translate(&service_record(3, RegistryEventType::Delete, false))
            .unwrap()
            .unwrap();
        assert!(delete.is_service_delete());
        assert_eq!(delete.key, key);

        // Second delete of the same key is unknown by now.
        assert!(
            translator
                .translate(&service_record(4, RegistryEventType::Delete, false))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_ignores_other_prefixes_and_rejects_bad_values() {
        let mut translator = RegistryTranslator::default();
        let pod = RegistryEvent {
            seq: 1,
            event_type: RegistryEventType::Put,
            key: "/registry/pods/default/p1".to_string(),
            value: Some(b"{}".to_vec()),
        };
        assert!(translator.translate(&pod).unwrap().is_none());

        let broken = RegistryEvent {
            seq: 2,
            event_type: RegistryEventType::Put,
            key: "/registry/endpoints/default/abc".to_string(),
            value: Some(b"not json".to_vec()),
        };
        assert!(translator.translate(&broken).is_err());
        assert!(
            translator
                .translate(&service_record(3, RegistryEventType::Put, false))
                .is_err()
        );
    }
}
