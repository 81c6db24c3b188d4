//! Desired-state feed for the scheduler.

use std::collections::BTreeMap;
use std::sync::RwLock;

use log::{debug, info};
use tokio::sync::broadcast;

use crate::core::error::{ReconcileError, ReconcileResult};
use crate::core::types::CertificateRequest;
use crate::domain::normalize_domain_set;
use crate::secrets::store::validate_secret_name;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Upsert(CertificateRequest),
    Deleted(String),
}

/// Lists the declared certificate requests and reports changes to them.
pub trait DesiredStateSource: Send + Sync {
    fn list(&self) -> Vec<CertificateRequest>;

    fn get(&self, name: &str) -> Option<CertificateRequest>;

    /// Change feed. Receivers that lag should fall back to [`list`](Self::list).
    fn watch(&self) -> broadcast::Receiver<RequestEvent>;
}

/// Source backed by a map, seeded from configuration.
pub struct InMemorySource {
    requests: RwLock<BTreeMap<String, CertificateRequest>>,
    events: broadcast::Sender<RequestEvent>,
}

impl InMemorySource {
    pub fn new(initial: Vec<CertificateRequest>) -> ReconcileResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let source = Self {
            requests: RwLock::new(BTreeMap::new()),
            events,
        };
        for request in initial {
            source.upsert(request)?;
        }
        Ok(source)
    }

    /// Stores `request` with normalized domains. Unchanged requests emit nothing.
    pub fn upsert(&self, mut request: CertificateRequest) -> ReconcileResult<()> {
        request.domains = normalize_domain_set(&request.domains)
            .map_err(|err| ReconcileError::Configuration(format!("{}: {err}", request.name)))?;
        if request.name.trim().is_empty() {
            return Err(ReconcileError::Configuration("request name is empty".into()));
        }
        validate_secret_name(&request.secret_name)
            .map_err(|err| ReconcileError::Configuration(format!("{}: {err}", request.name)))?;

        let mut requests = self
            .requests
            .write()
            .map_err(|_| ReconcileError::Internal("request table poisoned".into()))?;
        if requests.get(&request.name) == Some(&request) {
            debug!("[source] {} unchanged", request.name);
            return Ok(());
        }
        info!("[source] upsert {} {:?}", request.name, request.domains);
        requests.insert(request.name.clone(), request.clone());
        drop(requests);
        // No receivers yet is fine: the scheduler lists on start.
        let _ = self.events.send(RequestEvent::Upsert(request));
        Ok(())
    }

    /// Returns whether a request was removed.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self
            .requests
            .write()
            .map(|mut requests| requests.remove(name).is_some())
            .unwrap_or(false);
        if removed {
            info!("[source] deleted {}", name);
            let _ = self.events.send(RequestEvent::Deleted(name.to_string()));
        }
        removed
    }
}

impl DesiredStateSource for InMemorySource {
    fn list(&self) -> Vec<CertificateRequest> {
        self.requests
            .read()
            .map(|requests| requests.values().cloned().collect())
            .unwrap_or_default()
    }

    fn get(&self, name: &str) -> Option<CertificateRequest> {
        self.requests
            .read()
            .ok()
            .and_then(|requests| requests.get(name).cloned())
    }

    fn watch(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }
}
