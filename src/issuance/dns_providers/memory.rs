use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use log::debug;

use super::{DnsProvider, DnsProviderError, DnsRecord, DnsResult};
use crate::core::error::ReconcileResult;
use crate::issuance::dns::{PropagationChecker, ResolverAnswer};

/// In-process zone used for dry runs and tests.
///
/// Doubles as a [`PropagationChecker`]: records become observable as soon as
/// they are created unless visibility is switched off.
#[derive(Debug)]
pub struct MemoryDnsProvider {
    name: String,
    records: Mutex<BTreeMap<String, DnsRecord>>,
    next_id: AtomicUsize,
    visible: AtomicBool,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryDnsProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
            visible: AtomicBool::new(true),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// When false, lookups report NXDOMAIN regardless of stored records.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DnsRecord> {
        self.lock().map(|records| records.values().cloned().collect()).unwrap_or_default()
    }

    pub fn records_named(&self, record_name: &str) -> Vec<DnsRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.name == record_name)
            .collect()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> DnsResult<std::sync::MutexGuard<'_, BTreeMap<String, DnsRecord>>> {
        self.records.lock().map_err(|_| DnsProviderError::InvalidResponse {
            provider: "memory",
            message: "record table lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_record(&self, record_name: &str, value: &str) -> DnsResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = DnsRecord {
            id: id.clone(),
            name: record_name.to_string(),
            value: value.to_string(),
        };
        self.lock()?.insert(id.clone(), record);
        debug!("[dns-memory] created {} = {}", record_name, value);
        Ok(id)
    }

    async fn delete_record(&self, record: &DnsRecord) -> DnsResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.lock()?.remove(&record.id);
        Ok(())
    }

    async fn list_records(&self, record_name: &str) -> DnsResult<Vec<DnsRecord>> {
        Ok(self.records_named(record_name))
    }
}

#[async_trait]
impl PropagationChecker for MemoryDnsProvider {
    async fn query_txt(&self, record_name: &str) -> ReconcileResult<Vec<ResolverAnswer>> {
        let values: Vec<String> = if self.visible.load(Ordering::SeqCst) {
            self.records_named(record_name)
                .into_iter()
                .map(|record| record.value)
                .collect()
        } else {
            Vec::new()
        };
        Ok(vec![ResolverAnswer {
            resolver: self.name.clone(),
            status: if values.is_empty() { 3 } else { 0 },
            values,
        }])
    }
}
