use crate::types::{Scan, ScanId, ScanPatch};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Persistence contract for scans.
///
/// Implementations must make each call atomic per scan: a read issued after
/// an `update` returns observes that update.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Insert a scan, assigning it `max(existing ids) + 1`.
    async fn create(&self, scan: Scan) -> Result<Scan>;
    async fn get(&self, id: ScanId) -> Result<Option<Scan>>;
    /// All scans ordered by id.
    async fn list(&self) -> Result<Vec<Scan>>;
    async fn update(&self, id: ScanId, patch: ScanPatch) -> Result<Option<Scan>>;
    async fn delete(&self, id: ScanId) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
}

/// In-process store. Entries are locked individually, so work on different
/// scans never waits on a shared lock. Only id allocation is serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scans: DashMap<ScanId, Scan>,
    alloc: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create(&self, mut scan: Scan) -> Result<Scan> {
        let _alloc = self.alloc.lock().await;
        let max = self.scans.iter().map(|e| *e.key()).max().unwrap_or(0);
        scan.id = max + 1;
        self.scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    async fn get(&self, id: ScanId) -> Result<Option<Scan>> {
        Ok(self.scans.get(&id).map(|e| e.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Scan>> {
        let mut all: Vec<Scan> = self.scans.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        Ok(all)
    }

    async fn update(&self, id: ScanId, patch: ScanPatch) -> Result<Option<Scan>> {
        let Some(mut entry) = self.scans.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply(entry.value_mut());
        Ok(Some(entry.value().clone()))
    }

    async fn delete(&self, id: ScanId) -> Result<bool> {
        Ok(self.scans.remove(&id).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.scans.clear();
        Ok(())
    }
}
