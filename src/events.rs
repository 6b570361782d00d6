use crate::types::{Scan, ScanId, ScanPatch};
use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast;

pub const SCANS_CREATED: &str = "scans:created";
pub const SCANS_UPDATED: &str = "scans:updated";
pub const SCANS_DELETED: &str = "scans:deleted";
pub const SCANS_CLEARED: &str = "scans:cleared";

/// Change notification about the scan collection.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ScanEvent {
    #[serde(rename = "scans:created")]
    Created(Scan),
    #[serde(rename = "scans:updated")]
    Updated { id: ScanId, changes: ScanPatch },
    #[serde(rename = "scans:deleted")]
    Deleted { id: ScanId },
    #[serde(rename = "scans:cleared")]
    Cleared,
}

impl ScanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::Created(_) => SCANS_CREATED,
            ScanEvent::Updated { .. } => SCANS_UPDATED,
            ScanEvent::Deleted { .. } => SCANS_DELETED,
            ScanEvent::Cleared => SCANS_CLEARED,
        }
    }
}

/// Fire-and-forget delivery. Callers log failures and carry on.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ScanEvent) -> Result<()>;
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ScanEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: ScanEvent) -> Result<()> {
        // No subscribers is not a delivery failure.
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_names() {
        let json = serde_json::to_value(ScanEvent::Deleted { id: 3 }).unwrap();
        assert_eq!(json["event"], "scans:deleted");
        assert_eq!(json["payload"]["id"], 3);
        let json = serde_json::to_value(ScanEvent::Cleared).unwrap();
        assert_eq!(json["event"], SCANS_CLEARED);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = BroadcastPublisher::default();
        publisher.publish(ScanEvent::Cleared).unwrap();
        let mut rx = publisher.subscribe();
        publisher.publish(ScanEvent::Deleted { id: 1 }).unwrap();
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::Deleted { id: 1 });
    }
}
