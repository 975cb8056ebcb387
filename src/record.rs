use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Error;

/// Durable record behind a room. The in-memory room stays the authority for
/// live state; the record only carries metadata and the last-active stamp.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub last_active_time: u64,
}

/// Key-value record store consumed by rooms. Implementations typically wrap
/// a database; [`MemoryRoomStore`] serves servers without one.
#[async_trait]
pub trait RoomStore: Send + Sync + Debug {
    async fn find_room(&self, id: &str) -> Result<Option<RoomRecord>, Error>;
    async fn save_room(&self, record: RoomRecord) -> Result<(), Error>;
}

/// In-process store keyed by room id.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    records: Mutex<HashMap<String, RoomRecord>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn find_room(&self, id: &str) -> Result<Option<RoomRecord>, Error> {
        let records = self.records.lock().await;
        Ok(records.get(id).cloned())
    }

    async fn save_room(&self, record: RoomRecord) -> Result<(), Error> {
        let mut records = self.records.lock().await;
        records.insert(record.id.clone(), record);
        Ok(())
    }
}

/// Wall-clock milliseconds, the unit the durable record stores.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryRoomStore::new();
        assert!(store.find_room("1001").await.unwrap().is_none());

        let record = RoomRecord {
            id: "1001".to_string(),
            name: Some("physics".to_string()),
            description: None,
            last_active_time: 42,
        };
        store.save_room(record.clone()).await.unwrap();
        assert_eq!(store.find_room("1001").await.unwrap(), Some(record));
    }
}
