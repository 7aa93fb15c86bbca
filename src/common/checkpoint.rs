//! Durable resume positions
//!
//! Slots persist their last-committed WAL position and consumers persist
//! their last-acked cursor here, so both resume correctly after a process
//! or node failure. Checkpoints are JSON files, one per key, written with
//! a temp-file + rename so a crash mid-write never corrupts the previous
//! checkpoint.
//!
//! ## Usage
//!
//! ```ignore
//! let store = CheckpointStore::open("/var/lib/riffle/checkpoints").await?;
//!
//! // Slot side: persist after every committed transaction
//! store.save("slot:orders", Checkpoint::lsn(0x1_0000_0100)).await?;
//!
//! // Resume on restart
//! if let Some(cp) = store.load("slot:orders").await {
//!     let start = cp.as_lsn().unwrap_or(0);
//! }
//! ```

use crate::common::error::{Result, RiffleError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Format an LSN as the conventional `X/X` hex form.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parse an `X/X` hex LSN string.
pub fn parse_lsn(s: &str) -> Option<u64> {
    let (high, low) = s.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

/// Position kind carried by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionType {
    /// WAL log sequence number (`X/X` form) for a replication slot
    Lsn,
    /// Per-stream sequence number for a consumer cursor
    Seq,
}

/// A persisted resume position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Position kind
    pub position_type: PositionType,
    /// Position value (`X/X` LSN or decimal seq)
    pub position: String,
    /// Unix timestamp (seconds) when the checkpoint was written
    pub timestamp: u64,
}

impl Checkpoint {
    /// Create an LSN checkpoint for a slot.
    pub fn lsn(lsn: u64) -> Self {
        Self {
            position_type: PositionType::Lsn,
            position: format_lsn(lsn),
            timestamp: current_timestamp(),
        }
    }

    /// Create a cursor checkpoint for a consumer.
    pub fn seq(seq: u64) -> Self {
        Self {
            position_type: PositionType::Seq,
            position: seq.to_string(),
            timestamp: current_timestamp(),
        }
    }

    /// Parse as an LSN, if this is an LSN checkpoint.
    pub fn as_lsn(&self) -> Option<u64> {
        match self.position_type {
            PositionType::Lsn => parse_lsn(&self.position),
            PositionType::Seq => None,
        }
    }

    /// Parse as a sequence number, if this is a cursor checkpoint.
    pub fn as_seq(&self) -> Option<u64> {
        match self.position_type {
            PositionType::Seq => self.position.parse().ok(),
            PositionType::Lsn => None,
        }
    }

    /// Age of this checkpoint in seconds.
    pub fn age_secs(&self) -> u64 {
        current_timestamp().saturating_sub(self.timestamp)
    }
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Persistent checkpoint storage: one JSON file per key, atomic writes,
/// in-memory cache for reads.
pub struct CheckpointStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Checkpoint>>,
    fsync: bool,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint store and load any existing
    /// checkpoints from disk.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Open a store with an explicit fsync policy. Disabling fsync is
    /// only appropriate in tests.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(RiffleError::Io)?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    /// Save a checkpoint. Overwrites any previous checkpoint for `key`.
    pub async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        validate_key(key)?;

        let path = self.file_path(key);
        let tmp = path.with_extension("tmp");

        let json = serde_json::to_vec_pretty(&checkpoint)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await
            .map_err(RiffleError::Io)?;
        file.write_all(&json).await.map_err(RiffleError::Io)?;
        if self.fsync {
            file.sync_all().await.map_err(RiffleError::Io)?;
        }
        drop(file);

        fs::rename(&tmp, &path).await.map_err(RiffleError::Io)?;

        debug!(key, position = %checkpoint.position, "Checkpoint saved");
        self.cache
            .write()
            .await
            .insert(key.to_string(), checkpoint);
        Ok(())
    }

    /// Load a checkpoint from the cache.
    pub async fn load(&self, key: &str) -> Option<Checkpoint> {
        self.cache.read().await.get(key).cloned()
    }

    /// Remove a checkpoint.
    pub async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.cache.write().await.remove(key);
        let path = self.file_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RiffleError::Io(e)),
        }
    }

    /// All known checkpoint keys.
    pub async fn keys(&self) -> Vec<String> {
        self.cache.read().await.keys().cloned().collect()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(RiffleError::Io)?;
        let mut cache = self.cache.write().await;

        while let Some(entry) = entries.next_entry().await.map_err(RiffleError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<Checkpoint>(&data) {
                    Ok(cp) => {
                        cache.insert(key.to_string(), cp);
                    }
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable checkpoint: {e}"),
                },
                Err(e) => warn!(path = %path.display(), "Failed to read checkpoint: {e}"),
            }
        }

        debug!(count = cache.len(), "Loaded checkpoints");
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
        return Err(RiffleError::config(format!("Invalid checkpoint key: {key:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_roundtrip() {
        for lsn in [0u64, 1, 0x1234_ABCD, 0x7_0000_1000, u64::MAX] {
            assert_eq!(parse_lsn(&format_lsn(lsn)), Some(lsn));
        }
        assert_eq!(format_lsn(0x1_0000_0000), "1/0");
        assert_eq!(parse_lsn("0/1234ABCD"), Some(0x1234_ABCD));
        assert_eq!(parse_lsn("nonsense"), None);
        assert_eq!(parse_lsn("1-2"), None);
    }

    #[test]
    fn test_checkpoint_positions() {
        let cp = Checkpoint::lsn(0x2_0000_0010);
        assert_eq!(cp.as_lsn(), Some(0x2_0000_0010));
        assert_eq!(cp.as_seq(), None);

        let cp = Checkpoint::seq(42);
        assert_eq!(cp.as_seq(), Some(42));
        assert_eq!(cp.as_lsn(), None);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_options(dir.path(), false).await.unwrap();

        assert!(store.load("slot:orders").await.is_none());

        store.save("slot:orders", Checkpoint::lsn(0x100)).await.unwrap();
        let cp = store.load("slot:orders").await.unwrap();
        assert_eq!(cp.as_lsn(), Some(0x100));

        // Overwrite advances the position
        store.save("slot:orders", Checkpoint::lsn(0x200)).await.unwrap();
        assert_eq!(store.load("slot:orders").await.unwrap().as_lsn(), Some(0x200));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CheckpointStore::with_options(dir.path(), false).await.unwrap();
            store.save("consumer:audit", Checkpoint::seq(7)).await.unwrap();
        }

        let store = CheckpointStore::with_options(dir.path(), false).await.unwrap();
        assert_eq!(store.load("consumer:audit").await.unwrap().as_seq(), Some(7));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_options(dir.path(), false).await.unwrap();

        store.save("slot:x", Checkpoint::lsn(1)).await.unwrap();
        store.remove("slot:x").await.unwrap();
        assert!(store.load("slot:x").await.is_none());

        // Removing a missing key is fine
        store.remove("slot:x").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_options(dir.path(), false).await.unwrap();

        assert!(store.save("../escape", Checkpoint::seq(0)).await.is_err());
        assert!(store.save("a/b", Checkpoint::seq(0)).await.is_err());
        assert!(store.save("", Checkpoint::seq(0)).await.is_err());
    }
}
