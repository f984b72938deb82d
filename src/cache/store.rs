//! Persistent position cache tier
//!
//! One versioned JSON container on disk holds an entry per owner. Entries
//! above size/count thresholds are routed through the compression or
//! encryption codec; every read self-heals on corruption instead of
//! surfacing a fault.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::codec::{Codec, CodecError, EncryptedCodec, PlainCodec, StoredPayload, ZstdCodec};
use crate::types::{normalize_owner, Position};

/// Major format version of the on-disk container; a mismatch wipes the
/// whole container (no per-entry migration).
pub const CONTAINER_VERSION: u32 = 1;

/// Freshness bound: entries older than this are treated as absent.
pub const ENTRY_TTL_SECS: i64 = 60 * 60;

/// Storage-hygiene bound: entries older than this are deleted by
/// `cleanup_old_data`, independent of the freshness TTL.
pub const MAX_ENTRY_AGE_SECS: i64 = 7 * 24 * 60 * 60;

/// Serialized entries above this size go through the compression codec.
const COMPRESS_THRESHOLD_BYTES: usize = 4 * 1024;

/// Entries holding more positions than this go through the encrypted codec.
const ENCRYPT_POSITION_THRESHOLD: usize = 10;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One owner's cached positions plus the metadata gating its use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub positions: Vec<Position>,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Container {
    version: u32,
    data: HashMap<String, StoredPayload>,
}

impl Container {
    fn empty() -> Self {
        Self {
            version: CONTAINER_VERSION,
            data: HashMap::new(),
        }
    }
}

/// Summary of what is physically in storage, fresh or not.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub owners: usize,
    pub fresh: usize,
    pub stale: usize,
    pub file_bytes: u64,
}

/// Persistent cache tier backed by a single keyed JSON container.
///
/// All mutation goes through an internal lock so concurrent save/clear
/// calls serialize on the container file; readers re-read the file each
/// time (the memory tier is the fast path).
pub struct PositionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PositionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `positions` for `owner`, replacing any previous entry.
    pub async fn save(&self, owner: &str, positions: &[Position]) -> Result<(), CacheError> {
        let key = normalize_owner(owner);
        let entry = CacheEntry {
            positions: positions.to_vec(),
            timestamp: Utc::now(),
            version: CONTAINER_VERSION,
            owner: key.clone(),
        };
        let plain = serde_json::to_vec(&entry)?;
        let payload = self.encode_entry(&key, &plain, positions.len());

        let _guard = self.write_lock.lock().await;
        let mut container = self.read_container().await;
        container.data.insert(key.clone(), payload);
        self.write_container(&container).await?;
        debug!("saved {} positions for {}", positions.len(), key);
        Ok(())
    }

    /// Load `owner`'s positions if a fresh, decodable entry exists.
    ///
    /// A stale entry is deleted on the way out and reported as absent, so
    /// a subsequent `has_entry` reflects reality.
    pub async fn load(&self, owner: &str) -> Option<Vec<Position>> {
        let key = normalize_owner(owner);
        let container = self.read_container_checked().await?;
        let payload = container.data.get(&key)?;

        let entry = match self.decode_entry(&key, payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cache entry for {} unreadable, discarding: {}", key, e);
                self.remove_entry(&key).await;
                return None;
            }
        };

        if entry.version != CONTAINER_VERSION {
            warn!(
                "cache entry for {} has version {}, expected {}; discarding",
                key, entry.version, CONTAINER_VERSION
            );
            self.remove_entry(&key).await;
            return None;
        }

        let now = Utc::now();
        let age = now - entry.timestamp;
        if age > Duration::seconds(ENTRY_TTL_SECS) {
            debug!("cache entry for {} expired ({}s old), deleting", key, age.num_seconds());
            self.remove_entry(&key).await;
            return None;
        }

        // Lock windows may have elapsed while cached; re-derive statuses.
        let mut positions = entry.positions;
        for position in positions.iter_mut() {
            position.refresh_status(now);
        }
        debug!("cache hit for {}: {} positions", key, positions.len());
        Some(positions)
    }

    /// Whether a fresh, decodable entry exists for `owner`. No side effects.
    pub async fn is_valid(&self, owner: &str) -> bool {
        let key = normalize_owner(owner);
        let Some(container) = self.read_container_checked().await else {
            return false;
        };
        let Some(payload) = container.data.get(&key) else {
            return false;
        };
        match self.decode_entry(&key, payload) {
            Ok(entry) => {
                entry.version == CONTAINER_VERSION
                    && Utc::now() - entry.timestamp <= Duration::seconds(ENTRY_TTL_SECS)
            }
            Err(_) => false,
        }
    }

    /// Whether anything is physically stored for `owner`, fresh or not.
    ///
    /// Callers use this to distinguish "stale but recoverable" from
    /// "never synced"; freshness gating belongs to `load`.
    pub async fn has_entry(&self, owner: &str) -> bool {
        let key = normalize_owner(owner);
        match self.read_container_checked().await {
            Some(container) => container.data.contains_key(&key),
            None => false,
        }
    }

    /// Remove `owner`'s entry; other owners are untouched.
    pub async fn clear(&self, owner: &str) -> Result<(), CacheError> {
        let key = normalize_owner(owner);
        let _guard = self.write_lock.lock().await;
        let mut container = self.read_container().await;
        if container.data.remove(&key).is_some() {
            self.write_container(&container).await?;
            info!("cleared cached positions for {}", key);
        }
        Ok(())
    }

    /// Storage-hygiene sweep: delete entries older than 7 days regardless
    /// of the freshness TTL, plus anything undecodable. Returns the number
    /// of entries removed.
    pub async fn cleanup_old_data(&self) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut container = self.read_container().await;
        let cutoff = Utc::now() - Duration::seconds(MAX_ENTRY_AGE_SECS);

        let mut expired_keys = Vec::new();
        for (key, payload) in container.data.iter() {
            match self.decode_entry(key, payload) {
                Ok(entry) if entry.timestamp < cutoff => expired_keys.push(key.clone()),
                Ok(_) => {}
                Err(e) => {
                    warn!("cleanup removing undecodable entry for {}: {}", key, e);
                    expired_keys.push(key.clone());
                }
            }
        }

        for key in &expired_keys {
            container.data.remove(key);
        }
        if !expired_keys.is_empty() {
            self.write_container(&container).await?;
            info!("cleanup removed {} aged cache entries", expired_keys.len());
        }
        Ok(expired_keys.len())
    }

    /// Counts of fresh vs stale entries currently in storage.
    pub async fn stats(&self) -> StoreStats {
        let container = self.read_container_checked().await.unwrap_or_else(Container::empty);
        let ttl = Duration::seconds(ENTRY_TTL_SECS);
        let now = Utc::now();
        let mut fresh = 0usize;
        let mut stale = 0usize;
        for (key, payload) in container.data.iter() {
            match self.decode_entry(key, payload) {
                Ok(entry) if now - entry.timestamp <= ttl => fresh += 1,
                _ => stale += 1,
            }
        }
        let file_bytes = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        StoreStats {
            owners: container.data.len(),
            fresh,
            stale,
            file_bytes,
        }
    }

    // Codec routing

    fn encode_entry(&self, owner: &str, plain: &[u8], position_count: usize) -> StoredPayload {
        if position_count > ENCRYPT_POSITION_THRESHOLD {
            match EncryptedCodec::for_owner(owner).encode(plain) {
                Ok(payload) => return payload,
                Err(e) => {
                    // Encryption must not stop the cache from functioning.
                    warn!("encryption failed for {}, storing unencrypted: {}", owner, e);
                }
            }
        }
        let fallback = if plain.len() > COMPRESS_THRESHOLD_BYTES {
            ZstdCodec::default().encode(plain)
        } else {
            PlainCodec.encode(plain)
        };
        fallback.unwrap_or_else(|e| {
            warn!("codec failure for {}, storing raw JSON string: {}", owner, e);
            StoredPayload::Plain {
                body: serde_json::Value::String(String::from_utf8_lossy(plain).into_owned()),
            }
        })
    }

    fn decode_entry(&self, owner: &str, payload: &StoredPayload) -> Result<CacheEntry, CacheError> {
        let bytes = match payload {
            StoredPayload::Plain { .. } => PlainCodec.decode(payload)?,
            StoredPayload::Compressed { .. } => ZstdCodec::default().decode(payload)?,
            StoredPayload::Encrypted { .. } => EncryptedCodec::for_owner(owner).decode(payload)?,
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    // Container io

    /// Read the container, self-healing on version mismatch or corruption
    /// by wiping the file. Returns None when nothing usable exists.
    async fn read_container_checked(&self) -> Option<Container> {
        let raw = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice::<Container>(&raw) {
            Ok(container) if container.version == CONTAINER_VERSION => Some(container),
            Ok(container) => {
                warn!(
                    "cache container version {} != {}, wiping container",
                    container.version, CONTAINER_VERSION
                );
                let _ = tokio::fs::remove_file(&self.path).await;
                None
            }
            Err(e) => {
                warn!("cache container corrupted, wiping: {}", e);
                let _ = tokio::fs::remove_file(&self.path).await;
                None
            }
        }
    }

    async fn read_container(&self) -> Container {
        self.read_container_checked()
            .await
            .unwrap_or_else(Container::empty)
    }

    /// Atomic write: temp file then rename, so a crash never leaves a
    /// half-written container.
    async fn write_container(&self, container: &Container) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(container)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn remove_entry(&self, key: &str) {
        let _guard = self.write_lock.lock().await;
        let mut container = self.read_container().await;
        if container.data.remove(key).is_some() {
            if let Err(e) = self.write_container(&container).await {
                warn!("failed to persist entry removal for {}: {}", key, e);
            }
        }
    }
}
