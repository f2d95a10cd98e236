use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{MessageSource, TaggedMessage};
use crate::message::{PersistentMessage, decode_record, encode_record};
use crate::utils::error::{BoxError, CodecError, Result};

/// One captured delivery as kept in the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredCapture {
    pub source: String,
    pub exchange: String,
    pub routing_key: String,
    /// Milliseconds since the epoch.
    pub received_at: i64,
    /// The message as an encoded record.
    pub record: Vec<u8>,
}

impl StoredCapture {
    pub fn message(&self) -> std::result::Result<PersistentMessage, CodecError> {
        decode_record(&self.record)
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.received_at).single()
    }
}

/// Keeps the most recent captures of every tap source in a sled database,
/// one tree per source.
///
/// Entries are keyed by receive time so a tree iterates chronologically.
/// Entries older than the TTL are dropped when a source is loaded, and a
/// source never holds more than `max_messages_per_source` entries.
#[derive(Clone)]
pub struct CaptureStore {
    db: Db,
    ttl_seconds: Option<i64>,
    max_messages_per_source: Option<usize>,
}

impl CaptureStore {
    pub fn open(
        path: impl AsRef<Path>,
        ttl_seconds: Option<i64>,
        max_messages_per_source: Option<usize>,
    ) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_messages_per_source,
        })
    }

    pub fn store(&self, tagged: &TaggedMessage) -> Result<()> {
        let capture = StoredCapture {
            source: tagged.source.id(),
            exchange: tagged.message.exchange.clone(),
            routing_key: tagged.message.routing_key.clone(),
            received_at: tagged.received_at.timestamp_millis(),
            record: encode_record(&tagged.persistent())?,
        };
        self.insert(&capture)
    }

    pub fn insert(&self, capture: &StoredCapture) -> Result<()> {
        let tree = self.db.open_tree(&capture.source)?;
        let key = format!("{:020}_{}", capture.received_at.max(0), Uuid::new_v4().simple());
        tree.insert(key.as_bytes(), serde_json::to_vec(capture)?)?;

        if let Some(max) = self.max_messages_per_source {
            let excess = tree.len().saturating_sub(max);
            for entry in tree.iter().keys().take(excess) {
                tree.remove(entry?)?;
            }
        }
        Ok(())
    }

    /// Captures of `source`, oldest first.
    pub fn load(&self, source: &str) -> Result<Vec<StoredCapture>> {
        self.cleanup_expired(source)?;
        let tree = self.db.open_tree(source)?;
        let mut captures = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(capture) => captures.push(capture),
                Err(err) => warn!(
                    source,
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "unreadable capture entry"
                ),
            }
        }
        Ok(captures)
    }

    /// Names of all sources with stored captures.
    pub fn sources(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter(|name| &**name != b"__sled__default")
            .map(|name| String::from_utf8_lossy(&name).into_owned())
            .collect()
    }

    /// A source publishing the stored captures of `source` in the order they
    /// were received.
    pub fn replay(&self, source: &str) -> Result<StoreSource> {
        let captures = self.load(source)?;
        debug!(source, count = captures.len(), "replaying stored captures");
        Ok(StoreSource {
            captures: captures.into(),
        })
    }

    pub fn clear(&self, source: &str) -> Result<()> {
        self.db.drop_tree(source)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn cleanup_expired(&self, source: &str) -> Result<()> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let cutoff = (Utc::now().timestamp() - ttl).saturating_mul(1000);
        let tree = self.db.open_tree(source)?;
        let mut removed = 0usize;
        for key in tree.iter().keys() {
            let key = key?;
            let received_at = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.split('_').next())
                .and_then(|ts| ts.parse::<i64>().ok());
            match received_at {
                Some(ts) if ts < cutoff => {
                    tree.remove(&key)?;
                    removed += 1;
                }
                // keys are chronological, the rest is newer
                Some(_) => break,
                None => {}
            }
        }
        if removed > 0 {
            debug!(source, removed, "expired captures removed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for CaptureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_messages_per_source", &self.max_messages_per_source)
            .finish()
    }
}

/// Replays stored captures; fails on the first record that does not decode.
#[derive(Debug)]
pub struct StoreSource {
    captures: VecDeque<StoredCapture>,
}

impl StoreSource {
    pub fn remaining(&self) -> usize {
        self.captures.len()
    }
}

#[async_trait]
impl MessageSource for StoreSource {
    async fn next_message(&mut self) -> std::result::Result<Option<PersistentMessage>, BoxError> {
        match self.captures.pop_front() {
            Some(capture) => Ok(Some(capture.message()?)),
            None => Ok(None),
        }
    }
}
