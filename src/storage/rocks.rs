//! RocksDB-backed ledger store and round cache
//!
//! Values are JSON under string key prefixes. Every multi-key change goes
//! through one `WriteBatch`, so a crash never leaves half a wager or half a
//! settlement on disk.

use super::{closed_status, stamp_postings, wager_entry, LedgerStore, RoundCache};
use crate::errors::{EngineResult, StorageError, WagerError};
use crate::games::types::Variant;
use crate::ledger::{
    check_parent_chain, CommitReceipt, LedgerEntry, NodeId, OwnershipNode, ResolutionBatch, RoundResolution, Wager,
};
use crate::round::{RoundId, RoundRecord, RoundSnapshot};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

const NODE_PREFIX: &str = "node:";
const WAGER_PREFIX: &str = "wager:";
const ENTRY_PREFIX: &str = "entry:";
const ENTRY_ROUND_PREFIX: &str = "entry_round:";
const RESOLUTION_PREFIX: &str = "resolution:";
const OPEN_ROUND_PREFIX: &str = "open_round:";
const HISTORY_PREFIX: &str = "history:";
const SNAPSHOT_PREFIX: &str = "snapshot:";
const ENTRY_SEQ_KEY: &[u8] = b"meta:entry_seq";

fn node_key(id: &NodeId) -> Vec<u8> {
    format!("{}{}", NODE_PREFIX, id).into_bytes()
}

fn wager_key(wager: &Wager) -> Vec<u8> {
    format!("{}{}:{}", WAGER_PREFIX, wager.round_id, wager.id).into_bytes()
}

fn round_wagers_prefix(round_id: &RoundId) -> Vec<u8> {
    format!("{}{}:", WAGER_PREFIX, round_id).into_bytes()
}

// Zero-padded sequence keeps entries in insertion order under a prefix
fn entry_key(owner: &NodeId, seq: u64) -> Vec<u8> {
    format!("{}{}:{:020}", ENTRY_PREFIX, owner, seq).into_bytes()
}

fn entry_round_key(round_id: &RoundId, seq: u64) -> Vec<u8> {
    format!("{}{}:{:020}", ENTRY_ROUND_PREFIX, round_id, seq).into_bytes()
}

fn resolution_key(round_id: &RoundId) -> Vec<u8> {
    format!("{}{}", RESOLUTION_PREFIX, round_id).into_bytes()
}

fn open_round_key(round_id: &RoundId) -> Vec<u8> {
    format!("{}{}", OPEN_ROUND_PREFIX, round_id).into_bytes()
}

fn history_key(record: &RoundRecord) -> Vec<u8> {
    format!("{}{}:{}", HISTORY_PREFIX, record.variant, record.round_id).into_bytes()
}

fn snapshot_key(variant: Variant) -> Vec<u8> {
    format!("{}{}", SNAPSHOT_PREFIX, variant).into_bytes()
}

fn encode<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::WriteFailed(format!("encode failed: {}", e)).into())
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> EngineResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        StorageError::CorruptedData(format!("failed to decode {}: {}", String::from_utf8_lossy(key), e)).into()
    })
}

/// Ledger store and round cache sharing one RocksDB instance
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    entry_seq: Arc<AtomicU64>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        Self::open_with(path, false)
    }

    /// Opens the database, wiping it first when `clear_on_start` is set
    pub fn open_with<P: AsRef<Path>>(path: P, clear_on_start: bool) -> EngineResult<Self> {
        let path = path.as_ref();
        if clear_on_start && path.exists() {
            info!(path = %path.display(), "clearing ledger database");
            DB::destroy(&Options::default(), path)
                .map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path).map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;

        let seq = match db.get(ENTRY_SEQ_KEY).map_err(|e| StorageError::ReadFailed(e.to_string()))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::CorruptedData("entry sequence".to_string()))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            entry_seq: Arc::new(AtomicU64::new(seq)),
        })
    }

    fn writer(&self) -> EngineResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::Unavailable("write lock poisoned".to_string()).into())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> EngineResult<Option<T>> {
        match self.db.get(key).map_err(|e| StorageError::ReadFailed(e.to_string()))? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every value under `prefix`, in key order
    fn scan_prefix<T: DeserializeOwned>(&self, prefix: &[u8]) -> EngineResult<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(decode(&key, &value)?);
        }
        Ok(out)
    }

    fn scan_keys(&self, prefix: &[u8]) -> EngineResult<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key.to_vec());
        }
        Ok(out)
    }

    /// Queues `entry` under both of its indexes
    fn put_entry(&self, batch: &mut WriteBatch, entry: &LedgerEntry) -> EngineResult<()> {
        let seq = self.entry_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = encode(entry)?;
        batch.put(entry_key(&entry.owner, seq), &bytes);
        if let Some(round_id) = &entry.round_id {
            batch.put(entry_round_key(round_id, seq), &bytes);
        }
        batch.put(ENTRY_SEQ_KEY, seq.to_be_bytes());
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> EngineResult<()> {
        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    async fn upsert_node(&self, node: OwnershipNode) -> EngineResult<()> {
        let _guard = self.writer()?;
        let mut lookup_error = None;
        let chain = check_parent_chain(&node.id, node.parent.as_ref(), |id| {
            match self.get_json::<OwnershipNode>(&node_key(id)) {
                Ok(found) => found.map(|n| n.parent),
                Err(e) => {
                    lookup_error = Some(e);
                    None
                }
            }
        });
        if let Some(e) = lookup_error {
            return Err(e);
        }
        chain?;

        self.db
            .put(node_key(&node.id), encode(&node)?)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn node(&self, id: &NodeId) -> EngineResult<Option<OwnershipNode>> {
        self.get_json(&node_key(id))
    }

    async fn record_wager(&self, wager: &Wager) -> EngineResult<LedgerEntry> {
        let _guard = self.writer()?;
        let mut node: OwnershipNode =
            self.get_json(&node_key(&wager.bettor))?
                .ok_or_else(|| WagerError::UnknownBettor {
                    user: wager.bettor.to_string(),
                })?;
        if node.balance < wager.stake {
            return Err(WagerError::InsufficientFunds {
                available: node.balance,
                requested: wager.stake,
            }
            .into());
        }

        let entry = wager_entry(wager, node.balance);
        node.balance = entry.balance_after;

        let mut batch = WriteBatch::default();
        batch.put(node_key(&node.id), encode(&node)?);
        batch.put(wager_key(wager), encode(wager)?);
        batch.put(open_round_key(&wager.round_id), wager.round_id.as_str().as_bytes());
        self.put_entry(&mut batch, &entry)?;
        self.write(batch)?;
        Ok(entry)
    }

    async fn wagers_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<Wager>> {
        let mut wagers: Vec<Wager> = self.scan_prefix(&round_wagers_prefix(round_id))?;
        wagers.sort_by(|a, b| a.placed_at.cmp(&b.placed_at));
        Ok(wagers)
    }

    async fn round_resolution(&self, round_id: &RoundId) -> EngineResult<Option<RoundResolution>> {
        self.get_json(&resolution_key(round_id))
    }

    async fn commit_resolution(&self, batch: ResolutionBatch) -> EngineResult<CommitReceipt> {
        let _guard = self.writer()?;
        if let Some(existing) = self.get_json::<RoundResolution>(&resolution_key(&batch.round_id))? {
            return Ok(CommitReceipt::AlreadyResolved(existing.resolution));
        }

        let (entries, balances) = stamp_postings(&batch, |id| {
            self.get_json::<OwnershipNode>(&node_key(id))?
                .map(|n| n.balance)
                .ok_or_else(|| StorageError::CorruptedData(format!("ledger owner {} missing", id)).into())
        })?;

        let mut write = WriteBatch::default();
        for (id, balance) in &balances {
            let mut node: OwnershipNode = self
                .get_json(&node_key(id))?
                .ok_or_else(|| StorageError::CorruptedData(format!("ledger owner {} missing", id)))?;
            node.balance = *balance;
            write.put(node_key(id), encode(&node)?);
        }

        let status = closed_status(batch.resolution);
        let mut wagers: Vec<Wager> = self.scan_prefix(&round_wagers_prefix(&batch.round_id))?;
        for wager in wagers.iter_mut() {
            if let Some((_, payout)) = batch.wagers.iter().find(|(id, _)| *id == wager.id) {
                wager.payout = *payout;
                wager.status = status;
                wager.settled_at = Some(batch.resolved_at);
                write.put(wager_key(wager), encode(wager)?);
            }
        }

        for entry in &entries {
            self.put_entry(&mut write, entry)?;
        }
        write.put(resolution_key(&batch.round_id), encode(&batch.marker())?);
        write.delete(open_round_key(&batch.round_id));
        self.write(write)?;

        Ok(CommitReceipt::Applied(entries))
    }

    async fn unresolved_rounds(&self) -> EngineResult<Vec<RoundId>> {
        let prefix = OPEN_ROUND_PREFIX.as_bytes();
        Ok(self
            .scan_keys(prefix)?
            .into_iter()
            .map(|key| RoundId::from_raw(String::from_utf8_lossy(&key[prefix.len()..]).into_owned()))
            .collect())
    }

    async fn archive_round(&self, record: &RoundRecord) -> EngineResult<()> {
        self.db
            .put(history_key(record), encode(record)?)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    async fn round_history(&self, variant: Variant, limit: usize) -> EngineResult<Vec<RoundRecord>> {
        let prefix = format!("{}{}:", HISTORY_PREFIX, variant);
        let records: Vec<RoundRecord> = self.scan_prefix(prefix.as_bytes())?;
        Ok(records.into_iter().rev().take(limit).collect())
    }

    async fn entries_for_owner(&self, owner: &NodeId) -> EngineResult<Vec<LedgerEntry>> {
        let prefix = format!("{}{}:", ENTRY_PREFIX, owner);
        let entries: Vec<LedgerEntry> = self.scan_prefix(prefix.as_bytes())?;
        // ids containing ':' can share a prefix with a longer id
        Ok(entries.into_iter().filter(|e| e.owner == *owner).collect())
    }

    async fn entries_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<LedgerEntry>> {
        let prefix = format!("{}{}:", ENTRY_ROUND_PREFIX, round_id);
        self.scan_prefix(prefix.as_bytes())
    }
}

#[async_trait]
impl RoundCache for RocksStore {
    async fn get(&self, variant: Variant) -> EngineResult<Option<RoundSnapshot>> {
        self.get_json(&snapshot_key(variant))
    }

    async fn put(&self, snapshot: &RoundSnapshot) -> EngineResult<()> {
        self.db
            .put(snapshot_key(snapshot.round.variant), encode(snapshot)?)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    async fn remove(&self, variant: Variant) -> EngineResult<()> {
        self.db
            .delete(snapshot_key(variant))
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    async fn list(&self) -> EngineResult<Vec<RoundSnapshot>> {
        self.scan_prefix(SNAPSHOT_PREFIX.as_bytes())
    }
}
