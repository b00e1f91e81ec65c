//! Durable state: a single snapshot slot plus an append-only header store.
//!
//! The snapshot carries the expensive-to-recompute subset of the wallet
//! state; everything else is re-derived on startup. Headers are persisted in
//! whole 2016-header chunks keyed by start height and are never rewritten.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{Transaction, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::headers::HeaderReader;
use crate::chain::RETARGETING_PERIOD;
use crate::domain::scheme::ScriptHash;
use crate::engine::types::{HistoryItem, MerkleProof};

const SNAPSHOT_FILE: &str = "snapshot.json";
const HEADERS_DIR: &str = "headers";
const HEADER_SIZE: u64 = 80;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store payload: {0}")]
    Codec(String),
    #[error("non-contiguous header write at height {0}")]
    NonContiguous(u32),
}

/// The durable subset of the wallet state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub account_key_count: u32,
    pub change_key_count: u32,
    pub status: HashMap<ScriptHash, String>,
    pub transactions: HashMap<Txid, Transaction>,
    pub heights: HashMap<Txid, i32>,
    pub history: HashMap<ScriptHash, Vec<HistoryItem>>,
    pub proofs: HashMap<Txid, MerkleProof>,
    pub pending_transactions: Vec<Transaction>,
    pub locks: Vec<Transaction>,
}

pub trait WalletDb: Send + Sync {
    /// Atomically replaces the snapshot slot.
    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
    fn read_snapshot(&self) -> Result<Option<Snapshot>, StoreError>;
    /// Appends a contiguous run of headers starting at `start`.
    fn add_headers(&self, start: u32, headers: &[Header]) -> Result<(), StoreError>;
    fn get_header(&self, height: u32) -> Option<Header>;
    fn get_headers(&self, start: u32, limit: usize) -> Vec<Header>;
}

/// Adapts a [`WalletDb`] to the chain layer's read-only header lookup.
pub struct DbHeaderReader<'a>(pub &'a dyn WalletDb);

impl HeaderReader for DbHeaderReader<'_> {
    fn header_at(&self, height: u32) -> Option<Header> {
        self.0.get_header(height)
    }
}

// =====================================================================
// JSON codec
// =====================================================================

#[derive(Serialize, Deserialize)]
struct SnapshotDto {
    account_key_count: u32,
    change_key_count: u32,
    status: BTreeMap<String, String>,
    transactions: BTreeMap<String, String>,
    heights: BTreeMap<String, i32>,
    history: BTreeMap<String, Vec<HistoryItemDto>>,
    proofs: BTreeMap<String, MerkleProofDto>,
    pending_transactions: Vec<String>,
    locks: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct HistoryItemDto {
    tx_hash: String,
    height: i32,
}

#[derive(Serialize, Deserialize)]
struct MerkleProofDto {
    merkle: Vec<String>,
    block_height: u32,
    pos: usize,
}

fn tx_to_hex(tx: &Transaction) -> String {
    hex::encode(serialize(tx))
}

fn tx_from_hex(raw: &str) -> Result<Transaction, StoreError> {
    let bytes = hex::decode(raw).map_err(|e| StoreError::Codec(e.to_string()))?;
    deserialize(&bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn parse<T: FromStr>(raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Codec(e.to_string()))
}

impl Snapshot {
    fn to_dto(&self) -> SnapshotDto {
        SnapshotDto {
            account_key_count: self.account_key_count,
            change_key_count: self.change_key_count,
            status: self
                .status
                .iter()
                .map(|(sh, status)| (sh.to_string(), status.clone()))
                .collect(),
            transactions: self
                .transactions
                .iter()
                .map(|(txid, tx)| (txid.to_string(), tx_to_hex(tx)))
                .collect(),
            heights: self
                .heights
                .iter()
                .map(|(txid, height)| (txid.to_string(), *height))
                .collect(),
            history: self
                .history
                .iter()
                .map(|(sh, items)| {
                    let items = items
                        .iter()
                        .map(|item| HistoryItemDto {
                            tx_hash: item.txid.to_string(),
                            height: item.height,
                        })
                        .collect();
                    (sh.to_string(), items)
                })
                .collect(),
            proofs: self
                .proofs
                .iter()
                .map(|(txid, proof)| {
                    let dto = MerkleProofDto {
                        merkle: proof.merkle.iter().map(|node| node.to_string()).collect(),
                        block_height: proof.block_height,
                        pos: proof.pos,
                    };
                    (txid.to_string(), dto)
                })
                .collect(),
            pending_transactions: self.pending_transactions.iter().map(tx_to_hex).collect(),
            locks: self.locks.iter().map(tx_to_hex).collect(),
        }
    }

    fn from_dto(dto: SnapshotDto) -> Result<Self, StoreError> {
        let mut snapshot = Snapshot {
            account_key_count: dto.account_key_count,
            change_key_count: dto.change_key_count,
            ..Snapshot::default()
        };
        for (sh, status) in dto.status {
            snapshot.status.insert(parse::<ScriptHash>(&sh)?, status);
        }
        for (txid, raw) in dto.transactions {
            snapshot
                .transactions
                .insert(parse::<Txid>(&txid)?, tx_from_hex(&raw)?);
        }
        for (txid, height) in dto.heights {
            snapshot.heights.insert(parse::<Txid>(&txid)?, height);
        }
        for (sh, items) in dto.history {
            let items = items
                .into_iter()
                .map(|item| {
                    Ok(HistoryItem {
                        txid: parse::<Txid>(&item.tx_hash)?,
                        height: item.height,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            snapshot.history.insert(parse::<ScriptHash>(&sh)?, items);
        }
        for (txid, dto) in dto.proofs {
            let txid = parse::<Txid>(&txid)?;
            let merkle = dto
                .merkle
                .iter()
                .map(|node| parse::<TxMerkleNode>(node))
                .collect::<Result<Vec<_>, StoreError>>()?;
            snapshot.proofs.insert(
                txid,
                MerkleProof {
                    txid,
                    merkle,
                    block_height: dto.block_height,
                    pos: dto.pos,
                },
            );
        }
        for raw in dto.pending_transactions {
            snapshot.pending_transactions.push(tx_from_hex(&raw)?);
        }
        for raw in dto.locks {
            snapshot.locks.push(tx_from_hex(&raw)?);
        }
        Ok(snapshot)
    }
}

// =====================================================================
// File-backed store
// =====================================================================

/// Directory layout: `snapshot.json` plus `headers/<chunk start>.bin` files
/// of 80-byte records.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(HEADERS_DIR))?;
        Ok(Self { dir })
    }

    fn chunk_path(&self, chunk_start: u32) -> PathBuf {
        self.dir.join(HEADERS_DIR).join(format!("{chunk_start}.bin"))
    }
}

impl WalletDb for FileStore {
    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(&snapshot.to_dto())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        let raw = match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let dto: SnapshotDto =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Codec(e.to_string()))?;
        Snapshot::from_dto(dto).map(Some)
    }

    fn add_headers(&self, start: u32, headers: &[Header]) -> Result<(), StoreError> {
        for (offset, header) in headers.iter().enumerate() {
            let height = start + offset as u32;
            let chunk_start = height / RETARGETING_PERIOD * RETARGETING_PERIOD;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(self.chunk_path(chunk_start))?;
            let position = u64::from(height - chunk_start) * HEADER_SIZE;
            if position > file.metadata()?.len() {
                return Err(StoreError::NonContiguous(height));
            }
            file.seek(SeekFrom::Start(position))?;
            file.write_all(&serialize(header))?;
        }
        Ok(())
    }

    fn get_header(&self, height: u32) -> Option<Header> {
        let chunk_start = height / RETARGETING_PERIOD * RETARGETING_PERIOD;
        let mut file = fs::File::open(self.chunk_path(chunk_start)).ok()?;
        let position = u64::from(height - chunk_start) * HEADER_SIZE;
        file.seek(SeekFrom::Start(position)).ok()?;
        let mut bytes = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut bytes).ok()?;
        deserialize(&bytes).ok()
    }

    fn get_headers(&self, start: u32, limit: usize) -> Vec<Header> {
        let mut headers = Vec::new();
        let mut height = start;
        while headers.len() < limit {
            match self.get_header(height) {
                Some(header) => headers.push(header),
                None => break,
            }
            height += 1;
        }
        headers
    }
}

// =====================================================================
// In-memory store (tests, ephemeral wallets)
// =====================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Option<Snapshot>,
    headers: BTreeMap<u32, Header>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletDb for MemoryStore {
    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.inner.lock().unwrap().snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.inner.lock().unwrap().snapshot.clone())
    }

    fn add_headers(&self, start: u32, headers: &[Header]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for (offset, header) in headers.iter().enumerate() {
            inner.headers.insert(start + offset as u32, *header);
        }
        Ok(())
    }

    fn get_header(&self, height: u32) -> Option<Header> {
        self.inner.lock().unwrap().headers.get(&height).copied()
    }

    fn get_headers(&self, start: u32, limit: usize) -> Vec<Header> {
        let inner = self.inner.lock().unwrap();
        let mut headers = Vec::new();
        let mut height = start;
        while headers.len() < limit {
            match inner.headers.get(&height) {
                Some(header) => headers.push(*header),
                None => break,
            }
            height += 1;
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction;
    use bitcoin::{Amount, BlockHash, CompactTarget, ScriptBuf, TxOut};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_store() -> FileStore {
        let mut dir = std::env::temp_dir();
        let count = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        dir.push(format!("spv-wallet-store-{}-{}", std::process::id(), count));
        FileStore::new(dir).unwrap()
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(12_345),
                script_pubkey: ScriptBuf::from_bytes(vec![0x00, 0x14, 0xab]),
            }],
        }
    }

    fn sample_header(n: u32) -> Header {
        Header {
            version: Version::from_consensus(4),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: bitcoin::TxMerkleNode::all_zeros(),
            time: n,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: n,
        }
    }

    fn sample_snapshot() -> Snapshot {
        let tx = sample_tx();
        let txid = tx.compute_txid();
        let script_hash =
            ScriptHash::from_str("9f2c8b5d9c1f2e3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a")
                .unwrap();
        let mut snapshot = Snapshot {
            account_key_count: 12,
            change_key_count: 10,
            ..Snapshot::default()
        };
        snapshot.status.insert(script_hash, "abcd".into());
        snapshot.transactions.insert(txid, tx.clone());
        snapshot.heights.insert(txid, 120);
        snapshot
            .history
            .insert(script_hash, vec![HistoryItem { txid, height: 120 }]);
        snapshot.proofs.insert(
            txid,
            MerkleProof {
                txid,
                merkle: vec![bitcoin::TxMerkleNode::all_zeros()],
                block_height: 120,
                pos: 1,
            },
        );
        snapshot.pending_transactions.push(tx.clone());
        snapshot.locks.push(tx);
        snapshot
    }

    #[test]
    fn snapshot_roundtrip() {
        let store = temp_store();
        let snapshot = sample_snapshot();
        store.persist(&snapshot).unwrap();
        let restored = store.read_snapshot().unwrap().unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn missing_snapshot_reads_as_none() {
        let store = temp_store();
        assert!(store.read_snapshot().unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let store = temp_store();
        fs::write(store.dir.join(SNAPSHOT_FILE), b"{ not json").unwrap();
        assert!(matches!(
            store.read_snapshot(),
            Err(StoreError::Codec(_))
        ));
    }

    #[test]
    fn header_chunks_roundtrip() {
        let store = temp_store();
        let headers: Vec<Header> = (0..10).map(sample_header).collect();
        store.add_headers(0, &headers).unwrap();
        assert_eq!(store.get_header(3), Some(headers[3]));
        assert_eq!(store.get_header(10), None);
        assert_eq!(store.get_headers(2, 4), headers[2..6].to_vec());
    }

    #[test]
    fn header_write_must_be_contiguous() {
        let store = temp_store();
        let headers: Vec<Header> = (0..3).map(sample_header).collect();
        store.add_headers(0, &headers).unwrap();
        assert!(matches!(
            store.add_headers(7, &[sample_header(7)]),
            Err(StoreError::NonContiguous(7))
        ));
        // rewriting an existing height with the same data is fine
        store.add_headers(1, &headers[1..2]).unwrap();
    }

    #[test]
    fn chunks_are_independent_files() {
        let store = temp_store();
        let start = RETARGETING_PERIOD;
        let headers: Vec<Header> = (start..start + 4).map(sample_header).collect();
        // a later chunk can be written without its predecessors existing
        store.add_headers(start, &headers).unwrap();
        assert_eq!(store.get_header(start + 2), Some(headers[2]));
        assert_eq!(store.get_header(0), None);
        assert_eq!(store.get_headers(start, 10).len(), 4);
    }
}
