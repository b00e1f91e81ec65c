//! The wallet's aggregate state.
//!
//! Mutation is confined to the engine's transition handlers; everything else
//! (UTXOs, balances, depths) is derived on demand from what is stored here.

use std::collections::{HashMap, HashSet};

use bitcoin::{Transaction, Txid};

use crate::chain::Blockchain;
use crate::domain::keys::{DerivedKey, KeyBranch};
use crate::domain::scheme::ScriptHash;
use crate::engine::types::{HistoryItem, MerkleProof};
use crate::events::WalletReady;
use crate::persist::Snapshot;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    WaitingForTip,
    Syncing,
    Running,
}

#[derive(Debug, Clone)]
pub struct WalletData {
    pub blockchain: Blockchain,
    pub account_keys: Vec<DerivedKey>,
    pub change_keys: Vec<DerivedKey>,
    /// Reverse index over both key vectors.
    pub script_index: HashMap<ScriptHash, (KeyBranch, u32)>,
    /// Last status the server reported per scripthash; `""` means never used.
    pub status: HashMap<ScriptHash, String>,
    pub history: HashMap<ScriptHash, Vec<HistoryItem>>,
    pub transactions: HashMap<Txid, Transaction>,
    pub heights: HashMap<Txid, i32>,
    pub proofs: HashMap<Txid, MerkleProof>,
    /// Built but not yet committed or cancelled; their inputs are off-limits
    /// for coin selection.
    pub locks: HashMap<Txid, Transaction>,
    pub pending_history_requests: HashSet<ScriptHash>,
    pub pending_transaction_requests: HashSet<Txid>,
    /// Chunk start heights of in-flight header requests.
    pub pending_headers_requests: HashSet<u32>,
    /// Downloaded transactions whose parents we do not know yet.
    pub pending_transactions: Vec<Transaction>,
    /// Merkle responses waiting for their header chunk.
    pub pending_merkle_responses: Vec<MerkleProof>,
    pub last_ready: Option<WalletReady>,
}

impl WalletData {
    pub fn new(blockchain: Blockchain) -> Self {
        Self {
            blockchain,
            account_keys: Vec::new(),
            change_keys: Vec::new(),
            script_index: HashMap::new(),
            status: HashMap::new(),
            history: HashMap::new(),
            transactions: HashMap::new(),
            heights: HashMap::new(),
            proofs: HashMap::new(),
            locks: HashMap::new(),
            pending_history_requests: HashSet::new(),
            pending_transaction_requests: HashSet::new(),
            pending_headers_requests: HashSet::new(),
            pending_transactions: Vec::new(),
            pending_merkle_responses: Vec::new(),
            last_ready: None,
        }
    }

    pub fn branch_keys(&self, branch: KeyBranch) -> &[DerivedKey] {
        match branch {
            KeyBranch::Account => &self.account_keys,
            KeyBranch::Change => &self.change_keys,
        }
    }

    /// Appends a freshly derived key; indices must stay contiguous.
    pub fn push_key(&mut self, key: DerivedKey) {
        self.script_index
            .insert(key.script_hash, (key.branch, key.index));
        match key.branch {
            KeyBranch::Account => {
                debug_assert_eq!(key.index as usize, self.account_keys.len());
                self.account_keys.push(key);
            }
            KeyBranch::Change => {
                debug_assert_eq!(key.index as usize, self.change_keys.len());
                self.change_keys.push(key);
            }
        }
    }

    pub fn key_for_script_hash(&self, script_hash: &ScriptHash) -> Option<&DerivedKey> {
        let (branch, index) = self.script_index.get(script_hash)?;
        self.branch_keys(*branch).get(*index as usize)
    }

    /// First account key the server has never seen used, or the very first
    /// account key when all of them are used.
    pub fn receive_key(&self) -> &DerivedKey {
        self.account_keys
            .iter()
            .find(|key| self.status.get(&key.script_hash).map(String::as_str) == Some(""))
            .unwrap_or_else(|| {
                self.account_keys
                    .first()
                    .expect("wallet always has at least one account key")
            })
    }

    /// Change-branch analogue of [`receive_key`](Self::receive_key).
    pub fn change_key(&self) -> &DerivedKey {
        self.change_keys
            .iter()
            .find(|key| self.status.get(&key.script_hash).map(String::as_str) == Some(""))
            .unwrap_or_else(|| {
                self.change_keys
                    .first()
                    .expect("wallet always has at least one change key")
            })
    }

    /// The wallet is ready once both branches hold enough provably unused
    /// keys and no history or transaction downloads are in flight.
    pub fn is_ready(&self, gap_limit: u32) -> bool {
        self.status.values().filter(|status| status.is_empty()).count()
            >= 2 * gap_limit as usize
            && self.pending_history_requests.is_empty()
            && self.pending_transaction_requests.is_empty()
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            account_key_count: self.account_keys.len() as u32,
            change_key_count: self.change_keys.len() as u32,
            status: self.status.clone(),
            transactions: self.transactions.clone(),
            heights: self.heights.clone(),
            history: self.history.clone(),
            proofs: self.proofs.clone(),
            pending_transactions: self.pending_transactions.clone(),
            locks: self.locks.values().cloned().collect(),
        }
    }

    pub fn restore_snapshot(&mut self, snapshot: Snapshot) {
        self.status = snapshot.status;
        self.transactions = snapshot.transactions;
        self.heights = snapshot.heights;
        self.history = snapshot.history;
        self.proofs = snapshot.proofs;
        self.pending_transactions = snapshot.pending_transactions;
        self.locks = snapshot
            .locks
            .into_iter()
            .map(|tx| (tx.compute_txid(), tx))
            .collect();
    }
}
