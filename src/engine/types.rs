//! Events the engine consumes, actions it emits, and the records they carry.

use bitcoin::block::Header;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{Transaction, TxMerkleNode, Txid};
use thiserror::Error;

use crate::domain::scheme::{ScriptHash, SigningError};
use crate::events::WalletEvent;

/// One entry of a scripthash's server-side history. `height > 0` means
/// confirmed at that height, `0` unconfirmed, `-1` unconfirmed with at least
/// one unconfirmed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryItem {
    pub txid: Txid,
    pub height: i32,
}

/// A transaction's merkle path inside the block at `block_height`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub txid: Txid,
    pub merkle: Vec<TxMerkleNode>,
    pub block_height: u32,
    pub pos: usize,
}

impl MerkleProof {
    /// Root obtained by folding the path over the txid; the proof is valid
    /// iff this equals the merkle root of the header at `block_height`.
    pub fn root(&self) -> TxMerkleNode {
        let mut node = self.txid.to_raw_hash();
        let mut index = self.pos;
        for sibling in &self.merkle {
            let mut engine = sha256d::Hash::engine();
            if index & 1 == 1 {
                engine.input(sibling.to_raw_hash().as_byte_array());
                engine.input(node.as_byte_array());
            } else {
                engine.input(node.as_byte_array());
                engine.input(sibling.to_raw_hash().as_byte_array());
            }
            node = sha256d::Hash::from_engine(engine);
            index >>= 1;
        }
        TxMerkleNode::from_raw_hash(node)
    }
}

/// Typed requests the wallet sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectrumRequest {
    HeaderSubscription,
    ScriptHashSubscription(ScriptHash),
    GetHeaders { start: u32, count: u32 },
    GetScriptHashHistory(ScriptHash),
    GetTransaction(Txid),
    GetMerkle { txid: Txid, height: u32 },
    Broadcast(Transaction),
}

/// Everything the server (or the transport) can tell the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ServerReady,
    Disconnected,
    HeaderSubscription { height: u32, header: Header },
    ScriptHashSubscription { script_hash: ScriptHash, status: String },
    Headers { start: u32, headers: Vec<Header> },
    ScriptHashHistory { script_hash: ScriptHash, items: Vec<HistoryItem> },
    Transaction(Transaction),
    Merkle(MerkleProof),
    ServerError { request: ElectrumRequest, message: String },
}

/// Side effects a transition asks the driver to perform, in order.
#[derive(Debug, Clone)]
pub enum EngineAction {
    Send(ElectrumRequest),
    Publish(WalletEvent),
    Disconnect,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("output amount is below the dust limit")]
    AmountBelowDustLimit,
    #[error("transaction to complete must not have inputs")]
    InputsNotEmpty,
    #[error("not connected to a server")]
    NotConnected,
    #[error("key derivation failed: {0}")]
    Derivation(#[from] bitcoin::bip32::Error),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn merkle_root_of_empty_path_is_the_txid() {
        let txid =
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        let proof = MerkleProof {
            txid,
            merkle: vec![],
            block_height: 0,
            pos: 0,
        };
        assert_eq!(proof.root(), TxMerkleNode::from_raw_hash(txid.to_raw_hash()));
    }

    #[test]
    fn merkle_path_folds_pairwise() {
        // two-leaf tree: root = H(left || right)
        let left =
            Txid::from_str("1111111111111111111111111111111111111111111111111111111111111111")
                .unwrap();
        let right =
            Txid::from_str("2222222222222222222222222222222222222222222222222222222222222222")
                .unwrap();

        let mut engine = sha256d::Hash::engine();
        engine.input(left.to_raw_hash().as_byte_array());
        engine.input(right.to_raw_hash().as_byte_array());
        let expected = TxMerkleNode::from_raw_hash(sha256d::Hash::from_engine(engine));

        let from_left = MerkleProof {
            txid: left,
            merkle: vec![TxMerkleNode::from_raw_hash(right.to_raw_hash())],
            block_height: 0,
            pos: 0,
        };
        let from_right = MerkleProof {
            txid: right,
            merkle: vec![TxMerkleNode::from_raw_hash(left.to_raw_hash())],
            block_height: 0,
            pos: 1,
        };
        assert_eq!(from_left.root(), expected);
        assert_eq!(from_right.root(), expected);
    }
}
