//! The wallet decision engine.
//!
//! This is a PURE state machine over server events:
//! - No network
//! - No async
//! - Fully deterministic
//!
//! It consumes [`EngineEvent`]s and emits [`EngineAction`]s for the driver to
//! execute, and answers wallet commands (balances, addresses, spends)
//! synchronously. The only I/O it touches is the wallet store, for snapshot
//! writes and header reads below the in-memory view.

mod logic;
pub mod state;
pub mod types;


use std::sync::Arc;

use bitcoin::bip32::Xpub;
use bitcoin::{Address, Amount, FeeRate, ScriptBuf, SignedAmount, Transaction};

use crate::chain::{Blockchain, CheckPoint};
use crate::domain::keys::{KeyBranch, KeyChain};
use crate::domain::scheme::AddressScheme;
use crate::domain::WalletParameters;
use crate::persist::{DbHeaderReader, WalletDb};

pub use state::{State, WalletData};
pub use types::{EngineAction, EngineEvent, ElectrumRequest, HistoryItem, MerkleProof, WalletError};

pub struct WalletEngine {
    params: WalletParameters,
    keychain: KeyChain,
    scheme: &'static dyn AddressScheme,
    db: Arc<dyn WalletDb>,
    state: State,
    data: WalletData,
}

impl WalletEngine {
    /// Restores the wallet from the store (falling back to a fresh one on a
    /// missing or corrupt snapshot) and leaves it DISCONNECTED.
    pub fn new(
        seed: &[u8],
        params: WalletParameters,
        checkpoints: Vec<CheckPoint>,
        db: Arc<dyn WalletDb>,
    ) -> Result<Self, WalletError> {
        let keychain = KeyChain::new(seed, params.network, params.wallet_type)?;
        let scheme = params.wallet_type.scheme();

        let mut blockchain = Blockchain::new(params.network, checkpoints);
        let start = blockchain
            .checkpoint_height()
            .map(|height| height + 1)
            .unwrap_or(0);
        let stored = db.get_headers(start, usize::MAX);
        if !stored.is_empty() {
            log::info!(
                "[ENGINE] loading {} stored headers from {}",
                stored.len(),
                start
            );
            if let Err(err) = blockchain.add_headers(start, &stored, &DbHeaderReader(db.as_ref()))
            {
                log::warn!("[ENGINE] stored headers rejected: {}", err);
            }
        }

        let snapshot = match db.read_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!("[ENGINE] snapshot unreadable, starting fresh: {}", err);
                None
            }
        };

        let mut data = WalletData::new(blockchain);
        let (account_count, change_count) = snapshot
            .as_ref()
            .map(|s| {
                (
                    s.account_key_count.max(params.gap_limit).max(1),
                    s.change_key_count.max(params.gap_limit).max(1),
                )
            })
            .unwrap_or((params.gap_limit.max(1), params.gap_limit.max(1)));
        for index in 0..account_count {
            data.push_key(keychain.derive(scheme, KeyBranch::Account, index)?);
        }
        for index in 0..change_count {
            data.push_key(keychain.derive(scheme, KeyBranch::Change, index)?);
        }
        if let Some(snapshot) = snapshot {
            log::info!(
                "[ENGINE] restored snapshot ({} transactions, {} keys)",
                snapshot.transactions.len(),
                account_count + change_count
            );
            data.restore_snapshot(snapshot);
        }

        Ok(Self {
            params,
            keychain,
            scheme,
            db,
            state: State::Disconnected,
            data,
        })
    }

    /// Main entrypoint: feed one server event, get the side effects to run.
    pub fn handle_event(&mut self, event: EngineEvent) -> Vec<EngineAction> {
        match (self.state, event) {
            (_, EngineEvent::Disconnected) => self.on_disconnected(),
            (State::Disconnected, EngineEvent::ServerReady) => self.on_server_ready(),
            (State::WaitingForTip, EngineEvent::HeaderSubscription { height, header }) => {
                self.on_tip(height, header)
            }
            (State::Syncing, EngineEvent::Headers { start, headers }) => {
                self.on_headers_syncing(start, headers)
            }
            (State::Syncing, EngineEvent::HeaderSubscription { height, .. }) => {
                log::debug!("[ENGINE] ignoring tip {} while syncing", height);
                Vec::new()
            }
            (State::Running, EngineEvent::HeaderSubscription { height, header }) => {
                self.on_new_tip(height, header)
            }
            (State::Running, EngineEvent::ScriptHashSubscription {
                script_hash,
                status,
            }) => self.on_status(script_hash, status),
            (State::Running, EngineEvent::ScriptHashHistory { script_hash, items }) => {
                self.on_history(script_hash, items)
            }
            (State::Running, EngineEvent::Transaction(tx)) => self.on_transaction(tx),
            (State::Running, EngineEvent::Merkle(proof)) => self.on_merkle(proof),
            (State::Running, EngineEvent::Headers { start, headers }) => {
                self.on_headers_running(start, headers)
            }
            (_, EngineEvent::ServerError { request, message }) => {
                self.on_server_error(request, message)
            }
            (state, event) => {
                log::debug!("[ENGINE] ignoring {:?} in state {:?}", event, state);
                Vec::new()
            }
        }
    }

    // ================================
    // Commands
    // ================================

    pub fn state(&self) -> State {
        self.state
    }

    pub fn data(&self) -> &WalletData {
        &self.data
    }

    pub fn parameters(&self) -> &WalletParameters {
        &self.params
    }

    pub fn is_ready(&self) -> bool {
        self.data.is_ready(self.params.gap_limit)
    }

    pub fn balance(&self) -> (SignedAmount, SignedAmount) {
        self.data.balance()
    }

    pub fn receive_address(&self) -> Address {
        self.scheme
            .address(&self.data.receive_key().public_key, self.params.network)
    }

    /// Extended public key of the wallet root (`m/purpose'/coin'/0'`).
    pub fn root_xpub(&self) -> Xpub {
        self.keychain.root_xpub()
    }

    /// Funds, signs and locks a transaction that has outputs but no inputs.
    pub fn complete_transaction(
        &mut self,
        tx: Transaction,
        fee_rate: FeeRate,
    ) -> Result<(Transaction, Amount), WalletError> {
        self.data
            .complete_transaction(tx, fee_rate, &self.params, self.scheme, self.keychain.secp())
    }

    pub fn commit_transaction(&mut self, tx: &Transaction) {
        self.data.commit_transaction(tx, self.scheme);
    }

    pub fn cancel_transaction(&mut self, tx: &Transaction) {
        self.data.cancel_transaction(tx);
    }

    pub fn spend_all(
        &self,
        script: ScriptBuf,
        fee_rate: FeeRate,
    ) -> Result<(Transaction, Amount), WalletError> {
        self.data
            .spend_all(script, fee_rate, &self.params, self.scheme, self.keychain.secp())
    }

    pub fn is_double_spent(&self, tx: &Transaction) -> bool {
        self.data.is_double_spent(tx)
    }

    /// Only allowed while RUNNING; the returned action carries the request.
    pub fn broadcast_transaction(&self, tx: Transaction) -> Result<EngineAction, WalletError> {
        if self.state != State::Running {
            return Err(WalletError::NotConnected);
        }
        Ok(EngineAction::Send(ElectrumRequest::Broadcast(tx)))
    }
}
