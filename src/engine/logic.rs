//! Transition handlers, one per (state, event) pair that does real work.

use std::collections::VecDeque;

use bitcoin::block::Header;
use bitcoin::{Transaction, Txid};

use crate::chain::RETARGETING_PERIOD;
use crate::domain::scheme::{script_hash_hex, ScriptHash};
use crate::engine::state::State;
use crate::engine::types::{ElectrumRequest, EngineAction, HistoryItem, MerkleProof};
use crate::engine::WalletEngine;
use crate::events::{WalletEvent, WalletReady};
use crate::persist::DbHeaderReader;

/// Orphans are bounded; the server re-announces on reconnect if we drop one.
const ORPHAN_QUEUE_LIMIT: usize = 100;

impl WalletEngine {
    pub(super) fn on_disconnected(&mut self) -> Vec<EngineAction> {
        log::info!("[ENGINE] disconnected");
        // forget the status of scripthashes with interrupted history
        // downloads so they are re-queried on reconnect
        let interrupted: Vec<ScriptHash> =
            self.data.pending_history_requests.drain().collect();
        for script_hash in interrupted {
            self.data.status.remove(&script_hash);
        }
        self.data.pending_transaction_requests.clear();
        self.data.pending_headers_requests.clear();
        self.data.pending_merkle_responses.clear();
        self.data.last_ready = None;
        self.state = State::Disconnected;
        Vec::new()
    }

    pub(super) fn on_server_ready(&mut self) -> Vec<EngineAction> {
        log::info!("[ENGINE] server ready, subscribing to headers");
        self.state = State::WaitingForTip;
        vec![EngineAction::Send(ElectrumRequest::HeaderSubscription)]
    }

    pub(super) fn on_tip(&mut self, height: u32, header: Header) -> Vec<EngineAction> {
        match self.data.blockchain.tip().copied() {
            Some(tip) if height < tip.height => {
                log::error!(
                    "[ENGINE] server tip {} is behind our tip {}, disconnecting",
                    height,
                    tip.height
                );
                vec![EngineAction::Disconnect]
            }
            Some(tip) if tip.header == header => {
                log::info!("[ENGINE] already at the server tip {}", height);
                self.enter_running()
            }
            Some(tip) => {
                log::info!("[ENGINE] header sync {} -> {}", tip.height, height);
                self.state = State::Syncing;
                vec![EngineAction::Send(ElectrumRequest::GetHeaders {
                    start: tip.height + 1,
                    count: RETARGETING_PERIOD,
                })]
            }
            None => {
                let start =
                    self.data.blockchain.checkpoints().len() as u32 * RETARGETING_PERIOD;
                log::info!("[ENGINE] no local chain, full header sync from {}", start);
                self.state = State::Syncing;
                vec![EngineAction::Send(ElectrumRequest::GetHeaders {
                    start,
                    count: RETARGETING_PERIOD,
                })]
            }
        }
    }

    pub(super) fn on_headers_syncing(
        &mut self,
        start: u32,
        headers: Vec<Header>,
    ) -> Vec<EngineAction> {
        if headers.is_empty() {
            log::info!(
                "[ENGINE] headers in sync at {:?}",
                self.data.blockchain.tip_height()
            );
            return self.enter_running();
        }
        let added = self
            .data
            .blockchain
            .add_headers(start, &headers, &DbHeaderReader(self.db.as_ref()));
        match added {
            Ok(()) => {
                self.prune_and_persist();
                let next = self.data.blockchain.tip_height().map(|h| h + 1).unwrap_or(0);
                log::debug!("[ENGINE] requesting next headers chunk at {}", next);
                vec![EngineAction::Send(ElectrumRequest::GetHeaders {
                    start: next,
                    count: RETARGETING_PERIOD,
                })]
            }
            Err(err) => {
                log::error!("[ENGINE] invalid headers chunk at {}: {}", start, err);
                vec![EngineAction::Disconnect]
            }
        }
    }

    pub(super) fn on_new_tip(&mut self, height: u32, header: Header) -> Vec<EngineAction> {
        if self.data.blockchain.tip().map(|tip| tip.header) == Some(header) {
            return Vec::new();
        }
        if let Some(expected) = self
            .data
            .blockchain
            .expected_bits(height, &DbHeaderReader(self.db.as_ref()))
        {
            if header.bits != expected {
                log::error!(
                    "[ENGINE] tip at {} has unexpected difficulty, disconnecting",
                    height
                );
                return vec![EngineAction::Disconnect];
            }
        }
        let added = self
            .data
            .blockchain
            .add_header(height, header, &DbHeaderReader(self.db.as_ref()));
        match added {
            Ok(()) => {
                log::info!("[ENGINE] new tip at {}", height);
                self.prune_and_persist();
                let confirmed: Vec<Txid> = self
                    .data
                    .heights
                    .iter()
                    .filter(|(_, height)| **height > 0)
                    .map(|(txid, _)| *txid)
                    .collect();
                let mut actions: Vec<EngineAction> = confirmed
                    .into_iter()
                    .map(|txid| {
                        EngineAction::Publish(WalletEvent::TransactionConfidenceChanged {
                            txid,
                            depth: self.data.compute_depth(&txid),
                            timestamp: self.timestamp_of(&txid),
                        })
                    })
                    .collect();
                actions.extend(self.persist_and_notify());
                actions
            }
            Err(err) => {
                log::error!("[ENGINE] rejected tip at {}: {}; disconnecting", height, err);
                vec![EngineAction::Disconnect]
            }
        }
    }

    pub(super) fn on_status(
        &mut self,
        script_hash: ScriptHash,
        status: String,
    ) -> Vec<EngineAction> {
        if self.data.status.get(&script_hash) == Some(&status) {
            // a repeat tells us nothing new, but after a restart we may still
            // be missing transaction bodies for this history
            let missing: Vec<Txid> = self
                .data
                .history
                .get(&script_hash)
                .map(|items| {
                    items
                        .iter()
                        .map(|item| item.txid)
                        .filter(|txid| {
                            !self.data.transactions.contains_key(txid)
                                && !self.data.pending_transaction_requests.contains(txid)
                                && !self
                                    .data
                                    .pending_transactions
                                    .iter()
                                    .any(|tx| tx.compute_txid() == *txid)
                        })
                        .collect()
                })
                .unwrap_or_default();
            let mut actions = Vec::new();
            for txid in missing {
                self.data.pending_transaction_requests.insert(txid);
                actions.push(EngineAction::Send(ElectrumRequest::GetTransaction(txid)));
            }
            return actions;
        }

        let Some(key) = self.data.key_for_script_hash(&script_hash) else {
            log::warn!(
                "[ENGINE] status for unknown script hash {}",
                script_hash_hex(&script_hash)
            );
            return Vec::new();
        };
        let (branch, index) = (key.branch, key.index);

        if status.is_empty() {
            self.data.status.insert(script_hash, status);
            return self.persist_and_notify();
        }

        // a key whose stored status was absent or empty just became active
        let newly_active = self
            .data
            .status
            .get(&script_hash)
            .map(String::is_empty)
            .unwrap_or(true);
        log::debug!(
            "[ENGINE] status changed for {} ({:?}/{})",
            script_hash_hex(&script_hash),
            branch,
            index
        );
        self.data.status.insert(script_hash, status);
        self.data.pending_history_requests.insert(script_hash);
        let mut actions = vec![EngineAction::Send(ElectrumRequest::GetScriptHashHistory(
            script_hash,
        ))];

        let last_of_branch = index + 1 == self.data.branch_keys(branch).len() as u32;
        if newly_active && last_of_branch {
            if let Some(new_script_hash) = self.extend_branch(branch) {
                actions.push(EngineAction::Send(ElectrumRequest::ScriptHashSubscription(
                    new_script_hash,
                )));
            }
        }
        actions.extend(self.persist_and_notify());
        actions
    }

    pub(super) fn on_history(
        &mut self,
        script_hash: ScriptHash,
        items: Vec<HistoryItem>,
    ) -> Vec<EngineAction> {
        log::debug!(
            "[ENGINE] history for {}: {} items",
            script_hash_hex(&script_hash),
            items.len()
        );
        // entries the server omitted but we know locally are kept: typically
        // transactions we just committed and it has not indexed yet
        let shadow: Vec<HistoryItem> = self
            .data
            .history
            .get(&script_hash)
            .map(|known| {
                known
                    .iter()
                    .filter(|item| !items.iter().any(|i| i.txid == item.txid))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        let mut merged = items;
        merged.extend(shadow);

        let mut actions = Vec::new();
        for item in &merged {
            let new_download = !self.data.transactions.contains_key(&item.txid)
                && !self.data.pending_transaction_requests.contains(&item.txid)
                && !self
                    .data
                    .pending_transactions
                    .iter()
                    .any(|tx| tx.compute_txid() == item.txid);
            if new_download {
                self.data.pending_transaction_requests.insert(item.txid);
                actions.push(EngineAction::Send(ElectrumRequest::GetTransaction(
                    item.txid,
                )));
                if item.height > 0 {
                    self.request_headers_if_missing(item.height as u32, &mut actions);
                    actions.push(EngineAction::Send(ElectrumRequest::GetMerkle {
                        txid: item.txid,
                        height: item.height as u32,
                    }));
                }
            }

            let previous = self.data.heights.insert(item.txid, item.height);
            match previous {
                Some(previous) if previous == item.height => {
                    // unchanged, but a proof may still be missing
                    if item.height > 0 && !self.data.proofs.contains_key(&item.txid) && !new_download
                    {
                        self.request_headers_if_missing(item.height as u32, &mut actions);
                        actions.push(EngineAction::Send(ElectrumRequest::GetMerkle {
                            txid: item.txid,
                            height: item.height as u32,
                        }));
                    }
                }
                _ => {
                    // first height for this txid, or a reorg moved it
                    actions.push(EngineAction::Publish(
                        WalletEvent::TransactionConfidenceChanged {
                            txid: item.txid,
                            depth: self.data.compute_depth(&item.txid),
                            timestamp: self.timestamp_of(&item.txid),
                        },
                    ));
                    if item.height > 0 && !new_download {
                        self.request_headers_if_missing(item.height as u32, &mut actions);
                        actions.push(EngineAction::Send(ElectrumRequest::GetMerkle {
                            txid: item.txid,
                            height: item.height as u32,
                        }));
                    }
                }
            }
        }

        self.data.history.insert(script_hash, merged);
        self.data.pending_history_requests.remove(&script_hash);
        actions.extend(self.persist_and_notify());
        actions
    }

    pub(super) fn on_transaction(&mut self, tx: Transaction) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let mut queue: VecDeque<Transaction> = VecDeque::from([tx]);
        while let Some(tx) = queue.pop_front() {
            let txid = tx.compute_txid();
            self.data.pending_transaction_requests.remove(&txid);
            if self.data.transactions.contains_key(&txid) {
                continue;
            }
            match self.data.compute_transaction_delta(&tx, self.scheme) {
                Some(delta) => {
                    log::info!(
                        "[ENGINE] received tx {} (received {}, sent {})",
                        txid,
                        delta.received,
                        delta.sent
                    );
                    actions.push(EngineAction::Publish(WalletEvent::TransactionReceived {
                        tx: tx.clone(),
                        depth: self.data.compute_depth(&txid),
                        received: delta.received,
                        sent: delta.sent,
                        fee: delta.fee,
                        timestamp: self.timestamp_of(&txid),
                    }));
                    self.data.transactions.insert(txid, tx);
                    // this may have been the missing parent of earlier orphans
                    queue.extend(std::mem::take(&mut self.data.pending_transactions));
                }
                None => {
                    log::debug!("[ENGINE] tx {} is missing parents, queued", txid);
                    if self.data.pending_transactions.len() >= ORPHAN_QUEUE_LIMIT {
                        let dropped = self.data.pending_transactions.remove(0);
                        log::warn!(
                            "[ENGINE] orphan queue full, dropping {}",
                            dropped.compute_txid()
                        );
                    }
                    self.data.pending_transactions.push(tx);
                }
            }
        }
        actions.extend(self.persist_and_notify());
        actions
    }

    pub(super) fn on_merkle(&mut self, proof: MerkleProof) -> Vec<EngineAction> {
        let header = self
            .data
            .blockchain
            .get_header(proof.block_height)
            .or_else(|| self.db.get_header(proof.block_height));
        match header {
            Some(header) if header.merkle_root == proof.root() => {
                log::debug!(
                    "[ENGINE] proof for {} checks out at {}",
                    proof.txid,
                    proof.block_height
                );
                self.data.proofs.insert(proof.txid, proof);
                self.persist_and_notify()
            }
            Some(_) => {
                log::error!(
                    "[ENGINE] merkle proof for {} contradicts the header at {}, disconnecting",
                    proof.txid,
                    proof.block_height
                );
                self.data.transactions.remove(&proof.txid);
                vec![EngineAction::Disconnect]
            }
            None => {
                // hold the proof until its header chunk arrives
                let mut actions = Vec::new();
                self.request_headers_if_missing(proof.block_height, &mut actions);
                log::debug!(
                    "[ENGINE] missing header at {} for proof of {}, deferring",
                    proof.block_height,
                    proof.txid
                );
                self.data.pending_merkle_responses.push(proof);
                actions
            }
        }
    }

    pub(super) fn on_headers_running(
        &mut self,
        start: u32,
        headers: Vec<Header>,
    ) -> Vec<EngineAction> {
        self.data.pending_headers_requests.remove(&start);
        if headers.is_empty() {
            return Vec::new();
        }
        if let Err(err) = self.data.blockchain.validate_chunk(start, &headers) {
            log::error!("[ENGINE] invalid backfill chunk at {}: {}", start, err);
            return vec![EngineAction::Disconnect];
        }
        if let Err(err) = self.db.add_headers(start, &headers) {
            log::error!("[ENGINE] failed to persist chunk at {}: {}", start, err);
        }
        // the chunk may unblock deferred merkle proofs
        let deferred = std::mem::take(&mut self.data.pending_merkle_responses);
        let mut actions = Vec::new();
        for proof in deferred {
            actions.extend(self.on_merkle(proof));
        }
        actions
    }

    pub(super) fn on_server_error(
        &mut self,
        request: ElectrumRequest,
        message: String,
    ) -> Vec<EngineAction> {
        match request {
            ElectrumRequest::GetTransaction(txid)
                if self.data.heights.contains_key(&txid)
                    || self.data.pending_transaction_requests.contains(&txid) =>
            {
                // the server announced this txid and now claims ignorance
                log::error!(
                    "[ENGINE] server cannot provide tx {} it announced ({}), disconnecting",
                    txid,
                    message
                );
                vec![EngineAction::Disconnect]
            }
            request => {
                log::warn!("[ENGINE] server error for {:?}: {}", request, message);
                Vec::new()
            }
        }
    }

    // ================================
    // Shared helpers
    // ================================

    fn enter_running(&mut self) -> Vec<EngineAction> {
        self.state = State::Running;
        let mut actions: Vec<EngineAction> = self
            .data
            .account_keys
            .iter()
            .chain(&self.data.change_keys)
            .map(|key| {
                EngineAction::Send(ElectrumRequest::ScriptHashSubscription(key.script_hash))
            })
            .collect();
        log::info!(
            "[ENGINE] running, subscribing {} script hashes",
            actions.len()
        );
        actions.extend(self.persist_and_notify());
        actions
    }

    /// Publishes readiness and persists a snapshot whenever the ready message
    /// changes; a no-op while downloads are in flight.
    fn persist_and_notify(&mut self) -> Vec<EngineAction> {
        if !self.data.is_ready(self.params.gap_limit) {
            return Vec::new();
        }
        let (confirmed, unconfirmed) = self.data.balance();
        let tip = self.data.blockchain.tip().copied();
        let ready = WalletReady {
            confirmed,
            unconfirmed,
            height: tip.map(|tip| tip.height).unwrap_or(0),
            timestamp: tip.map(|tip| tip.header.time).unwrap_or(0),
        };
        if self.data.last_ready == Some(ready) {
            return Vec::new();
        }
        self.data.last_ready = Some(ready);
        if let Err(err) = self.db.persist(&self.data.to_snapshot()) {
            log::error!("[ENGINE] snapshot write failed: {}", err);
        }
        vec![
            EngineAction::Publish(WalletEvent::Ready(ready)),
            EngineAction::Publish(WalletEvent::NewReceiveAddress(self.receive_address())),
        ]
    }

    fn prune_and_persist(&mut self) {
        let pruned = self.data.blockchain.optimize();
        for chunk in pruned.chunks(RETARGETING_PERIOD as usize) {
            let headers: Vec<Header> = chunk.iter().map(|indexed| indexed.header).collect();
            if let Err(err) = self.db.add_headers(chunk[0].height, &headers) {
                log::error!(
                    "[ENGINE] failed to persist pruned headers at {}: {}",
                    chunk[0].height,
                    err
                );
            }
        }
    }

    fn extend_branch(&mut self, branch: crate::domain::keys::KeyBranch) -> Option<ScriptHash> {
        let index = self.data.branch_keys(branch).len() as u32;
        match self.keychain.derive(self.scheme, branch, index) {
            Ok(key) => {
                log::info!("[ENGINE] extending {:?} branch to index {}", branch, index);
                let script_hash = key.script_hash;
                self.data.push_key(key);
                Some(script_hash)
            }
            Err(err) => {
                log::error!(
                    "[ENGINE] key derivation failed for {:?}/{}: {}",
                    branch,
                    index,
                    err
                );
                None
            }
        }
    }

    fn request_headers_if_missing(&mut self, height: u32, actions: &mut Vec<EngineAction>) {
        if self.data.blockchain.get_header(height).is_some()
            || self.db.get_header(height).is_some()
        {
            return;
        }
        let start = height / RETARGETING_PERIOD * RETARGETING_PERIOD;
        if self.data.pending_headers_requests.insert(start) {
            actions.push(EngineAction::Send(ElectrumRequest::GetHeaders {
                start,
                count: RETARGETING_PERIOD,
            }));
        }
    }

    fn timestamp_of(&self, txid: &Txid) -> Option<u32> {
        let height = *self.data.heights.get(txid)?;
        if height <= 0 {
            return None;
        }
        let height = height as u32;
        self.data
            .blockchain
            .get_header(height)
            .or_else(|| self.db.get_header(height))
            .map(|header| header.time)
    }
}
