//! Coin selection, transaction construction, signing and lock management.

use std::collections::HashSet;

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Amount, FeeRate, OutPoint, ScriptBuf, Transaction, TxOut};

use crate::domain::scheme::{script_hash_of, AddressScheme};
use crate::domain::utxo::Utxo;
use crate::domain::WalletParameters;
use crate::engine::state::WalletData;
use crate::engine::types::{HistoryItem, WalletError};

impl WalletData {
    /// Candidate coins for selection: unlocked, optionally confirmed-only,
    /// sorted smallest-first (keeps the utxo set lean over time).
    fn spendable_utxos(&self, allow_spend_unconfirmed: bool) -> Vec<Utxo> {
        let locked: HashSet<OutPoint> = self
            .locks
            .values()
            .flat_map(|tx| tx.input.iter().map(|input| input.previous_output))
            .collect();
        let mut candidates: Vec<Utxo> = self
            .utxos()
            .into_iter()
            .filter(|utxo| !locked.contains(&utxo.outpoint))
            .filter(|utxo| allow_spend_unconfirmed || utxo.height > 0)
            .collect();
        candidates.sort_by_key(|utxo| utxo.value);
        candidates
    }

    /// Funds, signs and locks `tx`, which must have outputs but no inputs.
    /// Returns the signed transaction and the fee it actually pays.
    pub fn complete_transaction(
        &mut self,
        tx: Transaction,
        fee_rate: FeeRate,
        params: &WalletParameters,
        scheme: &dyn AddressScheme,
        secp: &Secp256k1<All>,
    ) -> Result<(Transaction, Amount), WalletError> {
        if !tx.input.is_empty() {
            return Err(WalletError::InputsNotEmpty);
        }
        if tx.output.iter().any(|output| output.value < params.dust_limit) {
            return Err(WalletError::AmountBelowDustLimit);
        }
        let amount: Amount = tx.output.iter().map(|output| output.value).sum();
        if amount <= params.dust_limit {
            return Err(WalletError::AmountBelowDustLimit);
        }

        let change_script = self.change_key().script_pubkey.clone();
        let estimate_fee = |selection: &[Utxo], change: Option<&ScriptBuf>| -> Amount {
            let mut probe = tx.clone();
            for utxo in selection {
                probe
                    .input
                    .push(scheme.dummy_input(utxo.outpoint, &utxo.key.public_key));
            }
            if let Some(script) = change {
                probe.output.push(TxOut {
                    value: params.dust_limit,
                    script_pubkey: script.clone(),
                });
            }
            fee_rate
                .fee_wu(probe.weight())
                .unwrap_or(Amount::MAX_MONEY)
                .max(params.minimum_fee)
        };

        // grow the selection until it covers amount + fee, then decide
        // whether a change output is worth carrying
        let mut selection: Vec<Utxo> = Vec::new();
        let mut pool = self.spendable_utxos(params.allow_spend_unconfirmed).into_iter();
        let change_value = loop {
            let total: Amount = selection.iter().map(|utxo| utxo.value).sum();
            let fee = estimate_fee(&selection, None);
            if total < amount + fee {
                match pool.next() {
                    Some(utxo) => selection.push(utxo),
                    None => return Err(WalletError::InsufficientFunds),
                }
                continue;
            }
            if total == amount + fee {
                break None;
            }
            let fee_with_change = estimate_fee(&selection, Some(&change_script));
            match total.checked_sub(amount + fee_with_change) {
                Some(change) if change >= params.dust_limit => break Some(change),
                // the change would be dust, let the miner have it
                _ => break None,
            }
        };

        let mut unsigned = tx;
        for utxo in &selection {
            unsigned
                .input
                .push(scheme.dummy_input(utxo.outpoint, &utxo.key.public_key));
        }
        if let Some(change) = change_value {
            unsigned.output.push(TxOut {
                value: change,
                script_pubkey: change_script,
            });
        }

        let mut signed = unsigned.clone();
        for (index, utxo) in selection.iter().enumerate() {
            signed.input[index] = scheme.sign_input(secp, &unsigned, index, utxo.value, &utxo.key)?;
        }

        let selected: Amount = selection.iter().map(|utxo| utxo.value).sum();
        let outputs: Amount = signed.output.iter().map(|output| output.value).sum();
        let fee = selected - outputs;
        let txid = signed.compute_txid();
        log::info!(
            "[WALLET] built tx {} ({} inputs, fee {})",
            txid,
            signed.input.len(),
            fee
        );
        self.locks.insert(txid, signed.clone());
        Ok((signed, fee))
    }

    /// Unlocks `tx` and records it as an unconfirmed wallet transaction,
    /// prepending it to the history of every scripthash it touches so that
    /// chained builds see the spend before the server announces it. The
    /// server's next history response overwrites these entries.
    pub fn commit_transaction(&mut self, tx: &Transaction, scheme: &dyn AddressScheme) {
        let txid = tx.compute_txid();
        self.locks.remove(&txid);

        let mut touched = Vec::new();
        for input in &tx.input {
            if let Some(public_key) = scheme.extract_public_key(input) {
                let script_hash = script_hash_of(&scheme.output_script(&public_key));
                if self.script_index.contains_key(&script_hash) {
                    touched.push(script_hash);
                }
            }
        }
        for output in &tx.output {
            let script_hash = script_hash_of(&output.script_pubkey);
            if self.script_index.contains_key(&script_hash) {
                touched.push(script_hash);
            }
        }
        for script_hash in touched {
            let items = self.history.entry(script_hash).or_default();
            if !items.iter().any(|item| item.txid == txid) {
                items.insert(0, HistoryItem { txid, height: 0 });
            }
        }

        self.transactions.insert(txid, tx.clone());
        self.heights.insert(txid, 0);
    }

    /// Unlocks `tx`; its inputs become selectable again.
    pub fn cancel_transaction(&mut self, tx: &Transaction) {
        self.locks.remove(&tx.compute_txid());
    }

    /// Drains every coin the wallet has (locked and unconfirmed included)
    /// into a single output paying `script`.
    pub fn spend_all(
        &self,
        script: ScriptBuf,
        fee_rate: FeeRate,
        params: &WalletParameters,
        scheme: &dyn AddressScheme,
        secp: &Secp256k1<All>,
    ) -> Result<(Transaction, Amount), WalletError> {
        let utxos = self.utxos();
        if utxos.is_empty() {
            return Err(WalletError::InsufficientFunds);
        }
        let total: Amount = utxos.iter().map(|utxo| utxo.value).sum();

        let mut unsigned = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: total,
                script_pubkey: script,
            }],
        };
        for utxo in &utxos {
            unsigned
                .input
                .push(scheme.dummy_input(utxo.outpoint, &utxo.key.public_key));
        }
        let fee = fee_rate
            .fee_wu(unsigned.weight())
            .unwrap_or(Amount::MAX_MONEY)
            .max(params.minimum_fee);
        let value = total
            .checked_sub(fee)
            .filter(|value| *value >= params.dust_limit)
            .ok_or(WalletError::InsufficientFunds)?;
        unsigned.output[0].value = value;

        let mut signed = unsigned.clone();
        for (index, utxo) in utxos.iter().enumerate() {
            signed.input[index] = scheme.sign_input(secp, &unsigned, index, utxo.value, &utxo.key)?;
        }
        Ok((signed, fee))
    }

    /// A transaction is double-spent once a conflicting transaction (same
    /// outpoint, different txid) is buried at least two blocks deep.
    pub fn is_double_spent(&self, tx: &Transaction) -> bool {
        let txid = tx.compute_txid();
        let outpoints: HashSet<OutPoint> =
            tx.input.iter().map(|input| input.previous_output).collect();
        self.heights
            .keys()
            .filter(|other| self.compute_depth(other) >= 2)
            .filter_map(|other| self.transactions.get(other))
            .any(|other| {
                other.compute_txid() != txid
                    && other
                        .input
                        .iter()
                        .any(|input| outpoints.contains(&input.previous_output))
            })
    }
}
