//! Spendable outputs, balances and confirmation depths, derived on demand.
//!
//! Nothing here is stored: the UTXO set is a function of (history,
//! transactions, locks), so a reorg simply re-derives it.

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, Script, SignedAmount, Transaction, TxIn, Txid};

use crate::domain::keys::DerivedKey;
use crate::domain::scheme::{script_hash_of, AddressScheme, ScriptHash};
use crate::engine::state::WalletData;

#[derive(Debug, Clone)]
pub struct Utxo {
    pub key: DerivedKey,
    pub outpoint: OutPoint,
    pub value: Amount,
    /// History height of the funding transaction (`<= 0` means unconfirmed).
    pub height: i32,
}

/// What a transaction does to the wallet, assuming its parents are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDelta {
    pub received: Amount,
    pub sent: Amount,
    /// Only known when every input of the transaction is ours.
    pub fee: Option<Amount>,
}

impl WalletData {
    pub fn is_mine_script(&self, script: &Script) -> bool {
        self.script_index.contains_key(&script_hash_of(script))
    }

    pub fn is_mine_input(&self, input: &TxIn, scheme: &dyn AddressScheme) -> bool {
        scheme
            .extract_public_key(input)
            .map(|pk| self.is_mine_script(&scheme.output_script(&pk)))
            .unwrap_or(false)
    }

    /// Unspent outputs funding `script_hash`: every output of the history's
    /// transactions paying it, minus outpoints consumed by any transaction in
    /// the same history (which covers unconfirmed-spending-unconfirmed).
    pub fn script_hash_utxos(&self, script_hash: &ScriptHash) -> Vec<Utxo> {
        let Some(items) = self.history.get(script_hash) else {
            return Vec::new();
        };
        let Some(key) = self.key_for_script_hash(script_hash) else {
            return Vec::new();
        };
        let txs: Vec<&Transaction> = items
            .iter()
            .filter_map(|item| self.transactions.get(&item.txid))
            .collect();
        let spent: HashSet<OutPoint> = txs
            .iter()
            .flat_map(|tx| tx.input.iter().map(|input| input.previous_output))
            .collect();

        let mut utxos = Vec::new();
        for item in items {
            let Some(tx) = self.transactions.get(&item.txid) else {
                continue;
            };
            for (vout, output) in tx.output.iter().enumerate() {
                if script_hash_of(&output.script_pubkey) != *script_hash {
                    continue;
                }
                let outpoint = OutPoint::new(item.txid, vout as u32);
                if !spent.contains(&outpoint) {
                    utxos.push(Utxo {
                        key: key.clone(),
                        outpoint,
                        value: output.value,
                        height: item.height,
                    });
                }
            }
        }
        utxos
    }

    /// Union over all keys of both branches.
    pub fn utxos(&self) -> Vec<Utxo> {
        self.account_keys
            .iter()
            .chain(&self.change_keys)
            .flat_map(|key| self.script_hash_utxos(&key.script_hash))
            .collect()
    }

    /// `(confirmed, unconfirmed)` sats for one scripthash. Received sums the
    /// outputs paying it; spent sums our outputs consumed by transactions of
    /// the same confirmation tier, so unconfirmed can go negative when it
    /// spends confirmed coins.
    pub fn script_hash_balance(&self, script_hash: &ScriptHash) -> (i64, i64) {
        let Some(items) = self.history.get(script_hash) else {
            return (0, 0);
        };
        let tier = |confirmed: bool| -> i64 {
            let txs: Vec<&Transaction> = items
                .iter()
                .filter(|item| (item.height > 0) == confirmed)
                .filter_map(|item| self.transactions.get(&item.txid))
                .collect();
            let received: i64 = txs
                .iter()
                .flat_map(|tx| &tx.output)
                .filter(|output| script_hash_of(&output.script_pubkey) == *script_hash)
                .map(|output| output.value.to_sat() as i64)
                .sum();
            let spent: i64 = txs
                .iter()
                .flat_map(|tx| &tx.input)
                .filter_map(|input| {
                    let parent = self.transactions.get(&input.previous_output.txid)?;
                    let output = parent.output.get(input.previous_output.vout as usize)?;
                    (script_hash_of(&output.script_pubkey) == *script_hash)
                        .then(|| output.value.to_sat() as i64)
                })
                .sum();
            received - spent
        };
        (tier(true), tier(false))
    }

    /// Wallet-wide balance. Folds over the ordered key list, never a set of
    /// per-key pairs, so equal per-key balances cannot collapse.
    pub fn balance(&self) -> (SignedAmount, SignedAmount) {
        let mut confirmed = 0i64;
        let mut unconfirmed = 0i64;
        for key in self.account_keys.iter().chain(&self.change_keys) {
            let (c, u) = self.script_hash_balance(&key.script_hash);
            confirmed += c;
            unconfirmed += u;
        }
        (
            SignedAmount::from_sat(confirmed),
            SignedAmount::from_sat(unconfirmed),
        )
    }

    /// Number of confirmations of `txid` under the current tip; `0` for
    /// unconfirmed or unknown transactions.
    pub fn compute_depth(&self, txid: &Txid) -> u32 {
        match (self.heights.get(txid), self.blockchain.tip_height()) {
            (Some(&height), Some(tip)) if height > 0 && tip as i64 >= height as i64 => {
                (tip as i64 - height as i64 + 1) as u32
            }
            _ => 0,
        }
    }

    /// All parents of our inputs must be known to compute what a transaction
    /// does to the wallet; returns `None` otherwise (orphan).
    pub fn compute_transaction_delta(
        &self,
        tx: &Transaction,
        scheme: &dyn AddressScheme,
    ) -> Option<TransactionDelta> {
        let our_inputs: Vec<&TxIn> = tx
            .input
            .iter()
            .filter(|input| self.is_mine_input(input, scheme))
            .collect();
        let mut sent = Amount::ZERO;
        for input in &our_inputs {
            let parent = self.transactions.get(&input.previous_output.txid)?;
            let output = parent.output.get(input.previous_output.vout as usize)?;
            sent += output.value;
        }
        let received: Amount = tx
            .output
            .iter()
            .filter(|output| self.is_mine_script(&output.script_pubkey))
            .map(|output| output.value)
            .sum();
        let fee = if !tx.input.is_empty() && our_inputs.len() == tx.input.len() {
            let total_out: Amount = tx.output.iter().map(|output| output.value).sum();
            sent.checked_sub(total_out)
        } else {
            None
        };
        Some(TransactionDelta {
            received,
            sent,
            fee,
        })
    }
}
