//! The two supported output types behind one strategy interface.
//!
//! Everything the rest of the wallet needs to know about P2SH-wrapped vs
//! native segwit lives here: address encoding, output script, input
//! scaffolding for fee estimation, BIP143 signing, and recovering the public
//! key from one of our own signed inputs.

use std::fmt;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{self, All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, Script, ScriptBuf, Sequence,
    Transaction, TxIn, Witness,
};
use thiserror::Error;

use super::keys::DerivedKey;

/// The server indexes scripts by `SHA256(script_pubkey)`. We keep the raw
/// digest in memory; the wire and the logs show it byte-reversed.
pub type ScriptHash = sha256::Hash;

pub fn script_hash_of(script: &Script) -> ScriptHash {
    sha256::Hash::hash(script.as_bytes())
}

/// Reversed-hex form used in wire params and logs.
pub fn script_hash_hex(hash: &ScriptHash) -> String {
    let mut bytes = hash.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

/// Worst-case DER signature length including the sighash flag.
const DUMMY_SIGNATURE_LEN: usize = 72;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("sighash computation failed: {0}")]
    Sighash(#[from] bitcoin::sighash::P2wpkhError),
}

pub trait AddressScheme: Send + Sync + fmt::Debug {
    fn address(&self, public_key: &CompressedPublicKey, network: Network) -> Address;

    fn output_script(&self, public_key: &CompressedPublicKey) -> ScriptBuf;

    /// Input scaffolding used during selection: right weight, dummy signature.
    fn dummy_input(&self, outpoint: OutPoint, public_key: &CompressedPublicKey) -> TxIn;

    /// Signs input `index` of `tx` (spending `value` with `key`) and returns
    /// the finished input. SIGHASH_ALL, BIP143.
    fn sign_input(
        &self,
        secp: &Secp256k1<All>,
        tx: &Transaction,
        index: usize,
        value: Amount,
        key: &DerivedKey,
    ) -> Result<TxIn, SigningError>;

    /// Recovers the public key from an input signed under this scheme.
    fn extract_public_key(&self, input: &TxIn) -> Option<CompressedPublicKey>;
}

/// BIP84: bare P2WPKH outputs, Bech32 addresses.
#[derive(Debug, Clone, Copy)]
pub struct NativeSegwit;

/// BIP49: P2WPKH wrapped in P2SH, Base58Check addresses.
#[derive(Debug, Clone, Copy)]
pub struct P2shSegwit;

fn p2wpkh_script(public_key: &CompressedPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash())
}

/// scriptSig of a P2SH-P2WPKH spend: a single push of the redeem script.
fn wrapped_script_sig(public_key: &CompressedPublicKey) -> ScriptBuf {
    let redeem = p2wpkh_script(public_key);
    let push = PushBytesBuf::try_from(redeem.into_bytes()).expect("redeem script is 22 bytes");
    ScriptBuf::builder().push_slice(push).into_script()
}

fn dummy_witness() -> Witness {
    let mut witness = Witness::new();
    witness.push(vec![0u8; DUMMY_SIGNATURE_LEN]);
    witness.push(vec![0u8; 33]);
    witness
}

fn sign_p2wpkh(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    value: Amount,
    key: &DerivedKey,
) -> Result<Witness, SigningError> {
    let script = p2wpkh_script(&key.public_key);
    let mut cache = SighashCache::new(tx);
    let sighash = cache.p2wpkh_signature_hash(index, &script, value, EcdsaSighashType::All)?;
    let message = Message::from_digest(sighash.to_byte_array());
    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, &key.xpriv.private_key),
        sighash_type: EcdsaSighashType::All,
    };
    Ok(Witness::p2wpkh(&signature, &key.public_key.0))
}

fn parse_witness_pubkey(input: &TxIn) -> Option<CompressedPublicKey> {
    if input.witness.len() != 2 {
        return None;
    }
    secp256k1::PublicKey::from_slice(input.witness.nth(1)?)
        .ok()
        .map(CompressedPublicKey)
}

impl AddressScheme for NativeSegwit {
    fn address(&self, public_key: &CompressedPublicKey, network: Network) -> Address {
        Address::p2wpkh(public_key, network)
    }

    fn output_script(&self, public_key: &CompressedPublicKey) -> ScriptBuf {
        p2wpkh_script(public_key)
    }

    fn dummy_input(&self, outpoint: OutPoint, _public_key: &CompressedPublicKey) -> TxIn {
        TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: dummy_witness(),
        }
    }

    fn sign_input(
        &self,
        secp: &Secp256k1<All>,
        tx: &Transaction,
        index: usize,
        value: Amount,
        key: &DerivedKey,
    ) -> Result<TxIn, SigningError> {
        let witness = sign_p2wpkh(secp, tx, index, value, key)?;
        Ok(TxIn {
            previous_output: tx.input[index].previous_output,
            script_sig: ScriptBuf::new(),
            sequence: tx.input[index].sequence,
            witness,
        })
    }

    fn extract_public_key(&self, input: &TxIn) -> Option<CompressedPublicKey> {
        if !input.script_sig.is_empty() {
            return None;
        }
        parse_witness_pubkey(input)
    }
}

impl AddressScheme for P2shSegwit {
    fn address(&self, public_key: &CompressedPublicKey, network: Network) -> Address {
        Address::p2shwpkh(public_key, network)
    }

    fn output_script(&self, public_key: &CompressedPublicKey) -> ScriptBuf {
        ScriptBuf::new_p2sh(&p2wpkh_script(public_key).script_hash())
    }

    fn dummy_input(&self, outpoint: OutPoint, public_key: &CompressedPublicKey) -> TxIn {
        TxIn {
            previous_output: outpoint,
            script_sig: wrapped_script_sig(public_key),
            sequence: Sequence::MAX,
            witness: dummy_witness(),
        }
    }

    fn sign_input(
        &self,
        secp: &Secp256k1<All>,
        tx: &Transaction,
        index: usize,
        value: Amount,
        key: &DerivedKey,
    ) -> Result<TxIn, SigningError> {
        let witness = sign_p2wpkh(secp, tx, index, value, key)?;
        Ok(TxIn {
            previous_output: tx.input[index].previous_output,
            script_sig: wrapped_script_sig(&key.public_key),
            sequence: tx.input[index].sequence,
            witness,
        })
    }

    fn extract_public_key(&self, input: &TxIn) -> Option<CompressedPublicKey> {
        let public_key = parse_witness_pubkey(input)?;
        (input.script_sig == wrapped_script_sig(&public_key)).then_some(public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::keys::{KeyBranch, KeyChain, WalletType};

    fn test_key(wallet_type: WalletType) -> DerivedKey {
        let keychain = KeyChain::new(&[7u8; 64], Network::Regtest, wallet_type).unwrap();
        keychain
            .derive(wallet_type.scheme(), KeyBranch::Account, 0)
            .unwrap()
    }

    #[test]
    fn native_output_is_v0_witness_program() {
        let key = test_key(WalletType::NativeSegwit);
        assert!(key.script_pubkey.is_p2wpkh());
    }

    #[test]
    fn wrapped_output_is_p2sh() {
        let key = test_key(WalletType::P2shSegwit);
        assert!(key.script_pubkey.is_p2sh());
    }

    #[test]
    fn script_hash_hex_is_reversed() {
        let key = test_key(WalletType::NativeSegwit);
        let hex = script_hash_hex(&key.script_hash);
        let forward = key.script_hash.to_string();
        let reversed: String = hex::decode(&hex)
            .map(|mut b| {
                b.reverse();
                hex::encode(b)
            })
            .unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn dummy_inputs_do_not_leak_a_public_key() {
        for wallet_type in [WalletType::NativeSegwit, WalletType::P2shSegwit] {
            let scheme = wallet_type.scheme();
            let key = test_key(wallet_type);
            let input = scheme.dummy_input(OutPoint::null(), &key.public_key);
            // the dummy witness carries a zeroed pubkey which must not parse
            assert!(scheme.extract_public_key(&input).is_none());
        }
    }

    #[test]
    fn schemes_do_not_share_scripts() {
        let native = test_key(WalletType::NativeSegwit);
        let wrapped = test_key(WalletType::P2shSegwit);
        assert_ne!(native.script_pubkey, wrapped.script_pubkey);
        assert_ne!(native.script_hash, wrapped.script_hash);
    }
}
