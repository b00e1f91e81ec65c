//! BIP32 key hierarchy for the two wallet types.
//!
//! P2SH-SegWit wallets derive from `m/49'/coin'/0'`, native SegWit wallets
//! from `m/84'/coin'/0'`; the account branch is `root/0`, the change branch
//! `root/1`. Keys on each branch form a contiguous index prefix `[0..N)`.

use bitcoin::bip32::{self, ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{CompressedPublicKey, Network, ScriptBuf};

use super::scheme::{script_hash_of, AddressScheme, NativeSegwit, P2shSegwit, ScriptHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletType {
    P2shSegwit,
    NativeSegwit,
}

impl WalletType {
    fn purpose(self) -> u32 {
        match self {
            WalletType::P2shSegwit => 49,
            WalletType::NativeSegwit => 84,
        }
    }

    pub fn scheme(self) -> &'static dyn AddressScheme {
        match self {
            WalletType::P2shSegwit => &P2shSegwit,
            WalletType::NativeSegwit => &NativeSegwit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyBranch {
    Account,
    Change,
}

/// A derived key with everything the wallet repeatedly needs precomputed.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub branch: KeyBranch,
    pub index: u32,
    pub xpriv: Xpriv,
    pub public_key: CompressedPublicKey,
    pub script_pubkey: ScriptBuf,
    pub script_hash: ScriptHash,
}

#[derive(Debug)]
pub struct KeyChain {
    secp: Secp256k1<All>,
    network: Network,
    /// `m/purpose'/coin'/0'`
    root: Xpriv,
    account_root: Xpriv,
    change_root: Xpriv,
}

impl KeyChain {
    pub fn new(seed: &[u8], network: Network, wallet_type: WalletType) -> Result<Self, bip32::Error> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)?;
        let coin = if network == Network::Bitcoin { 0 } else { 1 };
        let root = master.derive_priv(
            &secp,
            &[
                ChildNumber::from_hardened_idx(wallet_type.purpose())?,
                ChildNumber::from_hardened_idx(coin)?,
                ChildNumber::from_hardened_idx(0)?,
            ],
        )?;
        let account_root = root.derive_priv(&secp, &[ChildNumber::from_normal_idx(0)?])?;
        let change_root = root.derive_priv(&secp, &[ChildNumber::from_normal_idx(1)?])?;
        Ok(Self {
            secp,
            network,
            root,
            account_root,
            change_root,
        })
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Extended public key of the wallet root (`m/purpose'/coin'/0'`).
    pub fn root_xpub(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.root)
    }

    pub fn derive(
        &self,
        scheme: &dyn AddressScheme,
        branch: KeyBranch,
        index: u32,
    ) -> Result<DerivedKey, bip32::Error> {
        let parent = match branch {
            KeyBranch::Account => &self.account_root,
            KeyBranch::Change => &self.change_root,
        };
        let xpriv = parent.derive_priv(&self.secp, &[ChildNumber::from_normal_idx(index)?])?;
        let public_key = CompressedPublicKey(xpriv.private_key.public_key(&self.secp));
        let script_pubkey = scheme.output_script(&public_key);
        let script_hash = script_hash_of(&script_pubkey);
        Ok(DerivedKey {
            branch,
            index,
            xpriv,
            public_key,
            script_pubkey,
            script_hash,
        })
    }
}
