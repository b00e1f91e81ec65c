pub mod builder;
pub mod keys;
pub mod scheme;
pub mod utxo;

pub use keys::{DerivedKey, KeyBranch, KeyChain, WalletType};
pub use scheme::{script_hash_hex, script_hash_of, AddressScheme, ScriptHash};
pub use utxo::{TransactionDelta, Utxo};

use bitcoin::{Amount, Network};

/// Wallet-wide configuration. Only `network` and `wallet_type` have no
/// sensible defaults.
#[derive(Debug, Clone, Copy)]
pub struct WalletParameters {
    pub network: Network,
    pub wallet_type: WalletType,
    pub gap_limit: u32,
    pub dust_limit: Amount,
    pub minimum_fee: Amount,
    pub allow_spend_unconfirmed: bool,
}

impl WalletParameters {
    pub fn new(network: Network, wallet_type: WalletType) -> Self {
        Self {
            network,
            wallet_type,
            gap_limit: 10,
            dust_limit: Amount::from_sat(546),
            minimum_fee: Amount::from_sat(2000),
            allow_spend_unconfirmed: true,
        }
    }
}
