use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bitcoin::{Amount, Network};
use clap::{Parser, ValueEnum};

use electrum_spv_wallet::electrum::ElectrumClient;
use electrum_spv_wallet::events::LogBus;
use electrum_spv_wallet::{
    CheckPoint, FileStore, WalletDriver, WalletEngine, WalletParameters, WalletType,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AddressKind {
    /// BIP49, P2SH-wrapped segwit
    P2shSegwit,
    /// BIP84, native segwit
    NativeSegwit,
}

impl From<AddressKind> for WalletType {
    fn from(kind: AddressKind) -> Self {
        match kind {
            AddressKind::P2shSegwit => WalletType::P2shSegwit,
            AddressKind::NativeSegwit => WalletType::NativeSegwit,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "testnet")]
    network: Network,

    /// BIP39-style seed, hex encoded
    #[arg(long)]
    seed: String,

    #[arg(long, value_enum, default_value_t = AddressKind::NativeSegwit)]
    wallet_type: AddressKind,

    #[arg(long, default_value = "ssl://electrum.blockstream.info:60002")]
    electrum_url: String,

    #[arg(long, default_value = "wallet_db")]
    db_dir: PathBuf,

    /// Optional checkpoint file (JSON list of [block_hash, bits] pairs)
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    gap_limit: u32,

    #[arg(long, default_value_t = 546)]
    dust_limit: u64,

    #[arg(long, default_value_t = 2000)]
    minimum_fee: u64,

    /// Refuse to select unconfirmed coins when building transactions
    #[arg(long)]
    confirmed_only: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let seed = hex::decode(&args.seed).context("--seed must be hex")?;
    let mut params = WalletParameters::new(args.network, args.wallet_type.into());
    params.gap_limit = args.gap_limit;
    params.dust_limit = Amount::from_sat(args.dust_limit);
    params.minimum_fee = Amount::from_sat(args.minimum_fee);
    params.allow_spend_unconfirmed = !args.confirmed_only;

    let checkpoints = match &args.checkpoints {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            CheckPoint::from_json(&raw)?
        }
        None => CheckPoint::for_network(args.network),
    };

    let db = Arc::new(FileStore::new(&args.db_dir)?);
    let engine = WalletEngine::new(&seed, params, checkpoints, db)?;
    log::info!(
        "[MAIN] wallet root {} on {}, receive address {}",
        engine.root_xpub(),
        args.network,
        engine.receive_address()
    );

    let client = ElectrumClient::new(args.electrum_url);
    let driver = WalletDriver::new(engine, client, LogBus);
    driver.run_forever()
}
