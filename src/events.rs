//! Events the wallet publishes towards the application.

use bitcoin::{Address, Amount, SignedAmount, Transaction, Txid};

/// Snapshot of the wallet once it is fully synchronized. Published whenever
/// its content changes while the wallet is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletReady {
    pub confirmed: SignedAmount,
    pub unconfirmed: SignedAmount,
    pub height: u32,
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    Ready(WalletReady),
    TransactionReceived {
        tx: Transaction,
        depth: u32,
        received: Amount,
        sent: Amount,
        /// Only known when every input of the transaction is ours.
        fee: Option<Amount>,
        timestamp: Option<u32>,
    },
    TransactionConfidenceChanged {
        txid: Txid,
        depth: u32,
        timestamp: Option<u32>,
    },
    NewReceiveAddress(Address),
}

pub trait EventBus: Send {
    fn publish(&mut self, event: WalletEvent);
}

/// Logs every event; the default bus for the CLI.
#[derive(Debug, Default)]
pub struct LogBus;

impl EventBus for LogBus {
    fn publish(&mut self, event: WalletEvent) {
        log::info!("[EVENT] {:?}", event);
    }
}

/// Forwards events over an mpsc channel to whoever wants them.
#[derive(Debug)]
pub struct ChannelBus(pub std::sync::mpsc::Sender<WalletEvent>);

impl EventBus for ChannelBus {
    fn publish(&mut self, event: WalletEvent) {
        if self.0.send(event).is_err() {
            log::warn!("[EVENT] receiver is gone, dropping event");
        }
    }
}
