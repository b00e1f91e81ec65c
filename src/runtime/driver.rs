//! The imperative shell around the engine.
//!
//! One thread, one loop: poll the connection for the next event, feed it to
//! the engine, execute the emitted actions in order, repeat. Commands from
//! the application go through the same object, so every state transition is
//! serialized.

use std::time::Duration;

use bitcoin::{Amount, FeeRate, ScriptBuf, SignedAmount, Transaction};

use crate::electrum::api::ElectrumConnection;
use crate::engine::types::{EngineAction, EngineEvent, WalletError};
use crate::engine::WalletEngine;
use crate::events::EventBus;

pub struct WalletDriver<C: ElectrumConnection, B: EventBus> {
    engine: WalletEngine,
    connection: C,
    bus: B,
}

impl<C: ElectrumConnection, B: EventBus> WalletDriver<C, B> {
    pub fn new(engine: WalletEngine, connection: C, bus: B) -> Self {
        Self {
            engine,
            connection,
            bus,
        }
    }

    pub fn run_forever(mut self) -> ! {
        log::info!("[DRIVER] starting");
        loop {
            match self.connection.poll_event() {
                Some(event) => self.process(event),
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    /// Feeds one event through the engine and executes the resulting actions
    /// before anything else is dequeued.
    pub fn process(&mut self, event: EngineEvent) {
        log::trace!("[DRIVER] event: {:?}", event);
        let actions = self.engine.handle_event(event);
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: EngineAction) {
        match action {
            EngineAction::Send(request) => {
                log::trace!("[DRIVER] send: {:?}", request);
                self.connection.send(request);
            }
            EngineAction::Publish(event) => self.bus.publish(event),
            EngineAction::Disconnect => {
                log::warn!("[DRIVER] engine requested a disconnect");
                self.connection.disconnect();
            }
        }
    }

    // ================================
    // Commands
    // ================================

    pub fn engine(&self) -> &WalletEngine {
        &self.engine
    }

    pub fn balance(&self) -> (SignedAmount, SignedAmount) {
        self.engine.balance()
    }

    pub fn receive_address(&self) -> bitcoin::Address {
        self.engine.receive_address()
    }

    pub fn complete_transaction(
        &mut self,
        tx: Transaction,
        fee_rate: FeeRate,
    ) -> Result<(Transaction, Amount), WalletError> {
        self.engine.complete_transaction(tx, fee_rate)
    }

    pub fn commit_transaction(&mut self, tx: &Transaction) {
        self.engine.commit_transaction(tx);
    }

    pub fn cancel_transaction(&mut self, tx: &Transaction) {
        self.engine.cancel_transaction(tx);
    }

    pub fn spend_all(
        &self,
        script: ScriptBuf,
        fee_rate: FeeRate,
    ) -> Result<(Transaction, Amount), WalletError> {
        self.engine.spend_all(script, fee_rate)
    }

    pub fn is_double_spent(&self, tx: &Transaction) -> bool {
        self.engine.is_double_spent(tx)
    }

    /// Hands the signed transaction to the server; fails unless RUNNING.
    pub fn broadcast_transaction(&mut self, tx: Transaction) -> Result<(), WalletError> {
        let action = self.engine.broadcast_transaction(tx)?;
        self.execute(action);
        Ok(())
    }

    /// Drains the connection's event queue. STRICTLY FOR TESTING.
    #[cfg(test)]
    pub fn run_until_idle(&mut self) {
        let mut sanity = 0;
        while let Some(event) = self.connection.poll_event() {
            self.process(event);
            sanity += 1;
            if sanity > 1000 {
                log::warn!("[DRIVER] run_until_idle exceeded 1000 iterations, breaking");
                break;
            }
        }
    }

    #[cfg(test)]
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}
