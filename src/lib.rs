//! SPV Bitcoin wallet core driven by an Electrum status-subscription stream.
//!
//! The crate is split the same way the runtime behaves:
//! - `engine` is a PURE state machine: it consumes server events and emits
//!   actions (requests to send, events to publish). No network, no async.
//! - `chain` holds the checkpoint-anchored header tree with fork tracking.
//! - `domain` holds keys, the address-scheme strategy, the UTXO view and the
//!   transaction builder.
//! - `electrum` is the protocol port: a typed request/event interface, the
//!   async client adapter behind it, and a scripted mock for tests.
//! - `persist` is the snapshot codec plus the header store.
//! - `runtime` is the imperative shell that wires all of the above together.

pub mod chain;
pub mod domain;
pub mod electrum;
pub mod engine;
pub mod events;
pub mod persist;
pub mod runtime;

pub use chain::{Blockchain, CheckPoint, RETARGETING_PERIOD};
pub use domain::{AddressScheme, KeyBranch, WalletParameters, WalletType};
pub use engine::{EngineAction, EngineEvent, WalletEngine, WalletError};
pub use events::{EventBus, WalletEvent};
pub use persist::{FileStore, MemoryStore, Snapshot, WalletDb};
pub use runtime::WalletDriver;
