//! The port between the engine's driver and whatever speaks the protocol.

use crate::engine::types::{ElectrumRequest, EngineEvent};

/// A connection to one Electrum server. Implementations queue freely; the
/// driver polls. `Disconnected`/`ServerReady` events mark connection
/// lifecycle transitions and must be delivered in order with everything else.
pub trait ElectrumConnection {
    /// Queues a request for the server.
    fn send(&mut self, request: ElectrumRequest);

    /// Next pending event, if any. Never blocks.
    fn poll_event(&mut self) -> Option<EngineEvent>;

    /// Drops the current connection. The connection must surface a
    /// `Disconnected` event as a result.
    fn disconnect(&mut self);
}
