//! Scripted in-memory connection for driver and engine tests.

use std::collections::VecDeque;

use crate::electrum::api::ElectrumConnection;
use crate::engine::types::{ElectrumRequest, EngineEvent};

#[derive(Debug, Default)]
pub struct MockElectrumClient {
    /// Everything the wallet asked for, in order.
    pub requests: Vec<ElectrumRequest>,
    /// Events waiting to be polled.
    pub events: VecDeque<EngineEvent>,
    pub disconnects: usize,
}

impl MockElectrumClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: EngineEvent) {
        self.events.push_back(event);
    }

    pub fn requests_of<'a>(
        &'a self,
        filter: impl Fn(&ElectrumRequest) -> bool + 'a,
    ) -> impl Iterator<Item = &'a ElectrumRequest> {
        self.requests.iter().filter(move |request| filter(request))
    }
}

impl ElectrumConnection for MockElectrumClient {
    fn send(&mut self, request: ElectrumRequest) {
        self.requests.push(request);
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.events.push_back(EngineEvent::Disconnected);
    }
}
