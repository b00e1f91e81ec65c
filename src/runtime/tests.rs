use std::sync::mpsc;
use std::sync::Arc;

use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, Network, TxMerkleNode};

use crate::domain::keys::WalletType;
use crate::domain::WalletParameters;
use crate::electrum::mock_client::MockElectrumClient;
use crate::engine::state::State;
use crate::engine::types::{ElectrumRequest, EngineEvent};
use crate::engine::WalletEngine;
use crate::events::{ChannelBus, WalletEvent};
use crate::persist::MemoryStore;
use crate::runtime::WalletDriver;

fn mine_chain(len: usize) -> Vec<Header> {
    let mut headers = Vec::with_capacity(len);
    let mut prev = BlockHash::all_zeros();
    for height in 0..len as u32 {
        let mut header = Header {
            version: BlockVersion::from_consensus(4),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000 + height * 600,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        while header.validate_pow(header.target()).is_err() {
            header.nonce += 1;
        }
        prev = header.block_hash();
        headers.push(header);
    }
    headers
}

fn driver() -> (
    WalletDriver<MockElectrumClient, ChannelBus>,
    mpsc::Receiver<WalletEvent>,
) {
    let params = WalletParameters::new(Network::Regtest, WalletType::NativeSegwit);
    let db = Arc::new(MemoryStore::new());
    let engine = WalletEngine::new(&[11u8; 64], params, Vec::new(), db).unwrap();
    let (sender, receiver) = mpsc::channel();
    (
        WalletDriver::new(engine, MockElectrumClient::new(), ChannelBus(sender)),
        receiver,
    )
}

#[test]
fn driver_walks_the_engine_to_running() {
    let (mut driver, events) = driver();
    let chain = mine_chain(3);

    driver.connection_mut().push_event(EngineEvent::ServerReady);
    driver.run_until_idle();
    assert!(driver
        .connection_mut()
        .requests
        .contains(&ElectrumRequest::HeaderSubscription));

    driver.connection_mut().push_event(EngineEvent::HeaderSubscription {
        height: 2,
        header: chain[2],
    });
    driver.run_until_idle();

    driver.connection_mut().push_event(EngineEvent::Headers {
        start: 0,
        headers: chain.clone(),
    });
    driver.connection_mut().push_event(EngineEvent::Headers {
        start: 3,
        headers: Vec::new(),
    });
    driver.run_until_idle();
    assert_eq!(driver.engine().state(), State::Running);

    // answer every subscription with "never used"
    let subscriptions: Vec<_> = driver
        .connection_mut()
        .requests_of(|request| matches!(request, ElectrumRequest::ScriptHashSubscription(_)))
        .cloned()
        .collect();
    assert_eq!(subscriptions.len(), 20);
    for request in subscriptions {
        let ElectrumRequest::ScriptHashSubscription(script_hash) = request else {
            unreachable!()
        };
        driver
            .connection_mut()
            .push_event(EngineEvent::ScriptHashSubscription {
                script_hash,
                status: String::new(),
            });
    }
    driver.run_until_idle();

    // the bus saw exactly one ready and one address, in that order
    let published: Vec<WalletEvent> = events.try_iter().collect();
    let ready_count = published
        .iter()
        .filter(|event| matches!(event, WalletEvent::Ready(_)))
        .count();
    assert_eq!(ready_count, 1);
    assert!(matches!(
        published.last(),
        Some(WalletEvent::NewReceiveAddress(_))
    ));
    assert!(driver.engine().is_ready());
}

#[test]
fn engine_disconnect_reaches_the_connection() {
    let (mut driver, _events) = driver();
    let chain = mine_chain(3);

    driver.connection_mut().push_event(EngineEvent::ServerReady);
    driver.run_until_idle();

    // a server tip behind our local chain forces a disconnect; give the
    // wallet a local chain first
    driver.connection_mut().push_event(EngineEvent::HeaderSubscription {
        height: 2,
        header: chain[2],
    });
    driver.connection_mut().push_event(EngineEvent::Headers {
        start: 0,
        headers: chain.clone(),
    });
    driver.connection_mut().push_event(EngineEvent::Headers {
        start: 3,
        headers: Vec::new(),
    });
    driver.run_until_idle();

    driver.connection_mut().push_event(EngineEvent::Disconnected);
    driver.connection_mut().push_event(EngineEvent::ServerReady);
    driver.connection_mut().push_event(EngineEvent::HeaderSubscription {
        height: 0,
        header: chain[0],
    });
    driver.run_until_idle();

    // the mock answers a disconnect with a Disconnected event, which the
    // driver feeds back into the engine
    assert_eq!(driver.connection_mut().disconnects, 1);
    assert_eq!(driver.engine().state(), State::Disconnected);
}

#[test]
fn broadcast_outside_running_fails_without_touching_the_wire() {
    let (mut driver, _events) = driver();
    let tx = bitcoin::Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![],
    };
    assert!(driver.broadcast_transaction(tx).is_err());
    assert!(driver.connection_mut().requests.is_empty());
}
