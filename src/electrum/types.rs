//! JSON-RPC wire codec for the protocol the server speaks.
//!
//! Transactions and headers travel consensus-encoded in hex, txids and
//! scripthashes in reversed hex, statuses as opaque strings (`null` for
//! never-used).

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, TxMerkleNode, Txid};
use serde_json::{json, Value};

use crate::domain::scheme::{script_hash_hex, ScriptHash};
use crate::engine::types::{ElectrumRequest, EngineEvent, HistoryItem, MerkleProof};

const HEADER_HEX_LEN: usize = 160;

impl ElectrumRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ElectrumRequest::HeaderSubscription => "blockchain.headers.subscribe",
            ElectrumRequest::ScriptHashSubscription(_) => "blockchain.scripthash.subscribe",
            ElectrumRequest::GetHeaders { .. } => "blockchain.block.headers",
            ElectrumRequest::GetScriptHashHistory(_) => "blockchain.scripthash.get_history",
            ElectrumRequest::GetTransaction(_) => "blockchain.transaction.get",
            ElectrumRequest::GetMerkle { .. } => "blockchain.transaction.get_merkle",
            ElectrumRequest::Broadcast(_) => "blockchain.transaction.broadcast",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            ElectrumRequest::HeaderSubscription => json!([]),
            ElectrumRequest::ScriptHashSubscription(script_hash) => {
                json!([script_hash_hex(script_hash)])
            }
            ElectrumRequest::GetHeaders { start, count } => json!([start, count]),
            ElectrumRequest::GetScriptHashHistory(script_hash) => {
                json!([script_hash_hex(script_hash)])
            }
            ElectrumRequest::GetTransaction(txid) => json!([txid.to_string()]),
            ElectrumRequest::GetMerkle { txid, height } => json!([txid.to_string(), height]),
            ElectrumRequest::Broadcast(tx) => json!([hex::encode(serialize(tx))]),
        }
    }

    pub fn to_json(&self, id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": self.method(),
            "params": self.params(),
        })
    }
}

pub fn script_hash_from_hex(raw: &str) -> Result<ScriptHash> {
    let mut bytes: [u8; 32] = hex::decode(raw)
        .context("scripthash is not hex")?
        .try_into()
        .map_err(|_| anyhow!("scripthash is not 32 bytes"))?;
    bytes.reverse();
    Ok(ScriptHash::from_byte_array(bytes))
}

pub fn header_from_hex(raw: &str) -> Result<Header> {
    let bytes = hex::decode(raw).context("header is not hex")?;
    deserialize(&bytes).context("header does not decode")
}

fn headers_from_concatenated_hex(raw: &str) -> Result<Vec<Header>> {
    if raw.len() % HEADER_HEX_LEN != 0 {
        bail!("headers hex length {} is not a multiple of 160", raw.len());
    }
    raw.as_bytes()
        .chunks(HEADER_HEX_LEN)
        .map(|chunk| header_from_hex(std::str::from_utf8(chunk)?))
        .collect()
}

fn history_items(result: &Value) -> Result<Vec<HistoryItem>> {
    result
        .as_array()
        .ok_or_else(|| anyhow!("history is not an array"))?
        .iter()
        .map(|entry| {
            let txid = Txid::from_str(
                entry["tx_hash"]
                    .as_str()
                    .ok_or_else(|| anyhow!("history entry without tx_hash"))?,
            )?;
            let height = entry["height"]
                .as_i64()
                .ok_or_else(|| anyhow!("history entry without height"))?;
            Ok(HistoryItem {
                txid,
                height: height as i32,
            })
        })
        .collect()
}

fn tip_event(value: &Value) -> Result<EngineEvent> {
    let height = value["height"]
        .as_u64()
        .ok_or_else(|| anyhow!("tip without height"))? as u32;
    let header = header_from_hex(
        value["hex"]
            .as_str()
            .ok_or_else(|| anyhow!("tip without header hex"))?,
    )?;
    Ok(EngineEvent::HeaderSubscription { height, header })
}

/// Maps a response payload back to the engine event it answers. `Broadcast`
/// acknowledgements produce no event.
pub fn parse_response(request: &ElectrumRequest, result: &Value) -> Result<Option<EngineEvent>> {
    let event = match request {
        ElectrumRequest::HeaderSubscription => Some(tip_event(result)?),
        ElectrumRequest::ScriptHashSubscription(script_hash) => {
            let status = match result {
                Value::Null => String::new(),
                Value::String(status) => status.clone(),
                other => bail!("unexpected status payload: {other}"),
            };
            Some(EngineEvent::ScriptHashSubscription {
                script_hash: *script_hash,
                status,
            })
        }
        ElectrumRequest::GetHeaders { start, .. } => {
            let raw = result["hex"]
                .as_str()
                .ok_or_else(|| anyhow!("headers response without hex"))?;
            Some(EngineEvent::Headers {
                start: *start,
                headers: headers_from_concatenated_hex(raw)?,
            })
        }
        ElectrumRequest::GetScriptHashHistory(script_hash) => {
            Some(EngineEvent::ScriptHashHistory {
                script_hash: *script_hash,
                items: history_items(result)?,
            })
        }
        ElectrumRequest::GetTransaction(_) => {
            let raw = result
                .as_str()
                .ok_or_else(|| anyhow!("transaction response is not hex"))?;
            let tx: Transaction = deserialize(&hex::decode(raw)?)?;
            Some(EngineEvent::Transaction(tx))
        }
        ElectrumRequest::GetMerkle { txid, .. } => {
            let merkle = result["merkle"]
                .as_array()
                .ok_or_else(|| anyhow!("merkle response without path"))?
                .iter()
                .map(|node| {
                    let raw = node.as_str().ok_or_else(|| anyhow!("merkle node not hex"))?;
                    Ok(TxMerkleNode::from_str(raw)?)
                })
                .collect::<Result<Vec<_>>>()?;
            let block_height = result["block_height"]
                .as_u64()
                .ok_or_else(|| anyhow!("merkle response without height"))? as u32;
            let pos = result["pos"]
                .as_u64()
                .ok_or_else(|| anyhow!("merkle response without pos"))? as usize;
            Some(EngineEvent::Merkle(MerkleProof {
                txid: *txid,
                merkle,
                block_height,
                pos,
            }))
        }
        ElectrumRequest::Broadcast(tx) => {
            log::info!("[ELECTRUM] broadcast accepted: {}", tx.compute_txid());
            None
        }
    };
    Ok(event)
}

/// Maps an unsolicited notification to an engine event.
pub fn parse_notification(method: &str, params: &Value) -> Result<Option<EngineEvent>> {
    match method {
        "blockchain.headers.subscribe" => {
            let tip = params
                .get(0)
                .ok_or_else(|| anyhow!("headers notification without payload"))?;
            Ok(Some(tip_event(tip)?))
        }
        "blockchain.scripthash.subscribe" => {
            let script_hash = script_hash_from_hex(
                params
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("status notification without scripthash"))?,
            )?;
            let status = match params.get(1) {
                Some(Value::String(status)) => status.clone(),
                _ => String::new(),
            };
            Ok(Some(EngineEvent::ScriptHashSubscription {
                script_hash,
                status,
            }))
        }
        other => {
            log::debug!("[ELECTRUM] ignoring notification {}", other);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256;

    fn sample_header_hex() -> String {
        // regtest-style header mined for this test vector
        let mut header = Header {
            version: bitcoin::block::Version::from_consensus(4),
            prev_blockhash: bitcoin::BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000,
            bits: bitcoin::CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        while header.validate_pow(header.target()).is_err() {
            header.nonce += 1;
        }
        hex::encode(serialize(&header))
    }

    #[test]
    fn requests_carry_their_method_and_params() {
        let script_hash = sha256::Hash::hash(b"spk");
        let request = ElectrumRequest::ScriptHashSubscription(script_hash);
        let encoded = request.to_json(7);
        assert_eq!(encoded["id"], 7);
        assert_eq!(encoded["method"], "blockchain.scripthash.subscribe");
        assert_eq!(
            encoded["params"][0].as_str().unwrap(),
            script_hash_hex(&script_hash)
        );

        let headers = ElectrumRequest::GetHeaders {
            start: 2016,
            count: 2016,
        };
        assert_eq!(headers.to_json(1)["params"], json!([2016, 2016]));
    }

    #[test]
    fn scripthash_hex_roundtrips_through_the_wire_form() {
        let script_hash = sha256::Hash::hash(b"spk");
        let wire = script_hash_hex(&script_hash);
        assert_eq!(script_hash_from_hex(&wire).unwrap(), script_hash);
    }

    #[test]
    fn parses_header_subscription_response() {
        let raw = sample_header_hex();
        let result = json!({ "height": 120, "hex": raw });
        let event = parse_response(&ElectrumRequest::HeaderSubscription, &result)
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::HeaderSubscription { height, header } => {
                assert_eq!(height, 120);
                assert_eq!(header.time, 1_600_000_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_headers_chunk() {
        let raw = format!("{}{}", sample_header_hex(), sample_header_hex());
        let result = json!({ "count": 2, "hex": raw, "max": 2016 });
        let event = parse_response(
            &ElectrumRequest::GetHeaders { start: 0, count: 2 },
            &result,
        )
        .unwrap()
        .unwrap();
        match event {
            EngineEvent::Headers { start, headers } => {
                assert_eq!(start, 0);
                assert_eq!(headers.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let odd = json!({ "hex": "aabb" });
        assert!(
            parse_response(&ElectrumRequest::GetHeaders { start: 0, count: 1 }, &odd).is_err()
        );
    }

    #[test]
    fn parses_history_and_null_status() {
        let script_hash = sha256::Hash::hash(b"spk");
        let result = json!([
            { "tx_hash": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b", "height": 57 },
            { "tx_hash": "2222222222222222222222222222222222222222222222222222222222222222", "height": -1 },
        ]);
        let event = parse_response(&ElectrumRequest::GetScriptHashHistory(script_hash), &result)
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::ScriptHashHistory { items, .. } => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].height, 57);
                assert_eq!(items[1].height, -1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let event = parse_response(
            &ElectrumRequest::ScriptHashSubscription(script_hash),
            &Value::Null,
        )
        .unwrap()
        .unwrap();
        match event {
            EngineEvent::ScriptHashSubscription { status, .. } => assert!(status.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_merkle_response() {
        let txid =
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        let result = json!({
            "merkle": ["2222222222222222222222222222222222222222222222222222222222222222"],
            "block_height": 450538,
            "pos": 1,
        });
        let event = parse_response(
            &ElectrumRequest::GetMerkle { txid, height: 450538 },
            &result,
        )
        .unwrap()
        .unwrap();
        match event {
            EngineEvent::Merkle(proof) => {
                assert_eq!(proof.txid, txid);
                assert_eq!(proof.block_height, 450538);
                assert_eq!(proof.pos, 1);
                assert_eq!(proof.merkle.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parses_status_notification() {
        let script_hash = sha256::Hash::hash(b"spk");
        let params = json!([script_hash_hex(&script_hash), "abcdef"]);
        let event = parse_notification("blockchain.scripthash.subscribe", &params)
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::ScriptHashSubscription {
                script_hash: sh,
                status,
            } => {
                assert_eq!(sh, script_hash);
                assert_eq!(status, "abcdef");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(parse_notification("server.peers", &json!([]))
            .unwrap()
            .is_none());
    }
}
