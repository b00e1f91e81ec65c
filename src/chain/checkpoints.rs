//! Static header anchors.
//!
//! A checkpoint pins the block hash at height `(i + 1) * 2016 - 1` together
//! with the difficulty bits of the retargeting window that starts right above
//! it, so the first in-memory window can be verified without its predecessor.
//!
//! Checkpoint lists are plain JSON, one `[block_hash_hex, bits]` pair per
//! entry, ordered by height. Regtest never has checkpoints.

use std::str::FromStr;

use bitcoin::{BlockHash, CompactTarget, Network};

use super::headers::ChainError;

/// Number of blocks between difficulty adjustments.
pub const RETARGETING_PERIOD: u32 = 2016;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPoint {
    /// Hash of the block at this checkpoint's height.
    pub hash: BlockHash,
    /// Difficulty bits of the window starting right above this checkpoint.
    pub next_bits: CompactTarget,
}

impl CheckPoint {
    /// Built-in anchors for the given chain.
    ///
    /// Regtest has none by design; the other chains default to none as well
    /// and sync from genesis unless a checkpoint file is supplied at startup.
    pub fn for_network(_network: Network) -> Vec<CheckPoint> {
        Vec::new()
    }

    /// Parses a checkpoint file: `[["<block hash hex>", <bits>], ...]`.
    pub fn from_json(raw: &str) -> Result<Vec<CheckPoint>, ChainError> {
        let entries: Vec<(String, u32)> = serde_json::from_str(raw)
            .map_err(|e| ChainError::InvalidCheckpoints(e.to_string()))?;
        entries
            .into_iter()
            .map(|(hash, bits)| {
                let hash = BlockHash::from_str(&hash)
                    .map_err(|e| ChainError::InvalidCheckpoints(e.to_string()))?;
                Ok(CheckPoint {
                    hash,
                    next_bits: CompactTarget::from_consensus(bits),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkpoint_file() {
        let raw = r#"[
            ["00000000000000000000943de85f4495f053ff55f27d135edc61c27990c2eec5", 386604799],
            ["000000000000000000000b9b4b1e7b3e9e3be4b1c4d3f1e88ff1b06a2e8e3a3d", 386604799]
        ]"#;
        let checkpoints = CheckPoint::from_json(raw).unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(
            checkpoints[0].next_bits,
            CompactTarget::from_consensus(386604799)
        );
    }

    #[test]
    fn rejects_malformed_checkpoint_file() {
        assert!(CheckPoint::from_json("[[\"nothex\", 1]]").is_err());
        assert!(CheckPoint::from_json("{\"not\": \"a list\"}").is_err());
    }

    #[test]
    fn regtest_has_no_checkpoints() {
        assert!(CheckPoint::for_network(Network::Regtest).is_empty());
    }
}
