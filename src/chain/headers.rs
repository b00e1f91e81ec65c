//! Fork-tracking view of the headers above the highest checkpoint.
//!
//! Every header links to a parent already in the view (or anchors on the
//! topmost checkpoint / genesis), difficulty is verified on the way in, and
//! the best chain is the branch with the most accumulated work. Headers that
//! fall one full retargeting period behind the tip are pruned and handed back
//! to the caller for persistence.

use std::collections::HashMap;

use bitcoin::block::Header;
use bitcoin::consensus::params::Params;
use bitcoin::pow::{CompactTarget, Work};
use bitcoin::{BlockHash, Network};
use thiserror::Error;

use super::checkpoints::{CheckPoint, RETARGETING_PERIOD};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("header at height {0} has no known parent")]
    MissingParent(u32),
    #[error("header at height {height} has bits {got:#x}, expected {expected:#x}")]
    InvalidDifficulty { height: u32, got: u32, expected: u32 },
    #[error("header at height {0} does not meet its proof-of-work target")]
    InvalidProofOfWork(u32),
    #[error("headers are not contiguous at height {0}")]
    NotContiguous(u32),
    #[error("chunk at height {0} does not match its checkpoint")]
    CheckpointMismatch(u32),
    #[error("chunk start {0} is not aligned to the retargeting period")]
    MisalignedChunk(u32),
    #[error("invalid checkpoint file: {0}")]
    InvalidCheckpoints(String),
}

/// Read access to headers that have been pruned from the in-memory view.
pub trait HeaderReader {
    fn header_at(&self, height: u32) -> Option<Header>;
}

/// A header plus its height and the work accumulated from the view's anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedHeader {
    pub header: Header,
    pub height: u32,
    pub chainwork: Work,
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    network: Network,
    checkpoints: Vec<CheckPoint>,
    /// Every header above the highest checkpoint, forks included.
    headers: HashMap<BlockHash, IndexedHeader>,
    /// The heaviest branch, ordered and contiguous by height.
    best_chain: Vec<IndexedHeader>,
}

impl Blockchain {
    pub fn new(network: Network, checkpoints: Vec<CheckPoint>) -> Self {
        Self {
            network,
            checkpoints,
            headers: HashMap::new(),
            best_chain: Vec::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn checkpoints(&self) -> &[CheckPoint] {
        &self.checkpoints
    }

    /// Height of the topmost checkpoint, if there is one.
    pub fn checkpoint_height(&self) -> Option<u32> {
        (!self.checkpoints.is_empty())
            .then(|| self.checkpoints.len() as u32 * RETARGETING_PERIOD - 1)
    }

    pub fn tip(&self) -> Option<&IndexedHeader> {
        self.best_chain.last()
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    /// Best-chain header at `height`, if the view still holds it.
    pub fn get_header(&self, height: u32) -> Option<Header> {
        let first = self.best_chain.first()?.height;
        if height < first {
            return None;
        }
        self.best_chain
            .get((height - first) as usize)
            .map(|indexed| indexed.header)
    }

    /// Difficulty bits a header at `height` must carry, when they can be
    /// determined: on retarget boundaries the prior window is looked up in the
    /// view, the header store, or the topmost checkpoint; elsewhere the parent
    /// sets them. Regtest skips difficulty entirely.
    pub fn expected_bits<R: HeaderReader + ?Sized>(
        &self,
        height: u32,
        db: &R,
    ) -> Option<CompactTarget> {
        if self.network == Network::Regtest {
            return None;
        }
        if height % RETARGETING_PERIOD == 0 {
            if height == 0 {
                return None;
            }
            if let (Some(last), Some(first)) = (
                self.header_at_or_db(height - 1, db),
                self.header_at_or_db(height - RETARGETING_PERIOD, db),
            ) {
                return Some(next_window_bits(&first, &last, self.network));
            }
            // the window below lives under the checkpoint; its target is recorded there
            if self.checkpoint_height() == Some(height - 1) {
                return self.checkpoints.last().map(|cp| cp.next_bits);
            }
            None
        } else {
            self.header_at_or_db(height - 1, db).map(|h| h.bits)
        }
    }

    fn header_at_or_db<R: HeaderReader + ?Sized>(&self, height: u32, db: &R) -> Option<Header> {
        self.get_header(height).or_else(|| db.header_at(height))
    }

    /// Appends `header` at `height`, creating or extending a fork when its
    /// parent is not the tip. Fails on unknown parents, wrong difficulty or
    /// insufficient proof of work.
    pub fn add_header<R: HeaderReader + ?Sized>(
        &mut self,
        height: u32,
        header: Header,
        db: &R,
    ) -> Result<(), ChainError> {
        if header.validate_pow(header.target()).is_err() {
            return Err(ChainError::InvalidProofOfWork(height));
        }
        match self.headers.get(&header.prev_blockhash).copied() {
            Some(parent) if parent.height + 1 == height => {
                self.check_bits(height, &header, Some(&parent), db)?;
                let indexed = IndexedHeader {
                    header,
                    height,
                    chainwork: parent.chainwork + header.work(),
                };
                self.headers.insert(header.block_hash(), indexed);
                match self.tip().copied() {
                    Some(tip) if tip.header.block_hash() == parent.header.block_hash() => {
                        self.best_chain.push(indexed);
                    }
                    Some(tip) if indexed.chainwork > tip.chainwork => {
                        log::info!(
                            "[CHAIN] fork at {} is now the best chain ({} -> {})",
                            height,
                            tip.height,
                            height
                        );
                        self.rebuild_best_chain(indexed);
                    }
                    _ => {
                        log::debug!("[CHAIN] header at {} extends a fork", height);
                    }
                }
                Ok(())
            }
            Some(_) => Err(ChainError::NotContiguous(height)),
            None if self.best_chain.is_empty() && self.is_anchor(height, &header) => {
                self.check_bits(height, &header, None, db)?;
                let indexed = IndexedHeader {
                    header,
                    height,
                    chainwork: header.work(),
                };
                self.headers.insert(header.block_hash(), indexed);
                self.best_chain.push(indexed);
                Ok(())
            }
            None => Err(ChainError::MissingParent(height)),
        }
    }

    /// Contiguous batch variant of [`add_header`](Self::add_header).
    pub fn add_headers<R: HeaderReader + ?Sized>(
        &mut self,
        start: u32,
        headers: &[Header],
        db: &R,
    ) -> Result<(), ChainError> {
        for (offset, header) in headers.iter().enumerate() {
            self.add_header(start + offset as u32, *header, db)?;
        }
        Ok(())
    }

    /// Validates a chunk that sits at or below the highest checkpoint: start
    /// must be period-aligned, internal links consistent, and the hash at the
    /// chunk's checkpoint height must match the stored checkpoint. The chunk
    /// is not added to the in-memory view; the caller persists it.
    pub fn validate_chunk(&self, start: u32, headers: &[Header]) -> Result<(), ChainError> {
        if start % RETARGETING_PERIOD != 0 {
            return Err(ChainError::MisalignedChunk(start));
        }
        for (offset, pair) in headers.windows(2).enumerate() {
            if pair[1].prev_blockhash != pair[0].block_hash() {
                return Err(ChainError::NotContiguous(start + offset as u32 + 1));
            }
        }
        let index = (start / RETARGETING_PERIOD) as usize;
        if let Some(checkpoint) = self.checkpoints.get(index) {
            let matches = headers.len() == RETARGETING_PERIOD as usize
                && headers.last().map(|h| h.block_hash()) == Some(checkpoint.hash);
            if !matches {
                return Err(ChainError::CheckpointMismatch(start));
            }
        }
        Ok(())
    }

    /// Prunes everything more than one retargeting period behind the tip.
    /// Returns the pruned best-chain headers, oldest first, always in whole
    /// 2016-header groups so they can be persisted as chunks before they
    /// leave memory.
    pub fn optimize(&mut self) -> Vec<IndexedHeader> {
        let mut pruned = Vec::new();
        while self.best_chain.len() >= 2 * RETARGETING_PERIOD as usize {
            let rest = self.best_chain.split_off(RETARGETING_PERIOD as usize);
            let old = std::mem::replace(&mut self.best_chain, rest);
            let cutoff = self.best_chain[0].height;
            self.headers.retain(|_, indexed| indexed.height >= cutoff);
            log::debug!(
                "[CHAIN] pruned {} headers below {}",
                old.len(),
                cutoff
            );
            pruned.extend(old);
        }
        pruned
    }

    fn is_anchor(&self, height: u32, header: &Header) -> bool {
        match self.checkpoint_height() {
            Some(cp_height) => {
                height == cp_height + 1
                    && self
                        .checkpoints
                        .last()
                        .map(|cp| header.prev_blockhash == cp.hash)
                        .unwrap_or(false)
            }
            None => height == 0,
        }
    }

    fn check_bits<R: HeaderReader + ?Sized>(
        &self,
        height: u32,
        header: &Header,
        parent: Option<&IndexedHeader>,
        db: &R,
    ) -> Result<(), ChainError> {
        if self.network == Network::Regtest {
            return Ok(());
        }
        let expected = if height % RETARGETING_PERIOD == 0 {
            self.expected_bits(height, db)
        } else {
            // the parent may sit on a fork, so prefer it over a height lookup
            parent
                .map(|p| p.header.bits)
                .or_else(|| self.expected_bits(height, db))
        };
        match expected {
            Some(expected) if expected != header.bits => Err(ChainError::InvalidDifficulty {
                height,
                got: header.bits.to_consensus(),
                expected: expected.to_consensus(),
            }),
            _ => Ok(()),
        }
    }

    /// Makes `tip` the end of the best chain, walking its branch back to the
    /// point where it attaches to the current best chain.
    fn rebuild_best_chain(&mut self, tip: IndexedHeader) {
        let mut branch = vec![tip];
        loop {
            let prev = branch.last().expect("branch starts non-empty").header.prev_blockhash;
            match self.headers.get(&prev) {
                Some(parent) if !self.on_best_chain(parent) => branch.push(*parent),
                _ => break,
            }
        }
        branch.reverse();
        let first = self.best_chain.first().map(|i| i.height).unwrap_or(0);
        let keep = branch[0].height.saturating_sub(first) as usize;
        self.best_chain.truncate(keep);
        self.best_chain.extend(branch);
    }

    fn on_best_chain(&self, indexed: &IndexedHeader) -> bool {
        self.get_header(indexed.height)
            .map(|h| h.block_hash() == indexed.header.block_hash())
            .unwrap_or(false)
    }
}

/// Difficulty bits for the window following the one delimited by `first` and
/// `last` (the first and last headers of a full retargeting window).
pub fn next_window_bits(first: &Header, last: &Header, network: Network) -> CompactTarget {
    let timespan = last.time.saturating_sub(first.time) as u64;
    CompactTarget::from_next_work_required(last.bits, timespan, Params::new(network))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::pow::Target;
    use bitcoin::TxMerkleNode;

    const REGTEST_BITS: u32 = 0x207fffff;

    struct NoDb;
    impl HeaderReader for NoDb {
        fn header_at(&self, _height: u32) -> Option<Header> {
            None
        }
    }

    fn mine_header(prev: BlockHash, time: u32) -> Header {
        let mut header = Header {
            version: Version::from_consensus(4),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(REGTEST_BITS),
            nonce: 0,
        };
        while header.validate_pow(header.target()).is_err() {
            header.nonce += 1;
        }
        header
    }

    fn mine_chain(len: usize) -> Vec<Header> {
        let mut headers = Vec::with_capacity(len);
        let mut prev = BlockHash::all_zeros();
        for i in 0..len {
            let header = mine_header(prev, 1_600_000_000 + i as u32 * 600);
            prev = header.block_hash();
            headers.push(header);
        }
        headers
    }

    fn regtest_chain(len: usize) -> (Blockchain, Vec<Header>) {
        let mut chain = Blockchain::new(Network::Regtest, Vec::new());
        let headers = mine_chain(len);
        chain.add_headers(0, &headers, &NoDb).unwrap();
        (chain, headers)
    }

    #[test]
    fn appends_contiguous_headers() {
        let (chain, headers) = regtest_chain(5);
        assert_eq!(chain.tip_height(), Some(4));
        assert_eq!(chain.get_header(2), Some(headers[2]));
        assert_eq!(chain.get_header(5), None);
    }

    #[test]
    fn rejects_orphan_header() {
        let (mut chain, _) = regtest_chain(3);
        let unknown_parent = mine_header(BlockHash::all_zeros(), 42).block_hash();
        let orphan = mine_header(unknown_parent, 43);
        assert!(matches!(
            chain.add_header(7, orphan, &NoDb),
            Err(ChainError::MissingParent(7))
        ));
    }

    #[test]
    fn rejects_non_contiguous_height() {
        let (mut chain, headers) = regtest_chain(3);
        let child = mine_header(headers[2].block_hash(), 99);
        assert!(matches!(
            chain.add_header(9, child, &NoDb),
            Err(ChainError::NotContiguous(9))
        ));
    }

    #[test]
    fn heavier_fork_becomes_best_chain() {
        let (mut chain, headers) = regtest_chain(4);
        let tip_before = chain.tip().unwrap().header;

        // one-block fork at the same height does not win (equal work)
        let rival = mine_header(headers[2].block_hash(), 7_777);
        chain.add_header(3, rival, &NoDb).unwrap();
        assert_eq!(chain.tip().unwrap().header, tip_before);

        // a longer fork accumulates more work and takes over
        let rival_child = mine_header(rival.block_hash(), 7_778);
        chain.add_header(4, rival_child, &NoDb).unwrap();
        assert_eq!(chain.tip().unwrap().header, rival_child);
        assert_eq!(chain.get_header(3), Some(rival));
    }

    #[test]
    fn optimize_prunes_in_whole_periods() {
        let len = 2 * RETARGETING_PERIOD as usize + 10;
        let (mut chain, headers) = regtest_chain(len);

        let pruned = chain.optimize();
        assert_eq!(pruned.len(), RETARGETING_PERIOD as usize);
        assert_eq!(pruned[0].height, 0);
        assert_eq!(pruned[0].header, headers[0]);

        // the pruned range is gone from the view, the rest is intact
        assert_eq!(chain.get_header(100), None);
        assert_eq!(
            chain.get_header(RETARGETING_PERIOD),
            Some(headers[RETARGETING_PERIOD as usize])
        );
        assert_eq!(chain.tip_height(), Some(len as u32 - 1));

        // a second pass has nothing left to prune
        assert!(chain.optimize().is_empty());
    }

    #[test]
    fn anchors_on_checkpoint() {
        let below = mine_chain(RETARGETING_PERIOD as usize);
        let checkpoint = CheckPoint {
            hash: below.last().unwrap().block_hash(),
            next_bits: CompactTarget::from_consensus(REGTEST_BITS),
        };
        let mut chain = Blockchain::new(Network::Regtest, vec![checkpoint]);
        assert_eq!(chain.checkpoint_height(), Some(RETARGETING_PERIOD - 1));

        let above = mine_header(checkpoint.hash, 123);
        chain.add_header(RETARGETING_PERIOD, above, &NoDb).unwrap();
        assert_eq!(chain.tip_height(), Some(RETARGETING_PERIOD));

        let mut other = Blockchain::new(Network::Regtest, vec![checkpoint]);
        let unrelated = mine_header(BlockHash::all_zeros(), 124);
        assert!(other
            .add_header(RETARGETING_PERIOD, unrelated, &NoDb)
            .is_err());
    }

    #[test]
    fn validates_chunk_against_checkpoint() {
        let below = mine_chain(RETARGETING_PERIOD as usize);
        let checkpoint = CheckPoint {
            hash: below.last().unwrap().block_hash(),
            next_bits: CompactTarget::from_consensus(REGTEST_BITS),
        };
        let chain = Blockchain::new(Network::Regtest, vec![checkpoint]);

        assert!(chain.validate_chunk(0, &below).is_ok());
        assert!(matches!(
            chain.validate_chunk(1, &below),
            Err(ChainError::MisalignedChunk(1))
        ));

        // swapping two headers breaks the internal links
        let mut broken = below.clone();
        broken.swap(5, 6);
        assert!(matches!(
            chain.validate_chunk(0, &broken),
            Err(ChainError::NotContiguous(_))
        ));

        // a chunk ending on the wrong hash contradicts the checkpoint
        let mut wrong = below;
        wrong.pop();
        wrong.push(mine_header(wrong.last().unwrap().block_hash(), 9_999));
        assert!(matches!(
            chain.validate_chunk(0, &wrong),
            Err(ChainError::CheckpointMismatch(0))
        ));
    }

    #[test]
    fn retarget_keeps_bits_on_nominal_timespan() {
        let first = Header {
            version: Version::from_consensus(4),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_000_000_000,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 0,
        };
        let mut last = first;
        // exactly two weeks between the window's first and last header
        last.time = first.time + 14 * 24 * 60 * 60;
        let next = next_window_bits(&first, &last, Network::Bitcoin);
        assert_eq!(next.to_consensus(), 0x1d00ffff);
    }

    #[test]
    fn retarget_tightens_target_on_fast_window() {
        let first = Header {
            version: Version::from_consensus(4),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_000_000_000,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 0,
        };
        let mut last = first;
        last.time = first.time + 7 * 24 * 60 * 60;
        let next = next_window_bits(&first, &last, Network::Bitcoin);
        assert!(Target::from_compact(next) < Target::from_compact(first.bits));
    }

    #[test]
    fn regtest_skips_difficulty_checks() {
        let (chain, _) = regtest_chain(3);
        assert_eq!(chain.expected_bits(3, &NoDb), None);
    }
}
