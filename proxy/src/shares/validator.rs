/// Share Validator - proof-of-work classification of submitted solutions
///
/// The header is rebuilt from the job snapshot the miner named, the solution
/// is handed to a pluggable verifier, and the resulting hash is compared
/// against the network and share targets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::jobs::Work;
use crate::pow::{build_block_header, compact_size, sha256d, Uint128, Uint256};

/// Proof-of-work verification primitive for `(n, k)` solutions.
pub trait SolutionVerifier: Send + Sync {
    fn verify(&self, n: u32, k: u32, header: &[u8], solution: &[u8]) -> bool;
}

/// Accepts any solution with the byte length `(n, k)` requires.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralVerifier;

impl StructuralVerifier {
    /// `2^k` indices of `n/(k+1) + 1` bits each.
    pub fn solution_size(n: u32, k: u32) -> Option<usize> {
        if k == 0 {
            return None;
        }
        let indices = 1usize.checked_shl(k)?;
        let bits = (n / (k + 1) + 1) as usize;
        Some(indices.checked_mul(bits)? / 8)
    }
}

impl SolutionVerifier for StructuralVerifier {
    fn verify(&self, n: u32, k: u32, _header: &[u8], solution: &[u8]) -> bool {
        Self::solution_size(n, k) == Some(solution.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    Invalid,
    Ok,
    Block,
}

#[derive(Debug, Clone)]
pub struct ShareCheck {
    pub status: ShareStatus,
    /// Proof hash in comparison byte order; absent when the verifier refused.
    pub hash: Option<Uint256>,
    /// Complete block for submission, set only for `Block`.
    pub block: Option<Vec<u8>>,
}

impl ShareCheck {
    fn invalid(hash: Option<Uint256>) -> Self {
        Self {
            status: ShareStatus::Invalid,
            hash,
            block: None,
        }
    }
}

/// Max age of duplicate-detection entries (10 minutes)
const SEEN_MAX_AGE_SECS: i64 = 600;

/// Hashes remembered at most; the oldest go first beyond this.
pub const SEEN_CAPACITY: usize = 65_536;

/// Accepted hashes in arrival order. Expiry and eviction only ever pop from
/// the front, so each insert costs amortized O(1).
struct SeenHashes {
    at: HashMap<Uint256, i64>,
    order: VecDeque<Uint256>,
    capacity: usize,
}

impl SeenHashes {
    fn new(capacity: usize) -> Self {
        Self {
            at: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn expire(&mut self, now: i64) {
        while let Some(oldest) = self.order.front() {
            let stale = self
                .at
                .get(oldest)
                .map_or(true, |at| now - *at >= SEEN_MAX_AGE_SECS);
            if !stale && self.order.len() < self.capacity {
                break;
            }
            if let Some(oldest) = self.order.pop_front() {
                self.at.remove(&oldest);
            }
        }
    }

    fn insert(&mut self, hash: Uint256, now: i64) -> bool {
        self.expire(now);
        if self.at.contains_key(&hash) {
            return false;
        }
        self.at.insert(hash, now);
        self.order.push_back(hash);
        true
    }

    fn len(&self) -> usize {
        self.at.len()
    }
}

pub struct ShareValidator {
    verifier: Arc<dyn SolutionVerifier>,
    seen: Mutex<SeenHashes>,
}

impl ShareValidator {
    pub fn new(verifier: Arc<dyn SolutionVerifier>) -> Self {
        Self::with_capacity(verifier, SEEN_CAPACITY)
    }

    /// Like `new`, remembering at most `capacity` accepted hashes.
    pub fn with_capacity(verifier: Arc<dyn SolutionVerifier>, capacity: usize) -> Self {
        Self {
            verifier,
            seen: Mutex::new(SeenHashes::new(capacity)),
        }
    }

    /// Classify one submission against the job it names.
    ///
    /// The header is built with the miner's `ntime`, not the template's.
    pub fn check_share(
        &self,
        work: &Work,
        ntime: u32,
        nonce_part1: &Uint128,
        nonce_part2: &Uint128,
        solution: &[u8],
        share_target: &Uint256,
    ) -> ShareCheck {
        let header = build_block_header(
            work.version,
            &work.prev_hash,
            &work.merkle_root,
            &work.reserved,
            ntime,
            work.nbits,
            nonce_part1.as_bytes(),
            nonce_part2.as_bytes(),
        );

        if !self.verifier.verify(work.n, work.k, &header, solution) {
            return ShareCheck::invalid(None);
        }

        let prefix = compact_size(solution.len());
        let mut digest = sha256d(&[header.as_slice(), prefix.as_slice(), solution]);
        digest.reverse();
        let hash = Uint256(digest);

        if hash <= work.target {
            let consumed = header.len() + prefix.len() + solution.len();
            let tail = work.raw_block.get(consumed..).unwrap_or(&[]);

            let mut block = Vec::with_capacity(consumed + tail.len());
            block.extend_from_slice(&header);
            block.extend_from_slice(&prefix);
            block.extend_from_slice(solution);
            block.extend_from_slice(tail);

            return ShareCheck {
                status: ShareStatus::Block,
                hash: Some(hash),
                block: Some(block),
            };
        }

        if hash <= *share_target {
            return ShareCheck {
                status: ShareStatus::Ok,
                hash: Some(hash),
                block: None,
            };
        }

        ShareCheck::invalid(Some(hash))
    }

    /// Remember an accepted proof hash. Returns false if it was already seen.
    pub fn record(&self, hash: &Uint256) -> bool {
        self.record_at(hash, Utc::now().timestamp())
    }

    fn record_at(&self, hash: &Uint256, now: i64) -> bool {
        self.seen.lock().insert(*hash, now)
    }

    /// Accepted hashes currently remembered.
    pub fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }
}
