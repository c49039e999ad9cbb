/// Work snapshots and the bounded job history shares are checked against

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::pow::{Difficulty, Uint256};
use crate::stratum::protocol::Notify;

/// Immutable block template as handed to miners.
#[derive(Debug, Clone)]
pub struct Work {
    pub job_id: String,
    pub version: u32,
    pub prev_hash: Uint256,
    pub merkle_root: Uint256,
    pub reserved: Uint256,
    pub ntime: u32,
    pub nbits: u32,
    pub height: u64,
    /// Network target.
    pub target: Uint256,
    /// Serialized block template; bytes past the header and solution are the
    /// transactions carried into a block submission.
    pub raw_block: Vec<u8>,
    pub n: u32,
    pub k: u32,
    pub at: DateTime<Utc>,
    pub difficulty: Difficulty,
    pub subsidy: f64,
}

impl Work {
    pub fn notify(&self, clean_jobs: bool) -> Notify {
        Notify {
            job: self.job_id.clone(),
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            reserved: self.reserved,
            ntime: self.ntime,
            nbits: self.nbits,
            clean_jobs,
        }
    }
}

struct Book {
    jobs: HashMap<String, Arc<Work>>,
    order: VecDeque<String>,
    current: Option<Arc<Work>>,
    seq: u64,
}

/// Recent jobs by id, oldest evicted first once `limit` is exceeded.
pub struct JobBook {
    inner: Mutex<Book>,
    limit: usize,
}

impl JobBook {
    pub const DEFAULT_LIMIT: usize = 256;

    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Book {
                jobs: HashMap::new(),
                order: VecDeque::new(),
                current: None,
                seq: 0,
            }),
            limit: limit.max(1),
        }
    }

    /// Assign a job id, record `work` and make it current.
    pub fn insert(&self, mut work: Work) -> Arc<Work> {
        let mut book = self.inner.lock();
        book.seq += 1;

        let prev = work.prev_hash.to_hex();
        work.job_id = format!("h{}-{}-{}", work.height, &prev[..8], book.seq);

        let work = Arc::new(work);
        book.jobs.insert(work.job_id.clone(), work.clone());
        book.order.push_back(work.job_id.clone());
        book.current = Some(work.clone());

        while book.order.len() > self.limit {
            if let Some(oldest) = book.order.pop_front() {
                book.jobs.remove(&oldest);
            }
        }

        work
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Work>> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    pub fn current(&self) -> Option<Arc<Work>> {
        self.inner.lock().current.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }
}

impl Default for JobBook {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT)
    }
}

#[cfg(test)]
pub(crate) fn sample_work(height: u64) -> Work {
    Work {
        job_id: String::new(),
        version: 4,
        prev_hash: Uint256([0x11; 32]),
        merkle_root: Uint256([0x22; 32]),
        reserved: Uint256::ZERO,
        ntime: 0x5f5e1000,
        nbits: 0xffff001d,
        height,
        target: crate::pow::POW_LIMIT,
        raw_block: Vec::new(),
        n: 200,
        k: 9,
        at: Utc::now(),
        difficulty: 1,
        subsidy: 3.125,
    }
}
