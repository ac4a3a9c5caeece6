//! In-process implementation of [`SharedStore`].
//!
//! Only shares state between tasks of one process. Used by the test suite and
//! by the `--memory-store` single-node mode.

use super::{Condition, Op, Pipeline, Reply, ScoreBound, SharedStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const SHARDS: usize = 16;
/// Minimum spacing of full sweeps for expired keys.
const SWEEP_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    /// Kept sorted by `(score, member)`.
    Sorted(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at_ms: Option<u64>,
}

type Shard = HashMap<String, Entry>;

/// Lock-striped map with TTL expiry.
///
/// A batch locks every shard it touches, in ascending shard order, for the
/// duration of the batch. Batches on keys in different shards never contend.
/// Expired keys are dropped when a batch touches them, and at most once per
/// `SWEEP_INTERVAL_MS` a batch also sweeps every shard, so keys that are
/// never touched again (old fixed-window counters, idle buckets) are reclaimed.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shards: Arc<Vec<Mutex<Shard>>>,
    next_sweep_ms: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards: Arc::new(shards),
            next_sweep_ms: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    fn shard_index(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARDS
    }

    /// Number of live keys, for diagnostics and tests.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.shards
            .iter()
            .map(|shard| {
                lock(shard)
                    .values()
                    .filter(|e| e.expires_at_ms.map_or(true, |at| at > now))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys held, including expired ones not yet reclaimed.
    pub fn stored_keys(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = lock(shard);
                let before = shard.len();
                shard.retain(|_, e| e.expires_at_ms.map_or(true, |at| at > now));
                before - shard.len()
            })
            .sum()
    }

    fn sweep_if_due(&self) {
        let now = self.clock.now_millis();
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now < due {
            return;
        }
        // one caller wins the slot, the rest skip
        if self
            .next_sweep_ms
            .compare_exchange(due, now + SWEEP_INTERVAL_MS, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.purge_expired();
        }
    }

    fn run(&self, pipeline: &Pipeline) -> StoreResult<Vec<Reply>> {
        let mut indices: Vec<usize> = pipeline
            .ops()
            .iter()
            .map(|op| Self::shard_index(op.key()))
            .collect();
        indices.sort_unstable();
        indices.dedup();

        let mut guards: HashMap<usize, MutexGuard<'_, Shard>> = indices
            .iter()
            .map(|&i| (i, lock(&self.shards[i])))
            .collect();

        let now = self.clock.now_millis();
        let mut replies = Vec::with_capacity(pipeline.len());
        let mut halted = false;

        for op in pipeline.ops() {
            if halted {
                replies.push(Reply::Skipped);
                continue;
            }
            let shard = guards
                .get_mut(&Self::shard_index(op.key()))
                .ok_or_else(|| StoreError::Protocol("shard not locked".into()))?;
            evict_if_expired(shard, op.key(), now);

            let reply = apply(shard, op, now)?;
            if reply == Reply::Passed(false) {
                halted = true;
            }
            replies.push(reply);
        }

        Ok(replies)
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn evict_if_expired(shard: &mut Shard, key: &str, now: u64) {
    let expired = shard
        .get(key)
        .and_then(|e| e.expires_at_ms)
        .is_some_and(|at| at <= now);
    if expired {
        shard.remove(key);
    }
}

fn expiry(now: u64, ttl_secs: u64) -> Option<u64> {
    Some(now.saturating_add(ttl_secs.saturating_mul(1000)))
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!("WRONGTYPE operation against key `{}`", key))
}

fn sorted<'a>(shard: &'a Shard, key: &str) -> StoreResult<&'a [(f64, String)]> {
    match shard.get(key).map(|e| &e.data) {
        None => Ok(&[]),
        Some(Data::Sorted(set)) => Ok(set),
        Some(Data::Str(_)) => Err(wrong_type(key)),
    }
}

fn sorted_mut<'a>(shard: &'a mut Shard, key: &str) -> StoreResult<&'a mut Vec<(f64, String)>> {
    let entry = shard.entry(key.to_string()).or_insert_with(|| Entry {
        data: Data::Sorted(Vec::new()),
        expires_at_ms: None,
    });
    match &mut entry.data {
        Data::Sorted(set) => Ok(set),
        Data::Str(_) => Err(wrong_type(key)),
    }
}

/// ZADD semantics: returns whether `member` is new, moving it if it is not.
fn insert_member(set: &mut Vec<(f64, String)>, member: String, score: f64) -> bool {
    let existed = set.iter().position(|(_, m)| *m == member);
    if let Some(i) = existed {
        set.remove(i);
    }
    let at = set.partition_point(|(s, m)| (*s, m.as_str()) < (score, member.as_str()));
    set.insert(at, (score, member));
    existed.is_none()
}

fn count_in(set: &[(f64, String)], min: ScoreBound, max: ScoreBound) -> i64 {
    set.iter()
        .filter(|(score, _)| min.admits_as_min(*score) && max.admits_as_max(*score))
        .count() as i64
}

fn apply(shard: &mut Shard, op: &Op, now: u64) -> StoreResult<Reply> {
    match op {
        Op::Get { key } => match shard.get(key).map(|e| &e.data) {
            None => Ok(Reply::Value(None)),
            Some(Data::Str(v)) => Ok(Reply::Value(Some(v.clone()))),
            Some(Data::Sorted(_)) => Err(wrong_type(key)),
        },
        Op::SetWithTtl {
            key,
            value,
            ttl_secs,
        } => {
            shard.insert(
                key.clone(),
                Entry {
                    data: Data::Str(value.clone()),
                    expires_at_ms: expiry(now, *ttl_secs),
                },
            );
            Ok(Reply::Done)
        }
        Op::IncrementWithTtl { key, by, ttl_secs } => {
            let entry = shard.entry(key.clone()).or_insert_with(|| Entry {
                data: Data::Str("0".into()),
                expires_at_ms: expiry(now, *ttl_secs),
            });
            let current = match &entry.data {
                Data::Str(v) => v
                    .parse::<i64>()
                    .map_err(|_| StoreError::Protocol(format!("value at `{}` is not an integer", key)))?,
                Data::Sorted(_) => return Err(wrong_type(key)),
            };
            let next = current + by;
            entry.data = Data::Str(next.to_string());
            Ok(Reply::Int(next))
        }
        Op::PruneSortedSet { key, min, max } => {
            let removed = match shard.get_mut(key).map(|e| &mut e.data) {
                None => 0,
                Some(Data::Sorted(set)) => {
                    let before = set.len();
                    set.retain(|(score, _)| !(min.admits_as_min(*score) && max.admits_as_max(*score)));
                    (before - set.len()) as i64
                }
                Some(Data::Str(_)) => return Err(wrong_type(key)),
            };
            if matches!(shard.get(key).map(|e| &e.data), Some(Data::Sorted(s)) if s.is_empty()) {
                shard.remove(key);
            }
            Ok(Reply::Int(removed))
        }
        Op::CountSortedSet { key, min, max } => Ok(Reply::Int(count_in(sorted(shard, key)?, *min, *max))),
        Op::InsertSortedSet { key, member, score } => {
            let set = sorted_mut(shard, key)?;
            Ok(Reply::Int(i64::from(insert_member(set, member.clone(), *score))))
        }
        Op::InsertSortedSetMany {
            key,
            prefix,
            count,
            score,
        } => {
            let set = sorted_mut(shard, key)?;
            let added = (1..=*count)
                .filter(|i| insert_member(set, format!("{}:{}", prefix, i), *score))
                .count();
            Ok(Reply::Int(added as i64))
        }
        Op::RangeSortedSet { key, start, stop } => {
            let set = sorted(shard, key)?;
            let len = set.len() as i64;
            let start = if *start < 0 { (len + start).max(0) } else { *start };
            let stop = if *stop < 0 { len + stop } else { (*stop).min(len - 1) };
            if start > stop || start >= len {
                return Ok(Reply::Members(Vec::new()));
            }
            Ok(Reply::Members(
                set[start as usize..=stop as usize]
                    .iter()
                    .map(|(score, member)| (member.clone(), *score))
                    .collect(),
            ))
        }
        Op::Expire { key, ttl_secs } => match shard.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = expiry(now, *ttl_secs);
                Ok(Reply::Int(1))
            }
            None => Ok(Reply::Int(0)),
        },
        Op::Guard(Condition::ValueEquals { key, expected }) => {
            let current = match shard.get(key).map(|e| &e.data) {
                None => None,
                Some(Data::Str(v)) => Some(v.as_str()),
                Some(Data::Sorted(_)) => return Err(wrong_type(key)),
            };
            Ok(Reply::Passed(current == expected.as_deref()))
        }
        Op::Guard(Condition::CountAtMost {
            key,
            min,
            max,
            limit,
        }) => Ok(Reply::Passed(count_in(sorted(shard, key)?, *min, *max) <= *limit)),
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn execute(&self, pipeline: &Pipeline) -> StoreResult<Vec<Reply>> {
        let replies = self.run(pipeline)?;
        self.sweep_if_due();
        Ok(replies)
    }

    async fn ping(&self) -> StoreResult<bool> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
