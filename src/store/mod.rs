//! Shared state store contract.
//!
//! Algorithms never issue a read and a dependent write as separate calls.
//! Every state transition is expressed as a [`Pipeline`] which the adapter
//! executes as one atomic unit: a Lua script on Redis, a set of shard locks
//! in memory. [`Condition`] guards give the pipeline its only branching, which
//! is enough for compare-and-swap and for "insert only if there is room".

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;

/// Bound of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Redis range syntax: `-inf`, `+inf`, `12.5`, `(12.5`.
    pub fn to_redis_arg(self) -> String {
        match self {
            ScoreBound::NegInf => "-inf".to_string(),
            ScoreBound::PosInf => "+inf".to_string(),
            ScoreBound::Inclusive(v) => v.to_string(),
            ScoreBound::Exclusive(v) => format!("({}", v),
        }
    }

    pub(crate) fn admits_as_min(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(v) => score >= v,
            ScoreBound::Exclusive(v) => score > v,
        }
    }

    pub(crate) fn admits_as_max(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(v) => score <= v,
            ScoreBound::Exclusive(v) => score < v,
        }
    }
}

/// Precondition evaluated inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// String value at `key` equals `expected`; `None` means the key is absent.
    ValueEquals {
        key: String,
        expected: Option<String>,
    },
    /// Sorted set at `key` has at most `limit` members scored in `[min, max]`.
    CountAtMost {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
        limit: i64,
    },
}

impl Condition {
    pub fn key(&self) -> &str {
        match self {
            Condition::ValueEquals { key, .. } | Condition::CountAtMost { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Get {
        key: String,
    },
    SetWithTtl {
        key: String,
        value: String,
        ttl_secs: u64,
    },
    /// Atomic increment; the TTL is only applied when the key is created.
    IncrementWithTtl {
        key: String,
        by: i64,
        ttl_secs: u64,
    },
    PruneSortedSet {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    CountSortedSet {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    InsertSortedSet {
        key: String,
        member: String,
        score: f64,
    },
    /// Inserts `count` members named `"{prefix}:1"` to `"{prefix}:{count}"`,
    /// all at `score`. One op regardless of `count`.
    InsertSortedSetMany {
        key: String,
        prefix: String,
        count: u32,
        score: f64,
    },
    /// Members by rank, inclusive on both ends, negative ranks count from the end.
    RangeSortedSet {
        key: String,
        start: i64,
        stop: i64,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
    /// Stops the batch when the condition does not hold.
    Guard(Condition),
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::Get { key }
            | Op::SetWithTtl { key, .. }
            | Op::IncrementWithTtl { key, .. }
            | Op::PruneSortedSet { key, .. }
            | Op::CountSortedSet { key, .. }
            | Op::InsertSortedSet { key, .. }
            | Op::InsertSortedSetMany { key, .. }
            | Op::RangeSortedSet { key, .. }
            | Op::Expire { key, .. } => key,
            Op::Guard(condition) => condition.key(),
        }
    }
}

/// Result of one [`Op`], positionally matched to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Option<String>),
    Int(i64),
    Members(Vec<(String, f64)>),
    Passed(bool),
    Done,
    /// An earlier guard failed, the op did not run.
    Skipped,
}

impl Reply {
    pub fn into_value(self) -> StoreResult<Option<String>> {
        match self {
            Reply::Value(v) => Ok(v),
            other => Err(unexpected("value", &other)),
        }
    }

    pub fn as_int(&self) -> StoreResult<i64> {
        match self {
            Reply::Int(n) => Ok(*n),
            other => Err(unexpected("integer", other)),
        }
    }

    pub fn into_members(self) -> StoreResult<Vec<(String, f64)>> {
        match self {
            Reply::Members(m) => Ok(m),
            other => Err(unexpected("members", &other)),
        }
    }

    pub fn passed(&self) -> StoreResult<bool> {
        match self {
            Reply::Passed(p) => Ok(*p),
            other => Err(unexpected("guard", other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> StoreError {
    StoreError::Protocol(format!("expected {} reply, got {:?}", wanted, got))
}

/// Ordered batch of operations executed as one atomic unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    ops: Vec<Op>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn get(mut self, key: &str) -> Self {
        self.ops.push(Op::Get { key: key.into() });
        self
    }

    pub fn set_with_ttl(mut self, key: &str, value: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(Op::SetWithTtl {
            key: key.into(),
            value: value.into(),
            ttl_secs,
        });
        self
    }

    pub fn increment_with_ttl(mut self, key: &str, by: i64, ttl_secs: u64) -> Self {
        self.ops.push(Op::IncrementWithTtl {
            key: key.into(),
            by,
            ttl_secs,
        });
        self
    }

    pub fn prune_sorted_set(mut self, key: &str, min: ScoreBound, max: ScoreBound) -> Self {
        self.ops.push(Op::PruneSortedSet {
            key: key.into(),
            min,
            max,
        });
        self
    }

    pub fn count_sorted_set(mut self, key: &str, min: ScoreBound, max: ScoreBound) -> Self {
        self.ops.push(Op::CountSortedSet {
            key: key.into(),
            min,
            max,
        });
        self
    }

    pub fn insert_sorted_set(mut self, key: &str, member: impl Into<String>, score: f64) -> Self {
        self.ops.push(Op::InsertSortedSet {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn insert_sorted_set_many(
        mut self,
        key: &str,
        prefix: impl Into<String>,
        count: u32,
        score: f64,
    ) -> Self {
        self.ops.push(Op::InsertSortedSetMany {
            key: key.into(),
            prefix: prefix.into(),
            count,
            score,
        });
        self
    }

    pub fn range_sorted_set(mut self, key: &str, start: i64, stop: i64) -> Self {
        self.ops.push(Op::RangeSortedSet {
            key: key.into(),
            start,
            stop,
        });
        self
    }

    pub fn expire(mut self, key: &str, ttl_secs: u64) -> Self {
        self.ops.push(Op::Expire {
            key: key.into(),
            ttl_secs,
        });
        self
    }

    pub fn guard(mut self, condition: Condition) -> Self {
        self.ops.push(Op::Guard(condition));
        self
    }
}

/// Key-value store shared by every replica of the service.
///
/// Implementations must execute each [`Pipeline`] atomically: no other
/// client may observe or interleave with a partially applied batch. An
/// adapter that can only offer separate get/set calls cannot implement this
/// trait correctly.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Execute `pipeline` atomically, returning one reply per op.
    async fn execute(&self, pipeline: &Pipeline) -> StoreResult<Vec<Reply>>;

    async fn ping(&self) -> StoreResult<bool>;

    /// Short adapter name for logs and health output.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        single(self, Pipeline::new().get(key)).await?.into_value()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        single(self, Pipeline::new().set_with_ttl(key, value, ttl_secs))
            .await
            .map(|_| ())
    }

    async fn increment_with_ttl(&self, key: &str, ttl_secs: u64) -> StoreResult<i64> {
        single(self, Pipeline::new().increment_with_ttl(key, 1, ttl_secs))
            .await?
            .as_int()
    }

    async fn prune_sorted_set(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> StoreResult<i64> {
        single(self, Pipeline::new().prune_sorted_set(key, min, max))
            .await?
            .as_int()
    }

    async fn count_sorted_set(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> StoreResult<i64> {
        single(self, Pipeline::new().count_sorted_set(key, min, max))
            .await?
            .as_int()
    }

    async fn insert_sorted_set(&self, key: &str, member: &str, score: f64) -> StoreResult<i64> {
        single(self, Pipeline::new().insert_sorted_set(key, member, score))
            .await?
            .as_int()
    }

    async fn range_sorted_set(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<(String, f64)>> {
        single(self, Pipeline::new().range_sorted_set(key, start, stop))
            .await?
            .into_members()
    }
}

async fn single<S>(store: &S, pipeline: Pipeline) -> StoreResult<Reply>
where
    S: SharedStore + ?Sized,
{
    store
        .execute(&pipeline)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Protocol("empty reply to single-op pipeline".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bound_redis_syntax() {
        assert_eq!(ScoreBound::NegInf.to_redis_arg(), "-inf");
        assert_eq!(ScoreBound::PosInf.to_redis_arg(), "+inf");
        assert_eq!(ScoreBound::Inclusive(1500.0).to_redis_arg(), "1500");
        assert_eq!(ScoreBound::Exclusive(1500.5).to_redis_arg(), "(1500.5");
    }

    #[test]
    fn test_score_bound_admission() {
        assert!(ScoreBound::Inclusive(10.0).admits_as_min(10.0));
        assert!(!ScoreBound::Exclusive(10.0).admits_as_min(10.0));
        assert!(ScoreBound::Exclusive(10.0).admits_as_max(9.9));
        assert!(!ScoreBound::Exclusive(10.0).admits_as_max(10.0));
    }

    #[test]
    fn test_pipeline_builder_keeps_order() {
        let pipeline = Pipeline::new()
            .get("a")
            .guard(Condition::ValueEquals {
                key: "a".into(),
                expected: None,
            })
            .set_with_ttl("a", "1", 10);
        let keys: Vec<&str> = pipeline.ops().iter().map(Op::key).collect();
        assert_eq!(keys, vec!["a", "a", "a"]);
        assert!(matches!(pipeline.ops()[1], Op::Guard(_)));
    }

    #[test]
    fn test_reply_accessors_reject_wrong_shape() {
        assert!(Reply::Int(3).into_value().is_err());
        assert!(Reply::Skipped.as_int().is_err());
        assert!(Reply::Passed(true).passed().unwrap());
    }
}
