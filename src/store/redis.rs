//! Redis adapter for [`SharedStore`].
//!
//! Each [`Pipeline`] is compiled to a single Lua script and sent with
//! `EVALSHA`, which Redis runs atomically. Scripts depend only on the shape
//! of the pipeline, so the server-side script cache stays small: one entry per
//! algorithm batch shape.

use super::{Condition, Op, Pipeline, Reply, SharedStore};
use crate::error::{StoreError, StoreResult};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script, Value};

pub struct RedisStore {
    client: Client,
    connection: ArcSwapOption<ConnectionManager>,
}

/// Lua source plus the KEYS and ARGV it expects.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScript {
    pub source: String,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

impl RedisStore {
    /// Validate the URL and prepare a client. The connection is opened lazily.
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: ArcSwapOption::empty(),
        })
    }

    /// Open the managed connection now instead of on first use.
    pub async fn connect(&self) -> StoreResult<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        if let Some(conn) = self.connection.load_full() {
            return Ok((*conn).clone());
        }

        let conn = ConnectionManager::new(self.client.clone()).await.map_err(|e| {
            warn!(error = %e, "Failed to connect to Redis");
            StoreError::Unavailable(format!("Failed to connect to Redis: {}", e))
        })?;
        info!("Connected to Redis");
        self.connection.store(Some(Arc::new(conn.clone())));
        Ok(conn)
    }
}

/// Translate a pipeline into one Lua script.
///
/// Replies accumulate in the table `r`; a failed guard returns early, so the
/// reply array is shorter than the pipeline and the tail decodes as skipped.
pub fn compile(pipeline: &Pipeline) -> CompiledScript {
    let mut source = String::from("local r = {}\n");
    let mut keys = Vec::with_capacity(pipeline.len());
    let mut args = Vec::new();

    for (i, op) in pipeline.ops().iter().enumerate() {
        let n = i + 1;
        keys.push(op.key().to_string());
        let k = keys.len();
        let a = args.len() + 1;

        // Writes to a String never fail.
        let _ = match op {
            Op::Get { .. } => writeln!(source, "r[{n}] = redis.call('GET', KEYS[{k}])"),
            Op::SetWithTtl {
                value, ttl_secs, ..
            } => {
                args.push(value.clone());
                args.push(ttl_secs.to_string());
                writeln!(
                    source,
                    "redis.call('SET', KEYS[{k}], ARGV[{a}], 'EX', ARGV[{}])\nr[{n}] = 1",
                    a + 1
                )
            }
            Op::IncrementWithTtl { by, ttl_secs, .. } => {
                args.push(by.to_string());
                args.push(ttl_secs.to_string());
                writeln!(
                    source,
                    "do\n  local fresh = redis.call('EXISTS', KEYS[{k}]) == 0\n  r[{n}] = redis.call('INCRBY', KEYS[{k}], ARGV[{a}])\n  if fresh then redis.call('EXPIRE', KEYS[{k}], ARGV[{}]) end\nend",
                    a + 1
                )
            }
            Op::PruneSortedSet { min, max, .. } => {
                args.push(min.to_redis_arg());
                args.push(max.to_redis_arg());
                writeln!(
                    source,
                    "r[{n}] = redis.call('ZREMRANGEBYSCORE', KEYS[{k}], ARGV[{a}], ARGV[{}])",
                    a + 1
                )
            }
            Op::CountSortedSet { min, max, .. } => {
                args.push(min.to_redis_arg());
                args.push(max.to_redis_arg());
                writeln!(
                    source,
                    "r[{n}] = redis.call('ZCOUNT', KEYS[{k}], ARGV[{a}], ARGV[{}])",
                    a + 1
                )
            }
            Op::InsertSortedSet { member, score, .. } => {
                args.push(score.to_string());
                args.push(member.clone());
                writeln!(
                    source,
                    "r[{n}] = redis.call('ZADD', KEYS[{k}], ARGV[{a}], ARGV[{}])",
                    a + 1
                )
            }
            Op::InsertSortedSetMany {
                prefix,
                count,
                score,
                ..
            } => {
                args.push(score.to_string());
                args.push(prefix.clone());
                args.push(count.to_string());
                writeln!(
                    source,
                    "do\n  local added = 0\n  for i = 1, tonumber(ARGV[{}]) do\n    added = added + redis.call('ZADD', KEYS[{k}], ARGV[{a}], ARGV[{}] .. ':' .. i)\n  end\n  r[{n}] = added\nend",
                    a + 2,
                    a + 1
                )
            }
            Op::RangeSortedSet { start, stop, .. } => {
                args.push(start.to_string());
                args.push(stop.to_string());
                writeln!(
                    source,
                    "r[{n}] = redis.call('ZRANGE', KEYS[{k}], ARGV[{a}], ARGV[{}], 'WITHSCORES')",
                    a + 1
                )
            }
            Op::Expire { ttl_secs, .. } => {
                args.push(ttl_secs.to_string());
                writeln!(source, "r[{n}] = redis.call('EXPIRE', KEYS[{k}], ARGV[{a}])")
            }
            Op::Guard(Condition::ValueEquals {
                expected: Some(expected),
                ..
            }) => {
                args.push(expected.clone());
                writeln!(
                    source,
                    "if redis.call('GET', KEYS[{k}]) ~= ARGV[{a}] then r[{n}] = 0 return r end\nr[{n}] = 1"
                )
            }
            Op::Guard(Condition::ValueEquals { expected: None, .. }) => writeln!(
                source,
                "if redis.call('EXISTS', KEYS[{k}]) == 1 then r[{n}] = 0 return r end\nr[{n}] = 1"
            ),
            Op::Guard(Condition::CountAtMost {
                min, max, limit, ..
            }) => {
                args.push(min.to_redis_arg());
                args.push(max.to_redis_arg());
                args.push(limit.to_string());
                writeln!(
                    source,
                    "if redis.call('ZCOUNT', KEYS[{k}], ARGV[{a}], ARGV[{}]) > tonumber(ARGV[{}]) then r[{n}] = 0 return r end\nr[{n}] = 1",
                    a + 1,
                    a + 2
                )
            }
        };
    }

    source.push_str("return r\n");
    CompiledScript { source, keys, args }
}

/// Decode the script's reply array against the ops that produced it.
pub fn decode(pipeline: &Pipeline, value: Value) -> StoreResult<Vec<Reply>> {
    let items = match value {
        Value::Bulk(items) => items,
        Value::Nil => Vec::new(),
        other => {
            return Err(StoreError::Protocol(format!(
                "expected array reply from script, got {:?}",
                other
            )))
        }
    };
    let mut items = items.into_iter();

    pipeline
        .ops()
        .iter()
        .map(|op| match items.next() {
            None => Ok(Reply::Skipped),
            Some(value) => decode_one(op, value),
        })
        .collect()
}

fn decode_one(op: &Op, value: Value) -> StoreResult<Reply> {
    match (op, value) {
        (Op::Get { .. }, Value::Nil) => Ok(Reply::Value(None)),
        (Op::Get { .. }, Value::Data(bytes)) => Ok(Reply::Value(Some(utf8(bytes)?))),
        (Op::SetWithTtl { .. }, Value::Int(_)) => Ok(Reply::Done),
        (Op::Guard(_), Value::Int(flag)) => Ok(Reply::Passed(flag == 1)),
        (Op::RangeSortedSet { .. }, Value::Bulk(flat)) => {
            let mut members = Vec::with_capacity(flat.len() / 2);
            let mut flat = flat.into_iter();
            while let (Some(member), Some(score)) = (flat.next(), flat.next()) {
                let member = data(member)?;
                let score = data(score)?;
                let score = score
                    .parse::<f64>()
                    .map_err(|_| StoreError::Protocol(format!("bad score `{}`", score)))?;
                members.push((member, score));
            }
            Ok(Reply::Members(members))
        }
        (
            Op::IncrementWithTtl { .. }
            | Op::PruneSortedSet { .. }
            | Op::CountSortedSet { .. }
            | Op::InsertSortedSet { .. }
            | Op::InsertSortedSetMany { .. }
            | Op::Expire { .. },
            Value::Int(n),
        ) => Ok(Reply::Int(n)),
        (op, value) => Err(StoreError::Protocol(format!(
            "unexpected reply {:?} for {:?}",
            value, op
        ))),
    }
}

fn utf8(bytes: Vec<u8>) -> StoreResult<String> {
    String::from_utf8(bytes).map_err(|e| StoreError::Protocol(format!("non-UTF-8 reply: {}", e)))
}

fn data(value: Value) -> StoreResult<String> {
    match value {
        Value::Data(bytes) => utf8(bytes),
        other => Err(StoreError::Protocol(format!("expected bulk string, got {:?}", other))),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn execute(&self, pipeline: &Pipeline) -> StoreResult<Vec<Reply>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        let compiled = compile(pipeline);
        let script = Script::new(&compiled.source);
        let mut invocation = script.prepare_invoke();
        for key in &compiled.keys {
            invocation.key(key);
        }
        for arg in &compiled.args {
            invocation.arg(arg);
        }

        let mut conn = self.connection().await?;
        let value: Value = invocation.invoke_async(&mut conn).await.map_err(|e| {
            debug!(error = %e, ops = pipeline.len(), "Script execution failed");
            StoreError::from(e)
        })?;

        decode(pipeline, value)
    }

    async fn ping(&self) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
