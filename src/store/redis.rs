//! Redis-backed stores, shared by every edge region.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::{ConsumeOutcome, LedgerStore, RefillMode, RefillOutcome, StoreError, WindowStore};

const INCREMENT_WINDOW: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

const CONSUME: &str = r#"
local current = redis.call('HGET', KEYS[1], 'remaining')
if not current then
  return {-1, 0}
end
local remaining = tonumber(current)
local cost = tonumber(ARGV[1])
if remaining < cost then
  return {0, remaining}
end
return {1, redis.call('HINCRBY', KEYS[1], 'remaining', -cost)}
"#;

const REFILL: &str = r#"
local current = redis.call('HGET', KEYS[1], 'remaining')
if not current then
  return {-1, 0}
end
if redis.call('HGET', KEYS[1], 'period') == ARGV[3] then
  return {0, tonumber(current)}
end
local remaining
if ARGV[2] == 'set' then
  redis.call('HSET', KEYS[1], 'remaining', ARGV[1])
  remaining = tonumber(ARGV[1])
else
  remaining = redis.call('HINCRBY', KEYS[1], 'remaining', ARGV[1])
end
redis.call('HSET', KEYS[1], 'period', ARGV[3])
return {1, remaining}
"#;

const PROVISION: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'remaining', ARGV[1])
if ARGV[2] ~= '' then
  redis.call('HSET', KEYS[1], 'period', ARGV[2])
end
return 1
"#;

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

async fn connect(url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(url).map_err(unavailable)?;
    let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
    info!("Connected to Redis store");
    Ok(conn)
}

/// Window counters stored as plain Redis integers with a TTL.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    prefix: String,
    increment: Script,
}

impl RedisWindowStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            conn: connect(url).await?,
            prefix: prefix.to_string(),
            increment: Script::new(INCREMENT_WINDOW),
        })
    }

    fn key(&self, scope: &str, window_start: u64) -> String {
        format!("{}:window:{}:{}", self.prefix, scope, window_start)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn increment(
        &self,
        scope: &str,
        window_start: u64,
        duration_ms: u64,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(self.key(scope, window_start))
            .arg(amount)
            .arg(duration_ms.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn read(&self, scope: &str, window_start: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn
            .get(self.key(scope, window_start))
            .await
            .map_err(unavailable)?;
        Ok(count.unwrap_or(0))
    }
}

/// Key budgets stored as Redis hashes of `remaining` and the last refill period.
#[derive(Clone)]
pub struct RedisLedgerStore {
    conn: ConnectionManager,
    prefix: String,
    consume: Script,
    refill: Script,
    provision: Script,
}

impl RedisLedgerStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            conn: connect(url).await?,
            prefix: prefix.to_string(),
            consume: Script::new(CONSUME),
            refill: Script::new(REFILL),
            provision: Script::new(PROVISION),
        })
    }

    fn key(&self, key_id: &str) -> String {
        format!("{}:ledger:{}", self.prefix, key_id)
    }
}

fn decode_pair(reply: Vec<i64>) -> Result<(i64, u64), StoreError> {
    match reply.as_slice() {
        [status, remaining] if *remaining >= 0 => Ok((*status, *remaining as u64)),
        other => Err(StoreError::Corrupt(format!("unexpected ledger reply {:?}", other))),
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn consume(&self, key_id: &str, cost: u64) -> Result<Option<ConsumeOutcome>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .consume
            .key(self.key(key_id))
            .arg(cost)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let (status, remaining) = decode_pair(reply)?;
        Ok((status >= 0).then_some(ConsumeOutcome {
            ok: status == 1,
            remaining,
        }))
    }

    async fn refill(
        &self,
        key_id: &str,
        amount: u64,
        mode: RefillMode,
        period: &str,
    ) -> Result<Option<RefillOutcome>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .refill
            .key(self.key(key_id))
            .arg(amount)
            .arg(mode.as_str())
            .arg(period)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let (status, remaining) = decode_pair(reply)?;
        Ok((status >= 0).then_some(RefillOutcome {
            applied: status == 1,
            remaining,
        }))
    }

    async fn get(&self, key_id: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(self.key(key_id), "remaining")
            .await
            .map_err(unavailable)
    }

    async fn set(&self, key_id: &str, remaining: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match remaining {
            Some(remaining) => conn
                .hset(self.key(key_id), "remaining", remaining)
                .await
                .map_err(unavailable),
            None => conn.del(self.key(key_id)).await.map_err(unavailable),
        }
    }

    async fn provision_if_absent(
        &self,
        key_id: &str,
        remaining: u64,
        period: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .provision
            .key(self.key(key_id))
            .arg(remaining)
            .arg(period.unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(created == 1)
    }
}
