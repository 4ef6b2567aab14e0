use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::Script;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::storage::RedisConn;

/// Longest single sleep while waiting for a token
const MAX_POLL: Duration = Duration::from_millis(500);

/// Aggregate request throttle shared by every worker
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait for a token; `false` once waiting would outlast `timeout`
    async fn acquire(&self, timeout: Duration) -> Result<bool>;
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// In-process token bucket guarded by a single lock
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available right now, otherwise report how long to wait
    async fn take(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate))
        }
    }

    pub async fn try_acquire(&self) -> bool {
        self.take().await.is_ok()
    }

    pub async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = Instant::now().duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }
}

#[async_trait]
impl Throttle for TokenBucket {
    async fn acquire(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            let wait = match self.take().await {
                Ok(()) => return Ok(true),
                Err(wait) => wait,
            };

            if Instant::now() + wait > deadline {
                debug!("Token wait of {:?} exceeds the deadline", wait);
                return Ok(false);
            }
            sleep(wait.min(MAX_POLL)).await;
        }
    }
}

/// Refills from the server clock so every process sees one bucket.
/// Returns the seconds to wait as a string, "0" when a token was taken.
const BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local clock = redis.call('TIME')
local now = tonumber(clock[1]) + tonumber(clock[2]) / 1000000
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1]) or capacity
local ts = tonumber(state[2]) or now
tokens = math.min(capacity, tokens + math.max(0, now - ts) * rate)
local wait = 0
if tokens >= 1 then
  tokens = tokens - 1
else
  wait = (1 - tokens) / rate
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('EXPIRE', KEYS[1], 3600)
return tostring(wait)
"#;

/// Token bucket living in Redis, shared across worker processes
pub struct RedisTokenBucket {
    conn: RedisConn,
    key: String,
    capacity: u32,
    refill_rate: f64,
    script: Script,
}

impl RedisTokenBucket {
    pub fn new(conn: RedisConn, key: String, capacity: u32, refill_rate: f64) -> Self {
        Self {
            conn,
            key,
            capacity,
            refill_rate,
            script: Script::new(BUCKET_SCRIPT),
        }
    }

    async fn take(&self) -> Result<Duration> {
        let mut conn = self.conn.lock().await;
        let wait: String = self
            .script
            .key(&self.key)
            .arg(self.capacity)
            .arg(self.refill_rate)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to run token bucket script")?;

        let seconds: f64 = wait
            .parse()
            .context(format!("Unexpected token bucket reply: {}", wait))?;
        Ok(Duration::from_secs_f64(seconds.max(0.0)))
    }
}

#[async_trait]
impl Throttle for RedisTokenBucket {
    async fn acquire(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            let wait = self.take().await?;
            if wait.is_zero() {
                return Ok(true);
            }
            if Instant::now() + wait > deadline {
                debug!("Shared token wait of {:?} exceeds the deadline", wait);
                return Ok(false);
            }
            sleep(wait.min(MAX_POLL)).await;
        }
    }
}
