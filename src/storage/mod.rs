pub mod control;
pub mod ledger;
pub mod queue;

use anyhow::{Result, Context};
use redis::{Client, aio::MultiplexedConnection};
use std::sync::Arc;
use tokio::sync::Mutex;

// Re-export common types
pub use control::{FailureReport, MemoryRunControl, RedisRunControl, RemoteHealthGate, RunControl, WorkerHeartbeat, WorkerState};
pub use ledger::{Checkpoint, Ledger, LandRecord, SessionParams, SessionRecord, SkippedItem, SqliteLedger, VillageProgress};
pub use queue::{MemoryTaskQueue, RedisTaskQueue, TaskQueue};

/// Shared Redis connection
pub type RedisConn = Arc<Mutex<MultiplexedConnection>>;

pub async fn connect_redis(redis_url: &str) -> Result<RedisConn> {
    let client = Client::open(redis_url)
        .context(format!("Failed to connect to Redis at {}", redis_url))?;

    let conn = client.get_multiplexed_async_connection().await
        .context("Failed to get Redis connection")?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// Key layout for one session: `{prefix}:{kind}:{session}[:{lane}]`
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    session: String,
}

impl KeySpace {
    pub fn new(prefix: &str, session: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            session: session.to_string(),
        }
    }

    pub fn lane(&self, lane: u32) -> String {
        format!("{}:queue:{}:{}", self.prefix, self.session, lane)
    }

    pub fn inflight(&self, lane: u32) -> String {
        format!("{}:inflight:{}:{}", self.prefix, self.session, lane)
    }

    pub fn shutdown(&self) -> String {
        format!("{}:shutdown:{}", self.prefix, self.session)
    }

    pub fn metrics(&self) -> String {
        format!("{}:metrics:{}", self.prefix, self.session)
    }

    pub fn heartbeats(&self) -> String {
        format!("{}:heartbeats:{}", self.prefix, self.session)
    }

    pub fn health(&self) -> String {
        format!("{}:health:{}", self.prefix, self.session)
    }

    pub fn failure_reports(&self) -> String {
        format!("{}:failures:{}", self.prefix, self.session)
    }

    /// One bucket per portal, shared by every session
    pub fn token_bucket(&self) -> String {
        format!("{}:bucket", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("bhoomi", "abc");
        assert_eq!(keys.lane(3), "bhoomi:queue:abc:3");
        assert_eq!(keys.inflight(3), "bhoomi:inflight:abc:3");
        assert_eq!(keys.shutdown(), "bhoomi:shutdown:abc");
        assert_eq!(keys.token_bucket(), "bhoomi:bucket");
    }
}
