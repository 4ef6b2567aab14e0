use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::crawler::task::SearchTask;
use crate::storage::{KeySpace, RedisConn};

/// How often a producer re-checks a full lane
const CAPACITY_POLL: Duration = Duration::from_millis(200);

/// Per-worker task lanes with in-flight tracking
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append to the tail, waiting while the lane is at capacity
    async fn push(&self, lane: u32, task: &SearchTask) -> Result<()>;

    /// Insert at the head, ignoring capacity (retries, gate denials, recovery)
    async fn push_front(&self, lane: u32, task: &SearchTask) -> Result<()>;

    /// Take the head task into the in-flight set, or `None` after `timeout`
    async fn pop(&self, lane: u32, timeout: Duration) -> Result<Option<SearchTask>>;

    /// Drop a task from the in-flight set
    async fn ack(&self, lane: u32, task_id: &str) -> Result<()>;

    /// Re-queue at the head whatever a crashed consumer left in flight
    async fn recover_inflight(&self, lane: u32) -> Result<usize>;

    async fn len(&self, lane: u32) -> Result<usize>;

    async fn inflight_len(&self, lane: u32) -> Result<usize>;

    /// Remove a lane and its in-flight set
    async fn clear(&self, lane: u32) -> Result<()>;
}

/// Redis-backed lanes: `LPUSH` at the tail, `RPUSH` at the head, `BRPOP` from the head
pub struct RedisTaskQueue {
    conn: RedisConn,
    keys: KeySpace,
    capacity: usize,
    task_ttl: u64,
}

impl RedisTaskQueue {
    /// Opens a dedicated connection; `BRPOP` must not stall other callers
    pub async fn new(redis_url: &str, keys: KeySpace, capacity: usize, task_ttl: u64) -> Result<Self> {
        let client = Client::open(redis_url)
            .context(format!("Failed to connect to Redis at {}", redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            keys,
            capacity,
            task_ttl,
        })
    }

    async fn touch_ttl(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(self.task_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to set TTL on queue")?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, lane: u32, task: &SearchTask) -> Result<()> {
        let task_json = serde_json::to_string(task)
            .context("Failed to serialize task")?;
        let queue_key = self.keys.lane(lane);

        loop {
            let depth = self.len(lane).await?;
            if depth < self.capacity {
                break;
            }
            sleep(CAPACITY_POLL).await;
        }

        {
            let mut conn = self.conn.lock().await;
            redis::cmd("LPUSH")
                .arg(&queue_key)
                .arg(&task_json)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to push task to Redis queue")?;
        }
        self.touch_ttl(&queue_key).await?;

        debug!("Pushed task to lane {}: {}", lane, task.task_id);
        Ok(())
    }

    async fn push_front(&self, lane: u32, task: &SearchTask) -> Result<()> {
        let task_json = serde_json::to_string(task)
            .context("Failed to serialize task")?;
        let queue_key = self.keys.lane(lane);

        {
            let mut conn = self.conn.lock().await;
            redis::cmd("RPUSH")
                .arg(&queue_key)
                .arg(&task_json)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to re-queue task")?;
        }
        self.touch_ttl(&queue_key).await?;

        debug!("Re-queued task at head of lane {}: {}", lane, task.task_id);
        Ok(())
    }

    async fn pop(&self, lane: u32, timeout: Duration) -> Result<Option<SearchTask>> {
        let queue_key = self.keys.lane(lane);
        let inflight_key = self.keys.inflight(lane);
        let timeout_secs = timeout.as_secs().max(1);

        let mut conn = self.conn.lock().await;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&queue_key)
            .arg(timeout_secs)
            .query_async(&mut *conn)
            .await
            .context("Failed to pop task from Redis queue")?;

        let Some((_, task_json)) = popped else {
            return Ok(None);
        };

        let task: SearchTask = serde_json::from_str(&task_json)
            .context("Failed to deserialize task")?;

        redis::cmd("HSET")
            .arg(&inflight_key)
            .arg(&task.task_id)
            .arg(&task_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to add task to in-flight set")?;

        debug!("Popped task from lane {}: {}", lane, task.task_id);
        Ok(Some(task))
    }

    async fn ack(&self, lane: u32, task_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HDEL")
            .arg(self.keys.inflight(lane))
            .arg(task_id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to remove task from in-flight set")?;
        Ok(())
    }

    async fn recover_inflight(&self, lane: u32) -> Result<usize> {
        let inflight_key = self.keys.inflight(lane);
        let queue_key = self.keys.lane(lane);

        let mut conn = self.conn.lock().await;

        let leftovers: Vec<String> = redis::cmd("HVALS")
            .arg(&inflight_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to read in-flight set")?;

        if leftovers.is_empty() {
            return Ok(0);
        }

        redis::cmd("RPUSH")
            .arg(&queue_key)
            .arg(&leftovers)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to re-queue in-flight tasks")?;

        redis::cmd("DEL")
            .arg(&inflight_key)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to clear in-flight set")?;

        info!("Recovered {} in-flight task(s) on lane {}", leftovers.len(), lane);
        Ok(leftovers.len())
    }

    async fn len(&self, lane: u32) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let count: usize = redis::cmd("LLEN")
            .arg(self.keys.lane(lane))
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;
        Ok(count)
    }

    async fn inflight_len(&self, lane: u32) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let count: usize = redis::cmd("HLEN")
            .arg(self.keys.inflight(lane))
            .query_async(&mut *conn)
            .await
            .context("Failed to get in-flight set size")?;
        Ok(count)
    }

    async fn clear(&self, lane: u32) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL")
            .arg(self.keys.lane(lane))
            .arg(self.keys.inflight(lane))
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to delete lane")?;
        Ok(())
    }
}

#[derive(Default)]
struct Lane {
    items: VecDeque<SearchTask>,
    inflight: HashMap<String, SearchTask>,
}

/// In-process lanes with the same semantics, for tests and single-process runs
pub struct MemoryTaskQueue {
    lanes: Mutex<HashMap<u32, Lane>>,
    capacity: usize,
}

impl MemoryTaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            capacity,
        }
    }
}

const MEMORY_POLL: Duration = Duration::from_millis(10);

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, lane: u32, task: &SearchTask) -> Result<()> {
        loop {
            {
                let mut lanes = self.lanes.lock().await;
                let entry = lanes.entry(lane).or_default();
                if entry.items.len() < self.capacity {
                    entry.items.push_back(task.clone());
                    return Ok(());
                }
            }
            sleep(MEMORY_POLL).await;
        }
    }

    async fn push_front(&self, lane: u32, task: &SearchTask) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        lanes.entry(lane).or_default().items.push_front(task.clone());
        Ok(())
    }

    async fn pop(&self, lane: u32, timeout: Duration) -> Result<Option<SearchTask>> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut lanes = self.lanes.lock().await;
                let entry = lanes.entry(lane).or_default();
                if let Some(task) = entry.items.pop_front() {
                    entry.inflight.insert(task.task_id.clone(), task.clone());
                    return Ok(Some(task));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(MEMORY_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn ack(&self, lane: u32, task_id: &str) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        if let Some(entry) = lanes.get_mut(&lane) {
            entry.inflight.remove(task_id);
        }
        Ok(())
    }

    async fn recover_inflight(&self, lane: u32) -> Result<usize> {
        let mut lanes = self.lanes.lock().await;
        let entry = lanes.entry(lane).or_default();
        let leftovers: Vec<SearchTask> = entry.inflight.drain().map(|(_, task)| task).collect();
        for task in leftovers.iter().rev() {
            entry.items.push_front(task.clone());
        }
        Ok(leftovers.len())
    }

    async fn len(&self, lane: u32) -> Result<usize> {
        let lanes = self.lanes.lock().await;
        Ok(lanes.get(&lane).map_or(0, |entry| entry.items.len()))
    }

    async fn inflight_len(&self, lane: u32) -> Result<usize> {
        let lanes = self.lanes.lock().await;
        Ok(lanes.get(&lane).map_or(0, |entry| entry.inflight.len()))
    }

    async fn clear(&self, lane: u32) -> Result<()> {
        self.lanes.lock().await.remove(&lane);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::tests::location;

    fn task(survey_no: u32) -> SearchTask {
        SearchTask::new("session-1", location("7"), survey_no, "Ramesh", vec![])
    }

    #[tokio::test]
    async fn test_fifo_with_head_reinsertion() {
        let queue = MemoryTaskQueue::new(10);
        for n in 1..=3 {
            queue.push(0, &task(n)).await.unwrap();
        }

        let first = queue.pop(0, Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.survey_no, 1);

        // a retried survey goes back to the head so order stays increasing
        queue.push_front(0, &first).await.unwrap();
        let again = queue.pop(0, Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(again.survey_no, 1);
        queue.ack(0, &again.task_id).await.unwrap();

        let second = queue.pop(0, Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.survey_no, 2);
    }

    #[tokio::test]
    async fn test_lanes_are_isolated() {
        let queue = MemoryTaskQueue::new(10);
        queue.push(1, &task(1)).await.unwrap();

        assert!(queue.pop(0, Duration::from_millis(20)).await.unwrap().is_none());
        assert_eq!(queue.len(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty_lane() {
        let queue = MemoryTaskQueue::new(10);
        let start = std::time::Instant::now();
        assert!(queue.pop(0, Duration::from_millis(30)).await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_recover_inflight_requeues_at_head() {
        let queue = MemoryTaskQueue::new(10);
        queue.push(0, &task(4)).await.unwrap();
        queue.push(0, &task(5)).await.unwrap();

        let leased = queue.pop(0, Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(queue.inflight_len(0).await.unwrap(), 1);

        // consumer dies without acking
        assert_eq!(queue.recover_inflight(0).await.unwrap(), 1);
        assert_eq!(queue.inflight_len(0).await.unwrap(), 0);

        let next = queue.pop(0, Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(next.task_id, leased.task_id);
    }

    #[tokio::test]
    async fn test_push_waits_for_capacity() {
        let queue = Arc::new(MemoryTaskQueue::new(1));
        queue.push(0, &task(1)).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(0, &task(2)).await })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(0).await.unwrap(), 1);

        queue.pop(0, Duration::from_millis(20)).await.unwrap();
        producer.await.unwrap().unwrap();
        assert_eq!(queue.len(0).await.unwrap(), 1);
    }
}
