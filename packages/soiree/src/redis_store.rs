//! Redis-backed event store and queue.
//!
//! Layout:
//!
//! ```text
//! soiree:events            list  every saved event (optional TTL)
//! soiree:queue             list  events waiting for the bus consumer
//! soiree:results           list  listener outcomes (optional TTL)
//! soiree:dedup:{event_id}  set   listener ids that succeeded for the event
//! ```

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::Event;
use crate::store::{EventQueue, EventStore, HandlerResultDeduper, StoredEvent, StoredResult};

pub const EVENTS_KEY: &str = "soiree:events";
pub const QUEUE_KEY: &str = "soiree:queue";
pub const RESULTS_KEY: &str = "soiree:results";

/// How long one BLPOP waits before re-checking cancellation.
const DEQUEUE_POLL_SECS: f64 = 1.0;

pub fn dedup_key(event_id: &str) -> String {
    format!("soiree:dedup:{}", event_id)
}

/// Persists events and results in Redis and serves as the bus queue.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// BLPOP gets its own connection so it never stalls writes.
    queue_conn: Mutex<Option<MultiplexedConnection>>,
    events_ttl: Option<Duration>,
    results_ttl: Option<Duration>,
    dedup_ttl: Option<Duration>,
}

impl RedisStore {
    pub async fn connect(client: redis::Client) -> anyhow::Result<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        Ok(Self {
            client,
            conn,
            queue_conn: Mutex::new(None),
            events_ttl: None,
            results_ttl: None,
            dedup_ttl: None,
        })
    }

    pub async fn open(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Self::connect(client).await
    }

    pub fn with_events_ttl(mut self, ttl: Duration) -> Self {
        self.events_ttl = Some(ttl);
        self
    }

    pub fn with_results_ttl(mut self, ttl: Duration) -> Self {
        self.results_ttl = Some(ttl);
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = Some(ttl);
        self
    }

    /// Every persisted event, oldest first.
    pub async fn events(&self) -> anyhow::Result<Vec<Event>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(EVENTS_KEY, 0, -1).await?;

        raw.iter()
            .map(|data| decode_event(data))
            .collect()
    }

    /// Every persisted listener result, oldest first.
    pub async fn results(&self) -> anyhow::Result<Vec<StoredResult>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(RESULTS_KEY, 0, -1).await?;

        raw.iter()
            .map(|data| serde_json::from_str(data).context("invalid stored result"))
            .collect()
    }

    async fn blpop(&self) -> anyhow::Result<Option<String>> {
        let mut guard = self.queue_conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        // A BLPOP dropped mid-flight leaves the connection unusable, so it is
        // only put back after a completed round trip.
        let popped: Option<(String, String)> = conn.blpop(QUEUE_KEY, DEQUEUE_POLL_SECS).await?;
        *guard = Some(conn);

        Ok(popped.map(|(_, data)| data))
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

fn decode_event(data: &str) -> anyhow::Result<Event> {
    let stored: StoredEvent = serde_json::from_str(data).context("invalid stored event")?;
    Ok(stored.into())
}

#[async_trait]
impl EventStore for RedisStore {
    async fn save_event(&self, event: &Event) -> anyhow::Result<()> {
        let data = serde_json::to_string(&StoredEvent::from(event))?;

        let mut pipe = redis::pipe();
        pipe.rpush(EVENTS_KEY, &data).ignore();
        if let Some(ttl) = self.events_ttl {
            pipe.expire(EVENTS_KEY, ttl_secs(ttl)).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.context("failed to save event")?;

        debug!(topic = event.topic(), event_id = ?event.event_id(), "event persisted to redis");
        Ok(())
    }

    async fn save_handler_result(
        &self,
        event: &Event,
        handler_id: &str,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let result = StoredResult::new(event, handler_id, error);
        let data = serde_json::to_string(&result)?;

        let mut pipe = redis::pipe();
        pipe.rpush(RESULTS_KEY, &data).ignore();
        if let Some(ttl) = self.results_ttl {
            pipe.expire(RESULTS_KEY, ttl_secs(ttl)).ignore();
        }

        if result.succeeded() && !result.event_id.is_empty() && !handler_id.is_empty() {
            let key = dedup_key(&result.event_id);
            pipe.sadd(&key, handler_id).ignore();
            if let Some(ttl) = self.dedup_ttl {
                pipe.expire(&key, ttl_secs(ttl)).ignore();
            }
        }

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("failed to save handler result")?;

        Ok(())
    }
}

#[async_trait]
impl EventQueue for RedisStore {
    async fn enqueue_event(&self, event: &Event) -> anyhow::Result<()> {
        let data = serde_json::to_string(&StoredEvent::from(event))?;

        let mut conn = self.conn.clone();
        let _: () = conn.rpush(QUEUE_KEY, data).await.context("failed to enqueue event")?;

        debug!(topic = event.topic(), event_id = ?event.event_id(), "event queued in redis");
        Ok(())
    }

    async fn dequeue_event(&self, cancel: &CancellationToken) -> anyhow::Result<Option<Event>> {
        loop {
            let popped = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                popped = self.blpop() => popped?,
            };

            if let Some(data) = popped {
                return decode_event(&data).map(Some);
            }
        }
    }
}

#[async_trait]
impl HandlerResultDeduper for RedisStore {
    async fn handler_succeeded(&self, event_id: &str, handler_id: &str) -> anyhow::Result<bool> {
        if event_id.trim().is_empty() || handler_id.trim().is_empty() {
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(dedup_key(event_id), handler_id).await?;
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PROPERTY_EVENT_ID;
    use serde_json::json;

    #[test]
    fn test_dedup_key() {
        assert_eq!(dedup_key("evt-1"), "soiree:dedup:evt-1");
    }

    #[test]
    fn test_decode_event_restores_properties() {
        let data = r#"{"topic":"orders.placed","payload":{"id":3},"properties":{"event_id":"evt-9"}}"#;
        let event = decode_event(data).unwrap();

        assert_eq!(event.topic(), "orders.placed");
        assert_eq!(event.payload(), &json!({"id": 3}));
        assert_eq!(event.property(PROPERTY_EVENT_ID), Some(&json!("evt-9")));
    }

    #[test]
    fn test_decode_event_without_payload() {
        let event = decode_event(r#"{"topic":"ping"}"#).unwrap();
        assert!(event.payload().is_null());
    }

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }
}
