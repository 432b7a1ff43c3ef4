//! The message template: thin, atomic operations over Redis lists and
//! sorted sets, plus the Lua-scripted moves every higher layer builds on.
//!
//! [`RawStore`] knows about Redis key layout and operates purely in terms
//! of message ids; it backs the scheduler and the reaper, neither of
//! which ever need to see a payload. [`MessageTemplate`] wraps a
//! `RawStore` with a [`CodecChain`] and adds the operations that do need
//! the payload: `enqueue`, `pop_ready`, `ack_processing`, `re_enqueue`,
//! `move_to_dlq`. Between the two, they are the only code in the crate
//! that issues Redis commands directly.

use crate::codec::CodecChain;
use crate::error::Error;
use crate::keys::{meta_key, QueueKeys};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError, Script, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Create a [`ConnectionManager`] for `redis`, the shared connection every
/// loop and worker in a [`Container`](crate::container::Container) uses.
pub async fn connect<S: IntoConnectionInfo>(redis: S) -> Result<ConnectionManager, RedisError> {
    let client = Client::open(redis.into_connection_info()?)?;
    client.get_connection_manager().await
}

/// A message's stable, unique identifier. Immutable across retries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId(value)
    }
}

/// A message, with its payload decoded to `T`.
///
/// `retry_count` is monotonically non-decreasing across a message's
/// lifetime: once it exceeds a mapping's `num_retries`, the message is
/// never returned to a ready list again (ß3 invariant).
#[derive(Clone, Debug)]
pub struct Message<T> {
    pub id: MessageId,
    pub payload: T,
    pub queue: String,
    /// Scheduled-at, ms epoch. `0` if the message was enqueued immediately.
    pub process_at: i64,
    /// Ms epoch at creation.
    pub enqueued_at: i64,
    pub retry_count: u32,
    /// Ms epoch of the last retry or dead-letter move, if any.
    pub re_enqueued_at: Option<i64>,
}

/// A message with its payload still in wire form, as read straight off
/// the metadata hash.
#[derive(Clone, Debug)]
struct RawMessage {
    id: MessageId,
    payload: Vec<u8>,
    queue: String,
    process_at: i64,
    enqueued_at: i64,
    retry_count: u32,
    re_enqueued_at: Option<i64>,
}

impl RawMessage {
    fn decode<T: DeserializeOwned>(self, codec: &CodecChain<T>) -> Result<Message<T>, Error> {
        let payload = codec.decode(&self.payload)?;
        Ok(Message {
            id: self.id,
            payload,
            queue: self.queue,
            process_at: self.process_at,
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
            re_enqueued_at: self.re_enqueued_at,
        })
    }
}

/// Parse the `{id, {field, value, ...}}` shape returned by `pop_ready.lua`.
fn parse_pop_ready(value: Value) -> Result<Option<RawMessage>, Error> {
    let top = match value {
        Value::Array(v) if !v.is_empty() => v,
        Value::Nil | Value::Array(_) => return Ok(None),
        other => {
            return Err(Error::Infrastructure(RedisError::from((
                redis::ErrorKind::TypeError,
                "unexpected reply for pop_ready",
                format!("{other:?}"),
            ))))
        }
    };

    let mut iter = top.into_iter();
    let id = match iter.next() {
        Some(Value::BulkString(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => return Ok(None),
    };

    let fields = match iter.next() {
        Some(Value::Array(fields)) => fields,
        _ => Vec::new(),
    };

    let mut payload = Vec::new();
    let mut queue = String::new();
    let mut process_at = 0i64;
    let mut enqueued_at = 0i64;
    let mut retry_count = 0u32;
    let mut re_enqueued_at = None;

    let mut pairs = fields.into_iter();
    while let (Some(key), Some(val)) = (pairs.next(), pairs.next()) {
        let key = bulk_string(key);
        match key.as_str() {
            "payload" => payload = bulk_bytes(val),
            "queue" => queue = bulk_string(val),
            "process_at" => process_at = bulk_string(val).parse().unwrap_or(0),
            "enqueued_at" => enqueued_at = bulk_string(val).parse().unwrap_or(0),
            "retry_count" => retry_count = bulk_string(val).parse().unwrap_or(0),
            "re_enqueued_at" => re_enqueued_at = bulk_string(val).parse().ok(),
            _ => {}
        }
    }

    Ok(Some(RawMessage {
        id: MessageId::from(id),
        payload,
        queue,
        process_at,
        enqueued_at,
        retry_count,
        re_enqueued_at,
    }))
}

fn bulk_bytes(value: Value) -> Vec<u8> {
    match value {
        Value::BulkString(bytes) => bytes,
        Value::Int(i) => i.to_string().into_bytes(),
        _ => Vec::new(),
    }
}

fn bulk_string(value: Value) -> String {
    String::from_utf8_lossy(&bulk_bytes(value)).into_owned()
}

/// What `pop_ready` found.
#[derive(Clone, Debug)]
pub enum PopOutcome<T> {
    /// A message whose payload decoded cleanly.
    Message(Message<T>),
    /// A message was dequeued, but no configured codec could decode its
    /// payload. The message is already in the processing set; only its
    /// id and retry count are known.
    UndecodablePayload { id: MessageId, retry_count: u32 },
}

/// Outcome of a `promote_delayed` or `reap_processing` sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepOutcome {
    pub moved: usize,
    /// The score (ms epoch) of the earliest entry still waiting, if any.
    /// Lets a loop size its next sleep instead of polling blind.
    pub next_due_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    List,
    ZSet,
    None,
}

#[derive(Clone)]
struct RawScripts {
    promote_delayed: Script,
    reap_processing: Script,
    move_zset_to_zset: Script,
    move_zset_to_list: Script,
    move_list_to_list: Script,
}

/// Id-only, codec-free Redis operations. Backs the scheduler, the reaper,
/// and the read-only admin surfaces (`readFrom*`, `size`, `type`, bulk
/// moves). Cheap to clone: the connection manager multiplexes internally.
#[derive(Clone)]
pub struct RawStore {
    conn: ConnectionManager,
    scripts: RawScripts,
}

impl RawStore {
    pub fn new(conn: ConnectionManager) -> Self {
        RawStore {
            conn,
            scripts: RawScripts {
                promote_delayed: Script::new(include_str!("../lua/promote_delayed.lua")),
                reap_processing: Script::new(include_str!("../lua/reap_processing.lua")),
                move_zset_to_zset: Script::new(include_str!("../lua/move_zset_to_zset.lua")),
                move_zset_to_list: Script::new(include_str!("../lua/move_zset_to_list.lua")),
                move_list_to_list: Script::new(include_str!("../lua/move_list_to_list.lua")),
            },
        }
    }

    /// Promote all due entries from `<queue>:delayed` into `<queue>`.
    pub async fn promote_delayed(
        &self,
        keys: &QueueKeys,
        now_ms: i64,
        limit: usize,
    ) -> Result<SweepOutcome, Error> {
        let (moved, next): (usize, Option<i64>) = self
            .scripts
            .promote_delayed
            .key(keys.delayed_set())
            .key(keys.ready_list())
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(SweepOutcome {
            moved,
            next_due_ms: next,
        })
    }

    /// Reap all visibility-expired entries from `<queue>:processing` back
    /// into `<queue>`, incrementing each message's retry count.
    pub async fn reap_processing(
        &self,
        keys: &QueueKeys,
        now_ms: i64,
        limit: usize,
    ) -> Result<SweepOutcome, Error> {
        let (moved, next): (usize, Option<i64>) = self
            .scripts
            .reap_processing
            .key(keys.processing_set())
            .key(keys.ready_list())
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(SweepOutcome {
            moved,
            next_due_ms: next,
        })
    }

    /// `TYPE key`, narrowed to the two structures the broker uses.
    pub async fn key_type(&self, key: &str) -> Result<KeyType, Error> {
        let kind: String = redis::cmd("TYPE")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(match kind.as_str() {
            "list" => KeyType::List,
            "zset" => KeyType::ZSet,
            _ => KeyType::None,
        })
    }

    /// `LLEN` or `ZCARD`, whichever fits the key's structure.
    pub async fn size(&self, key: &str) -> Result<usize, Error> {
        match self.key_type(key).await? {
            KeyType::List => Ok(redis::cmd("LLEN")
                .arg(key)
                .query_async(&mut self.conn.clone())
                .await?),
            KeyType::ZSet => Ok(redis::cmd("ZCARD")
                .arg(key)
                .query_async(&mut self.conn.clone())
                .await?),
            KeyType::None => Ok(0),
        }
    }

    /// Read-only pagination over a list, used by the admin view
    /// collaborator.
    pub async fn read_from_list(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<String>, Error> {
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    /// Read-only pagination over a sorted set, used by the admin view
    /// collaborator.
    pub async fn read_from_zset(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<String>, Error> {
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    /// Same as [`read_from_zset`](Self::read_from_zset), but paired with
    /// each member's score.
    pub async fn read_from_zset_with_score(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<(String, f64)>, Error> {
        let flat: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .arg("WITHSCORES")
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].parse().unwrap_or_default()))
            .collect())
    }

    /// Bulk-move up to `limit` lowest-scored entries between two sorted
    /// sets, for the external admin move surface. `fixed_score`, when
    /// given, overwrites the destination score; otherwise the source
    /// score is kept.
    pub async fn move_zset_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        fixed_score: Option<i64>,
    ) -> Result<usize, Error> {
        let score_arg = fixed_score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "keep".to_string());
        Ok(self
            .scripts
            .move_zset_to_zset
            .key(src)
            .key(dst)
            .arg(limit)
            .arg(score_arg)
            .invoke_async(&mut self.conn.clone())
            .await?)
    }

    /// Bulk-move up to `limit` entries from a sorted set into a list.
    pub async fn move_zset_to_list(&self, src: &str, dst: &str, limit: usize) -> Result<usize, Error> {
        Ok(self
            .scripts
            .move_zset_to_list
            .key(src)
            .key(dst)
            .arg(limit)
            .invoke_async(&mut self.conn.clone())
            .await?)
    }

    /// Bulk-move up to `limit` entries from one list into another.
    pub async fn move_list_to_list(&self, src: &str, dst: &str, limit: usize) -> Result<usize, Error> {
        Ok(self
            .scripts
            .move_list_to_list
            .key(src)
            .key(dst)
            .arg(limit)
            .invoke_async(&mut self.conn.clone())
            .await?)
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[derive(Clone)]
struct MessageScripts {
    enqueue: Script,
    pop_ready: Script,
    ack_processing: Script,
    re_enqueue: Script,
    move_to_dlq: Script,
}

/// The full, codec-aware message template described in ß4.1: `enqueue`,
/// `pop_ready`, `ack_processing`, `re_enqueue`, `move_to_dlq`. Generic
/// over the payload type so callers get back decoded [`Message<T>`]
/// values rather than raw bytes.
pub struct MessageTemplate<T> {
    raw: RawStore,
    scripts: MessageScripts,
    codec: CodecChain<T>,
}

impl<T> Clone for MessageTemplate<T> {
    fn clone(&self) -> Self {
        MessageTemplate {
            raw: self.raw.clone(),
            scripts: self.scripts.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> MessageTemplate<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(conn: ConnectionManager, codec: CodecChain<T>) -> Self {
        MessageTemplate {
            raw: RawStore::new(conn),
            scripts: MessageScripts {
                enqueue: Script::new(include_str!("../lua/enqueue.lua")),
                pop_ready: Script::new(include_str!("../lua/pop_ready.lua")),
                ack_processing: Script::new(include_str!("../lua/ack_processing.lua")),
                re_enqueue: Script::new(include_str!("../lua/re_enqueue.lua")),
                move_to_dlq: Script::new(include_str!("../lua/move_to_dlq.lua")),
            },
            codec,
        }
    }

    /// The id-only substrate shared with the scheduler and the reaper.
    pub fn raw_store(&self) -> &RawStore {
        &self.raw
    }

    /// Push `payload` onto `queue`. Goes straight to the ready list if
    /// `process_at <= now`, otherwise into the delayed set.
    pub async fn enqueue(
        &self,
        keys: &QueueKeys,
        payload: &T,
        process_at: i64,
    ) -> Result<MessageId, Error> {
        self.enqueue_with_retry_count(keys, payload, process_at, 0).await
    }

    /// Like [`enqueue`](Self::enqueue), but `process_at` is an absolute
    /// epoch-ms timestamp; the caller's queue must be registered as
    /// delayed if this is in the future.
    pub async fn enqueue_at(
        &self,
        keys: &QueueKeys,
        payload: &T,
        epoch_ms: i64,
    ) -> Result<MessageId, Error> {
        self.enqueue(keys, payload, epoch_ms).await
    }

    /// Like [`enqueue`](Self::enqueue), with `process_at` computed as
    /// `now + delay`.
    pub async fn enqueue_in(
        &self,
        keys: &QueueKeys,
        payload: &T,
        delay: Duration,
    ) -> Result<MessageId, Error> {
        let at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.enqueue(keys, payload, at).await
    }

    /// Like [`enqueue`](Self::enqueue), overriding the message's starting
    /// `retry_count` rather than the default of `0`.
    pub async fn enqueue_with_retry(
        &self,
        keys: &QueueKeys,
        payload: &T,
        process_at: i64,
        retry_count: u32,
    ) -> Result<MessageId, Error> {
        self.enqueue_with_retry_count(keys, payload, process_at, retry_count)
            .await
    }

    async fn enqueue_with_retry_count(
        &self,
        keys: &QueueKeys,
        payload: &T,
        process_at: i64,
        retry_count: u32,
    ) -> Result<MessageId, Error> {
        let id = MessageId::new();
        let now = Utc::now().timestamp_millis();
        let bytes = self.codec.encode(payload)?;

        let _: i64 = self
            .scripts
            .enqueue
            .key(keys.ready_list())
            .key(keys.delayed_set())
            .arg(id.as_str())
            .arg(bytes)
            .arg(keys.queue())
            .arg(process_at)
            .arg(now)
            .arg(retry_count)
            .arg(now)
            .invoke_async(&mut self.raw.connection())
            .await?;
        Ok(id)
    }

    /// Pop the next ready message and move it into the processing set
    /// with a visibility deadline of `now + visibility`.
    ///
    /// A codec failure is not an infrastructure error: the message has
    /// already been moved into the processing set, so it is reported as
    /// [`PopOutcome::UndecodablePayload`] rather than `Err`, letting the
    /// caller route it to the discard/DLQ path by id (ß7: codec errors
    /// are a terminal handler-level failure, not a retried one).
    pub async fn pop_ready(
        &self,
        keys: &QueueKeys,
        visibility: Duration,
    ) -> Result<Option<PopOutcome<T>>, Error> {
        let deadline = Utc::now().timestamp_millis() + visibility.as_millis() as i64;
        let reply: Value = self
            .scripts
            .pop_ready
            .key(keys.ready_list())
            .key(keys.processing_set())
            .arg(deadline)
            .invoke_async(&mut self.raw.connection())
            .await?;

        let raw = match parse_pop_ready(reply)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let id = raw.id.clone();
        let retry_count = raw.retry_count;
        match raw.decode(&self.codec) {
            Ok(message) => Ok(Some(PopOutcome::Message(message))),
            Err(_) => Ok(Some(PopOutcome::UndecodablePayload { id, retry_count })),
        }
    }

    /// Idempotently remove a message from the processing set.
    pub async fn ack_processing(&self, keys: &QueueKeys, id: &MessageId) -> Result<(), Error> {
        let _: i64 = self
            .scripts
            .ack_processing
            .key(keys.processing_set())
            .arg(id.as_str())
            .invoke_async(&mut self.raw.connection())
            .await?;
        Ok(())
    }

    /// Remove a message from the processing set and place it back in the
    /// ready list (`delay == 0`) or the delayed set (`delay > 0`),
    /// incrementing its retry count.
    pub async fn re_enqueue(
        &self,
        keys: &QueueKeys,
        id: &MessageId,
        delay: Duration,
    ) -> Result<(), Error> {
        let now = Utc::now().timestamp_millis();
        let _: i64 = self
            .scripts
            .re_enqueue
            .key(keys.processing_set())
            .key(keys.ready_list())
            .key(keys.delayed_set())
            .arg(id.as_str())
            .arg(delay.as_millis() as i64)
            .arg(now)
            .invoke_async(&mut self.raw.connection())
            .await?;
        Ok(())
    }

    /// Remove a message from the processing set and push it onto `dlq`,
    /// stamping `re_enqueued_at`.
    pub async fn move_to_dlq(
        &self,
        keys: &QueueKeys,
        dlq: &str,
        id: &MessageId,
    ) -> Result<(), Error> {
        let now = Utc::now().timestamp_millis();
        let _: i64 = self
            .scripts
            .move_to_dlq
            .key(keys.processing_set())
            .key(dlq)
            .arg(id.as_str())
            .arg(now)
            .invoke_async(&mut self.raw.connection())
            .await?;
        Ok(())
    }

    /// Fetch a message's metadata by id without removing it from
    /// whichever structure currently holds it.
    pub async fn fetch_meta(&self, id: &MessageId) -> Result<Option<Message<T>>, Error> {
        let key = meta_key(id.as_str());
        let fields: Vec<(String, Vec<u8>)> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut self.raw.connection())
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        let mut queue = String::new();
        let mut process_at = 0i64;
        let mut enqueued_at = 0i64;
        let mut retry_count = 0u32;
        let mut re_enqueued_at = None;
        for (field, value) in fields {
            let value_str = || String::from_utf8_lossy(&value).into_owned();
            match field.as_str() {
                "payload" => payload = value,
                "queue" => queue = value_str(),
                "process_at" => process_at = value_str().parse().unwrap_or(0),
                "enqueued_at" => enqueued_at = value_str().parse().unwrap_or(0),
                "retry_count" => retry_count = value_str().parse().unwrap_or(0),
                "re_enqueued_at" => re_enqueued_at = value_str().parse().ok(),
                _ => {}
            }
        }
        let raw = RawMessage {
            id: id.clone(),
            payload,
            queue,
            process_at,
            enqueued_at,
            retry_count,
            re_enqueued_at,
        };
        Ok(Some(raw.decode(&self.codec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    async fn setup() -> MessageTemplate<String> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
        let conn = connect(redis_url).await.expect("connect to redis");
        MessageTemplate::new(conn, CodecChain::new(vec![Arc::new(JsonCodec)]).unwrap())
    }

    async fn flush(template: &MessageTemplate<String>) {
        let _: String = redis::cmd("FLUSHDB")
            .query_async(&mut template.raw.connection())
            .await
            .expect("flushdb");
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn enqueue_then_pop_ready_round_trips_payload() {
        let template = setup().await;
        flush(&template).await;
        let keys = QueueKeys::new("q1");

        let id = template
            .enqueue(&keys, &"A".to_string(), 0)
            .await
            .expect("enqueue");

        let popped = match template
            .pop_ready(&keys, Duration::from_secs(30))
            .await
            .expect("pop_ready")
            .expect("message present")
        {
            PopOutcome::Message(m) => m,
            PopOutcome::UndecodablePayload { .. } => panic!("payload should have decoded"),
        };

        assert_eq!(popped.id, id);
        assert_eq!(popped.payload, "A");
        assert_eq!(popped.retry_count, 0);
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn ack_processing_is_idempotent() {
        let template = setup().await;
        flush(&template).await;
        let keys = QueueKeys::new("q1");

        template.enqueue(&keys, &"A".to_string(), 0).await.unwrap();
        let msg = match template
            .pop_ready(&keys, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
        {
            PopOutcome::Message(m) => m,
            PopOutcome::UndecodablePayload { .. } => panic!("payload should have decoded"),
        };

        template.ack_processing(&keys, &msg.id).await.unwrap();
        template.ack_processing(&keys, &msg.id).await.unwrap();

        assert_eq!(template.raw.size(&keys.processing_set()).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn delayed_message_is_not_ready_before_its_time() {
        let template = setup().await;
        flush(&template).await;
        let keys = QueueKeys::new("q1");

        let future = Utc::now().timestamp_millis() + 2_000;
        template.enqueue(&keys, &"B".to_string(), future).await.unwrap();

        let popped = template.pop_ready(&keys, Duration::from_secs(30)).await.unwrap();
        assert!(popped.is_none());
        assert_eq!(template.raw.size(&keys.delayed_set()).await.unwrap(), 1);
    }
}
