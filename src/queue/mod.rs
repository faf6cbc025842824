//! # Outbound Query Queue
//!
//! Bounded FIFO of outbound work, shared between arbitrary producer threads
//! and the single event-loop consumer. A query is owned by exactly one side
//! at a time: the producer until `enqueue` succeeds, the queue until
//! `dequeue`, then the worker until completion. On shutdown the queue is
//! locked against new inserts and flushed, dropping everything left.
//!
//! Deduplication is a best-effort coalescer: when a query carries a
//! `dedup_id`, an already-queued query with the same `(kind, dedup_id)` is
//! replaced in place, so the earlier queue position is kept (FIFO across
//! distinct classes is untouched) and the later payload wins.
//!
//! A second, smaller queue collects batchable binary messages until the
//! event-loop timer or the batch threshold converts them into one worker job.

pub mod inflight;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::session::topics::TopicId;
use crate::stats::LinkStats;

/// Batchable messages accumulate up to this count before a batch job fires.
pub const BATCH_THRESHOLD: usize = 64;

/// Outbound query kinds, one per encoder in [`crate::tx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum QueryKind {
    HttpApiV2 = 0,
    RegisterNode,
    NodeStateUpdate,
    UpdateNodeInfo,
    UpdateNodeCollectors,
    ChartDimsUpdate,
    ChartConfigUpdated,
    ChartReset,
    RetentionUpdated,
    AlarmLogHealth,
    AlarmProvideConfig,
    AlarmSnapshot,
    AlarmLogEntry,
    ContextsSnapshot,
    ContextsUpdated,
}

impl QueryKind {
    pub const ALL: &'static [QueryKind] = &[
        QueryKind::HttpApiV2,
        QueryKind::RegisterNode,
        QueryKind::NodeStateUpdate,
        QueryKind::UpdateNodeInfo,
        QueryKind::UpdateNodeCollectors,
        QueryKind::ChartDimsUpdate,
        QueryKind::ChartConfigUpdated,
        QueryKind::ChartReset,
        QueryKind::RetentionUpdated,
        QueryKind::AlarmLogHealth,
        QueryKind::AlarmProvideConfig,
        QueryKind::AlarmSnapshot,
        QueryKind::AlarmLogEntry,
        QueryKind::ContextsSnapshot,
        QueryKind::ContextsUpdated,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::HttpApiV2 => "http_api_request_v2",
            QueryKind::RegisterNode => "register_node",
            QueryKind::NodeStateUpdate => "node_state_update",
            QueryKind::UpdateNodeInfo => "update_node_info",
            QueryKind::UpdateNodeCollectors => "update_node_collectors",
            QueryKind::ChartDimsUpdate => "chart_and_dim_update",
            QueryKind::ChartConfigUpdated => "chart_config_updated",
            QueryKind::ChartReset => "reset_chart_messages",
            QueryKind::RetentionUpdated => "update_retention_info",
            QueryKind::AlarmLogHealth => "alarm_log_health",
            QueryKind::AlarmProvideConfig => "provide_alarm_config",
            QueryKind::AlarmSnapshot => "alarm_snapshot",
            QueryKind::AlarmLogEntry => "alarm_log_entry",
            QueryKind::ContextsSnapshot => "contexts_snapshot",
            QueryKind::ContextsUpdated => "contexts_updated",
        }
    }
}

/// Already-encoded binary payload with its target topic and a friendly name
/// for logs.
#[derive(Debug, Clone)]
pub struct BinPayload {
    pub topic: TopicId,
    pub msg_name: &'static str,
    pub bytes: Vec<u8>,
}

/// HTTP-style query extracted from a cloud `cmd` envelope. `raw` is the full
/// HTTP request text (request line plus headers), `path` the decoded query
/// target.
#[derive(Debug, Clone)]
pub struct HttpQuery {
    pub raw: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub enum QueryPayload {
    Bin(BinPayload),
    Http(HttpQuery),
}

/// One outbound unit of work.
#[derive(Debug, Clone)]
pub struct Query {
    pub kind: QueryKind,
    pub msg_id: Option<String>,
    pub callback_topic: Option<String>,
    pub dedup_id: Option<String>,
    pub created: Instant,
    /// Receive timestamp in microseconds, echoed back as `t-rx`.
    pub created_unix_us: i64,
    pub timeout: Option<Duration>,
    pub payload: QueryPayload,
}

impl Query {
    pub fn bin(kind: QueryKind, payload: BinPayload) -> Self {
        Self {
            kind,
            msg_id: None,
            callback_topic: None,
            dedup_id: None,
            created: Instant::now(),
            created_unix_us: chrono::Utc::now().timestamp_micros(),
            timeout: None,
            payload: QueryPayload::Bin(payload),
        }
    }

    /// Binary query that may coalesce with queued queries of the same kind
    /// and dedup id.
    pub fn bin_dedup(kind: QueryKind, payload: BinPayload, dedup_id: String) -> Self {
        let mut q = Self::bin(kind, payload);
        q.dedup_id = Some(dedup_id);
        q
    }

    pub fn http(
        msg_id: String,
        callback_topic: String,
        timeout: Duration,
        query: HttpQuery,
    ) -> Self {
        Self {
            kind: QueryKind::HttpApiV2,
            msg_id: Some(msg_id),
            callback_topic: Some(callback_topic),
            dedup_id: None,
            created: Instant::now(),
            created_unix_us: chrono::Utc::now().timestamp_micros(),
            timeout: Some(timeout),
            payload: QueryPayload::Http(query),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is locked; this is the normal case while the link prepares
    /// to shut down. The query is dropped.
    #[error("Query queue is blocked from accepting new requests")]
    Blocked,

    #[error("Query queue is full")]
    Full,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Query>,
    blocked: bool,
}

/// Thread-safe bounded FIFO with a shutdown barrier. One mutex guards the
/// list; the consumer parks on a [`Notify`].
#[derive(Debug)]
pub struct QueryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    stats: Arc<LinkStats>,
}

impl QueryQueue {
    pub fn new(capacity: usize, stats: Arc<LinkStats>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
            stats,
        }
    }

    /// Appends to the tail and wakes the consumer. While the queue is locked
    /// or full the query is dropped and an error reported to the caller.
    pub fn enqueue(&self, query: Query) -> Result<(), EnqueueError> {
        let kind = query.kind;
        {
            let mut inner = self.inner.lock().expect("query queue poisoned");
            if inner.blocked {
                return Err(EnqueueError::Blocked);
            }
            if let Some(dedup_id) = query.dedup_id.as_deref() {
                if let Some(slot) = inner
                    .items
                    .iter_mut()
                    .find(|q| q.kind == kind && q.dedup_id.as_deref() == Some(dedup_id))
                {
                    debug!("Coalescing queued {} query ({dedup_id})", kind.name());
                    *slot = query;
                    self.notify.notify_one();
                    return Ok(());
                }
            }
            if inner.items.len() >= self.capacity {
                warn!("Outbound query queue is full, dropping {}", kind.name());
                return Err(EnqueueError::Full);
            }
            inner.items.push_back(query);
        }
        self.stats.query_queued(kind);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the head, or `None` when empty.
    pub fn dequeue(&self) -> Option<Query> {
        self.inner
            .lock()
            .expect("query queue poisoned")
            .items
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("query queue poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arms the shutdown barrier; subsequent `enqueue` calls fail.
    pub fn lock(&self) {
        self.inner.lock().expect("query queue poisoned").blocked = true;
    }

    pub fn unlock(&self) {
        self.inner.lock().expect("query queue poisoned").blocked = false;
    }

    /// Drops every queued query.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("query queue poisoned");
        let dropped = inner.items.len();
        inner.items.clear();
        if dropped > 0 {
            debug!("Flushed {dropped} queued queries");
        }
    }

    /// Parks until a producer enqueues. Returns immediately when items are
    /// already queued.
    pub async fn wait_for_work(&self) {
        if !self.is_empty() {
            return;
        }
        self.notify.notified().await;
    }

    /// Manual consumer wake, used by the event-loop timer.
    pub fn wake_consumer(&self) {
        self.notify.notify_one();
    }
}

/// Accumulator for batchable outbound messages. Reaching
/// [`BATCH_THRESHOLD`] signals the caller to fire a batch job; the timer
/// flushes smaller batches.
#[derive(Debug, Default)]
pub struct BatchQueue {
    inner: Mutex<Vec<BinPayload>>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a payload, returning the new batch length.
    pub fn add(&self, payload: BinPayload) -> usize {
        let mut inner = self.inner.lock().expect("batch queue poisoned");
        inner.push(payload);
        inner.len()
    }

    /// Takes the whole batch, preserving insertion order.
    pub fn drain(&self) -> Vec<BinPayload> {
        std::mem::take(&mut *self.inner.lock().expect("batch queue poisoned"))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("batch queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue() -> QueryQueue {
        QueryQueue::new(64, Arc::new(LinkStats::new(false)))
    }

    fn bin_query(kind: QueryKind, marker: u8) -> Query {
        Query::bin(
            kind,
            BinPayload {
                topic: TopicId::AgentConnection,
                msg_name: kind.name(),
                bytes: vec![marker],
            },
        )
    }

    #[test]
    fn dequeue_order_equals_enqueue_order() {
        let queue = test_queue();
        for i in 0..10u8 {
            queue.enqueue(bin_query(QueryKind::NodeStateUpdate, i)).unwrap();
        }
        for i in 0..10u8 {
            let q = queue.dequeue().unwrap();
            match q.payload {
                QueryPayload::Bin(b) => assert_eq!(b.bytes, vec![i]),
                _ => panic!("unexpected payload"),
            }
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn locked_queue_rejects_and_flush_empties() {
        let queue = test_queue();
        queue.enqueue(bin_query(QueryKind::ChartReset, 1)).unwrap();
        queue.lock();
        assert_eq!(
            queue.enqueue(bin_query(QueryKind::ChartReset, 2)),
            Err(EnqueueError::Blocked)
        );
        queue.flush();
        assert!(queue.is_empty());
        queue.unlock();
        assert!(queue.enqueue(bin_query(QueryKind::ChartReset, 3)).is_ok());
    }

    #[test]
    fn full_queue_rejects() {
        let queue = QueryQueue::new(2, Arc::new(LinkStats::new(false)));
        queue.enqueue(bin_query(QueryKind::AlarmLogEntry, 0)).unwrap();
        queue.enqueue(bin_query(QueryKind::AlarmLogEntry, 1)).unwrap();
        assert_eq!(
            queue.enqueue(bin_query(QueryKind::AlarmLogEntry, 2)),
            Err(EnqueueError::Full)
        );
    }

    #[test]
    fn dedup_keeps_position_and_later_payload() {
        let queue = test_queue();
        queue
            .enqueue(bin_query(QueryKind::NodeStateUpdate, 0))
            .unwrap();
        queue
            .enqueue(Query::bin_dedup(
                QueryKind::AlarmLogHealth,
                BinPayload {
                    topic: TopicId::AlarmHealth,
                    msg_name: "AlarmLogHealth",
                    bytes: vec![1],
                },
                "node-a".into(),
            ))
            .unwrap();
        queue
            .enqueue(bin_query(QueryKind::ChartReset, 2))
            .unwrap();
        // same (kind, dedup) coalesces; the later payload replaces in place
        queue
            .enqueue(Query::bin_dedup(
                QueryKind::AlarmLogHealth,
                BinPayload {
                    topic: TopicId::AlarmHealth,
                    msg_name: "AlarmLogHealth",
                    bytes: vec![9],
                },
                "node-a".into(),
            ))
            .unwrap();
        assert_eq!(queue.len(), 3);
        queue.dequeue().unwrap();
        let second = queue.dequeue().unwrap();
        match second.payload {
            QueryPayload::Bin(b) => assert_eq!(b.bytes, vec![9]),
            _ => panic!("unexpected payload"),
        }
    }

    #[test]
    fn distinct_dedup_classes_do_not_coalesce() {
        let queue = test_queue();
        for node in ["a", "b"] {
            queue
                .enqueue(Query::bin_dedup(
                    QueryKind::AlarmLogHealth,
                    BinPayload {
                        topic: TopicId::AlarmHealth,
                        msg_name: "AlarmLogHealth",
                        bytes: vec![0],
                    },
                    node.into(),
                ))
                .unwrap();
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn batch_queue_reports_threshold() {
        let batch = BatchQueue::new();
        for i in 0..BATCH_THRESHOLD {
            let len = batch.add(BinPayload {
                topic: TopicId::ChartDimsUpdated,
                msg_name: "ChartsAndDimensionsUpdated",
                bytes: vec![i as u8],
            });
            assert_eq!(len, i + 1);
        }
        let drained = batch.drain();
        assert_eq!(drained.len(), BATCH_THRESHOLD);
        assert!(batch.is_empty());
        // FIFO within the batch
        assert_eq!(drained[0].bytes, vec![0]);
        assert_eq!(drained[BATCH_THRESHOLD - 1].bytes, vec![(BATCH_THRESHOLD - 1) as u8]);
    }
}
