//! # cloudlink
//!
//! Client subsystem maintaining a persistent, authenticated, bidirectional
//! channel between a monitoring agent and its cloud control plane, speaking
//! MQTT 3.1.1 over WebSockets over TLS.
//!
//! ## Module Architecture
//!
//! ```text
//! net/       - ring buffer, proxy resolution, blocking HTTPS helper
//! otp        - /env discovery and the OTP challenge/response exchange
//! session/   - topic cache, reconnection backoff, connection lifecycle
//! queue/     - outbound query queue, batch queue, in-flight tracker
//! dispatch/  - inbound router, HTTP-query execution, command event loop
//! tx         - outbound encoders and the publish path
//! proto/     - binary message types (the serialization layer)
//! ```
//!
//! ## Runtime Shape
//!
//! Two long-lived tasks cooperate around [`LinkShared`]:
//! the **lifecycle task** owns the MQTT client and walks the connection
//! state machine (claim wait, bootstrap, connect, serve, disconnect,
//! backoff), and the **command loop** owns the worker pool, the timers and
//! the outbound queue consumer. Producer threads interact only through the
//! thread-safe [`LinkHandle`] surface.
//!
//! External engines (metrics database, alert engine, context engine, local
//! web API) are collaborators injected as trait objects; the link never
//! reaches into them beyond these seams.

pub mod config;
pub mod dispatch;
pub mod identity;
pub mod net;
pub mod otp;
pub mod proto;
pub mod queue;
pub mod session;
pub mod stats;
pub mod tx;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rumqttc::AsyncClient;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigError, LinkConfig};
use crate::dispatch::eventloop::{CommandLoop, LinkCommand};
use crate::dispatch::router::RouterError;
use crate::identity::IdentityError;
use crate::proto::agent::Capability;
use crate::proto::alarm::{AlarmSnapshot, ProvideAlarmConfiguration};
use crate::proto::context::{
    ContextsCheckpoint, ContextsSnapshot, ContextsUpdated, StopStreamingContexts,
};
use crate::proto::node::CollectorInfo;
use crate::queue::inflight::InFlightTracker;
use crate::queue::{BatchQueue, BinPayload, EnqueueError, Query, QueryQueue, BATCH_THRESHOLD};
use crate::session::lifecycle;
use crate::session::topics::TopicCache;
use crate::stats::{LinkStats, StatsSnapshot};

/// Depth bound of the outbound query queue.
pub const QUERY_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Result of one local web-API query executed on behalf of the cloud.
#[derive(Debug, Clone)]
pub struct WebApiResponse {
    pub code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Local HTTP-style query executor (the agent's web API).
pub trait WebApi: Send + Sync {
    fn execute(&self, path: &str) -> WebApiResponse;
}

/// One monitored host in the agent's scope.
#[derive(Debug, Clone, Default)]
pub struct NodeInstanceInfo {
    pub machine_guid: String,
    /// Cloud-allocated node id, once known.
    pub node_id: Option<String>,
    pub hostname: String,
    pub live: bool,
    pub queryable: bool,
    /// Streaming hops from this agent; 0 for the local host.
    pub hops: i32,
}

/// Node inventory collaborator: enumeration and node-id persistence.
pub trait NodeRegistry: Send + Sync {
    fn nodes(&self) -> Vec<NodeInstanceInfo>;
    fn find_by_guid(&self, machine_guid: &str) -> Option<NodeInstanceInfo>;
    /// Persists a cloud-allocated node id for a machine guid.
    fn update_node_id(&self, machine_guid: &str, node_id: &str);
    fn collectors(&self, node_id: &str) -> Vec<CollectorInfo>;
}

/// Alert/health engine collaborator. Commands received from the cloud are
/// forwarded here; the engine replies by enqueueing messages through the
/// [`LinkHandle`] it holds.
pub trait AlertEngine: Send + Sync {
    fn start_alert_streaming(&self, node_id: &str, batch_id: u64, start_sequence_id: u64);
    fn send_alarm_log_health(&self, node_id: &str);
    fn alarm_configuration(&self, config_hash: &str) -> Option<ProvideAlarmConfiguration>;
    fn alarm_snapshot(
        &self,
        node_id: &str,
        claim_id: &str,
        snapshot_id: u64,
        sequence_id: u64,
    ) -> Option<AlarmSnapshot>;
    /// Periodic alert push across all hosts.
    fn push_alerts(&self);
    /// Periodic node-info-and-collectors freshness check.
    fn check_node_metadata(&self);
}

/// Metrics database / context engine collaborator. Incremental
/// context-stream updates are pushed by the engine through
/// [`LinkHandle::push_contexts_updated`] as contexts change.
pub trait MetricsEngine: Send + Sync {
    fn start_chart_streaming(
        &self,
        node_id: &str,
        sequence_id: u64,
        seq_id_created_at: i64,
        batch_id: u64,
    );
    fn ack_chart_sequence(&self, node_id: &str, last_sequence_id: u64);
    fn provide_chart_configs(&self, hashes: &[String]);
    /// Processes the cloud's context checkpoint. Returns a full snapshot
    /// when the cloud's version hash is stale and the stream must restart
    /// from scratch.
    fn contexts_checkpoint(&self, cmd: ContextsCheckpoint) -> Option<ContextsSnapshot>;
    fn stop_streaming_contexts(&self, cmd: StopStreamingContexts);
}

/// Bundle of collaborator seams injected at link construction.
#[derive(Clone)]
pub struct Collaborators {
    pub web_api: Arc<dyn WebApi>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub alerts: Arc<dyn AlertEngine>,
    pub metrics: Arc<dyn MetricsEngine>,
}

impl Collaborators {
    /// Inert collaborators for the demo binary and tests.
    pub fn noop() -> Self {
        struct Noop;
        impl WebApi for Noop {
            fn execute(&self, _path: &str) -> WebApiResponse {
                WebApiResponse {
                    code: 404,
                    content_type: "text/plain".into(),
                    body: b"not wired".to_vec(),
                }
            }
        }
        impl NodeRegistry for Noop {
            fn nodes(&self) -> Vec<NodeInstanceInfo> {
                Vec::new()
            }
            fn find_by_guid(&self, _machine_guid: &str) -> Option<NodeInstanceInfo> {
                None
            }
            fn update_node_id(&self, _machine_guid: &str, _node_id: &str) {}
            fn collectors(&self, _node_id: &str) -> Vec<CollectorInfo> {
                Vec::new()
            }
        }
        impl AlertEngine for Noop {
            fn start_alert_streaming(&self, _: &str, _: u64, _: u64) {}
            fn send_alarm_log_health(&self, _: &str) {}
            fn alarm_configuration(&self, _: &str) -> Option<ProvideAlarmConfiguration> {
                None
            }
            fn alarm_snapshot(&self, _: &str, _: &str, _: u64, _: u64) -> Option<AlarmSnapshot> {
                None
            }
            fn push_alerts(&self) {}
            fn check_node_metadata(&self) {}
        }
        impl MetricsEngine for Noop {
            fn start_chart_streaming(&self, _: &str, _: u64, _: i64, _: u64) {}
            fn ack_chart_sequence(&self, _: &str, _: u64) {}
            fn provide_chart_configs(&self, _: &[String]) {}
            fn contexts_checkpoint(&self, _: ContextsCheckpoint) -> Option<ContextsSnapshot> {
                None
            }
            fn stop_streaming_contexts(&self, _: StopStreamingContexts) {}
        }
        let noop = Arc::new(Noop);
        Self {
            web_api: noop.clone(),
            nodes: noop.clone(),
            alerts: noop.clone(),
            metrics: noop,
        }
    }
}

/// Capability set announced to the cloud.
pub fn default_capabilities() -> Vec<Capability> {
    vec![
        Capability {
            name: "proto".into(),
            version: 1,
            enabled: true,
        },
        Capability {
            name: "ml".into(),
            version: 0,
            enabled: false,
        },
        Capability {
            name: "mc".into(),
            version: 0,
            enabled: false,
        },
        Capability {
            name: "ctx".into(),
            version: 1,
            enabled: true,
        },
    ]
}

/// State shared between the lifecycle task, the command loop, workers and
/// producers. The lifecycle task is the only writer of the connection
/// fields; everything else reads through atomics or short-lived locks.
pub struct LinkShared {
    pub config: LinkConfig,
    pub cloud_url: url::Url,
    pub stats: Arc<LinkStats>,
    pub queue: Arc<QueryQueue>,
    pub batch: Arc<BatchQueue>,
    pub inflight: Arc<InFlightTracker>,
    pub shutdown: CancellationToken,
    capabilities: Vec<Capability>,

    connected: AtomicBool,
    online: AtomicBool,
    disabled_runtime: AtomicBool,
    disconnect_requested: AtomicBool,
    kill_link: AtomicBool,
    /// Connection counter; incremented on every established connection.
    connection_counter: AtomicU32,
    /// Session start, microseconds since the epoch. Zero when never connected.
    session_id_us: AtomicI64,
    pubacks_this_session: AtomicU32,

    blocked_until: Mutex<Option<Instant>>,
    claim_id: RwLock<Option<String>>,
    client: RwLock<Option<AsyncClient>>,
    topics: RwLock<Option<Arc<TopicCache>>>,
}

impl LinkShared {
    pub(crate) fn new(config: LinkConfig, cloud_url: url::Url) -> Arc<Self> {
        let stats = Arc::new(LinkStats::new(config.statistics));
        Arc::new(Self {
            stats: stats.clone(),
            queue: Arc::new(QueryQueue::new(QUERY_QUEUE_DEPTH, stats)),
            batch: Arc::new(BatchQueue::new()),
            inflight: Arc::new(InFlightTracker::new()),
            shutdown: CancellationToken::new(),
            capabilities: default_capabilities(),
            config,
            cloud_url,
            connected: AtomicBool::new(false),
            online: AtomicBool::new(false),
            disabled_runtime: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            kill_link: AtomicBool::new(false),
            connection_counter: AtomicU32::new(0),
            session_id_us: AtomicI64::new(0),
            pubacks_this_session: AtomicU32::new(0),
            blocked_until: Mutex::new(None),
            claim_id: RwLock::new(None),
            client: RwLock::new(None),
            topics: RwLock::new(None),
        })
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_runtime.load(Ordering::Acquire)
    }

    /// Permanently disables the link until process restart.
    pub fn disable_runtime(&self) {
        self.disabled_runtime.store(true, Ordering::Release);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    pub fn request_disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::Release);
    }

    pub fn kill_link_requested(&self) -> bool {
        self.kill_link.load(Ordering::Acquire)
    }

    /// Forces the current session down so it reconnects with fresh settings.
    pub fn request_reconnect(&self) {
        self.kill_link.store(true, Ordering::Release);
    }

    pub fn session_id(&self) -> i64 {
        self.session_id_us.load(Ordering::Acquire)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.connection_counter.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Starts a new session: fresh timestamp, cleared per-session state.
    /// Called by the lifecycle just before the MQTT connect, so the LWT and
    /// every message of the session carry the same id.
    pub fn begin_session(&self) -> i64 {
        let now_us = chrono::Utc::now().timestamp_micros();
        self.session_id_us.store(now_us, Ordering::Release);
        self.pubacks_this_session.store(0, Ordering::Release);
        self.disconnect_requested.store(false, Ordering::Release);
        self.kill_link.store(false, Ordering::Release);
        now_us
    }

    pub fn connection_established(&self) {
        self.connection_counter.fetch_add(1, Ordering::AcqRel);
        self.connected.store(true, Ordering::Release);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Release);
        self.online.store(false, Ordering::Release);
        *self.client.write().expect("client lock poisoned") = None;
    }

    /// Counts a PUBACK for the current session, returning the new total.
    pub fn puback_received(&self) -> u32 {
        self.stats.puback();
        self.pubacks_this_session.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn pubacks(&self) -> u32 {
        self.pubacks_this_session.load(Ordering::Acquire)
    }

    pub fn block_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut blocked = self.blocked_until.lock().expect("block lock poisoned");
        // keep the later of the two when blocks stack
        *blocked = Some(blocked.map_or(until, |existing| existing.max(until)));
    }

    pub fn blocked_remaining(&self) -> Option<Duration> {
        let mut blocked = self.blocked_until.lock().expect("block lock poisoned");
        match *blocked {
            Some(until) if until > Instant::now() => Some(until - Instant::now()),
            Some(_) => {
                *blocked = None;
                None
            }
            None => None,
        }
    }

    pub fn claim_id(&self) -> Option<String> {
        self.claim_id.read().expect("claim lock poisoned").clone()
    }

    pub fn set_claim_id(&self, claim_id: String) {
        *self.claim_id.write().expect("claim lock poisoned") = Some(claim_id);
    }

    pub fn client(&self) -> Option<AsyncClient> {
        self.client.read().expect("client lock poisoned").clone()
    }

    pub fn install_client(&self, client: AsyncClient) {
        *self.client.write().expect("client lock poisoned") = Some(client);
    }

    pub fn topics(&self) -> Option<Arc<TopicCache>> {
        self.topics.read().expect("topics lock poisoned").clone()
    }

    /// Installs a freshly built topic cache. Only the lifecycle task calls
    /// this, and only between sessions, so no worker publishes against a
    /// half-built cache.
    pub fn install_topics(&self, topics: Arc<TopicCache>) {
        *self.topics.write().expect("topics lock poisoned") = Some(topics);
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            online: self.is_online(),
            reconnect_count: self.reconnect_count(),
            claim_id: self.claim_id(),
            cloud_base_url: self.cloud_url.to_string(),
            protocol: "MQTT 3.1.1 over WSS",
            banned_by_cloud: self.is_disabled(),
            session_id_us: self.session_id(),
            stats: self.stats.enabled().then(|| self.stats.snapshot()),
        }
    }
}

/// Read-only status snapshot feeding the agent's state JSON.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub online: bool,
    pub reconnect_count: u32,
    pub claim_id: Option<String>,
    pub cloud_base_url: String,
    pub protocol: &'static str,
    pub banned_by_cloud: bool,
    pub session_id_us: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
}

/// Handle to a running link: the producer surface for collaborators and the
/// owner of the background tasks.
pub struct LinkHandle {
    shared: Arc<LinkShared>,
    commands: mpsc::Sender<LinkCommand>,
    lifecycle: tokio::task::JoinHandle<()>,
    command_loop: tokio::task::JoinHandle<()>,
}

impl LinkHandle {
    /// Validates the configuration, builds the dispatch table (failing on a
    /// hash collision) and spawns the lifecycle and command-loop tasks.
    pub fn spawn(
        config: LinkConfig,
        collaborators: Collaborators,
    ) -> Result<LinkHandle, LinkError> {
        let cloud_url = config.validate()?;
        let dispatcher = Arc::new(dispatch::router::Dispatcher::new(collaborators.clone())?);

        let shared = LinkShared::new(config, cloud_url);
        let (commands, command_rx) = mpsc::channel(256);

        let command_loop = CommandLoop::new(shared.clone(), collaborators.clone(), command_rx);
        let command_loop = tokio::spawn(command_loop.run());

        let lifecycle = tokio::spawn(lifecycle::run_lifecycle(shared.clone(), dispatcher));

        info!("Agent-cloud link spawned");
        Ok(LinkHandle {
            shared,
            commands,
            lifecycle,
            command_loop,
        })
    }

    pub fn shared(&self) -> Arc<LinkShared> {
        self.shared.clone()
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.status()
    }

    /// Thread-safe producer entry point: enqueues one outbound query and
    /// wakes the consumer.
    pub fn enqueue(&self, query: Query) -> Result<(), EnqueueError> {
        self.shared.queue.enqueue(query)
    }

    /// Adds a batchable message; fires a batch job when the threshold fills.
    pub fn enqueue_batched(&self, payload: BinPayload) {
        if self.shared.batch.add(payload) >= BATCH_THRESHOLD {
            let _ = self.commands.try_send(LinkCommand::QueryBatchExecute);
        }
    }

    /// Producer route for incremental context-stream updates. The context
    /// engine pushes these as contexts change, outside any inbound trigger.
    pub fn push_contexts_updated(&self, msg: ContextsUpdated) -> Result<(), EnqueueError> {
        self.enqueue(tx::contexts_updated(msg))
    }

    /// Posts a command into the event loop.
    pub fn command(&self, command: LinkCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    /// Cooperative shutdown: stop accepting work, cancel in-flight queries,
    /// give workers up to their drain window, then tear the tasks down.
    pub async fn shutdown(self) {
        info!("Link shutdown requested");
        let _ = self.commands.send(LinkCommand::Shutdown).await;
        self.shared.shutdown.cancel();
        let _ = self.command_loop.await;
        let _ = self.lifecycle.await;
        info!("Link shut down");
    }
}
