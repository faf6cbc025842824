//! # Inbound Message Router
//!
//! Routes publishes arriving on subscribed topics to per-type handlers. The
//! message type is the final `/`-delimited segment of the topic; lookup goes
//! through a fixed dispatch table keyed by a 32-bit name hash. Hashes are
//! computed once at startup and checked for collisions — a collision is a
//! programming error and refuses to start the link.
//!
//! Handlers decode the payload (protobuf for the binary protocol, JSON for
//! the legacy `cmd` envelope) and either forward the command to a
//! collaborator or enqueue a follow-up query. Unknown names bump an error
//! counter and are dropped.

use prost::Message;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::proto::agent::DisconnectReq;
use crate::proto::alarm::{
    SendAlarmConfiguration, SendAlarmLogHealth, SendAlarmSnapshot, StartAlarmStreaming,
};
use crate::proto::chart::{ChartsAndDimensionsAck, StreamChartsAndDimensions, UpdateChartConfigs};
use crate::proto::context::{ContextsCheckpoint, StopStreamingContexts};
use crate::proto::node::{CreateNodeInstance, CreateNodeInstanceResult, UpdateNodeInstanceConnection};
use crate::queue::{HttpQuery, Query};
use crate::tx;
use crate::{Collaborators, LinkShared};

/// Minimum `cmd` envelope version this handler can answer.
const CLOUD_REQ_MIN_VERSION: i32 = 2;
const V2_PAYLOAD_SEPARATOR: &[u8] = b"\r\n\r\n";
const V2_REQUEST_PREFIX: &str = "GET /";

#[derive(Debug, Error)]
pub enum RouterError {
    /// Two table entries hash alike; the table must be fixed at compile
    /// time, so this is fatal.
    #[error("Dispatch table hash collision: \"{first}\" clashes with \"{second}\"")]
    HashCollision {
        first: &'static str,
        second: &'static str,
    },
}

/// The hash the dispatch table is keyed by (FNV-1a, 32 bit).
pub fn simple_hash(name: &str) -> u32 {
    let mut hval: u32 = 0x811c9dc5;
    for byte in name.bytes() {
        hval = hval.wrapping_mul(0x0100_0193);
        hval ^= byte as u32;
    }
    hval
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxKind {
    Cmd,
    CreateNodeInstanceResult,
    SendNodeInstances,
    StreamChartsAndDimensions,
    ChartsAndDimensionsAck,
    UpdateChartConfigs,
    StartAlarmStreaming,
    SendAlarmLogHealth,
    SendAlarmConfiguration,
    SendAlarmSnapshot,
    DisconnectReq,
    ContextsCheckpoint,
    StopStreamingContexts,
}

const RX_MESSAGES: &[(&str, RxKind)] = &[
    ("cmd", RxKind::Cmd),
    ("CreateNodeInstanceResult", RxKind::CreateNodeInstanceResult),
    ("SendNodeInstances", RxKind::SendNodeInstances),
    ("StreamChartsAndDimensions", RxKind::StreamChartsAndDimensions),
    ("ChartsAndDimensionsAck", RxKind::ChartsAndDimensionsAck),
    ("UpdateChartConfigs", RxKind::UpdateChartConfigs),
    ("StartAlarmStreaming", RxKind::StartAlarmStreaming),
    ("SendAlarmLogHealth", RxKind::SendAlarmLogHealth),
    ("SendAlarmConfiguration", RxKind::SendAlarmConfiguration),
    ("SendAlarmSnapshot", RxKind::SendAlarmSnapshot),
    ("DisconnectReq", RxKind::DisconnectReq),
    ("ContextsCheckpoint", RxKind::ContextsCheckpoint),
    ("StopStreamingContexts", RxKind::StopStreamingContexts),
];

struct RxEntry {
    name: &'static str,
    hash: u32,
    kind: RxKind,
}

/// Precomputed dispatch table.
pub struct Router {
    table: Vec<RxEntry>,
}

impl Router {
    pub fn new() -> Result<Self, RouterError> {
        let mut table: Vec<RxEntry> = Vec::with_capacity(RX_MESSAGES.len());
        for (name, kind) in RX_MESSAGES {
            let hash = simple_hash(name);
            if let Some(existing) = table.iter().find(|e| e.hash == hash) {
                return Err(RouterError::HashCollision {
                    first: name,
                    second: existing.name,
                });
            }
            table.push(RxEntry {
                name,
                hash,
                kind: *kind,
            });
        }
        Ok(Self { table })
    }

    fn lookup(&self, name: &str) -> Option<&RxEntry> {
        // hash match is enough: collisions were ruled out at startup
        let hash = simple_hash(name);
        self.table.iter().find(|e| e.hash == hash)
    }
}

/// Legacy JSON command envelope, the prefix of every `cmd` publish.
#[derive(Debug, Deserialize)]
struct CmdEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "msg-id")]
    msg_id: Option<String>,
    #[serde(rename = "callback-topic")]
    callback_topic: Option<String>,
    /// Milliseconds the cloud is willing to wait.
    timeout: Option<u64>,
    version: Option<i32>,
}

/// Router plus the collaborator seams its handlers need.
pub struct Dispatcher {
    router: Router,
    collaborators: Collaborators,
}

impl Dispatcher {
    pub fn new(collaborators: Collaborators) -> Result<Self, RouterError> {
        let router = Router::new()?;
        info!("Inbound dispatch table ready ({} handlers)", RX_MESSAGES.len());
        Ok(Self {
            router,
            collaborators,
        })
    }

    /// Entry point for every publish received on a subscribed topic.
    pub fn handle(&self, shared: &LinkShared, topic: &str, payload: &[u8]) {
        if shared.shutdown.is_cancelled() || shared.disconnect_requested() {
            debug!("Dropping inbound message on {topic}: link is tearing down");
            return;
        }
        shared.stats.cloud_request_received();

        let message_type = topic.rsplit('/').next().unwrap_or(topic);
        let Some(entry) = self.router.lookup(message_type) else {
            error!("Do not know how to handle message of type \"{message_type}\". Ignoring");
            shared.stats.cloud_request_error();
            return;
        };
        debug!("Got message named \"{}\" from cloud", entry.name);

        let outcome = match entry.kind {
            RxKind::Cmd => self.handle_cmd(shared, payload),
            RxKind::CreateNodeInstanceResult => self.handle_node_created(shared, payload),
            RxKind::SendNodeInstances => self.handle_send_node_instances(shared),
            RxKind::StreamChartsAndDimensions => self.handle_stream_charts(payload),
            RxKind::ChartsAndDimensionsAck => self.handle_charts_ack(payload),
            RxKind::UpdateChartConfigs => self.handle_update_chart_configs(payload),
            RxKind::StartAlarmStreaming => self.handle_start_alarm_streaming(payload),
            RxKind::SendAlarmLogHealth => self.handle_send_alarm_log_health(payload),
            RxKind::SendAlarmConfiguration => self.handle_send_alarm_config(shared, payload),
            RxKind::SendAlarmSnapshot => self.handle_send_alarm_snapshot(shared, payload),
            RxKind::DisconnectReq => self.handle_disconnect_req(shared, payload),
            RxKind::ContextsCheckpoint => self.handle_contexts_checkpoint(shared, payload),
            RxKind::StopStreamingContexts => self.handle_stop_streaming_contexts(payload),
        };
        if let Err(reason) = outcome {
            error!("Error handling {}: {reason}", entry.name);
            shared.stats.cloud_request_error();
        }
    }

    /// Legacy envelope: `http` requests become v2 queries, `cancel` retracts
    /// an in-flight request.
    fn handle_cmd(&self, shared: &LinkShared, payload: &[u8]) -> Result<(), String> {
        let mut stream =
            serde_json::Deserializer::from_slice(payload).into_iter::<CmdEnvelope>();
        let envelope = stream
            .next()
            .ok_or("empty cmd message")?
            .map_err(|e| format!("malformed cmd envelope: {e}"))?;
        let rest = &payload[stream.byte_offset()..];

        match envelope.kind.as_str() {
            "http" => self.handle_http_cmd(shared, envelope, rest),
            "cancel" => {
                let msg_id = envelope.msg_id.ok_or("cancel without msg-id")?;
                if shared.inflight.cancel(&msg_id) {
                    info!("Cloud cancelled pending request {msg_id}");
                } else {
                    debug!("Cancel for unknown request {msg_id}");
                }
                Ok(())
            }
            other => Err(format!("only 'http' and 'cancel' cmd messages are supported, got '{other}'")),
        }
    }

    fn handle_http_cmd(
        &self,
        shared: &LinkShared,
        envelope: CmdEnvelope,
        rest: &[u8],
    ) -> Result<(), String> {
        let version = envelope.version.unwrap_or(0);
        if version < CLOUD_REQ_MIN_VERSION {
            return Err(format!(
                "cannot reply to request with version older than {CLOUD_REQ_MIN_VERSION}, received {version}"
            ));
        }
        let msg_id = envelope.msg_id.ok_or("missing msg-id")?;
        let callback_topic = envelope.callback_topic.ok_or("missing callback-topic")?;

        let separator = rest
            .windows(V2_PAYLOAD_SEPARATOR.len())
            .position(|w| w == V2_PAYLOAD_SEPARATOR)
            .ok_or("payload separator missing after the JSON dictionary")?;
        let http_raw = std::str::from_utf8(&rest[separator + V2_PAYLOAD_SEPARATOR.len()..])
            .map_err(|_| "request payload is not UTF-8")?;

        if !http_raw.starts_with(V2_REQUEST_PREFIX) {
            return Err(format!(
                "only accepting requests that start with \"{V2_REQUEST_PREFIX}\""
            ));
        }
        let line_end = http_raw
            .find(" HTTP/1.1\r\n")
            .ok_or("doesn't look like an HTTP GET request")?;
        let path = http_raw["GET ".len()..line_end].to_string();

        let timeout =
            std::time::Duration::from_millis(envelope.timeout.unwrap_or(60_000));
        let query = Query::http(
            msg_id,
            callback_topic,
            timeout,
            HttpQuery {
                raw: http_raw.to_string(),
                path,
            },
        );
        shared
            .queue
            .enqueue(query)
            .map_err(|e| format!("enqueue failed: {e}"))
    }

    /// Persist the allocated node id, then tell the cloud how that node is
    /// doing right now.
    fn handle_node_created(&self, shared: &LinkShared, payload: &[u8]) -> Result<(), String> {
        let result = CreateNodeInstanceResult::decode(payload)
            .map_err(|e| format!("error parsing CreateNodeInstanceResult: {e}"))?;
        if result.machine_guid.is_empty() || result.node_id.is_empty() {
            return Err("CreateNodeInstanceResult misses machine_guid or node_id".into());
        }
        debug!(
            "CreateNodeInstanceResult: guid:{} nodeid:{}",
            result.machine_guid, result.node_id
        );
        self.collaborators
            .nodes
            .update_node_id(&result.machine_guid, &result.node_id);

        let claim_id = shared.claim_id().ok_or("not claimed")?;
        let node = self
            .collaborators
            .nodes
            .find_by_guid(&result.machine_guid);
        let (live, hops, queryable) = node
            .map(|n| (n.live, n.hops, n.queryable))
            .unwrap_or((false, 1, true));

        let update = UpdateNodeInstanceConnection {
            claim_id,
            node_id: result.node_id,
            live,
            queryable,
            session_id: shared.session_id(),
            hops,
            capabilities: shared.capabilities().to_vec(),
        };
        shared
            .queue
            .enqueue(tx::node_state_update(update))
            .map_err(|e| format!("enqueue failed: {e}"))
    }

    /// Enumerate known nodes: registration for the ones the cloud has not
    /// seen, a state update for the rest.
    fn handle_send_node_instances(&self, shared: &LinkShared) -> Result<(), String> {
        let claim_id = shared.claim_id().ok_or("not claimed")?;
        let session_id = shared.session_id();
        for node in self.collaborators.nodes.nodes() {
            let query = match &node.node_id {
                Some(node_id) => tx::node_state_update(UpdateNodeInstanceConnection {
                    claim_id: claim_id.clone(),
                    node_id: node_id.clone(),
                    live: node.live,
                    queryable: node.queryable,
                    session_id,
                    hops: node.hops,
                    capabilities: shared.capabilities().to_vec(),
                }),
                None => tx::register_node(CreateNodeInstance {
                    claim_id: claim_id.clone(),
                    machine_guid: node.machine_guid.clone(),
                    hostname: node.hostname.clone(),
                    hops: node.hops,
                }),
            };
            if let Err(e) = shared.queue.enqueue(query) {
                warn!("Dropping node instance message: {e}");
            }
        }
        Ok(())
    }

    fn handle_stream_charts(&self, payload: &[u8]) -> Result<(), String> {
        let cmd = StreamChartsAndDimensions::decode(payload)
            .map_err(|e| format!("error parsing StreamChartsAndDimensions: {e}"))?;
        if cmd.claim_id.is_empty() || cmd.node_id.is_empty() {
            return Err("StreamChartsAndDimensions misses claim_id or node_id".into());
        }
        self.collaborators.metrics.start_chart_streaming(
            &cmd.node_id,
            cmd.sequence_id,
            cmd.seq_id_created_at,
            cmd.batch_id,
        );
        Ok(())
    }

    fn handle_charts_ack(&self, payload: &[u8]) -> Result<(), String> {
        let ack = ChartsAndDimensionsAck::decode(payload)
            .map_err(|e| format!("error parsing ChartsAndDimensionsAck: {e}"))?;
        self.collaborators
            .metrics
            .ack_chart_sequence(&ack.node_id, ack.last_sequence_id);
        Ok(())
    }

    fn handle_update_chart_configs(&self, payload: &[u8]) -> Result<(), String> {
        let cmd = UpdateChartConfigs::decode(payload)
            .map_err(|e| format!("error parsing UpdateChartConfigs: {e}"))?;
        self.collaborators
            .metrics
            .provide_chart_configs(&cmd.config_hashes);
        Ok(())
    }

    fn handle_start_alarm_streaming(&self, payload: &[u8]) -> Result<(), String> {
        let cmd = StartAlarmStreaming::decode(payload)
            .map_err(|e| format!("error parsing StartAlarmStreaming: {e}"))?;
        if cmd.node_id.is_empty() {
            return Err("StartAlarmStreaming misses node_id".into());
        }
        self.collaborators.alerts.start_alert_streaming(
            &cmd.node_id,
            cmd.batch_id,
            cmd.start_sequence_id,
        );
        Ok(())
    }

    fn handle_send_alarm_log_health(&self, payload: &[u8]) -> Result<(), String> {
        let cmd = SendAlarmLogHealth::decode(payload)
            .map_err(|e| format!("error parsing SendAlarmLogHealth: {e}"))?;
        if cmd.node_id.is_empty() {
            return Err("SendAlarmLogHealth misses node_id".into());
        }
        self.collaborators.alerts.send_alarm_log_health(&cmd.node_id);
        Ok(())
    }

    fn handle_send_alarm_config(&self, shared: &LinkShared, payload: &[u8]) -> Result<(), String> {
        let cmd = SendAlarmConfiguration::decode(payload)
            .map_err(|e| format!("error parsing SendAlarmConfiguration: {e}"))?;
        if cmd.config_hash.is_empty() {
            return Err("SendAlarmConfiguration misses config_hash".into());
        }
        let Some(config) = self.collaborators.alerts.alarm_configuration(&cmd.config_hash)
        else {
            return Err(format!("no alarm configuration for hash {}", cmd.config_hash));
        };
        shared
            .queue
            .enqueue(tx::provide_alarm_config(config))
            .map_err(|e| format!("enqueue failed: {e}"))
    }

    fn handle_send_alarm_snapshot(
        &self,
        shared: &LinkShared,
        payload: &[u8],
    ) -> Result<(), String> {
        let cmd = SendAlarmSnapshot::decode(payload)
            .map_err(|e| format!("error parsing SendAlarmSnapshot: {e}"))?;
        if cmd.node_id.is_empty() || cmd.claim_id.is_empty() {
            return Err("SendAlarmSnapshot misses node_id or claim_id".into());
        }
        let Some(snapshot) = self.collaborators.alerts.alarm_snapshot(
            &cmd.node_id,
            &cmd.claim_id,
            cmd.snapshot_id,
            cmd.sequence_id,
        ) else {
            return Err("alert engine produced no snapshot".into());
        };
        shared
            .queue
            .enqueue(tx::alarm_snapshot(snapshot))
            .map_err(|e| format!("enqueue failed: {e}"))
    }

    /// Honored literally: permaban disables the link until restart, a
    /// reconnect-after delay arms the block, and the session goes down
    /// gracefully either way.
    fn handle_disconnect_req(&self, shared: &LinkShared, payload: &[u8]) -> Result<(), String> {
        let cmd = DisconnectReq::decode(payload)
            .map_err(|e| format!("error parsing DisconnectReq: {e}"))?;
        if cmd.permaban {
            error!("Cloud banned this agent!");
            shared.disable_runtime();
        }
        info!(
            "Cloud requested disconnect (EC={}, \"{}\")",
            cmd.error_code, cmd.error_description
        );
        if cmd.reconnect_after_seconds > 0 {
            info!(
                "Cloud asks not to reconnect for {} seconds. We shall honor that request",
                cmd.reconnect_after_seconds
            );
            shared.block_for(std::time::Duration::from_secs(cmd.reconnect_after_seconds));
        }
        shared.request_disconnect();
        Ok(())
    }

    /// The checkpoint carries the cloud's context version hash; when the
    /// engine finds it stale it supplies a full snapshot to re-send.
    fn handle_contexts_checkpoint(
        &self,
        shared: &LinkShared,
        payload: &[u8],
    ) -> Result<(), String> {
        let cmd = ContextsCheckpoint::decode(payload)
            .map_err(|e| format!("error parsing ContextsCheckpoint: {e}"))?;
        if let Some(snapshot) = self.collaborators.metrics.contexts_checkpoint(cmd) {
            shared
                .queue
                .enqueue(tx::contexts_snapshot(snapshot))
                .map_err(|e| format!("enqueue failed: {e}"))?;
        }
        Ok(())
    }

    fn handle_stop_streaming_contexts(&self, payload: &[u8]) -> Result<(), String> {
        let cmd = StopStreamingContexts::decode(payload)
            .map_err(|e| format!("error parsing StopStreamingContexts: {e}"))?;
        self.collaborators.metrics.stop_streaming_contexts(cmd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::queue::QueryKind;
    use prost::Message as _;
    use std::sync::Arc;

    fn test_shared() -> Arc<LinkShared> {
        let config = LinkConfig {
            cloud_base_url: "https://cloud.example".into(),
            statistics: true,
            ..Default::default()
        };
        let url = config.validate().unwrap();
        let shared = LinkShared::new(config, url);
        shared.set_claim_id("claim-1".into());
        shared
    }

    #[test]
    fn dispatch_table_hashes_are_unique() {
        // the same property Router::new enforces, checked explicitly
        for (i, (a, _)) in RX_MESSAGES.iter().enumerate() {
            for (b, _) in &RX_MESSAGES[i + 1..] {
                assert_ne!(simple_hash(a), simple_hash(b), "{a} vs {b}");
            }
        }
        assert!(Router::new().is_ok());
    }

    #[test]
    fn unknown_message_is_dropped_and_counted() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        dispatcher.handle(&shared, "/agent/claim-1/inbox/NoSuchThing", b"payload");
        let snap = shared.stats.snapshot();
        assert_eq!(snap.cloud_req_err, 1);
        assert_eq!(snap.cloud_req_recvd, 1);
    }

    #[test]
    fn http_cmd_is_enqueued_as_v2_query() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        let payload = concat!(
            r#"{"type":"http","msg-id":"m1","callback-topic":"t/cb","timeout":5000,"version":2}"#,
            "\r\n\r\n",
            "GET /api/v1/info HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n"
        );
        dispatcher.handle(&shared, "/inbox/cmd", payload.as_bytes());

        let query = shared.queue.dequeue().expect("query enqueued");
        assert_eq!(query.kind, QueryKind::HttpApiV2);
        assert_eq!(query.msg_id.as_deref(), Some("m1"));
        assert_eq!(query.callback_topic.as_deref(), Some("t/cb"));
        match query.payload {
            crate::queue::QueryPayload::Http(http) => {
                assert_eq!(http.path, "/api/v1/info");
                assert!(http.raw.starts_with("GET /api/v1/info HTTP/1.1"));
            }
            _ => panic!("expected http payload"),
        }
    }

    #[test]
    fn http_cmd_with_old_version_is_rejected() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        let payload = concat!(
            r#"{"type":"http","msg-id":"m1","callback-topic":"t/cb","version":1}"#,
            "\r\n\r\nGET /x HTTP/1.1\r\n\r\n"
        );
        dispatcher.handle(&shared, "/inbox/cmd", payload.as_bytes());
        assert!(shared.queue.dequeue().is_none());
        assert_eq!(shared.stats.snapshot().cloud_req_err, 1);
    }

    #[test]
    fn cancel_cmd_flips_inflight_flag() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        let flag = shared.inflight.add("m1");
        let payload = r#"{"type":"cancel","msg-id":"m1"}"#;
        dispatcher.handle(&shared, "/inbox/cmd", payload.as_bytes());
        assert!(flag.is_cancelled());
    }

    #[test]
    fn disconnect_req_applies_block_and_permaban() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        let cmd = DisconnectReq {
            reconnect_after_seconds: 30,
            permaban: true,
            error_code: 7,
            error_description: "be gone".into(),
        };
        dispatcher.handle(
            &shared,
            "/inbox/DisconnectReq",
            &cmd.encode_to_vec(),
        );
        assert!(shared.is_disabled());
        assert!(shared.disconnect_requested());
        assert!(shared.blocked_remaining().unwrap() > std::time::Duration::from_secs(25));
    }

    #[test]
    fn node_created_enqueues_state_update() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        let result = CreateNodeInstanceResult {
            node_id: "node-1".into(),
            machine_guid: "guid-1".into(),
        };
        dispatcher.handle(
            &shared,
            "/inbox/CreateNodeInstanceResult",
            &result.encode_to_vec(),
        );
        let query = shared.queue.dequeue().expect("state update enqueued");
        assert_eq!(query.kind, QueryKind::NodeStateUpdate);
    }

    #[test]
    fn contexts_checkpoint_enqueues_snapshot_when_stale() {
        use crate::proto::context::ContextsSnapshot;

        struct StaleContexts;
        impl crate::MetricsEngine for StaleContexts {
            fn start_chart_streaming(&self, _: &str, _: u64, _: i64, _: u64) {}
            fn ack_chart_sequence(&self, _: &str, _: u64) {}
            fn provide_chart_configs(&self, _: &[String]) {}
            fn contexts_checkpoint(&self, cmd: ContextsCheckpoint) -> Option<ContextsSnapshot> {
                Some(ContextsSnapshot {
                    claim_id: cmd.claim_id,
                    node_id: cmd.node_id,
                    version: 5,
                    contexts: vec![],
                })
            }
            fn stop_streaming_contexts(&self, _: StopStreamingContexts) {}
        }

        let mut collaborators = Collaborators::noop();
        collaborators.metrics = Arc::new(StaleContexts);
        let dispatcher = Dispatcher::new(collaborators).unwrap();
        let shared = test_shared();

        let cmd = ContextsCheckpoint {
            claim_id: "claim-1".into(),
            node_id: "node-1".into(),
            version_hash: 9,
        };
        dispatcher.handle(&shared, "/inbox/ContextsCheckpoint", &cmd.encode_to_vec());

        let query = shared.queue.dequeue().expect("snapshot enqueued");
        assert_eq!(query.kind, QueryKind::ContextsSnapshot);
    }

    #[test]
    fn contexts_checkpoint_with_fresh_hash_enqueues_nothing() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        let cmd = ContextsCheckpoint {
            claim_id: "claim-1".into(),
            node_id: "node-1".into(),
            version_hash: 9,
        };
        dispatcher.handle(&shared, "/inbox/ContextsCheckpoint", &cmd.encode_to_vec());
        assert!(shared.queue.dequeue().is_none());
    }

    #[test]
    fn teardown_drops_inbound() {
        let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
        let shared = test_shared();
        shared.request_disconnect();
        let payload = r#"{"type":"cancel","msg-id":"m1"}"#;
        dispatcher.handle(&shared, "/inbox/cmd", payload.as_bytes());
        // nothing counted: the message was dropped before dispatch
        assert_eq!(shared.stats.snapshot().cloud_req_recvd, 0);
    }
}
