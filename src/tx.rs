//! # Outbound Encoders and Publish Path
//!
//! One constructor per outbound message type, each encoding a typed record
//! into a [`BinPayload`] targeting a logical topic, plus the publish helpers
//! that resolve the topic through the cache and hand the bytes to the
//! transport at QoS 1.
//!
//! HTTP-query replies use their own wire framing: a JSON envelope
//! (`type`, `msg-id`, `t-exec`, `t-rx`, `http-code`), the literal
//! `\r\n\r\n` separator, then the raw (optionally gzipped) HTTP response.

use prost::Message;
use rumqttc::QoS;
use thiserror::Error;
use tracing::debug;

use crate::proto::agent::UpdateAgentConnection;
use crate::proto::alarm::{
    AlarmLogEntry, AlarmLogHealth, AlarmSnapshot, ProvideAlarmConfiguration,
};
use crate::proto::chart::{
    ChartConfigsUpdated, ChartsAndDimensionsUpdated, ResetChartMessages, RetentionUpdated,
};
use crate::proto::context::{ContextsSnapshot, ContextsUpdated};
use crate::proto::node::{
    CreateNodeInstance, UpdateNodeCollectors, UpdateNodeInfo, UpdateNodeInstanceConnection,
};
use crate::queue::{BinPayload, Query, QueryKind};
use crate::session::topics::TopicId;
use crate::LinkShared;

/// Upper bound for one outbound publish.
pub const MAX_PUBLISH_SIZE: usize = 25 * 1024 * 1024;

// Cloud error codes carried in HTTP-query error replies.
pub const EC_SND_TIMEOUT: u32 = 5;
pub const EMSG_SND_TIMEOUT: &str = "Query timed out before it could be processed";
pub const EC_ZLIB_ERROR: u32 = 6;
pub const EMSG_ZLIB_ERROR: &str = "Error during zlib compression";
pub const EC_REQ_REPLY_TOO_BIG: u32 = 7;
pub const EMSG_REQ_REPLY_TOO_BIG: &str =
    "Request reply produces message bigger than allowed maximum";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not connected to the cloud")]
    NotConnected,

    #[error("No topic cached for {0:?}")]
    NoTopic(TopicId),

    #[error("Message of {0} bytes exceeds the publish size limit")]
    TooBig(usize),

    #[error("Transport rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Encodes the agent-connection update, also used as the LWT payload with
/// `lwt = true` and `reachable = false`.
pub fn agent_connection_payload(
    claim_id: &str,
    session_id: i64,
    reachable: bool,
    lwt: bool,
    capabilities: &[crate::proto::agent::Capability],
) -> Vec<u8> {
    UpdateAgentConnection {
        claim_id: claim_id.to_string(),
        reachable,
        lwt,
        session_id,
        capabilities: capabilities.to_vec(),
    }
    .encode_to_vec()
}

pub fn register_node(msg: CreateNodeInstance) -> Query {
    let dedup = msg.machine_guid.clone();
    Query::bin_dedup(
        QueryKind::RegisterNode,
        BinPayload {
            topic: TopicId::CreateNodeInstance,
            msg_name: "CreateNodeInstance",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

pub fn node_state_update(msg: UpdateNodeInstanceConnection) -> Query {
    let dedup = msg.node_id.clone();
    Query::bin_dedup(
        QueryKind::NodeStateUpdate,
        BinPayload {
            topic: TopicId::NodeInstanceConnection,
            msg_name: "UpdateNodeInstanceConnection",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

pub fn node_info(msg: UpdateNodeInfo) -> Query {
    let dedup = msg.node_id.clone();
    Query::bin_dedup(
        QueryKind::UpdateNodeInfo,
        BinPayload {
            topic: TopicId::NodeInstanceInfo,
            msg_name: "UpdateNodeInfo",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

pub fn node_collectors(msg: UpdateNodeCollectors) -> Query {
    let dedup = msg.node_id.clone();
    Query::bin_dedup(
        QueryKind::UpdateNodeCollectors,
        BinPayload {
            topic: TopicId::NodeInstanceCollectors,
            msg_name: "UpdateNodeCollectors",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

/// Chart updates are batchable; the caller routes them through the batch
/// queue rather than the main FIFO.
pub fn charts_and_dims_updated(msg: ChartsAndDimensionsUpdated) -> BinPayload {
    BinPayload {
        topic: TopicId::ChartDimsUpdated,
        msg_name: "ChartsAndDimensionsUpdated",
        bytes: msg.encode_to_vec(),
    }
}

pub fn chart_configs_updated(msg: ChartConfigsUpdated) -> Query {
    Query::bin(
        QueryKind::ChartConfigUpdated,
        BinPayload {
            topic: TopicId::ChartConfigsUpdated,
            msg_name: "ChartConfigsUpdated",
            bytes: msg.encode_to_vec(),
        },
    )
}

pub fn chart_reset(msg: ResetChartMessages) -> Query {
    let dedup = msg.node_id.clone();
    Query::bin_dedup(
        QueryKind::ChartReset,
        BinPayload {
            topic: TopicId::ChartReset,
            msg_name: "ResetChartMessages",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

pub fn retention_updated(msg: RetentionUpdated) -> Query {
    let dedup = msg.node_id.clone();
    Query::bin_dedup(
        QueryKind::RetentionUpdated,
        BinPayload {
            topic: TopicId::RetentionUpdated,
            msg_name: "RetentionUpdated",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

pub fn alarm_log_health(msg: AlarmLogHealth) -> Query {
    let dedup = msg.node_id.clone();
    Query::bin_dedup(
        QueryKind::AlarmLogHealth,
        BinPayload {
            topic: TopicId::AlarmHealth,
            msg_name: "AlarmLogHealth",
            bytes: msg.encode_to_vec(),
        },
        dedup,
    )
}

pub fn provide_alarm_config(msg: ProvideAlarmConfiguration) -> Query {
    Query::bin(
        QueryKind::AlarmProvideConfig,
        BinPayload {
            topic: TopicId::AlarmConfig,
            msg_name: "ProvideAlarmConfiguration",
            bytes: msg.encode_to_vec(),
        },
    )
}

pub fn alarm_snapshot(msg: AlarmSnapshot) -> Query {
    Query::bin(
        QueryKind::AlarmSnapshot,
        BinPayload {
            topic: TopicId::AlarmSnapshot,
            msg_name: "AlarmSnapshot",
            bytes: msg.encode_to_vec(),
        },
    )
}

pub fn alarm_log_entry(msg: AlarmLogEntry) -> Query {
    Query::bin(
        QueryKind::AlarmLogEntry,
        BinPayload {
            topic: TopicId::AlarmLog,
            msg_name: "AlarmLogEntry",
            bytes: msg.encode_to_vec(),
        },
    )
}

pub fn contexts_snapshot(msg: ContextsSnapshot) -> Query {
    Query::bin(
        QueryKind::ContextsSnapshot,
        BinPayload {
            topic: TopicId::ContextsSnapshot,
            msg_name: "ContextsSnapshot",
            bytes: msg.encode_to_vec(),
        },
    )
}

pub fn contexts_updated(msg: ContextsUpdated) -> Query {
    Query::bin(
        QueryKind::ContextsUpdated,
        BinPayload {
            topic: TopicId::ContextsUpdated,
            msg_name: "ContextsUpdated",
            bytes: msg.encode_to_vec(),
        },
    )
}

/// Publishes an encoded payload on its cached topic, QoS 1.
pub async fn publish_bin(shared: &LinkShared, payload: &BinPayload) -> Result<(), PublishError> {
    if payload.bytes.len() > MAX_PUBLISH_SIZE {
        return Err(PublishError::TooBig(payload.bytes.len()));
    }
    let client = shared.client().ok_or(PublishError::NotConnected)?;
    let topics = shared.topics().ok_or(PublishError::NotConnected)?;
    let topic = topics
        .topic_for(payload.topic)
        .ok_or(PublishError::NoTopic(payload.topic))?;
    debug!("Publishing {} to {topic}", payload.msg_name);
    client
        .publish(topic, QoS::AtLeastOnce, false, payload.bytes.clone())
        .await?;
    Ok(())
}

/// Publishes raw bytes on a concrete topic (callback topics from the cloud).
pub async fn publish_raw(
    shared: &LinkShared,
    topic: &str,
    bytes: Vec<u8>,
) -> Result<(), PublishError> {
    if bytes.len() > MAX_PUBLISH_SIZE {
        return Err(PublishError::TooBig(bytes.len()));
    }
    let client = shared.client().ok_or(PublishError::NotConnected)?;
    client.publish(topic, QoS::AtLeastOnce, false, bytes).await?;
    Ok(())
}

/// JSON envelope + separator + raw body, as the cloud expects HTTP replies.
fn frame_http_reply(envelope: &serde_json::Value, body: &[u8]) -> Vec<u8> {
    let mut framed = envelope.to_string().into_bytes();
    framed.extend_from_slice(b"\r\n\r\n");
    framed.extend_from_slice(body);
    framed
}

/// Successful HTTP-query reply on the callback topic.
pub async fn send_http_response(
    shared: &LinkShared,
    callback_topic: &str,
    msg_id: &str,
    t_exec_us: i64,
    t_rx_us: i64,
    http_code: u16,
    body: Vec<u8>,
) -> Result<(), PublishError> {
    let envelope = serde_json::json!({
        "type": "http",
        "msg-id": msg_id,
        "version": 2,
        "t-exec": t_exec_us,
        "t-rx": t_rx_us,
        "http-code": http_code,
    });
    publish_raw(shared, callback_topic, frame_http_reply(&envelope, &body)).await
}

/// HTTP-query error reply carrying a cloud error code and description.
pub async fn send_http_error(
    shared: &LinkShared,
    callback_topic: &str,
    msg_id: &str,
    http_code: u16,
    error_code: u32,
    error_description: &str,
) -> Result<(), PublishError> {
    let envelope = serde_json::json!({
        "type": "http",
        "msg-id": msg_id,
        "version": 2,
        "http-code": http_code,
        "error-code": error_code,
        "error-description": error_description,
    });
    publish_raw(shared, callback_topic, frame_http_reply(&envelope, &[])).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueryPayload;

    #[test]
    fn http_reply_framing_uses_separator() {
        let envelope = serde_json::json!({"type": "http", "msg-id": "m1", "http-code": 200});
        let framed = frame_http_reply(&envelope, b"BODY");
        let text = String::from_utf8_lossy(&framed);
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "BODY");
        let parsed: serde_json::Value = serde_json::from_str(head).unwrap();
        assert_eq!(parsed["msg-id"], "m1");
        assert_eq!(parsed["http-code"], 200);
    }

    #[test]
    fn node_state_update_targets_node_connection_topic() {
        let query = node_state_update(UpdateNodeInstanceConnection {
            claim_id: "c".into(),
            node_id: "n1".into(),
            live: true,
            queryable: true,
            session_id: 1,
            hops: 0,
            capabilities: vec![],
        });
        assert_eq!(query.kind, QueryKind::NodeStateUpdate);
        assert_eq!(query.dedup_id.as_deref(), Some("n1"));
        match query.payload {
            QueryPayload::Bin(b) => {
                assert_eq!(b.topic, TopicId::NodeInstanceConnection);
                assert!(!b.bytes.is_empty());
            }
            _ => panic!("expected binary payload"),
        }
    }

    #[test]
    fn context_stream_messages_target_their_topics() {
        let snapshot = contexts_snapshot(ContextsSnapshot {
            claim_id: "c".into(),
            node_id: "n".into(),
            version: 3,
            contexts: vec![],
        });
        assert_eq!(snapshot.kind, QueryKind::ContextsSnapshot);
        match snapshot.payload {
            QueryPayload::Bin(b) => assert_eq!(b.topic, TopicId::ContextsSnapshot),
            _ => panic!("expected binary payload"),
        }

        let updated = contexts_updated(ContextsUpdated {
            claim_id: "c".into(),
            node_id: "n".into(),
            version_hash: 7,
            contexts: vec![],
        });
        assert_eq!(updated.kind, QueryKind::ContextsUpdated);
        match updated.payload {
            QueryPayload::Bin(b) => assert_eq!(b.topic, TopicId::ContextsUpdated),
            _ => panic!("expected binary payload"),
        }
    }

    #[test]
    fn lwt_payload_round_trips() {
        use prost::Message as _;
        let bytes =
            agent_connection_payload("claim-1", 42, false, true, &crate::default_capabilities());
        let decoded = UpdateAgentConnection::decode(bytes.as_slice()).unwrap();
        assert!(decoded.lwt);
        assert!(!decoded.reachable);
        assert_eq!(decoded.session_id, 42);
        assert_eq!(decoded.claim_id, "claim-1");
    }
}
