//! Binary message types exchanged with the cloud, one encode/decode pair per
//! message, carried as protobuf via `prost` derives.
//!
//! Field numbering is stable per message; adding fields keeps existing tags.
//! The link treats these purely as wire records: no business logic lives
//! here, the encoders in [`crate::tx`] and the router in
//! [`crate::dispatch::router`] do the mapping.

pub mod agent;
pub mod alarm;
pub mod chart;
pub mod context;
pub mod node;

pub use prost::Message;

#[cfg(test)]
mod tests {
    use super::agent::{Capability, UpdateAgentConnection};
    use super::node::CreateNodeInstanceResult;
    use prost::Message;

    #[test]
    fn agent_connection_update_encodes_and_decodes() {
        let msg = UpdateAgentConnection {
            claim_id: "claim-1".into(),
            reachable: true,
            lwt: false,
            session_id: 1_700_000_000_000_000,
            capabilities: vec![Capability {
                name: "proto".into(),
                version: 1,
                enabled: true,
            }],
        };
        let bytes = msg.encode_to_vec();
        let back = UpdateAgentConnection::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        // a message with extra fields still decodes into the known subset
        let full = UpdateAgentConnection {
            claim_id: "c".into(),
            reachable: true,
            lwt: true,
            session_id: 7,
            capabilities: vec![],
        };
        let bytes = full.encode_to_vec();
        let narrow = CreateNodeInstanceResult::decode(bytes.as_slice());
        // decoding into an unrelated schema must not panic
        let _ = narrow;
    }
}
