//! Agent-level connection messages, including the LWT payload shape.

/// One named agent capability with a version and an enabled flag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Capability {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub version: u32,
    #[prost(bool, tag = "3")]
    pub enabled: bool,
}

/// Published on the agent-connection topic on connect, graceful disconnect
/// and (with `lwt = true`) as the broker-delivered Last Will.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateAgentConnection {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(bool, tag = "2")]
    pub reachable: bool,
    #[prost(bool, tag = "3")]
    pub lwt: bool,
    /// Session start timestamp, microseconds since the epoch. Lets the cloud
    /// discard LWTs from sessions it already knows are gone.
    #[prost(int64, tag = "4")]
    pub session_id: i64,
    #[prost(message, repeated, tag = "5")]
    pub capabilities: Vec<Capability>,
}

/// Cloud-directed disconnect, possibly with a reconnect block or a permanent
/// ban.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectReq {
    #[prost(uint64, tag = "1")]
    pub reconnect_after_seconds: u64,
    #[prost(bool, tag = "2")]
    pub permaban: bool,
    #[prost(uint32, tag = "3")]
    pub error_code: u32,
    #[prost(string, tag = "4")]
    pub error_description: String,
}
