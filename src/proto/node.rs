//! Node-instance registration and state messages.

use super::agent::Capability;

/// Asks the cloud to create a node instance for a host this agent knows.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateNodeInstance {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub machine_guid: String,
    #[prost(string, tag = "3")]
    pub hostname: String,
    #[prost(int32, tag = "4")]
    pub hops: i32,
}

/// Cloud reply carrying the node id it allocated for a machine guid.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateNodeInstanceResult {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub machine_guid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateNodeInstanceConnection {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(bool, tag = "3")]
    pub live: bool,
    #[prost(bool, tag = "4")]
    pub queryable: bool,
    #[prost(int64, tag = "5")]
    pub session_id: i64,
    #[prost(int32, tag = "6")]
    pub hops: i32,
    #[prost(message, repeated, tag = "7")]
    pub capabilities: Vec<Capability>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateNodeInfo {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(string, tag = "3")]
    pub machine_guid: String,
    #[prost(string, tag = "4")]
    pub hostname: String,
    #[prost(string, tag = "5")]
    pub os: String,
    #[prost(string, tag = "6")]
    pub os_version: String,
    #[prost(string, tag = "7")]
    pub kernel_version: String,
    #[prost(string, tag = "8")]
    pub architecture: String,
    #[prost(int64, tag = "9")]
    pub session_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectorInfo {
    #[prost(string, tag = "1")]
    pub plugin: String,
    #[prost(string, tag = "2")]
    pub module: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateNodeCollectors {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(message, repeated, tag = "3")]
    pub collectors: Vec<CollectorInfo>,
}
