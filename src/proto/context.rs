//! Context-stream messages exchanged with the context engine collaborator.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextsCheckpoint {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(uint64, tag = "3")]
    pub version_hash: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopStreamingContexts {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextVersion {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(int64, tag = "3")]
    pub first_entry_s: i64,
    #[prost(int64, tag = "4")]
    pub last_entry_s: i64,
    #[prost(bool, tag = "5")]
    pub deleted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextsSnapshot {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(uint64, tag = "3")]
    pub version: u64,
    #[prost(message, repeated, tag = "4")]
    pub contexts: Vec<ContextVersion>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextsUpdated {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(uint64, tag = "3")]
    pub version_hash: u64,
    #[prost(message, repeated, tag = "4")]
    pub contexts: Vec<ContextVersion>,
}
