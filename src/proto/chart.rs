//! Chart streaming control and update messages.

/// Cloud command: start streaming charts for a node at a given position.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamChartsAndDimensions {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(uint64, tag = "3")]
    pub sequence_id: u64,
    #[prost(uint64, tag = "4")]
    pub batch_id: u64,
    #[prost(int64, tag = "5")]
    pub seq_id_created_at: i64,
}

/// Cloud acknowledgement of chart updates up to a sequence id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChartsAndDimensionsAck {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(uint64, tag = "3")]
    pub last_sequence_id: u64,
}

/// Cloud request for chart configurations by hash.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateChartConfigs {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(string, repeated, tag = "3")]
    pub config_hashes: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChartInstance {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub chart_type: String,
    #[prost(string, tag = "4")]
    pub family: String,
    #[prost(string, tag = "5")]
    pub config_hash: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChartDimension {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub chart_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChartsAndDimensionsUpdated {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(uint64, tag = "3")]
    pub batch_id: u64,
    #[prost(uint64, tag = "4")]
    pub sequence_id: u64,
    #[prost(message, repeated, tag = "5")]
    pub charts: Vec<ChartInstance>,
    #[prost(message, repeated, tag = "6")]
    pub dimensions: Vec<ChartDimension>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChartConfigsUpdated {
    #[prost(string, repeated, tag = "1")]
    pub config_hashes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResetReason {
    DbEmpty = 0,
    SeqIdNotExists = 1,
    Timeout = 2,
}

/// Tells the cloud to restart chart streaming from scratch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResetChartMessages {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(enumeration = "ResetReason", tag = "3")]
    pub reason: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetentionInterval {
    #[prost(uint32, tag = "1")]
    pub update_every: u32,
    #[prost(uint32, tag = "2")]
    pub retention_seconds: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetentionUpdated {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(message, repeated, tag = "3")]
    pub intervals: Vec<RetentionInterval>,
}
