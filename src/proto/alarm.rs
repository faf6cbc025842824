//! Alert streaming control, log, configuration and snapshot messages.

/// Cloud command: start alert streaming for a node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartAlarmStreaming {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint64, tag = "2")]
    pub batch_id: u64,
    #[prost(uint64, tag = "3")]
    pub start_sequence_id: u64,
}

/// Cloud request for the alarm-log health summary of a node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendAlarmLogHealth {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

/// Cloud request for one alarm configuration by hash.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendAlarmConfiguration {
    #[prost(string, tag = "1")]
    pub config_hash: String,
}

/// Cloud request for an alert snapshot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendAlarmSnapshot {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub claim_id: String,
    #[prost(uint64, tag = "3")]
    pub snapshot_id: u64,
    #[prost(uint64, tag = "4")]
    pub sequence_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlarmLogHealth {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(bool, tag = "3")]
    pub enabled: bool,
    #[prost(uint64, tag = "4")]
    pub last_undelivered_event_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlarmConfiguration {
    #[prost(string, tag = "1")]
    pub alarm: String,
    #[prost(string, tag = "2")]
    pub template: String,
    #[prost(string, tag = "3")]
    pub on_chart: String,
    #[prost(string, tag = "4")]
    pub calculation: String,
    #[prost(string, tag = "5")]
    pub warn: String,
    #[prost(string, tag = "6")]
    pub crit: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProvideAlarmConfiguration {
    #[prost(string, tag = "1")]
    pub config_hash: String,
    #[prost(message, optional, tag = "2")]
    pub config: Option<AlarmConfiguration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum AlarmStatus {
    Unknown = 0,
    Clear = 1,
    Warning = 2,
    Critical = 3,
    Removed = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlarmLogEntry {
    #[prost(string, tag = "1")]
    pub claim_id: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(string, tag = "3")]
    pub chart: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(int64, tag = "5")]
    pub when_unix: i64,
    #[prost(enumeration = "AlarmStatus", tag = "6")]
    pub status: i32,
    #[prost(double, tag = "7")]
    pub value: f64,
    #[prost(double, tag = "8")]
    pub old_value: f64,
    #[prost(uint64, tag = "9")]
    pub sequence_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlarmSnapshot {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub claim_id: String,
    #[prost(uint64, tag = "3")]
    pub snapshot_id: u64,
    #[prost(uint32, tag = "4")]
    pub chunks: u32,
    #[prost(uint32, tag = "5")]
    pub chunk: u32,
    #[prost(message, repeated, tag = "6")]
    pub alarms: Vec<AlarmLogEntry>,
}
