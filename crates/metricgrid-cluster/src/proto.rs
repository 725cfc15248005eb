//! Remote wire protocol.
//!
//! ```text
//! service metricgrid.remote.RemoteService {
//!   rpc Call(stream RemoteMessage) returns (stream Ack);
//! }
//! ```
//!
//! Messages are declared with prost derives; the service stubs are
//! generated by `build.rs`.

/// One forwarded record, or a heartbeat when `heartbeat` is set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteMessage {
    #[prost(uint32, tag = "1")]
    pub worker_role_id: u32,
    #[prost(uint32, tag = "2")]
    pub schema_id: u32,
    #[prost(string, tag = "3")]
    pub entity_id: String,
    #[prost(int64, tag = "4")]
    pub time_bucket: i64,
    /// One slot per schema column, in schema order.
    #[prost(message, repeated, tag = "5")]
    pub columns: Vec<TypedValue>,
    #[prost(bool, tag = "6")]
    pub heartbeat: bool,
}

/// A column slot. An absent `kind` is an unset column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypedValue {
    #[prost(oneof = "typed_value::Kind", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub kind: Option<typed_value::Kind>,
}

pub mod typed_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(string, tag = "1")]
        StringValue(String),
        #[prost(int32, tag = "2")]
        IntValue(i32),
        #[prost(int64, tag = "3")]
        LongValue(i64),
        #[prost(double, tag = "4")]
        DoubleValue(f64),
        #[prost(bool, tag = "5")]
        BoolValue(bool),
        #[prost(bytes = "vec", tag = "6")]
        BytesValue(Vec<u8>),
        #[prost(message, tag = "7")]
        Mean(super::MeanValue),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeanValue {
    #[prost(double, tag = "1")]
    pub summation: f64,
    #[prost(uint64, tag = "2")]
    pub count: u64,
}

/// Server reply. An empty `error` with `heartbeat` set confirms liveness;
/// a non-empty `error` reports a rejected message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(uint32, tag = "1")]
    pub worker_role_id: u32,
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(bool, tag = "3")]
    pub heartbeat: bool,
}

impl RemoteMessage {
    pub fn heartbeat() -> Self {
        Self {
            heartbeat: true,
            ..Self::default()
        }
    }
}

include!(concat!(env!("OUT_DIR"), "/metricgrid.remote.RemoteService.rs"));
