//! MQTT telemetry worker
//!
//! The worker task owns the broker socket and the connection state machine. Other
//! contexts talk to it only through [`WorkerShared`]: a single-slot publish request
//! channel with an acknowledgement signal, and a bounded inbox of subscription
//! messages drained by the dispatch task.
//!
//! Packet encoding and decoding is done by `mqttrs`; [`frame`] only finds packet
//! boundaries in the TCP stream.

pub mod frame;
pub mod state_machine;
pub mod worker;

pub use frame::{PacketError, PacketReader};
pub use state_machine::{ConnectionMachine, ConnectionState, RetryPolicy, WorkerAction, WorkerEvent};
pub use worker::{
    dispatch, Liveness, LogHandler, PublishRequest, SubscriptionHandler, SubscriptionMessage, TelemetryClient,
    TelemetryWorker, Transport, WorkerConfig, WorkerShared, WorkerTimeouts, MAX_SUBSCRIBE_TOPICS,
};

/// Client id sent in CONNECT
pub const CLIENT_ID: &str = "zephyrux";
/// Longest topic held in a subscription slot or publish request
pub const MAX_TOPIC_LEN: usize = 128;
/// Longest inbound payload held in a subscription slot
pub const MAX_PAYLOAD_LEN: usize = 256;
/// Longest outbound publish payload
pub const MAX_PUBLISH_LEN: usize = 512;
/// Subscription slots available to the dispatch queue
pub const SUBSCRIPTION_POOL_SIZE: usize = 4;
/// Socket receive scratch buffer
pub const RX_BUFFER_SIZE: usize = 1024;
/// Socket transmit scratch buffer
pub const TX_BUFFER_SIZE: usize = 1024;

/// Broker connection failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("unable to resolve broker address")]
    DnsFailure,
    #[error("broker transport failure")]
    TransportFailure,
    #[error("broker acknowledgement timed out")]
    AckTimeout,
    /// CONNACK carried a non-zero return code
    #[error("broker refused connection, code {0}")]
    Refused(u8),
}

/// Publish failures reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("client not connected")]
    NotConnected,
    #[error("publish ack timeout")]
    AckTimeout,
    #[error("publish does not fit the outbound buffer")]
    EncodeOverflow,
}
