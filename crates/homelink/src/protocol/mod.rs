//! Wire protocol between the bridge and the upstream service.
//!
//! Every frame is a versioned envelope `{version, type, data}`, JSON encoded.
//! Inbound frames may batch several envelopes in a JSON array.
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `ClientMessage`: snapshots, status changes and metrics sent upstream
//! - `ServerMessage`: commands and notifications received from upstream

mod envelope;
mod service;

pub use envelope::decode_server_frame;
pub use envelope::decode_server_value;
pub use envelope::encode_client;
pub use envelope::envelope_value;
pub use envelope::ClientMessage;
pub use envelope::Counters;
pub use envelope::Envelope;
pub use envelope::ServerMessage;
pub use envelope::SetCharacteristic;
pub use envelope::PROTOCOL_VERSION;
pub use service::Characteristic;
pub use service::CharacteristicValue;
pub use service::Format;
pub use service::Perm;
pub use service::Service;
pub use service::Unit;

#[cfg(test)]
pub(crate) use service::fixtures;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported protocol version {found} (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Service '{service_name}' has no uniqueId")]
    MissingUniqueId { service_name: String },

    #[error("Service {unique_id} repeats characteristic iid {iid}")]
    DuplicateIid { unique_id: String, iid: u64 },

    #[error("SetCharacteristic carries an empty serviceId")]
    EmptyServiceId,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
