//! Resilient, self-healing channel to the upstream control service.
//!
//! The client connects with a bearer credential, considers the channel ready
//! only after it stayed open for [`CONNECTION_RESET_DELAY`], buffers outbound
//! messages until then and reconnects with capped exponential backoff.

mod backoff;
mod buffer;
mod client;
mod transport;
mod ws;

pub use backoff::Backoff;
pub use buffer::MessageBuffer;
pub use client::ClientOptions;
pub use client::ClientStatus;
pub use client::ConnectionState;
pub use client::MessageObserver;
pub use client::UpstreamClient;
pub use client::UpstreamHandle;
pub use client::CONNECTION_RESET_DELAY;
pub use transport::CloseInfo;
pub use transport::ConnectRequest;
pub use transport::Connection;
pub use transport::Connector;
pub use transport::EventSink;
pub use transport::Frame;
pub use transport::LinkEvent;
pub use transport::TransportError;
pub use ws::WsConnector;

#[cfg(test)]
pub(crate) use transport::mock;
