//! Live Stream Module - Resilient event transport and aggregation

mod aggregator;
mod connection;
mod transport;

pub use aggregator::{EventAggregator, EventStats};
pub use connection::{
    ConnectionState, EventConsumer, StreamConnection, StreamError, CLOSE_AUTH_INVALID,
    CLOSE_AUTH_MISSING, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_SESSION_NOT_FOUND,
};
pub use transport::{CloseReason, Frame, Transport, TransportStream, WsTransport};
