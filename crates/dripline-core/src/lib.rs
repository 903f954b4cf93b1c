//! Dripline Core - Campaign delivery scheduling and live event streaming
//!
//! This crate provides the two client-side subsystems behind the campaign
//! console's delivery view: the scheduling estimator that predicts when a
//! windowed drip send will complete, and the resilient event stream that
//! feeds the live delivery log.

pub mod schedule;
pub mod stream;

pub use schedule::{estimate, DeliveryPlan, RateSpec, SendWindow};
pub use stream::{
    ConnectionState, EventAggregator, EventConsumer, EventStats, StreamConnection, StreamError,
    Transport, TransportStream, WsTransport,
};
