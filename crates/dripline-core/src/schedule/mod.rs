//! Scheduling Module - Delivery rate, send window, and completion estimation

mod estimator;
mod rate;
mod window;

pub use estimator::{estimate, DeliveryPlan};
pub use rate::RateSpec;
pub use window::SendWindow;
