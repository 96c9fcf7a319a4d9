//! IPC operation wrappers: request shapes over the connection core.

mod config;
mod iot_core;
mod lifecycle;
mod pubsub;

pub use iot_core::Qos;
pub use lifecycle::ComponentState;
pub use pubsub::TopicMessage;
