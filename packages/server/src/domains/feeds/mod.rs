//! Realtime kill feeds.

pub mod redisq;
pub mod websocket;

pub use redisq::PollConsumer;
pub use websocket::{StreamListener, StreamListenerConfig};
