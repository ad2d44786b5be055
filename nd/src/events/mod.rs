//! Typed pub/sub event system
//!
//! - [`types`] - the closed topic set and event payloads
//! - [`bus`] - the broadcast bus with lag markers, retention and heartbeat

pub mod bus;
pub mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_HEARTBEAT, DEFAULT_RETENTION, EventBus, Subscription, create_event_bus};
pub use types::{BusEvent, Delivery, Envelope, Topic};
