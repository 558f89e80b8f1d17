//! Monitored channels: a ping protocol that detects broken connections even if the transport
//!  does not notice, e.g. because a peer vanished without closing its socket.
//!
//! Both sides must be monitored, since they exchange [monitor_message::MonitorMessage]
//!  envelopes instead of raw payloads.

pub mod input_channel;
pub mod monitor_message;
pub mod output_channel;

pub use input_channel::MonitoredDuplexInputChannel;
pub use output_channel::MonitoredDuplexOutputChannel;
