//! Reliable channels: messages are acknowledged by the receiving side, and the sending side is
//!  notified whether each message was delivered.
//!
//! Both sides must be reliable, since they exchange [reliable_message::ReliableMessage]
//!  envelopes instead of raw payloads.

pub mod input_channel;
pub mod output_channel;
mod pending;
pub mod reliable_message;

pub use input_channel::ReliableDuplexInputChannel;
pub use output_channel::ReliableDuplexOutputChannel;
