//! Buffering decorators: they hide temporary connection loss from the application.
//!
//! The output side queues messages and reconnects in the background, the input side queues
//!  response messages per response receiver. Both give up after a configurable maximum offline
//!  time, discarding what was queued.

pub mod input_channel;
pub mod output_channel;
mod receiver_context;
mod response_sender;

pub use input_channel::BufferedDuplexInputChannel;
pub use output_channel::BufferedDuplexOutputChannel;
