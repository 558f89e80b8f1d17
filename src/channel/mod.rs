//! The duplex channel abstraction that transports provide, and that all decorators in this
//!  crate both consume and implement.
//!
//! A duplex channel consists of an *output* side (the client: opens a connection, sends
//!  messages, receives responses) and an *input* side (the server: listens, receives messages,
//!  sends responses to a specific response receiver). Notifications are published as events,
//!  see [events].

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::channel::events::{InputChannelEvent, OutputChannelEvent};

pub mod dispatcher;
pub mod events;

/// Passing this as the response receiver id sends a response message to all connected
///  response receivers.
pub const BROADCAST_RECEIVER_ID: &str = "*";

/// generates a fresh, globally unique id, e.g. for response receivers or messages
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DuplexOutputChannel: Send + Sync + 'static {
    /// the logical address of the input channel this channel connects to
    fn channel_id(&self) -> String;

    /// the identity of this channel on the input side; it is stable for the channel's lifetime
    fn response_receiver_id(&self) -> String;

    /// fails if the connection is already open, or if it can not be established
    async fn open_connection(&self) -> anyhow::Result<()>;

    async fn close_connection(&self);

    async fn is_connected(&self) -> bool;

    async fn send_message(&self, message: Bytes) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<OutputChannelEvent>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DuplexInputChannel: Send + Sync + 'static {
    fn channel_id(&self) -> String;

    async fn start_listening(&self) -> anyhow::Result<()>;

    async fn stop_listening(&self);

    async fn is_listening(&self) -> bool;

    /// sends a message to a single response receiver, or to all of them when called with
    ///  [BROADCAST_RECEIVER_ID]
    async fn send_response_message(&self, response_receiver_id: &str, message: Bytes) -> anyhow::Result<()>;

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<InputChannelEvent>;
}
