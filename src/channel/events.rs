use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::dispatcher::{EventDispatcher, InlineDispatcher};

/// Events raised by output (client side) channels.
///
/// Not every channel raises every kind of event: a plain transport only opens and closes
///  connections and receives response messages, while online / offline and delivery
///  notifications come from decorators. Decorators forward all events they do not handle
///  themselves, so events of lower layers remain visible to the application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputChannelEvent {
    ConnectionOpened(ConnectionOpenedData),
    ConnectionClosed(ConnectionEventData),
    /// the underlying connection is (re-)established - raised by buffering decorators
    ConnectionOnline(ConnectionEventData),
    /// the underlying connection is temporarily lost, messages are buffered
    ConnectionOffline(ConnectionEventData),
    ResponseMessageReceived(ResponseMessageData),
    MessageDelivered(MessageDeliveryData),
    MessageNotDelivered(MessageDeliveryData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionEventData {
    pub channel_id: String,
    pub response_receiver_id: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionOpenedData {
    pub channel_id: String,
    pub response_receiver_id: String,
    /// `true` if this is a recovery of a connection that was open before
    pub is_reconnect: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseMessageData {
    pub channel_id: String,
    pub response_receiver_id: String,
    pub message: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageDeliveryData {
    pub message_id: String,
}


/// Events raised by input (server side) channels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InputChannelEvent {
    ResponseReceiverConnected(ResponseReceiverData),
    ResponseReceiverDisconnected(ResponseReceiverData),
    /// a known response receiver is reachable again - raised by buffering decorators
    ResponseReceiverOnline(ResponseReceiverData),
    /// a response receiver is temporarily unreachable, response messages are buffered
    ResponseReceiverOffline(ResponseReceiverData),
    MessageReceived(MessageReceivedData),
    ResponseMessageDelivered(ResponseMessageDeliveryData),
    ResponseMessageNotDelivered(ResponseMessageDeliveryData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseReceiverData {
    pub channel_id: String,
    pub response_receiver_id: String,
    pub sender_address: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageReceivedData {
    pub channel_id: String,
    pub response_receiver_id: String,
    pub sender_address: String,
    pub message: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseMessageDeliveryData {
    pub response_receiver_id: String,
    pub message_id: String,
}


pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Publishes events to any number of subscribers. Publishing without subscribers is fine, and
///  since every subscriber owns its receiver, subscribers cannot interfere with each other.
///
/// Subscribers that fall behind by more than the configured capacity lose the oldest events.
pub struct EventNotifier<E> {
    sender: broadcast::Sender<E>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl<E: Clone + Debug + Send + 'static> EventNotifier<E> {
    pub fn new(capacity: usize) -> EventNotifier<E> {
        Self::with_dispatcher(capacity, Arc::new(InlineDispatcher))
    }

    pub fn with_dispatcher(capacity: usize, dispatcher: Arc<dyn EventDispatcher>) -> EventNotifier<E> {
        let (sender, _) = broadcast::channel(capacity);
        EventNotifier {
            sender,
            dispatcher,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        let sender = self.sender.clone();
        self.dispatcher.dispatch(Box::new(move || {
            // no subscribers is not an error
            let _ = sender.send(event);
        }));
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(id: &str) -> OutputChannelEvent {
        OutputChannelEvent::MessageDelivered(MessageDeliveryData { message_id: id.to_string() })
    }

    #[test]
    fn test_send_without_subscribers() {
        let notifier = EventNotifier::<OutputChannelEvent>::new(4);
        notifier.send_event(delivered("a"));
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let notifier = EventNotifier::<OutputChannelEvent>::new(4);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.send_event(delivered("a"));

        assert_eq!(first.recv().await.unwrap(), delivered("a"));
        assert_eq!(second.recv().await.unwrap(), delivered("a"));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_affect_others() {
        let notifier = EventNotifier::<OutputChannelEvent>::new(4);
        let first = notifier.subscribe();
        let mut second = notifier.subscribe();
        drop(first);

        notifier.send_event(delivered("b"));
        assert_eq!(second.recv().await.unwrap(), delivered("b"));
    }
}
