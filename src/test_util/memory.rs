use std::sync::{Arc, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use crate::channel::events::{ConnectionEventData, ConnectionOpenedData, EventNotifier, InputChannelEvent, MessageReceivedData, OutputChannelEvent, ResponseMessageData, ResponseReceiverData, DEFAULT_EVENT_CAPACITY};
use crate::channel::{generate_id, DuplexInputChannel, DuplexOutputChannel, BROADCAST_RECEIVER_ID};

/// An in-process 'network' for duplex channels. It behaves like a connection oriented
///  transport as far as the decorators are concerned:
///
/// * opening a connection fails while nobody listens on the channel id
/// * sending fails while not connected
/// * when the input side disconnects a response receiver or stops listening, the output side
///    sees an unsolicited `ConnectionClosed`
///
/// Messages are delivered as events, i.e. asynchronously and in order per connection.
#[derive(Clone, Default)]
pub struct MemoryMessaging {
    listeners: Arc<RwLock<FxHashMap<String, Arc<InputShared>>>>,
}

impl MemoryMessaging {
    pub fn new() -> MemoryMessaging {
        Default::default()
    }

    pub fn create_input_channel(&self, channel_id: &str) -> MemoryInputChannel {
        MemoryInputChannel {
            messaging: self.clone(),
            shared: Arc::new(InputShared {
                channel_id: channel_id.to_string(),
                notifier: EventNotifier::new(DEFAULT_EVENT_CAPACITY),
                connections: Default::default(),
            }),
        }
    }

    /// `response_receiver_id` is generated if it is not provided
    pub fn create_output_channel(&self, channel_id: &str, response_receiver_id: Option<&str>) -> MemoryOutputChannel {
        let response_receiver_id = response_receiver_id
            .map(|s| s.to_string())
            .unwrap_or_else(generate_id);

        MemoryOutputChannel {
            messaging: self.clone(),
            shared: Arc::new(OutputShared {
                channel_id: channel_id.to_string(),
                response_receiver_id,
                notifier: EventNotifier::new(DEFAULT_EVENT_CAPACITY),
                connected_to: Default::default(),
            }),
        }
    }
}

fn sender_address(response_receiver_id: &str) -> String {
    format!("memory://{}", response_receiver_id)
}


struct InputShared {
    channel_id: String,
    notifier: EventNotifier<InputChannelEvent>,
    connections: RwLock<FxHashMap<String, Arc<OutputShared>>>,
}

impl InputShared {
    fn receiver_data(&self, response_receiver_id: &str) -> ResponseReceiverData {
        ResponseReceiverData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: response_receiver_id.to_string(),
            sender_address: sender_address(response_receiver_id),
        }
    }
}

struct OutputShared {
    channel_id: String,
    response_receiver_id: String,
    notifier: EventNotifier<OutputChannelEvent>,
    connected_to: RwLock<Option<Weak<InputShared>>>,
}

impl OutputShared {
    fn connection_data(&self) -> ConnectionEventData {
        ConnectionEventData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: self.response_receiver_id.clone(),
        }
    }

    /// called by the input side when it drops this connection
    async fn on_disconnected_by_peer(&self) {
        if self.connected_to.write().await.take().is_some() {
            debug!("connection {:?} was closed by the input side", self.response_receiver_id);
            self.notifier.send_event(OutputChannelEvent::ConnectionClosed(self.connection_data()));
        }
    }

    fn receive(&self, message: Bytes) {
        self.notifier.send_event(OutputChannelEvent::ResponseMessageReceived(ResponseMessageData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: self.response_receiver_id.clone(),
            message,
        }));
    }
}


pub struct MemoryInputChannel {
    messaging: MemoryMessaging,
    shared: Arc<InputShared>,
}

impl MemoryInputChannel {
    /// the response receivers that are currently connected, in no particular order
    pub async fn connected_response_receivers(&self) -> Vec<String> {
        self.shared.connections.read().await
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DuplexInputChannel for MemoryInputChannel {
    fn channel_id(&self) -> String {
        self.shared.channel_id.clone()
    }

    async fn start_listening(&self) -> anyhow::Result<()> {
        let mut listeners = self.messaging.listeners.write().await;
        if listeners.contains_key(&self.shared.channel_id) {
            bail!("there is already a listener for channel {:?}", self.shared.channel_id);
        }
        listeners.insert(self.shared.channel_id.clone(), self.shared.clone());
        debug!("listening on {:?}", self.shared.channel_id);
        Ok(())
    }

    async fn stop_listening(&self) {
        {
            let mut listeners = self.messaging.listeners.write().await;
            let is_own_listener = listeners.get(&self.shared.channel_id)
                .map(|l| Arc::ptr_eq(l, &self.shared))
                .unwrap_or(false);
            if !is_own_listener {
                return;
            }
            listeners.remove(&self.shared.channel_id);
        }

        let connections = std::mem::take(&mut *self.shared.connections.write().await);
        for connection in connections.values() {
            connection.on_disconnected_by_peer().await;
        }
        debug!("stopped listening on {:?}", self.shared.channel_id);
    }

    async fn is_listening(&self) -> bool {
        self.messaging.listeners.read().await
            .get(&self.shared.channel_id)
            .map(|l| Arc::ptr_eq(l, &self.shared))
            .unwrap_or(false)
    }

    async fn send_response_message(&self, response_receiver_id: &str, message: Bytes) -> anyhow::Result<()> {
        if !self.is_listening().await {
            bail!("channel {:?} is not listening", self.shared.channel_id);
        }

        let connections = self.shared.connections.read().await;
        if response_receiver_id == BROADCAST_RECEIVER_ID {
            for connection in connections.values() {
                connection.receive(message.clone());
            }
            return Ok(());
        }

        match connections.get(response_receiver_id) {
            Some(connection) => {
                trace!("sending response message to {:?}", response_receiver_id);
                connection.receive(message);
                Ok(())
            }
            None => bail!("response receiver {:?} is not connected", response_receiver_id),
        }
    }

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> anyhow::Result<()> {
        let removed = self.shared.connections.write().await
            .remove(response_receiver_id);
        if let Some(connection) = removed {
            connection.on_disconnected_by_peer().await;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InputChannelEvent> {
        self.shared.notifier.subscribe()
    }
}


pub struct MemoryOutputChannel {
    messaging: MemoryMessaging,
    shared: Arc<OutputShared>,
}

impl MemoryOutputChannel {
    async fn connected_input(&self) -> Option<Arc<InputShared>> {
        self.shared.connected_to.read().await
            .as_ref()
            .and_then(|w| w.upgrade())
    }
}

#[async_trait]
impl DuplexOutputChannel for MemoryOutputChannel {
    fn channel_id(&self) -> String {
        self.shared.channel_id.clone()
    }

    fn response_receiver_id(&self) -> String {
        self.shared.response_receiver_id.clone()
    }

    async fn open_connection(&self) -> anyhow::Result<()> {
        let mut connected_to = self.shared.connected_to.write().await;
        if connected_to.as_ref().and_then(|w| w.upgrade()).is_some() {
            bail!("connection {:?} is already open", self.shared.response_receiver_id);
        }

        let input = match self.messaging.listeners.read().await.get(&self.shared.channel_id) {
            Some(input) => input.clone(),
            None => bail!("nobody is listening on channel {:?}", self.shared.channel_id),
        };

        input.connections.write().await
            .insert(self.shared.response_receiver_id.clone(), self.shared.clone());
        *connected_to = Some(Arc::downgrade(&input));
        drop(connected_to);

        debug!("connection {:?} opened to {:?}", self.shared.response_receiver_id, self.shared.channel_id);
        self.shared.notifier.send_event(OutputChannelEvent::ConnectionOpened(ConnectionOpenedData {
            channel_id: self.shared.channel_id.clone(),
            response_receiver_id: self.shared.response_receiver_id.clone(),
            is_reconnect: false,
        }));
        input.notifier.send_event(InputChannelEvent::ResponseReceiverConnected(input.receiver_data(&self.shared.response_receiver_id)));
        Ok(())
    }

    async fn close_connection(&self) {
        let input = match self.shared.connected_to.write().await.take() {
            Some(w) => w.upgrade(),
            None => return,
        };

        if let Some(input) = input {
            let mut connections = input.connections.write().await;
            let is_registered = connections.get(&self.shared.response_receiver_id)
                .map(|c| Arc::ptr_eq(c, &self.shared))
                .unwrap_or(false);
            if is_registered {
                connections.remove(&self.shared.response_receiver_id);
                drop(connections);
                input.notifier.send_event(InputChannelEvent::ResponseReceiverDisconnected(input.receiver_data(&self.shared.response_receiver_id)));
            }
        }

        debug!("connection {:?} closed", self.shared.response_receiver_id);
        self.shared.notifier.send_event(OutputChannelEvent::ConnectionClosed(self.shared.connection_data()));
    }

    async fn is_connected(&self) -> bool {
        self.connected_input().await.is_some()
    }

    async fn send_message(&self, message: Bytes) -> anyhow::Result<()> {
        let input = match self.connected_input().await {
            Some(input) => input,
            None => bail!("connection {:?} is not open", self.shared.response_receiver_id),
        };

        trace!("sending message from {:?}", self.shared.response_receiver_id);
        input.notifier.send_event(InputChannelEvent::MessageReceived(MessageReceivedData {
            channel_id: input.channel_id.clone(),
            response_receiver_id: self.shared.response_receiver_id.clone(),
            sender_address: sender_address(&self.shared.response_receiver_id),
            message,
        }));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputChannelEvent> {
        self.shared.notifier.subscribe()
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;
    use crate::test_util::EventCollector;

    #[tokio::test]
    async fn test_open_requires_listener() {
        let messaging = MemoryMessaging::new();
        let output = messaging.create_output_channel("ch", Some("client"));
        assert!(output.open_connection().await.is_err());
        assert!(!output.is_connected().await);
        assert!(output.send_message(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let messaging = MemoryMessaging::new();
        let input = messaging.create_input_channel("ch");
        let output = messaging.create_output_channel("ch", Some("client"));
        let input_events = EventCollector::new(input.subscribe());
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        assert!(output.open_connection().await.is_err());

        output.send_message(Bytes::from_static(b"request")).await.unwrap();
        input.send_response_message("client", Bytes::from_static(b"response")).await.unwrap();

        assert!(input_events.wait_for(|e| matches!(e, InputChannelEvent::MessageReceived(d) if d.message.as_ref() == b"request"), Duration::from_secs(1)).await);
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ResponseMessageReceived(d) if d.message.as_ref() == b"response"), Duration::from_secs(1)).await);
        assert_eq!(input.connected_response_receivers().await, vec!["client".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_by_input_side() {
        let messaging = MemoryMessaging::new();
        let input = messaging.create_input_channel("ch");
        let output = messaging.create_output_channel("ch", Some("client"));
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        input.disconnect_response_receiver("client").await.unwrap();

        assert!(!output.is_connected().await);
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionClosed(_)), Duration::from_secs(1)).await);
        assert!(input.send_response_message("client", Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_listening_closes_connections() {
        let messaging = MemoryMessaging::new();
        let input = messaging.create_input_channel("ch");
        let output = messaging.create_output_channel("ch", None);

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        input.stop_listening().await;

        assert!(!input.is_listening().await);
        assert!(!output.is_connected().await);
        assert!(output.open_connection().await.is_err());
    }
}
