//! Composable decorators for duplex message channels that add the resilience a raw transport
//!  does not provide by itself.
//!
//! There are three decorators, and each of them implements the very traits it wraps
//!  ([channel::DuplexOutputChannel] and [channel::DuplexInputChannel]), so they can be nested in
//!  any order:
//!
//! * [buffered]: buffers outgoing messages while a connection is unavailable and keeps
//!    reconnecting until a maximum offline time has passed. On the server side, messages for
//!    peers that are temporarily offline are buffered per peer.
//! * [monitored]: a ping protocol on top of an established connection to detect silently
//!    broken connections faster than the transport would.
//! * [reliable]: every message carries an id and is acknowledged by the peer, and the
//!    application is notified whether a message was delivered.
//!
//! All notifications are published as events on `tokio::sync::broadcast` channels, see
//!  [channel::events].

pub mod channel;
pub mod config;
pub mod buffered;
pub mod monitored;
pub mod reliable;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use tracing::Level;

    use crate::buffered::{BufferedDuplexInputChannel, BufferedDuplexOutputChannel};
    use crate::channel::dispatcher::{DispatchJob, EventDispatcher, SerialDispatcher};
    use crate::channel::events::{InputChannelEvent, OutputChannelEvent};
    use crate::channel::{DuplexInputChannel, DuplexOutputChannel};
    use crate::config::{BufferedConfig, MonitorConfig, ReliableConfig};
    use crate::monitored::{MonitoredDuplexInputChannel, MonitoredDuplexOutputChannel};
    use crate::reliable::{ReliableDuplexInputChannel, ReliableDuplexOutputChannel};
    use crate::test_util::memory::{MemoryInputChannel, MemoryMessaging};
    use crate::test_util::EventCollector;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }

    /// reliable over monitored over buffered over the in-memory transport, on both sides
    fn stacked(messaging: &MemoryMessaging) -> (Arc<MemoryInputChannel>, ReliableDuplexInputChannel, ReliableDuplexOutputChannel) {
        let buffered_config = Arc::new(BufferedConfig::new(Duration::from_secs(5)));
        let monitor_config = Arc::new(MonitorConfig::default());
        let reliable_config = Arc::new(ReliableConfig::new(Duration::from_secs(3)));

        let memory_input = Arc::new(messaging.create_input_channel("stack"));
        let input = BufferedDuplexInputChannel::new(memory_input.clone(), buffered_config.clone()).unwrap();
        let input = MonitoredDuplexInputChannel::new(Arc::new(input), monitor_config.clone()).unwrap();
        let input = ReliableDuplexInputChannel::new(Arc::new(input), reliable_config.clone()).unwrap();

        let output = BufferedDuplexOutputChannel::new(Arc::new(messaging.create_output_channel("stack", Some("client"))), buffered_config).unwrap();
        let output = MonitoredDuplexOutputChannel::new(Arc::new(output), monitor_config).unwrap();
        let output = ReliableDuplexOutputChannel::new(Arc::new(output), reliable_config).unwrap();

        (memory_input, input, output)
    }

    fn received(payload: &'static [u8]) -> impl Fn(&InputChannelEvent) -> bool {
        move |e| matches!(e, InputChannelEvent::MessageReceived(d) if d.message.as_ref() == payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stacked_round_trip() {
        let messaging = MemoryMessaging::new();
        let (_memory_input, input, output) = stacked(&messaging);
        let input_events = EventCollector::new(input.subscribe());
        let output_events = EventCollector::new(output.subscribe());

        // sent before anybody listens: the buffered layer holds it until the connection is up
        output.open_connection().await.unwrap();
        let message_id = output.send_reliable_message(Bytes::from_static(b"early")).await.unwrap();
        input.start_listening().await.unwrap();

        assert!(input_events.wait_for(received(b"early"), Duration::from_secs(2)).await);
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::MessageDelivered(d) if d.message_id == message_id), Duration::from_secs(2)).await);

        let response_id = input.send_reliable_response_message("client", Bytes::from_static(b"reply")).await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ResponseMessageReceived(d) if d.message.as_ref() == b"reply"), Duration::from_secs(2)).await);
        assert!(input_events.wait_for(|e| matches!(e, InputChannelEvent::ResponseMessageDelivered(d) if d.message_id == response_id), Duration::from_secs(2)).await);

        // pings keep the idle connection alive, and pings never surface as messages
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(output.is_connected().await);
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionClosed(_))).await, 0);
        assert_eq!(input_events.count(|e| matches!(e, InputChannelEvent::MessageReceived(_))).await, 1);
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::MessageNotDelivered(_))).await, 0);

        output.close_connection().await;
        input.stop_listening().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stacked_messages_survive_transport_disconnect() {
        let messaging = MemoryMessaging::new();
        let (memory_input, input, output) = stacked(&messaging);
        let input_events = EventCollector::new(input.subscribe());
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), Duration::from_secs(1)).await);

        memory_input.disconnect_response_receiver("client").await.unwrap();

        let payloads: [&'static [u8]; 3] = [b"m1", b"m2", b"m3"];
        let mut message_ids = Vec::new();
        for payload in payloads {
            message_ids.push(output.send_reliable_message(Bytes::from_static(payload)).await.unwrap());
        }

        for message_id in &message_ids {
            assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::MessageDelivered(d) if &d.message_id == message_id), Duration::from_secs(3)).await);
        }

        let received_payloads = input_events.events().await
            .into_iter()
            .filter_map(|e| match e {
                InputChannelEvent::MessageReceived(d) => Some(d.message.to_vec()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(received_payloads, payloads.iter().map(|p| p.to_vec()).collect::<Vec<_>>());
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionClosed(_))).await, 0);
    }

    /// numbers jobs in dispatch order and records the order in which they actually run
    #[derive(Debug)]
    struct SequencingDispatcher {
        inner: SerialDispatcher,
        dispatched: AtomicUsize,
        executed: Arc<Mutex<Vec<usize>>>,
    }

    impl EventDispatcher for SequencingDispatcher {
        fn dispatch(&self, job: DispatchJob) {
            let seq = self.dispatched.fetch_add(1, Ordering::SeqCst);
            let executed = self.executed.clone();
            self.inner.dispatch(Box::new(move || {
                job();
                executed.lock().unwrap().push(seq);
            }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stacked_channels_share_dispatcher() {
        let executed: Arc<Mutex<Vec<usize>>> = Default::default();
        let dispatcher: Arc<dyn EventDispatcher> = Arc::new(SequencingDispatcher {
            inner: SerialDispatcher::new(),
            dispatched: AtomicUsize::new(0),
            executed: executed.clone(),
        });

        let mut buffered_config = BufferedConfig::new(Duration::from_secs(5));
        buffered_config.dispatcher = dispatcher.clone();
        let mut monitor_config = MonitorConfig::default();
        monitor_config.dispatcher = dispatcher.clone();

        let messaging = MemoryMessaging::new();
        let input = MonitoredDuplexInputChannel::new(Arc::new(messaging.create_input_channel("stack")), Arc::new(MonitorConfig::default())).unwrap();
        let buffered = Arc::new(BufferedDuplexOutputChannel::new(Arc::new(messaging.create_output_channel("stack", Some("client"))), Arc::new(buffered_config)).unwrap());
        let monitored = MonitoredDuplexOutputChannel::new(buffered.clone(), Arc::new(monitor_config)).unwrap();
        let input_events = EventCollector::new(input.subscribe());
        let buffered_events = EventCollector::new(buffered.subscribe());
        let monitored_events = EventCollector::new(monitored.subscribe());

        input.start_listening().await.unwrap();
        monitored.open_connection().await.unwrap();
        monitored.send_message(Bytes::from_static(b"hello")).await.unwrap();
        assert!(input_events.wait_for(received(b"hello"), Duration::from_secs(2)).await);
        input.send_response_message("client", Bytes::from_static(b"reply")).await.unwrap();
        assert!(monitored_events.wait_for(|e| matches!(e, OutputChannelEvent::ResponseMessageReceived(d) if d.message.as_ref() == b"reply"), Duration::from_secs(2)).await);

        monitored.close_connection().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let buffered_count = buffered_events.events().await.len();
        let monitored_count = monitored_events.events().await.len();
        assert!(buffered_count > 0);
        assert!(monitored_count > 0);

        // every event of both channels went through the shared dispatcher, in dispatch order
        let executed = executed.lock().unwrap().clone();
        assert_eq!(executed, (0..buffered_count + monitored_count).collect::<Vec<_>>());
        // the lower channel's 'opened' is published before the upper channel forwards it
        assert!(matches!(monitored_events.events().await.first(), Some(OutputChannelEvent::ConnectionOpened(_))));
    }
}
