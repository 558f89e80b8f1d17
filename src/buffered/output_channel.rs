use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::channel::events::{ConnectionEventData, ConnectionOpenedData, EventNotifier, OutputChannelEvent};
use crate::channel::DuplexOutputChannel;
use crate::config::BufferedConfig;
use crate::util::stop_signal::{StopListener, StopSignal};
use crate::util::tasks::join_all_with_timeout;

/// An output channel that keeps working while the underlying connection is not available.
///
/// Opening succeeds as soon as the request is registered: the actual connection is established
///  in the background, retrying until it succeeds or the configured maximum offline time is
///  exceeded. Messages sent in the meantime are queued and delivered in FIFO order once the
///  connection is (re-)established. When the underlying connection drops unexpectedly, the
///  channel goes 'offline' and reconnects in the background, again keeping messages queued.
///
/// If the connection cannot be (re-)established within the maximum offline time, queued
///  messages are discarded and the channel is closed (raising `ConnectionClosed`).
pub struct BufferedDuplexOutputChannel {
    inner: Arc<BufferedOutputInner>,
}

impl BufferedDuplexOutputChannel {
    pub fn new(underlying: Arc<dyn DuplexOutputChannel>, config: Arc<BufferedConfig>) -> anyhow::Result<BufferedDuplexOutputChannel> {
        config.validate()?;
        Ok(BufferedDuplexOutputChannel {
            inner: Arc::new(BufferedOutputInner {
                channel_id: underlying.channel_id(),
                response_receiver_id: underlying.response_receiver_id(),
                notifier: EventNotifier::with_dispatcher(config.event_capacity, config.dispatcher.clone()),
                underlying,
                config,
                state: Default::default(),
            }),
        })
    }

    /// `true` while the underlying connection is established, as opposed to
    ///  [DuplexOutputChannel::is_connected] which reflects the application's view
    pub async fn is_online(&self) -> bool {
        self.inner.state.lock().await.is_online
    }

    pub async fn queued_message_count(&self) -> usize {
        self.inner.state.lock().await.send_queue.len()
    }
}

impl Drop for BufferedDuplexOutputChannel {
    fn drop(&mut self) {
        // background tasks hold their own references to the inner state, so they must be told
        //  to stop explicitly
        if let Ok(mut state) = self.inner.state.try_lock() {
            if let Some(signal) = state.stop_signal.take() {
                signal.stop();
            }
        }
    }
}

#[async_trait]
impl DuplexOutputChannel for BufferedDuplexOutputChannel {
    fn channel_id(&self) -> String {
        self.inner.channel_id.clone()
    }

    fn response_receiver_id(&self) -> String {
        self.inner.response_receiver_id.clone()
    }

    async fn open_connection(&self) -> anyhow::Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.is_open {
            bail!("connection {:?} to {:?} is already open", self.inner.response_receiver_id, self.inner.channel_id);
        }

        state.session += 1;
        let session = state.session;
        let stop_signal = StopSignal::new();

        // subscribe before opening to make sure no event of the underlying channel is missed
        let events = self.inner.underlying.subscribe();
        let span = debug_span!("buffered_events", response_receiver_id = %self.inner.response_receiver_id);
        state.event_task = Some(tokio::spawn(
            self.inner.clone()
                .event_loop(session, events, stop_signal.listener())
                .instrument(span)
        ));

        state.is_open = true;
        state.is_online = false;
        state.is_sending = false;
        state.is_opening = false;
        state.stop_signal = Some(stop_signal);

        debug!("opening connection {:?} to {:?} in the background", self.inner.response_receiver_id, self.inner.channel_id);
        self.inner.start_opening(&mut state, false);
        Ok(())
    }

    async fn close_connection(&self) {
        let (was_open, stop_signal, handles) = {
            let mut state = self.inner.state.lock().await;
            let was_open = state.is_open;
            state.is_open = false;
            state.is_online = false;
            state.is_sending = false;
            state.is_opening = false;

            let discarded = state.send_queue.len();
            if discarded > 0 {
                debug!("discarding {} queued messages", discarded);
            }
            state.send_queue.clear();

            let handles = [state.sending_task.take(), state.opening_task.take(), state.event_task.take()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            (was_open, state.stop_signal.take(), handles)
        };

        if let Some(stop_signal) = stop_signal {
            stop_signal.stop();
        }
        join_all_with_timeout("buffered output", handles, self.inner.config.shutdown_timeout).await;

        if was_open {
            self.inner.underlying.close_connection().await;
            info!("connection {:?} to {:?} closed", self.inner.response_receiver_id, self.inner.channel_id);
            self.inner.notifier.send_event(OutputChannelEvent::ConnectionClosed(self.inner.connection_data()));
        }
    }

    async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.is_open
    }

    async fn send_message(&self, message: Bytes) -> anyhow::Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.is_open {
            bail!("connection {:?} to {:?} is not open", self.inner.response_receiver_id, self.inner.channel_id);
        }

        state.send_queue.push_back(message);
        trace!("queued message, {} messages in the send queue", state.send_queue.len());
        self.inner.start_sending(&mut state);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputChannelEvent> {
        self.inner.notifier.subscribe()
    }
}


#[derive(Default)]
struct OutputState {
    is_open: bool,
    is_online: bool,
    /// incremented by every `open_connection` so that background tasks of an earlier
    ///  session can detect they are stale
    session: u64,
    stop_signal: Option<StopSignal>,

    send_queue: VecDeque<Bytes>,
    is_sending: bool,
    is_opening: bool,

    sending_task: Option<JoinHandle<()>>,
    opening_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

struct BufferedOutputInner {
    channel_id: String,
    response_receiver_id: String,
    underlying: Arc<dyn DuplexOutputChannel>,
    config: Arc<BufferedConfig>,
    notifier: EventNotifier<OutputChannelEvent>,
    state: Mutex<OutputState>,
}

impl BufferedOutputInner {
    fn connection_data(&self) -> ConnectionEventData {
        ConnectionEventData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: self.response_receiver_id.clone(),
        }
    }

    fn start_opening(self: &Arc<Self>, state: &mut OutputState, is_reconnect: bool) {
        if state.is_opening {
            return;
        }
        let Some(stop_signal) = &state.stop_signal else {
            return;
        };

        state.is_opening = true;
        let span = debug_span!("buffered_open", response_receiver_id = %self.response_receiver_id);
        state.opening_task = Some(tokio::spawn(
            self.clone()
                .opening_loop(state.session, stop_signal.listener(), is_reconnect)
                .instrument(span)
        ));
    }

    fn start_sending(self: &Arc<Self>, state: &mut OutputState) {
        if state.is_sending || state.send_queue.is_empty() {
            return;
        }
        let Some(stop_signal) = &state.stop_signal else {
            return;
        };

        state.is_sending = true;
        let span = debug_span!("buffered_send", response_receiver_id = %self.response_receiver_id);
        state.sending_task = Some(tokio::spawn(
            self.clone()
                .sending_loop(state.session, stop_signal.listener())
                .instrument(span)
        ));
    }

    async fn opening_loop(self: Arc<Self>, session: u64, mut stop: StopListener, is_reconnect: bool) {
        let max_offline_time = self.config.max_offline_time;
        let started_at = Instant::now();

        loop {
            if stop.is_stopped() {
                return;
            }

            match self.underlying.open_connection().await {
                Ok(()) => break,
                Err(e) => {
                    if self.underlying.is_connected().await {
                        // somebody else opened the underlying connection concurrently
                        debug!("underlying connection is already open");
                        break;
                    }
                    debug!("opening connection failed: {}", e);
                }
            }

            let elapsed = started_at.elapsed();
            if elapsed >= max_offline_time {
                self.on_opening_timed_out(session).await;
                return;
            }

            let pause = self.config.retry_interval.min(max_offline_time - elapsed);
            if !stop.sleep(pause).await {
                return;
            }
        }

        self.on_connection_established(session, is_reconnect).await;
    }

    async fn on_connection_established(self: &Arc<Self>, session: u64, is_reconnect: bool) {
        {
            let mut state = self.state.lock().await;
            if state.session != session || !state.is_open {
                return;
            }
            state.is_opening = false;
            state.is_online = true;
            self.start_sending(&mut state);
        }

        info!("connection {:?} to {:?} is online", self.response_receiver_id, self.channel_id);
        self.notifier.send_event(OutputChannelEvent::ConnectionOpened(ConnectionOpenedData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: self.response_receiver_id.clone(),
            is_reconnect,
        }));
        self.notifier.send_event(OutputChannelEvent::ConnectionOnline(self.connection_data()));
    }

    async fn on_opening_timed_out(&self, session: u64) {
        {
            let mut state = self.state.lock().await;
            if state.session != session || !state.is_open {
                return;
            }

            warn!("connection {:?} to {:?} could not be established within {:?} - giving up and discarding {} queued messages",
                self.response_receiver_id, self.channel_id, self.config.max_offline_time, state.send_queue.len());

            state.is_open = false;
            state.is_online = false;
            state.is_opening = false;
            state.is_sending = false;
            state.send_queue.clear();
            if let Some(stop_signal) = state.stop_signal.take() {
                stop_signal.stop();
            }
        }

        self.notifier.send_event(OutputChannelEvent::ConnectionClosed(self.connection_data()));
    }

    async fn on_connection_lost(self: &Arc<Self>, session: u64) {
        {
            let mut state = self.state.lock().await;
            if state.session != session || !state.is_open || !state.is_online {
                return;
            }
            state.is_online = false;
            self.start_opening(&mut state, true);
        }

        info!("connection {:?} to {:?} is offline, reconnecting", self.response_receiver_id, self.channel_id);
        self.notifier.send_event(OutputChannelEvent::ConnectionOffline(self.connection_data()));
    }

    async fn sending_loop(self: Arc<Self>, session: u64, mut stop: StopListener) {
        loop {
            let message = {
                let mut state = self.state.lock().await;
                if state.session != session || stop.is_stopped() {
                    return;
                }
                match state.send_queue.front().cloned() {
                    Some(message) => message,
                    None => {
                        state.is_sending = false;
                        return;
                    }
                }
            };

            match self.underlying.send_message(message).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if state.session == session && state.is_open {
                        state.send_queue.pop_front();
                    }
                }
                Err(e) => {
                    debug!("sending failed, retrying in {:?}: {}", self.config.retry_interval, e);
                    if !self.underlying.is_connected().await {
                        self.on_connection_lost(session).await;
                    }
                    if !stop.sleep(self.config.retry_interval).await {
                        return;
                    }
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, session: u64, mut events: broadcast::Receiver<OutputChannelEvent>, mut stop: StopListener) {
        while let Some(evt) = stop.recv(&mut events).await {
            match evt {
                OutputChannelEvent::ConnectionOpened(_) => {
                    // the application is notified by the opening loop
                    trace!("underlying connection opened");
                }
                OutputChannelEvent::ConnectionClosed(_) => {
                    self.on_connection_lost(session).await;
                }
                other => {
                    self.notifier.send_event(other);
                }
            }
        }
        debug!("event loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time;

    use super::*;
    use crate::channel::events::InputChannelEvent;
    use crate::channel::DuplexInputChannel;
    use crate::test_util::memory::{MemoryInputChannel, MemoryMessaging};
    use crate::test_util::EventCollector;

    fn config(max_offline_millis: u64) -> Arc<BufferedConfig> {
        Arc::new(BufferedConfig::new(Duration::from_millis(max_offline_millis)))
    }

    fn setup(max_offline_millis: u64) -> (MemoryInputChannel, BufferedDuplexOutputChannel) {
        let messaging = MemoryMessaging::new();
        let input = messaging.create_input_channel("ch");
        let output = BufferedDuplexOutputChannel::new(
            Arc::new(messaging.create_output_channel("ch", Some("client"))),
            config(max_offline_millis),
        ).unwrap();
        (input, output)
    }

    fn received_messages(events: &[InputChannelEvent]) -> Vec<Bytes> {
        events.iter()
            .filter_map(|e| match e {
                InputChannelEvent::MessageReceived(d) => Some(d.message.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_sent_before_listening_is_delivered() {
        let (input, output) = setup(1000);
        let input_events = EventCollector::new(input.subscribe());
        let output_events = EventCollector::new(output.subscribe());

        output.open_connection().await.unwrap();
        assert!(output.is_connected().await);
        output.send_message(Bytes::from_static(b"A")).await.unwrap();

        time::sleep(Duration::from_millis(400)).await;
        assert!(!output.is_online().await);
        input.start_listening().await.unwrap();

        assert!(input_events.wait_for(|e| matches!(e, InputChannelEvent::MessageReceived(d) if d.message.as_ref() == b"A"), Duration::from_secs(2)).await);
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), Duration::from_secs(1)).await);
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionOpened(d) if !d.is_reconnect)).await, 1);
        assert_eq!(output.queued_message_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_across_reconnect() {
        let (input, output) = setup(5000);
        let input_events = EventCollector::new(input.subscribe());
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), Duration::from_secs(1)).await);

        input.stop_listening().await;
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOffline(_)), Duration::from_secs(1)).await);

        let expected = (0..20u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>();
        for message in &expected {
            output.send_message(message.clone()).await.unwrap();
        }

        time::sleep(Duration::from_millis(1000)).await;
        input.start_listening().await.unwrap();

        assert!(input_events.wait_for_count(|e| matches!(e, InputChannelEvent::MessageReceived(_)), 20, Duration::from_secs(5)).await);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(received_messages(&input_events.events().await), expected);
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionOpened(d) if d.is_reconnect)).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_offline_time() {
        let (_input, output) = setup(1000);
        let output_events = EventCollector::new(output.subscribe());

        let started_at = Instant::now();
        output.open_connection().await.unwrap();
        for _ in 0..3 {
            output.send_message(Bytes::from_static(b"lost")).await.unwrap();
        }

        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionClosed(_)), Duration::from_secs(3)).await);
        assert!(started_at.elapsed() <= Duration::from_millis(1100));

        assert_eq!(output.queued_message_count().await, 0);
        assert!(!output.is_connected().await);
        assert!(output.send_message(Bytes::from_static(b"x")).await.is_err());
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_))).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_after_disconnect_by_peer() {
        let (input, output) = setup(5000);
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), Duration::from_secs(1)).await);

        input.disconnect_response_receiver("client").await.unwrap();

        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOffline(_)), Duration::from_secs(1)).await);
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOpened(d) if d.is_reconnect), Duration::from_secs(2)).await);
        assert!(output.is_online().await);
        assert_eq!(input.connected_response_receivers().await, vec!["client".to_string()]);
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionClosed(_))).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_fails() {
        let (_input, output) = setup(1000);
        output.open_connection().await.unwrap();
        assert!(output.open_connection().await.is_err());
        output.close_connection().await;
    }

    #[tokio::test]
    async fn test_send_without_open_fails() {
        let (_input, output) = setup(1000);
        assert!(output.send_message(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (input, output) = setup(5000);
        let input_events = EventCollector::new(input.subscribe());
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), Duration::from_secs(1)).await);

        output.close_connection().await;
        output.close_connection().await;

        assert!(input_events.wait_for(|e| matches!(e, InputChannelEvent::ResponseReceiverDisconnected(_)), Duration::from_secs(1)).await);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionClosed(_))).await, 1);
        assert_eq!(output_events.count(|e| matches!(e, OutputChannelEvent::ConnectionOffline(_))).await, 0);
        assert!(!output.is_connected().await);

        // the channel can be reopened
        output.open_connection().await.unwrap();
        assert!(output_events.wait_for_count(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), 2, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_messages_are_forwarded() {
        let (input, output) = setup(5000);
        let output_events = EventCollector::new(output.subscribe());

        input.start_listening().await.unwrap();
        output.open_connection().await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ConnectionOnline(_)), Duration::from_secs(1)).await);

        input.send_response_message("client", Bytes::from_static(b"response")).await.unwrap();
        assert!(output_events.wait_for(|e| matches!(e, OutputChannelEvent::ResponseMessageReceived(d) if d.message.as_ref() == b"response"), Duration::from_secs(1)).await);
    }
}
