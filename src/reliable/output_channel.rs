use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::channel::events::{ConnectionEventData, EventNotifier, MessageDeliveryData, OutputChannelEvent, ResponseMessageData};
use crate::channel::{generate_id, DuplexOutputChannel};
use crate::config::ReliableConfig;
use crate::reliable::pending::PendingMessages;
use crate::reliable::reliable_message::ReliableMessage;
use crate::util::stop_signal::{StopListener, StopSignal};
use crate::util::tasks::join_all_with_timeout;

/// An output channel that tells the application whether each message reached the input side.
///
/// Every message gets a fresh id which the input side acknowledges. The application receives
///  `MessageDelivered` when the acknowledgement arrives, or `MessageNotDelivered` if it does
///  not arrive within the acknowledge timeout. Response messages from the input side are
///  acknowledged in turn.
///
/// This requires the input side to be a [super::ReliableDuplexInputChannel].
pub struct ReliableDuplexOutputChannel {
    inner: Arc<ReliableOutputInner>,
}

impl ReliableDuplexOutputChannel {
    pub fn new(underlying: Arc<dyn DuplexOutputChannel>, config: Arc<ReliableConfig>) -> anyhow::Result<ReliableDuplexOutputChannel> {
        config.validate()?;
        Ok(ReliableDuplexOutputChannel {
            inner: Arc::new(ReliableOutputInner {
                channel_id: underlying.channel_id(),
                response_receiver_id: underlying.response_receiver_id(),
                notifier: EventNotifier::with_dispatcher(config.event_capacity, config.dispatcher.clone()),
                underlying,
                config,
                state: Default::default(),
            }),
        })
    }

    /// sends a message, returning the id that delivery notifications for it will carry
    pub async fn send_reliable_message(&self, message: Bytes) -> anyhow::Result<String> {
        let message_id = generate_id();
        {
            let mut state = self.inner.state.lock().await;
            if !state.is_open {
                bail!("connection {:?} to {:?} is not open", self.inner.response_receiver_id, self.inner.channel_id);
            }
            // register before sending: the acknowledgement may arrive before sending returns
            state.pending.insert(message_id.clone(), (), Instant::now());
            self.inner.ensure_sweeping(&mut state);
        }

        let envelope = ReliableMessage::Message { message_id: message_id.clone(), payload: message };
        if let Err(e) = self.inner.underlying.send_message(envelope.to_bytes()).await {
            self.inner.state.lock().await
                .pending
                .remove(&message_id);
            return Err(e);
        }

        trace!("sent message {:?}", message_id);
        Ok(message_id)
    }

    pub async fn pending_message_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

impl Drop for ReliableDuplexOutputChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            if let Some(signal) = state.stop_signal.take() {
                signal.stop();
            }
        }
    }
}

#[async_trait]
impl DuplexOutputChannel for ReliableDuplexOutputChannel {
    fn channel_id(&self) -> String {
        self.inner.channel_id.clone()
    }

    fn response_receiver_id(&self) -> String {
        self.inner.response_receiver_id.clone()
    }

    async fn open_connection(&self) -> anyhow::Result<()> {
        if self.inner.state.lock().await.is_open {
            bail!("connection {:?} to {:?} is already open", self.inner.response_receiver_id, self.inner.channel_id);
        }

        let events = self.inner.underlying.subscribe();
        self.inner.underlying.open_connection().await?;

        let mut state = self.inner.state.lock().await;
        if state.is_open {
            bail!("connection {:?} to {:?} is already open", self.inner.response_receiver_id, self.inner.channel_id);
        }
        state.session += 1;
        let stop_signal = StopSignal::new();
        let span = debug_span!("reliable_events", response_receiver_id = %self.inner.response_receiver_id);
        state.event_task = Some(tokio::spawn(
            self.inner.clone()
                .event_loop(state.session, events, stop_signal.listener())
                .instrument(span)
        ));
        state.stop_signal = Some(stop_signal);
        state.is_open = true;
        Ok(())
    }

    async fn close_connection(&self) {
        let (was_open, stop_signal, handles) = {
            let mut state = self.inner.state.lock().await;
            let was_open = state.is_open;
            state.is_open = false;
            state.is_sweeping = false;
            if !state.pending.is_empty() {
                debug!("closing with {} unacknowledged messages", state.pending.len());
            }
            state.pending.clear();
            let handles = [state.event_task.take(), state.sweep_task.take()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            (was_open, state.stop_signal.take(), handles)
        };

        if let Some(stop_signal) = stop_signal {
            stop_signal.stop();
        }
        join_all_with_timeout("reliable output", handles, self.inner.config.shutdown_timeout).await;

        if was_open {
            self.inner.underlying.close_connection().await;
            info!("connection {:?} to {:?} closed", self.inner.response_receiver_id, self.inner.channel_id);
            self.inner.notifier.send_event(OutputChannelEvent::ConnectionClosed(ConnectionEventData {
                channel_id: self.inner.channel_id.clone(),
                response_receiver_id: self.inner.response_receiver_id.clone(),
            }));
        }
    }

    async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.is_open && self.inner.underlying.is_connected().await
    }

    async fn send_message(&self, message: Bytes) -> anyhow::Result<()> {
        self.send_reliable_message(message).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputChannelEvent> {
        self.inner.notifier.subscribe()
    }
}


#[derive(Default)]
struct ReliableOutputState {
    is_open: bool,
    session: u64,
    stop_signal: Option<StopSignal>,
    pending: PendingMessages<()>,
    is_sweeping: bool,
    event_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

struct ReliableOutputInner {
    channel_id: String,
    response_receiver_id: String,
    underlying: Arc<dyn DuplexOutputChannel>,
    config: Arc<ReliableConfig>,
    notifier: EventNotifier<OutputChannelEvent>,
    state: Mutex<ReliableOutputState>,
}

impl ReliableOutputInner {
    fn ensure_sweeping(self: &Arc<Self>, state: &mut ReliableOutputState) {
        if state.is_sweeping {
            return;
        }
        let Some(stop_signal) = &state.stop_signal else {
            return;
        };

        state.is_sweeping = true;
        let span = debug_span!("reliable_sweep", response_receiver_id = %self.response_receiver_id);
        state.sweep_task = Some(tokio::spawn(
            self.clone()
                .sweep_loop(state.session, stop_signal.listener())
                .instrument(span)
        ));
    }

    async fn sweep_loop(self: Arc<Self>, session: u64, mut stop: StopListener) {
        loop {
            if !stop.sleep(self.config.sweep_interval).await {
                return;
            }

            let (expired, is_done) = {
                let mut state = self.state.lock().await;
                if state.session != session {
                    return;
                }
                let expired = state.pending.take_expired(Instant::now(), self.config.acknowledge_timeout);
                let is_done = state.pending.is_empty();
                if is_done {
                    state.is_sweeping = false;
                }
                (expired, is_done)
            };

            for (message_id, _) in expired {
                info!("message {:?} was not acknowledged within {:?}", message_id, self.config.acknowledge_timeout);
                self.notifier.send_event(OutputChannelEvent::MessageNotDelivered(MessageDeliveryData { message_id }));
            }

            if is_done {
                return;
            }
        }
    }

    async fn on_response(&self, session: u64, data: ResponseMessageData) {
        match ReliableMessage::deser(data.message) {
            Ok(ReliableMessage::Message { message_id, payload }) => {
                let ack = ReliableMessage::Acknowledge { message_id };
                if let Err(e) = self.underlying.send_message(ack.to_bytes()).await {
                    warn!("error acknowledging response message {:?}: {}", ack.message_id(), e);
                }
                self.notifier.send_event(OutputChannelEvent::ResponseMessageReceived(ResponseMessageData {
                    message: payload,
                    ..data
                }));
            }
            Ok(ReliableMessage::Acknowledge { message_id }) => {
                let was_pending = {
                    let mut state = self.state.lock().await;
                    state.session == session && state.pending.remove(&message_id).is_some()
                };
                if was_pending {
                    trace!("message {:?} was delivered", message_id);
                    self.notifier.send_event(OutputChannelEvent::MessageDelivered(MessageDeliveryData { message_id }));
                }
                else {
                    debug!("acknowledge for unknown message {:?} - ignoring", message_id);
                }
            }
            Err(e) => warn!("dropping malformed response message: {}", e),
        }
    }

    /// The underlying connection was closed without this channel asking for it. Called from the
    ///  event loop, so this does not wait for background tasks to terminate.
    async fn on_underlying_closed(&self, session: u64, data: ConnectionEventData) {
        {
            let mut state = self.state.lock().await;
            if state.session != session || !state.is_open {
                return;
            }
            state.is_open = false;
            state.is_sweeping = false;
            if !state.pending.is_empty() {
                debug!("connection lost with {} unacknowledged messages", state.pending.len());
            }
            state.pending.clear();
            if let Some(stop_signal) = state.stop_signal.take() {
                stop_signal.stop();
            }
            state.event_task = None;
            state.sweep_task = None;
        }

        info!("connection {:?} to {:?} was closed by the underlying channel", self.response_receiver_id, self.channel_id);
        self.underlying.close_connection().await;
        self.notifier.send_event(OutputChannelEvent::ConnectionClosed(data));
    }

    async fn event_loop(self: Arc<Self>, session: u64, mut events: broadcast::Receiver<OutputChannelEvent>, mut stop: StopListener) {
        while let Some(evt) = stop.recv(&mut events).await {
            match evt {
                OutputChannelEvent::ResponseMessageReceived(data) => self.on_response(session, data).await,
                OutputChannelEvent::ConnectionClosed(data) => self.on_underlying_closed(session, data).await,
                other => self.notifier.send_event(other),
            }
        }
        debug!("event loop terminated");
    }
}
