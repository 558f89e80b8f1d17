use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::channel::events::{EventNotifier, InputChannelEvent, MessageReceivedData, ResponseMessageDeliveryData};
use crate::channel::{generate_id, DuplexInputChannel, BROADCAST_RECEIVER_ID};
use crate::config::ReliableConfig;
use crate::reliable::pending::PendingMessages;
use crate::reliable::reliable_message::ReliableMessage;
use crate::util::stop_signal::{StopListener, StopSignal};
use crate::util::tasks::join_all_with_timeout;

/// The input side of reliable channels: it acknowledges every message it receives, and it
///  reports delivery of response messages based on the output side's acknowledgements.
///
/// A broadcast response message is tracked as a single message, which counts as delivered as
///  soon as any response receiver acknowledges it.
pub struct ReliableDuplexInputChannel {
    inner: Arc<ReliableInputInner>,
}

impl ReliableDuplexInputChannel {
    pub fn new(underlying: Arc<dyn DuplexInputChannel>, config: Arc<ReliableConfig>) -> anyhow::Result<ReliableDuplexInputChannel> {
        config.validate()?;
        Ok(ReliableDuplexInputChannel {
            inner: Arc::new(ReliableInputInner {
                channel_id: underlying.channel_id(),
                notifier: EventNotifier::with_dispatcher(config.event_capacity, config.dispatcher.clone()),
                underlying,
                config,
                state: Default::default(),
            }),
        })
    }

    /// sends a response message, returning the id that delivery notifications for it will carry
    pub async fn send_reliable_response_message(&self, response_receiver_id: &str, message: Bytes) -> anyhow::Result<String> {
        let message_id = generate_id();
        {
            let mut state = self.inner.state.lock().await;
            if !state.is_listening {
                bail!("channel {:?} is not listening", self.inner.channel_id);
            }
            // register before sending: the acknowledgement may arrive before sending returns
            state.pending.insert(message_id.clone(), response_receiver_id.to_string(), Instant::now());
            self.inner.ensure_sweeping(&mut state);
        }

        let envelope = ReliableMessage::Message { message_id: message_id.clone(), payload: message };
        if let Err(e) = self.inner.underlying.send_response_message(response_receiver_id, envelope.to_bytes()).await {
            self.inner.state.lock().await
                .pending
                .remove(&message_id);
            return Err(e);
        }

        trace!("sent response message {:?} to {:?}", message_id, response_receiver_id);
        Ok(message_id)
    }

    pub async fn pending_message_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

impl Drop for ReliableDuplexInputChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            if let Some(signal) = state.stop_signal.take() {
                signal.stop();
            }
        }
    }
}

#[async_trait]
impl DuplexInputChannel for ReliableDuplexInputChannel {
    fn channel_id(&self) -> String {
        self.inner.channel_id.clone()
    }

    async fn start_listening(&self) -> anyhow::Result<()> {
        if self.inner.state.lock().await.is_listening {
            bail!("channel {:?} is already listening", self.inner.channel_id);
        }

        let events = self.inner.underlying.subscribe();
        self.inner.underlying.start_listening().await?;

        let mut state = self.inner.state.lock().await;
        if state.is_listening {
            bail!("channel {:?} is already listening", self.inner.channel_id);
        }
        state.session += 1;
        let stop_signal = StopSignal::new();
        let span = debug_span!("reliable_input_events", channel_id = %self.inner.channel_id);
        state.event_task = Some(tokio::spawn(
            self.inner.clone()
                .event_loop(state.session, events, stop_signal.listener())
                .instrument(span)
        ));
        state.stop_signal = Some(stop_signal);
        state.is_listening = true;
        Ok(())
    }

    async fn stop_listening(&self) {
        let (was_listening, stop_signal, handles) = {
            let mut state = self.inner.state.lock().await;
            let was_listening = state.is_listening;
            state.is_listening = false;
            state.is_sweeping = false;
            state.pending.clear();
            let handles = [state.event_task.take(), state.sweep_task.take()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            (was_listening, state.stop_signal.take(), handles)
        };

        if let Some(stop_signal) = stop_signal {
            stop_signal.stop();
        }
        join_all_with_timeout("reliable input", handles, self.inner.config.shutdown_timeout).await;

        if was_listening {
            self.inner.underlying.stop_listening().await;
        }
    }

    async fn is_listening(&self) -> bool {
        self.inner.state.lock().await.is_listening
    }

    async fn send_response_message(&self, response_receiver_id: &str, message: Bytes) -> anyhow::Result<()> {
        self.send_reliable_response_message(response_receiver_id, message).await?;
        Ok(())
    }

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> anyhow::Result<()> {
        self.inner.underlying.disconnect_response_receiver(response_receiver_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<InputChannelEvent> {
        self.inner.notifier.subscribe()
    }
}


#[derive(Default)]
struct ReliableInputState {
    is_listening: bool,
    session: u64,
    stop_signal: Option<StopSignal>,
    /// the response receiver each message was sent to
    pending: PendingMessages<String>,
    is_sweeping: bool,
    event_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

struct ReliableInputInner {
    channel_id: String,
    underlying: Arc<dyn DuplexInputChannel>,
    config: Arc<ReliableConfig>,
    notifier: EventNotifier<InputChannelEvent>,
    state: Mutex<ReliableInputState>,
}

impl ReliableInputInner {
    fn ensure_sweeping(self: &Arc<Self>, state: &mut ReliableInputState) {
        if state.is_sweeping {
            return;
        }
        let Some(stop_signal) = &state.stop_signal else {
            return;
        };

        state.is_sweeping = true;
        let span = debug_span!("reliable_input_sweep", channel_id = %self.channel_id);
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

            for (message_id, response_receiver_id) in expired {
                info!("response message {:?} to {:?} was not acknowledged within {:?}", message_id, response_receiver_id, self.config.acknowledge_timeout);
                self.notifier.send_event(InputChannelEvent::ResponseMessageNotDelivered(ResponseMessageDeliveryData {
                    response_receiver_id,
                    message_id,
                }));
            }

            if is_done {
                return;
            }
        }
    }

    /// Resolves a pending response message. Only the receiver it was sent to can acknowledge
    ///  it, except for broadcasts.
    async fn on_acknowledge(&self, session: u64, acknowledged_by: &str, message_id: String) {
        let resolved = {
            let mut state = self.state.lock().await;
            if state.session != session {
                return;
            }
            match state.pending.target(&message_id).cloned() {
                Some(target) if target == acknowledged_by || target == BROADCAST_RECEIVER_ID => state.pending.remove(&message_id),
                Some(target) => {
                    warn!("response message {:?} was sent to {:?} but acknowledged by {:?} - ignoring", message_id, target, acknowledged_by);
                    return;
                }
                None => None,
            }
        };

        match resolved {
            Some(response_receiver_id) => {
                trace!("response message {:?} was delivered", message_id);
                self.notifier.send_event(InputChannelEvent::ResponseMessageDelivered(ResponseMessageDeliveryData {
                    response_receiver_id,
                    message_id,
                }));
            }
            None => debug!("acknowledge for unknown response message {:?} - ignoring", message_id),
        }
    }

    async fn on_message(&self, session: u64, data: MessageReceivedData) {
        match ReliableMessage::deser(data.message) {
            Ok(ReliableMessage::Message { message_id, payload }) => {
                let ack = ReliableMessage::Acknowledge { message_id };
                if let Err(e) = self.underlying.send_response_message(&data.response_receiver_id, ack.to_bytes()).await {
                    warn!("error acknowledging message {:?} from {:?}: {}", ack.message_id(), data.response_receiver_id, e);
                }
                self.notifier.send_event(InputChannelEvent::MessageReceived(MessageReceivedData {
                    message: payload,
                    ..data
                }));
            }
            Ok(ReliableMessage::Acknowledge { message_id }) => {
                self.on_acknowledge(session, &data.response_receiver_id, message_id).await;
            }
            Err(e) => warn!("dropping malformed message from {:?}: {}", data.response_receiver_id, e),
        }
    }

    async fn event_loop(self: Arc<Self>, session: u64, mut events: broadcast::Receiver<InputChannelEvent>, mut stop: StopListener) {
        while let Some(evt) = stop.recv(&mut events).await {
            match evt {
                InputChannelEvent::MessageReceived(data) => self.on_message(session, data).await,
                other => self.notifier.send_event(other),
            }
        }
        debug!("event loop terminated");
    }
}
