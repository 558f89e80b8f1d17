use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::channel::events::{EventNotifier, InputChannelEvent, MessageReceivedData, ResponseReceiverData};
use crate::channel::DuplexInputChannel;
use crate::config::MonitorConfig;
use crate::monitored::monitor_message::MonitorMessage;
use crate::util::stop_signal::{StopListener, StopSignal};
use crate::util::tasks::join_all_with_timeout;

/// The input side of monitored channels: it echoes pings, and it disconnects response
///  receivers that were silent for longer than the receive timeout.
pub struct MonitoredDuplexInputChannel {
    inner: Arc<MonitoredInputInner>,
}

impl MonitoredDuplexInputChannel {
    pub fn new(underlying: Arc<dyn DuplexInputChannel>, config: Arc<MonitorConfig>) -> anyhow::Result<MonitoredDuplexInputChannel> {
        config.validate()?;
        Ok(MonitoredDuplexInputChannel {
            inner: Arc::new(MonitoredInputInner {
                channel_id: underlying.channel_id(),
                notifier: EventNotifier::with_dispatcher(config.event_capacity, config.dispatcher.clone()),
                ping: MonitorMessage::Ping.to_bytes(),
                underlying,
                config,
                state: Default::default(),
            }),
        })
    }

    pub async fn monitored_response_receivers(&self) -> Vec<String> {
        self.inner.state.lock().await
            .receivers
            .keys()
            .cloned()
            .collect()
    }
}

impl Drop for MonitoredDuplexInputChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            if let Some(signal) = state.stop_signal.take() {
                signal.stop();
            }
        }
    }
}

#[async_trait]
impl DuplexInputChannel for MonitoredDuplexInputChannel {
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
        let span = debug_span!("monitored_input_events", channel_id = %self.inner.channel_id);
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
            state.receivers.clear();
            let handles = [state.event_task.take(), state.sweep_task.take()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            (was_listening, state.stop_signal.take(), handles)
        };

        if let Some(stop_signal) = stop_signal {
            stop_signal.stop();
        }
        join_all_with_timeout("monitored input", handles, self.inner.config.shutdown_timeout).await;

        if was_listening {
            self.inner.underlying.stop_listening().await;
        }
    }

    async fn is_listening(&self) -> bool {
        self.inner.state.lock().await.is_listening
    }

    async fn send_response_message(&self, response_receiver_id: &str, message: Bytes) -> anyhow::Result<()> {
        if !self.is_listening().await {
            bail!("channel {:?} is not listening", self.inner.channel_id);
        }
        self.inner.underlying.send_response_message(response_receiver_id, MonitorMessage::Message(message).to_bytes()).await
    }

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> anyhow::Result<()> {
        self.inner.state.lock().await
            .receivers
            .remove(response_receiver_id);
        self.inner.underlying.disconnect_response_receiver(response_receiver_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<InputChannelEvent> {
        self.inner.notifier.subscribe()
    }
}


struct ReceiverActivity {
    sender_address: String,
    last_activity: Instant,
}

#[derive(Default)]
struct MonitoredInputState {
    is_listening: bool,
    session: u64,
    stop_signal: Option<StopSignal>,
    receivers: FxHashMap<String, ReceiverActivity>,
    is_sweeping: bool,
    event_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

struct MonitoredInputInner {
    channel_id: String,
    underlying: Arc<dyn DuplexInputChannel>,
    config: Arc<MonitorConfig>,
    notifier: EventNotifier<InputChannelEvent>,
    ping: Bytes,
    state: Mutex<MonitoredInputState>,
}

impl MonitoredInputInner {
    /// registers activity for a response receiver, starting to track it if it is not known yet
    async fn on_activity(self: &Arc<Self>, session: u64, response_receiver_id: &str, sender_address: &str) {
        let mut state = self.state.lock().await;
        if state.session != session {
            return;
        }

        let now = Instant::now();
        state.receivers.entry(response_receiver_id.to_string())
            .and_modify(|activity| activity.last_activity = now)
            .or_insert_with(|| ReceiverActivity {
                sender_address: sender_address.to_string(),
                last_activity: now,
            });
        self.ensure_sweeping(&mut state);
    }

    fn ensure_sweeping(self: &Arc<Self>, state: &mut MonitoredInputState) {
        if state.is_sweeping {
            return;
        }
        let Some(stop_signal) = &state.stop_signal else {
            return;
        };

        state.is_sweeping = true;
        let span = debug_span!("monitored_sweep", channel_id = %self.channel_id);
        state.sweep_task = Some(tokio::spawn(
            self.clone()
                .sweep_loop(state.session, stop_signal.listener())
                .instrument(span)
        ));
    }

    async fn sweep_loop(self: Arc<Self>, session: u64, mut stop: StopListener) {
        let receive_timeout = self.config.receive_timeout;

        loop {
            if !stop.sleep(self.config.sweep_interval).await {
                return;
            }

            let (inactive, is_done) = {
                let mut state = self.state.lock().await;
                if state.session != session {
                    return;
                }

                let now = Instant::now();
                let inactive_ids = state.receivers.iter()
                    .filter(|(_, activity)| now.saturating_duration_since(activity.last_activity) > receive_timeout)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>();
                let inactive = inactive_ids.into_iter()
                    .filter_map(|id| state.receivers.remove(&id).map(|activity| (id, activity)))
                    .collect::<Vec<_>>();

                let is_done = state.receivers.is_empty();
                if is_done {
                    state.is_sweeping = false;
                }
                (inactive, is_done)
            };

            for (id, activity) in inactive {
                info!("response receiver {:?} was inactive for more than {:?} - disconnecting", id, receive_timeout);
                if let Err(e) = self.underlying.disconnect_response_receiver(&id).await {
                    warn!("error disconnecting response receiver {:?}: {}", id, e);
                }
                self.notifier.send_event(InputChannelEvent::ResponseReceiverDisconnected(ResponseReceiverData {
                    channel_id: self.channel_id.clone(),
                    response_receiver_id: id,
                    sender_address: activity.sender_address,
                }));
            }

            if is_done {
                return;
            }
        }
    }

    async fn on_message(self: &Arc<Self>, session: u64, data: MessageReceivedData) {
        self.on_activity(session, &data.response_receiver_id, &data.sender_address).await;

        match MonitorMessage::deser(data.message) {
            Ok(MonitorMessage::Ping) => {
                trace!("echoing ping from {:?}", data.response_receiver_id);
                if let Err(e) = self.underlying.send_response_message(&data.response_receiver_id, self.ping.clone()).await {
                    warn!("error echoing ping to {:?}: {}", data.response_receiver_id, e);
                }
            }
            Ok(MonitorMessage::Message(message)) => {
                self.notifier.send_event(InputChannelEvent::MessageReceived(MessageReceivedData {
                    message,
                    ..data
                }));
            }
            Err(e) => warn!("dropping malformed message from {:?}: {}", data.response_receiver_id, e),
        }
    }

    async fn on_disconnected(&self, session: u64, data: ResponseReceiverData) {
        let was_tracked = {
            let mut state = self.state.lock().await;
            state.session == session && state.receivers.remove(&data.response_receiver_id).is_some()
        };

        // receivers that were removed by the sweep or explicitly were reported already
        if was_tracked {
            debug!("response receiver {:?} disconnected", data.response_receiver_id);
            self.notifier.send_event(InputChannelEvent::ResponseReceiverDisconnected(data));
        }
    }

    async fn event_loop(self: Arc<Self>, session: u64, mut events: broadcast::Receiver<InputChannelEvent>, mut stop: StopListener) {
        while let Some(evt) = stop.recv(&mut events).await {
            match evt {
                InputChannelEvent::ResponseReceiverConnected(data) => {
                    self.on_activity(session, &data.response_receiver_id, &data.sender_address).await;
                    self.notifier.send_event(InputChannelEvent::ResponseReceiverConnected(data));
                }
                InputChannelEvent::ResponseReceiverDisconnected(data) => self.on_disconnected(session, data).await,
                InputChannelEvent::MessageReceived(data) => self.on_message(session, data).await,
                other => self.notifier.send_event(other),
            }
        }
        debug!("event loop terminated");
    }
}
