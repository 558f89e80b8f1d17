use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, Instrument};

use crate::buffered::receiver_context::{BroadcastRecord, ResponseReceiverContext};
use crate::channel::events::{EventNotifier, InputChannelEvent, ResponseReceiverData};
use crate::channel::{DuplexInputChannel, BROADCAST_RECEIVER_ID};
use crate::config::BufferedConfig;
use crate::util::stop_signal::{StopListener, StopSignal};
use crate::util::tasks::join_all_with_timeout;

/// An input channel that buffers response messages for response receivers that are
///  temporarily unreachable.
///
/// Each response receiver has its own FIFO queue, and messages are kept while the receiver is
///  offline. A receiver that stays offline longer than the maximum offline time is removed
///  (discarding its messages) and reported as disconnected. Response messages can be sent to
///  receivers that have not connected yet; they are delivered when the receiver connects.
///
/// Broadcasts are delivered to all known receivers, and they are retained to be replayed to
///  receivers connecting for the first time later. Replayed broadcasts precede the receiver's
///  own queued messages.
pub struct BufferedDuplexInputChannel {
    inner: Arc<BufferedInputInner>,
}

impl BufferedDuplexInputChannel {
    pub fn new(underlying: Arc<dyn DuplexInputChannel>, config: Arc<BufferedConfig>) -> anyhow::Result<BufferedDuplexInputChannel> {
        config.validate()?;
        Ok(BufferedDuplexInputChannel {
            inner: Arc::new(BufferedInputInner {
                channel_id: underlying.channel_id(),
                notifier: EventNotifier::with_dispatcher(config.event_capacity, config.dispatcher.clone()),
                underlying,
                config,
                state: Default::default(),
            }),
        })
    }

    /// `None` if the response receiver is not known (any more)
    pub async fn is_response_receiver_online(&self, response_receiver_id: &str) -> Option<bool> {
        self.inner.state.lock().await
            .receivers
            .get(response_receiver_id)
            .map(|ctx| ctx.is_online)
    }

    pub async fn queued_message_count(&self, response_receiver_id: &str) -> Option<usize> {
        self.inner.state.lock().await
            .receivers
            .get(response_receiver_id)
            .map(|ctx| ctx.sender.len())
    }

    pub async fn retained_broadcast_count(&self) -> usize {
        self.inner.state.lock().await.broadcasts.len()
    }
}

impl Drop for BufferedDuplexInputChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            if let Some(signal) = state.stop_signal.take() {
                signal.stop();
            }
        }
    }
}

#[async_trait]
impl DuplexInputChannel for BufferedDuplexInputChannel {
    fn channel_id(&self) -> String {
        self.inner.channel_id.clone()
    }

    async fn start_listening(&self) -> anyhow::Result<()> {
        if self.inner.state.lock().await.is_listening {
            bail!("channel {:?} is already listening", self.inner.channel_id);
        }

        // events are buffered in the receiver until the event loop is running
        let events = self.inner.underlying.subscribe();
        self.inner.underlying.start_listening().await?;

        let mut state = self.inner.state.lock().await;
        if state.is_listening {
            bail!("channel {:?} is already listening", self.inner.channel_id);
        }
        state.session += 1;
        let stop_signal = StopSignal::new();

        let span = debug_span!("buffered_input_events", channel_id = %self.inner.channel_id);
        state.event_task = Some(tokio::spawn(
            self.inner.clone()
                .event_loop(state.session, events, stop_signal.listener())
                .instrument(span)
        ));
        state.stop_signal = Some(stop_signal);
        state.is_listening = true;

        info!("listening on {:?}", self.inner.channel_id);
        Ok(())
    }

    async fn stop_listening(&self) {
        let (was_listening, stop_signal, handles) = {
            let mut state = self.inner.state.lock().await;
            let was_listening = state.is_listening;
            state.is_listening = false;
            state.is_sweeping = false;
            state.broadcasts.clear();

            let mut handles = state.receivers
                .drain()
                .filter_map(|(_, mut ctx)| ctx.sender.take_task())
                .collect::<Vec<_>>();
            handles.extend(state.event_task.take());
            handles.extend(state.sweep_task.take());
            (was_listening, state.stop_signal.take(), handles)
        };

        if let Some(stop_signal) = stop_signal {
            stop_signal.stop();
        }
        join_all_with_timeout("buffered input", handles, self.inner.config.shutdown_timeout).await;

        if was_listening {
            self.inner.underlying.stop_listening().await;
            info!("stopped listening on {:?}", self.inner.channel_id);
        }
    }

    async fn is_listening(&self) -> bool {
        self.inner.state.lock().await.is_listening
    }

    async fn send_response_message(&self, response_receiver_id: &str, message: Bytes) -> anyhow::Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.is_listening {
            bail!("channel {:?} is not listening", self.inner.channel_id);
        }

        if response_receiver_id == BROADCAST_RECEIVER_ID {
            self.inner.broadcast(&mut state, message);
        }
        else {
            if !state.receivers.contains_key(response_receiver_id) {
                debug!("response message for unknown receiver {:?} - buffering it in case it connects", response_receiver_id);
                let generation = state.next_generation();
                let ctx = ResponseReceiverContext::new_pending(response_receiver_id, generation, state.next_broadcast_seq, Instant::now());
                state.receivers.insert(response_receiver_id.to_string(), ctx);
                self.inner.ensure_sweeping(&mut state);
            }
            if let Some(ctx) = state.receivers.get_mut(response_receiver_id) {
                ctx.sender.enqueue(message);
            }
            self.inner.start_delivery(&mut state, response_receiver_id);
        }
        Ok(())
    }

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> anyhow::Result<()> {
        let removed = {
            let mut state = self.inner.state.lock().await;
            if !state.is_listening {
                bail!("channel {:?} is not listening", self.inner.channel_id);
            }
            state.receivers.remove(response_receiver_id)
        };

        if let Some(ctx) = removed {
            debug!("disconnecting response receiver {:?}, discarding {} queued messages", response_receiver_id, ctx.sender.len());
        }
        self.inner.underlying.disconnect_response_receiver(response_receiver_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<InputChannelEvent> {
        self.inner.notifier.subscribe()
    }
}


#[derive(Default)]
struct InputState {
    is_listening: bool,
    session: u64,
    stop_signal: Option<StopSignal>,

    receivers: FxHashMap<String, ResponseReceiverContext>,
    last_generation: u64,

    broadcasts: VecDeque<BroadcastRecord>,
    next_broadcast_seq: u64,

    is_sweeping: bool,
    event_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl InputState {
    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    /// retained broadcasts that were sent before a context with the given `first_broadcast_seq`
    ///  was created, in the order they were sent
    fn broadcasts_for_replay(&self, first_broadcast_seq: u64, now: Instant, retention: Duration) -> Vec<Bytes> {
        self.broadcasts.iter()
            .filter(|b| b.seq < first_broadcast_seq)
            .filter(|b| !b.is_expired(now, retention))
            .map(|b| b.message.clone())
            .collect()
    }
}

struct BufferedInputInner {
    channel_id: String,
    underlying: Arc<dyn DuplexInputChannel>,
    config: Arc<BufferedConfig>,
    notifier: EventNotifier<InputChannelEvent>,
    state: Mutex<InputState>,
}

impl BufferedInputInner {
    fn receiver_data(&self, ctx: &ResponseReceiverContext) -> ResponseReceiverData {
        ResponseReceiverData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: ctx.response_receiver_id.clone(),
            sender_address: ctx.sender_address.clone(),
        }
    }

    fn broadcast(self: &Arc<Self>, state: &mut InputState, message: Bytes) {
        let seq = state.next_broadcast_seq;
        state.next_broadcast_seq += 1;
        state.broadcasts.push_back(BroadcastRecord {
            seq,
            message: message.clone(),
            sent_at: Instant::now(),
        });

        let ids = state.receivers.keys().cloned().collect::<Vec<_>>();
        trace!("broadcasting to {} response receivers", ids.len());
        for id in &ids {
            if let Some(ctx) = state.receivers.get_mut(id) {
                ctx.sender.enqueue(message.clone());
            }
            self.start_delivery(state, id);
        }
        self.ensure_sweeping(state);
    }

    fn start_delivery(self: &Arc<Self>, state: &mut InputState, response_receiver_id: &str) {
        let stop = match &state.stop_signal {
            Some(signal) => signal.listener(),
            None => return,
        };
        let session = state.session;

        let Some(ctx) = state.receivers.get_mut(response_receiver_id) else {
            return;
        };
        if !ctx.is_online || !ctx.sender.begin_sending() {
            return;
        }

        let span = debug_span!("buffered_response_send", response_receiver_id = %response_receiver_id);
        let handle = tokio::spawn(
            self.clone()
                .delivery_loop(session, ctx.generation, response_receiver_id.to_string(), stop)
                .instrument(span)
        );
        ctx.sender.set_task(handle);
    }

    fn ensure_sweeping(self: &Arc<Self>, state: &mut InputState) {
        if state.is_sweeping {
            return;
        }
        let Some(stop_signal) = &state.stop_signal else {
            return;
        };

        state.is_sweeping = true;
        let span = debug_span!("buffered_sweep", channel_id = %self.channel_id);
        state.sweep_task = Some(tokio::spawn(
            self.clone()
                .sweep_loop(state.session, stop_signal.listener())
                .instrument(span)
        ));
    }

    async fn delivery_loop(self: Arc<Self>, session: u64, generation: u64, response_receiver_id: String, stop: StopListener) {
        loop {
            let message = {
                let mut state = self.state.lock().await;
                if state.session != session || stop.is_stopped() {
                    return;
                }
                let Some(ctx) = state.receivers.get_mut(&response_receiver_id) else {
                    return;
                };
                if ctx.generation != generation {
                    return;
                }
                if !ctx.is_online {
                    ctx.sender.finish_sending();
                    return;
                }
                match ctx.sender.next_message() {
                    Some(message) => message,
                    None => return,
                }
            };

            let result = self.underlying.send_response_message(&response_receiver_id, message).await;

            let mut state = self.state.lock().await;
            if state.session != session {
                return;
            }
            let Some(ctx) = state.receivers.get_mut(&response_receiver_id) else {
                return;
            };
            if ctx.generation != generation {
                return;
            }

            match result {
                Ok(()) => ctx.sender.confirm_sent(),
                Err(e) => {
                    debug!("sending response message failed, {} messages remain queued: {}", ctx.sender.len(), e);
                    ctx.sender.finish_sending();
                    if ctx.set_offline(Instant::now()) {
                        let data = self.receiver_data(ctx);
                        self.ensure_sweeping(&mut state);
                        drop(state);

                        info!("response receiver {:?} is offline", response_receiver_id);
                        self.notifier.send_event(InputChannelEvent::ResponseReceiverOffline(data));
                    }
                    return;
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, session: u64, mut stop: StopListener) {
        let max_offline_time = self.config.max_offline_time;
        let retention = self.config.effective_broadcast_retention();

        loop {
            if !stop.sleep(self.config.sweep_interval).await {
                return;
            }

            let (expired, is_done) = {
                let mut state = self.state.lock().await;
                if state.session != session {
                    return;
                }
                let now = Instant::now();

                let num_broadcasts = state.broadcasts.len();
                state.broadcasts.retain(|b| !b.is_expired(now, retention));
                if state.broadcasts.len() < num_broadcasts {
                    debug!("discarded {} expired broadcast messages", num_broadcasts - state.broadcasts.len());
                }

                let expired_ids = state.receivers.values()
                    .filter(|ctx| ctx.is_expired(now, max_offline_time))
                    .map(|ctx| ctx.response_receiver_id.clone())
                    .collect::<Vec<_>>();
                let expired = expired_ids.iter()
                    .filter_map(|id| state.receivers.remove(id))
                    .collect::<Vec<_>>();

                let is_done = state.receivers.is_empty() && state.broadcasts.is_empty();
                if is_done {
                    state.is_sweeping = false;
                }
                (expired, is_done)
            };

            for ctx in expired {
                info!("response receiver {:?} was offline longer than {:?} - discarding {} queued messages",
                    ctx.response_receiver_id, max_offline_time, ctx.sender.len());
                self.notifier.send_event(InputChannelEvent::ResponseReceiverDisconnected(self.receiver_data(&ctx)));
            }

            if is_done {
                debug!("nothing left to check, sweeping stops");
                return;
            }
        }
    }

    async fn on_receiver_connected(self: &Arc<Self>, session: u64, data: ResponseReceiverData) {
        let id = &data.response_receiver_id;
        let (data, is_first_connect) = {
            let mut state = self.state.lock().await;
            if state.session != session {
                return;
            }
            let now = Instant::now();

            // a peer that was dropped by disconnect_response_receiver gets a fresh context, and
            //  with it a replay of all retained broadcasts, including those it already received
            if !state.receivers.contains_key(id) {
                let generation = state.next_generation();
                let ctx = ResponseReceiverContext::new_pending(id, generation, state.next_broadcast_seq, now);
                state.receivers.insert(id.clone(), ctx);
            }

            let Some((is_first_connect, first_broadcast_seq)) = state.receivers.get(id)
                .map(|ctx| (ctx.pending_connected_event, ctx.first_broadcast_seq))
            else {
                return;
            };
            let replay = if is_first_connect {
                state.broadcasts_for_replay(first_broadcast_seq, now, self.config.effective_broadcast_retention())
            }
            else {
                Vec::new()
            };

            let Some(ctx) = state.receivers.get_mut(id) else {
                return;
            };
            if !replay.is_empty() {
                debug!("replaying {} broadcast messages to {:?}", replay.len(), id);
                ctx.sender.prepend(replay);
            }
            ctx.pending_connected_event = false;
            ctx.set_online(&data.sender_address);
            let data = self.receiver_data(ctx);

            self.start_delivery(&mut state, id);
            (data, is_first_connect)
        };

        if is_first_connect {
            info!("response receiver {:?} connected", data.response_receiver_id);
            self.notifier.send_event(InputChannelEvent::ResponseReceiverConnected(data.clone()));
        }
        else {
            info!("response receiver {:?} is back online", data.response_receiver_id);
        }
        self.notifier.send_event(InputChannelEvent::ResponseReceiverOnline(data));
    }

    async fn on_receiver_disconnected(self: &Arc<Self>, session: u64, data: ResponseReceiverData) {
        let data = {
            let mut state = self.state.lock().await;
            if state.session != session {
                return;
            }
            let Some(ctx) = state.receivers.get_mut(&data.response_receiver_id) else {
                trace!("disconnect for unknown response receiver {:?}", data.response_receiver_id);
                return;
            };
            if !ctx.set_offline(Instant::now()) {
                return;
            }
            let data = self.receiver_data(ctx);
            self.ensure_sweeping(&mut state);
            data
        };

        info!("response receiver {:?} is offline", data.response_receiver_id);
        self.notifier.send_event(InputChannelEvent::ResponseReceiverOffline(data));
    }

    async fn event_loop(self: Arc<Self>, session: u64, mut events: broadcast::Receiver<InputChannelEvent>, mut stop: StopListener) {
        while let Some(evt) = stop.recv(&mut events).await {
            match evt {
                InputChannelEvent::ResponseReceiverConnected(data) => self.on_receiver_connected(session, data).await,
                InputChannelEvent::ResponseReceiverDisconnected(data) => self.on_receiver_disconnected(session, data).await,
                other => self.notifier.send_event(other),
            }
        }
        debug!("event loop terminated");
    }
}
