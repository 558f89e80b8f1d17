use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::channel::events::{ConnectionEventData, EventNotifier, OutputChannelEvent, ResponseMessageData};
use crate::channel::DuplexOutputChannel;
use crate::config::MonitorConfig;
use crate::monitored::monitor_message::MonitorMessage;
use crate::util::stop_signal::{StopListener, StopSignal};
use crate::util::tasks::join_all_with_timeout;

/// An output channel that detects broken connections by exchanging pings with the input side.
///
/// A ping is sent whenever there was no outgoing traffic for `ping_frequency`, and the input
///  side echoes it. If nothing at all arrives for `receive_timeout`, the connection is
///  considered broken and closed. A failing send is treated the same way.
///
/// This requires the input side to be a [super::MonitoredDuplexInputChannel].
pub struct MonitoredDuplexOutputChannel {
    inner: Arc<MonitoredOutputInner>,
}

impl MonitoredDuplexOutputChannel {
    pub fn new(underlying: Arc<dyn DuplexOutputChannel>, config: Arc<MonitorConfig>) -> anyhow::Result<MonitoredDuplexOutputChannel> {
        config.validate()?;
        let now = Instant::now();
        Ok(MonitoredDuplexOutputChannel {
            inner: Arc::new(MonitoredOutputInner {
                channel_id: underlying.channel_id(),
                response_receiver_id: underlying.response_receiver_id(),
                notifier: EventNotifier::with_dispatcher(config.event_capacity, config.dispatcher.clone()),
                ping: MonitorMessage::Ping.to_bytes(),
                underlying,
                config,
                state: Mutex::new(MonitorState {
                    is_connected: false,
                    session: 0,
                    stop_signal: None,
                    last_sent: now,
                    last_received: now,
                    event_task: None,
                    monitor_task: None,
                }),
            }),
        })
    }
}

impl Drop for MonitoredDuplexOutputChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            if let Some(signal) = state.stop_signal.take() {
                signal.stop();
            }
        }
    }
}

#[async_trait]
impl DuplexOutputChannel for MonitoredDuplexOutputChannel {
    fn channel_id(&self) -> String {
        self.inner.channel_id.clone()
    }

    fn response_receiver_id(&self) -> String {
        self.inner.response_receiver_id.clone()
    }

    async fn open_connection(&self) -> anyhow::Result<()> {
        if self.inner.state.lock().await.is_connected {
            bail!("connection {:?} to {:?} is already open", self.inner.response_receiver_id, self.inner.channel_id);
        }

        let events = self.inner.underlying.subscribe();
        self.inner.underlying.open_connection().await?;

        let mut state = self.inner.state.lock().await;
        if state.is_connected {
            bail!("connection {:?} to {:?} is already open", self.inner.response_receiver_id, self.inner.channel_id);
        }

        state.session += 1;
        let session = state.session;
        let now = Instant::now();
        state.last_sent = now;
        state.last_received = now;

        let stop_signal = StopSignal::new();
        let span = debug_span!("monitored_events", response_receiver_id = %self.inner.response_receiver_id);
        state.event_task = Some(tokio::spawn(
            self.inner.clone()
                .event_loop(session, events, stop_signal.listener())
                .instrument(span)
        ));
        let span = debug_span!("monitor", response_receiver_id = %self.inner.response_receiver_id);
        state.monitor_task = Some(tokio::spawn(
            self.inner.clone()
                .monitor_loop(session, stop_signal.listener())
                .instrument(span)
        ));
        state.stop_signal = Some(stop_signal);
        state.is_connected = true;

        debug!("monitoring connection {:?} to {:?}", self.inner.response_receiver_id, self.inner.channel_id);
        Ok(())
    }

    async fn close_connection(&self) {
        let session = self.inner.state.lock().await.session;
        if let Some(handles) = self.inner.disconnect(session).await {
            join_all_with_timeout("monitored output", handles, self.inner.config.shutdown_timeout).await;
            self.inner.underlying.close_connection().await;
            info!("connection {:?} to {:?} closed", self.inner.response_receiver_id, self.inner.channel_id);
            self.inner.notifier.send_event(OutputChannelEvent::ConnectionClosed(self.inner.connection_data()));
        }
    }

    async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.is_connected
    }

    async fn send_message(&self, message: Bytes) -> anyhow::Result<()> {
        let session = {
            let state = self.inner.state.lock().await;
            if !state.is_connected {
                bail!("connection {:?} to {:?} is not open", self.inner.response_receiver_id, self.inner.channel_id);
            }
            state.session
        };

        match self.inner.underlying.send_message(MonitorMessage::Message(message).to_bytes()).await {
            Ok(()) => {
                self.inner.on_sent(session).await;
                Ok(())
            }
            Err(e) => {
                self.inner.on_connection_broken(session, "sending a message failed").await;
                Err(e)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputChannelEvent> {
        self.inner.notifier.subscribe()
    }
}


struct MonitorState {
    is_connected: bool,
    session: u64,
    stop_signal: Option<StopSignal>,
    last_sent: Instant,
    last_received: Instant,
    event_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

struct MonitoredOutputInner {
    channel_id: String,
    response_receiver_id: String,
    underlying: Arc<dyn DuplexOutputChannel>,
    config: Arc<MonitorConfig>,
    notifier: EventNotifier<OutputChannelEvent>,
    ping: Bytes,
    state: Mutex<MonitorState>,
}

impl MonitoredOutputInner {
    fn connection_data(&self) -> ConnectionEventData {
        ConnectionEventData {
            channel_id: self.channel_id.clone(),
            response_receiver_id: self.response_receiver_id.clone(),
        }
    }

    /// Marks the connection as closed and signals background tasks to stop. Returns their
    ///  handles if this call actually closed the connection - the caller is responsible for
    ///  closing the underlying connection and notifying the application then.
    async fn disconnect(&self, session: u64) -> Option<Vec<JoinHandle<()>>> {
        let mut state = self.state.lock().await;
        if state.session != session || !state.is_connected {
            return None;
        }

        state.is_connected = false;
        if let Some(stop_signal) = state.stop_signal.take() {
            stop_signal.stop();
        }
        Some([state.event_task.take(), state.monitor_task.take()]
            .into_iter()
            .flatten()
            .collect())
    }

    /// called from background tasks, so this does not wait for them to terminate
    async fn on_connection_broken(&self, session: u64, reason: &str) {
        if self.disconnect(session).await.is_some() {
            warn!("closing connection {:?} to {:?}: {}", self.response_receiver_id, self.channel_id, reason);
            self.underlying.close_connection().await;
            self.notifier.send_event(OutputChannelEvent::ConnectionClosed(self.connection_data()));
        }
    }

    async fn on_sent(&self, session: u64) {
        let mut state = self.state.lock().await;
        if state.session == session {
            state.last_sent = Instant::now();
        }
    }

    async fn on_received(&self, session: u64) {
        let mut state = self.state.lock().await;
        if state.session == session {
            state.last_received = Instant::now();
        }
    }

    async fn monitor_loop(self: Arc<Self>, session: u64, mut stop: StopListener) {
        loop {
            let (ping_due, timeout_due) = {
                let state = self.state.lock().await;
                if state.session != session || !state.is_connected {
                    return;
                }
                (state.last_sent + self.config.ping_frequency, state.last_received + self.config.receive_timeout)
            };

            let now = Instant::now();
            if now >= timeout_due {
                self.on_connection_broken(session, "nothing was received within the receive timeout").await;
                return;
            }

            if now >= ping_due {
                trace!("sending ping");
                match self.underlying.send_message(self.ping.clone()).await {
                    Ok(()) => self.on_sent(session).await,
                    Err(e) => {
                        debug!("sending ping failed: {}", e);
                        self.on_connection_broken(session, "sending a ping failed").await;
                        return;
                    }
                }
                continue;
            }

            if !stop.sleep_until(ping_due.min(timeout_due)).await {
                return;
            }
        }
    }

    async fn event_loop(self: Arc<Self>, session: u64, mut events: broadcast::Receiver<OutputChannelEvent>, mut stop: StopListener) {
        while let Some(evt) = stop.recv(&mut events).await {
            match evt {
                OutputChannelEvent::ResponseMessageReceived(data) => {
                    self.on_received(session).await;
                    match MonitorMessage::deser(data.message) {
                        Ok(MonitorMessage::Ping) => trace!("received ping response"),
                        Ok(MonitorMessage::Message(message)) => {
                            self.notifier.send_event(OutputChannelEvent::ResponseMessageReceived(ResponseMessageData {
                                message,
                                ..data
                            }));
                        }
                        Err(e) => warn!("dropping malformed response message: {}", e),
                    }
                }
                OutputChannelEvent::ConnectionClosed(_) => {
                    self.on_connection_broken(session, "the underlying connection was closed").await;
                }
                other => self.notifier.send_event(other),
            }
        }
        debug!("event loop terminated");
    }
}
