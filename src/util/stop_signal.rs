use std::time::Duration;

use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::warn;

/// The owning side of a stop request for a group of background tasks. Each task gets its own
///  [StopListener], and all of them observe the same request.
///
/// A signal is one-shot: once stopped, it stays stopped. Code that needs to restart background
///  activity creates a fresh signal for the new 'session'.
pub struct StopSignal {
    sender: watch::Sender<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> StopSignal {
        let (sender, _) = watch::channel(false);
        StopSignal { sender }
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Clone)]
pub struct StopListener {
    receiver: watch::Receiver<bool>,
}

impl StopListener {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// resolves when a stop was requested. Dropping the [StopSignal] counts as a stop request.
    pub async fn stopped(&mut self) {
        let _ = self.receiver.wait_for(|&stopped| stopped).await;
    }

    /// returns `true` if the full duration elapsed, `false` if a stop was requested in between
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// returns `true` if the deadline was reached, `false` if a stop was requested before
    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        if self.is_stopped() {
            return false;
        }

        select! {
            _ = sleep_until(deadline) => !self.is_stopped(),
            _ = self.stopped() => false,
        }
    }

    /// Waits for the next event on `events`, returning `None` if a stop was requested or the
    ///  sending side went away. Lagging is logged and skipped, there is no way to recover the
    ///  dropped events.
    pub async fn recv<E: Clone>(&mut self, events: &mut broadcast::Receiver<E>) -> Option<E> {
        loop {
            if self.is_stopped() {
                return None;
            }

            select! {
                evt = events.recv() => {
                    match evt {
                        Ok(evt) => return Some(evt),
                        Err(RecvError::Lagged(n)) => {
                            warn!("event receiver lagged behind, {} events were dropped", n);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
                _ = self.stopped() => return None,
            }
        }
    }
}
