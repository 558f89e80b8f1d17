//! This module contains utilities that are useful for testing code based on duplex channels.
//!  They are used for testing the decorators themselves, but they are also exported for
//!  application testing: an in-memory transport, and a collector for event streams.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

pub mod memory;

/// Collects all events from a subscription in the background, for later assertions
pub struct EventCollector<E> {
    events: Arc<RwLock<Vec<E>>>,
    handle: JoinHandle<()>,
}

impl<E: Clone + Debug + Send + Sync + 'static> EventCollector<E> {
    pub fn new(mut receiver: broadcast::Receiver<E>) -> EventCollector<E> {
        let events: Arc<RwLock<Vec<E>>> = Default::default();

        let collected = events.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(evt) => collected.write().await.push(evt),
                    Err(RecvError::Lagged(n)) => panic!("event collector lagged behind by {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        EventCollector {
            events,
            handle,
        }
    }

    pub async fn events(&self) -> Vec<E> {
        self.events.read().await.clone()
    }

    pub async fn count(&self, predicate: impl Fn(&E) -> bool) -> usize {
        self.events.read().await
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    /// polls until an event matching `predicate` was collected, returning `false` if that does
    ///  not happen within `timeout`
    pub async fn wait_for(&self, predicate: impl Fn(&E) -> bool, timeout: Duration) -> bool {
        self.wait_for_count(predicate, 1, timeout).await
    }

    pub async fn wait_for_count(&self, predicate: impl Fn(&E) -> bool, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(&predicate).await >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl<E> Drop for EventCollector<E> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
