use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::buffered::response_sender::ResponseMessageSender;

/// The buffered input channel's knowledge about a single response receiver: whether it is
///  currently reachable, since when it is not, and the messages waiting for it.
///
/// Contexts are created lazily - either when the response receiver connects, or when a
///  response message is sent to a receiver that is not known yet (it may be about to connect).
///  Either way they start out offline and waiting for their first connect.
///  They are removed when the receiver was offline longer than the maximum offline time, or
///  when the application disconnects it explicitly.
pub struct ResponseReceiverContext {
    pub response_receiver_id: String,
    pub sender_address: String,
    /// distinguishes contexts for the same response receiver id over time, so that a stale
    ///  delivery loop never touches a newer context's queue
    pub generation: u64,
    pub is_online: bool,
    pub offline_started_at: Option<Instant>,
    /// The application was not notified of this receiver's connection yet. That is the case
    ///  for contexts that were created by sending a message before the receiver connected.
    pub pending_connected_event: bool,
    /// broadcasts with a sequence number below this were sent before the context existed and
    ///  are replayed on first connect; later ones were queued directly
    pub first_broadcast_seq: u64,
    pub sender: ResponseMessageSender,
}

impl ResponseReceiverContext {
    pub fn new_pending(response_receiver_id: &str, generation: u64, first_broadcast_seq: u64, now: Instant) -> ResponseReceiverContext {
        ResponseReceiverContext {
            response_receiver_id: response_receiver_id.to_string(),
            sender_address: String::new(),
            generation,
            is_online: false,
            offline_started_at: Some(now),
            pending_connected_event: true,
            first_broadcast_seq,
            sender: Default::default(),
        }
    }

    pub fn set_online(&mut self, sender_address: &str) {
        self.is_online = true;
        self.offline_started_at = None;
        self.sender_address = sender_address.to_string();
    }

    /// returns `true` if the context was online before
    pub fn set_offline(&mut self, now: Instant) -> bool {
        if !self.is_online {
            return false;
        }
        self.is_online = false;
        self.offline_started_at = Some(now);
        true
    }

    pub fn is_expired(&self, now: Instant, max_offline_time: Duration) -> bool {
        match self.offline_started_at {
            Some(offline_started_at) if !self.is_online => now.saturating_duration_since(offline_started_at) > max_offline_time,
            _ => false,
        }
    }
}


/// A response message that was sent to all response receivers. It is retained for a while to
///  be replayed to receivers that connect later.
pub struct BroadcastRecord {
    pub seq: u64,
    pub message: Bytes,
    pub sent_at: Instant,
}

impl BroadcastRecord {
    pub fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        now.saturating_duration_since(self.sent_at) > retention
    }
}
