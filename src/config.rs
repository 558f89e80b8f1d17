use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::channel::dispatcher::{EventDispatcher, InlineDispatcher};
use crate::channel::events::DEFAULT_EVENT_CAPACITY;

#[derive(Debug, Clone)]
pub struct BufferedConfig {
    /// Buffered messages are discarded if the connection (or a response receiver) stays
    ///  unreachable for longer than this. The application is notified with a 'closed' or
    ///  'disconnected' event.
    pub max_offline_time: Duration,

    /// Broadcast messages are kept this long for replay to response receivers that connect
    ///  later. `None` means 'same as `max_offline_time`'.
    pub broadcast_retention: Option<Duration>,

    /// fixed pause between attempts to (re-)open a connection or re-send a message
    pub retry_interval: Duration,
    /// interval for checking response receivers and broadcasts for expiry
    pub sweep_interval: Duration,
    /// upper bound for waiting on background tasks when closing / stopping
    pub shutdown_timeout: Duration,

    pub event_capacity: usize,
    /// the execution context for publishing events, shared between channels to get a common
    ///  order of their notifications
    pub dispatcher: Arc<dyn EventDispatcher>,
}

impl BufferedConfig {
    pub fn new(max_offline_time: Duration) -> BufferedConfig {
        BufferedConfig {
            max_offline_time,
            broadcast_retention: None,
            retry_interval: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(300),
            shutdown_timeout: Duration::from_secs(5),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            dispatcher: Arc::new(InlineDispatcher),
        }
    }

    pub fn effective_broadcast_retention(&self) -> Duration {
        self.broadcast_retention.unwrap_or(self.max_offline_time)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_interval.is_zero() {
            bail!("retry interval must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }
}

impl Default for BufferedConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}


#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// A ping is sent after this much time without outgoing traffic
    pub ping_frequency: Duration,
    /// The connection is considered broken if nothing (ping or data) arrives for this long.
    ///  This should be a comfortable multiple of `ping_frequency` to allow for round trips.
    pub receive_timeout: Duration,
    /// interval for checking response receivers for inactivity on the input side
    pub sweep_interval: Duration,
    pub shutdown_timeout: Duration,

    pub event_capacity: usize,
    pub dispatcher: Arc<dyn EventDispatcher>,
}

impl MonitorConfig {
    pub fn new(ping_frequency: Duration, receive_timeout: Duration) -> MonitorConfig {
        MonitorConfig {
            ping_frequency,
            receive_timeout,
            sweep_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            dispatcher: Arc::new(InlineDispatcher),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_frequency.is_zero() {
            bail!("ping frequency must be positive");
        }
        if self.receive_timeout <= self.ping_frequency {
            bail!("receive timeout {:?} must be greater than ping frequency {:?}", self.receive_timeout, self.ping_frequency);
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3))
    }
}


#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// A message that is not acknowledged within this time is reported as 'not delivered'
    pub acknowledge_timeout: Duration,
    pub sweep_interval: Duration,
    pub shutdown_timeout: Duration,

    pub event_capacity: usize,
    pub dispatcher: Arc<dyn EventDispatcher>,
}

impl ReliableConfig {
    pub fn new(acknowledge_timeout: Duration) -> ReliableConfig {
        ReliableConfig {
            acknowledge_timeout,
            sweep_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            dispatcher: Arc::new(InlineDispatcher),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.acknowledge_timeout.is_zero() {
            bail!("acknowledge timeout must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(11))
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_broadcast_retention_defaults_to_max_offline_time() {
        let mut config = BufferedConfig::new(Duration::from_secs(7));
        assert_eq!(config.effective_broadcast_retention(), Duration::from_secs(7));

        config.broadcast_retention = Some(Duration::from_secs(2));
        assert_eq!(config.effective_broadcast_retention(), Duration::from_secs(2));
    }

    #[rstest]
    #[case::defaults(1000, 3000, true)]
    #[case::equal(1000, 1000, false)]
    #[case::timeout_too_short(1000, 500, false)]
    #[case::zero_ping(0, 500, false)]
    fn test_monitor_config_validation(#[case] ping_millis: u64, #[case] timeout_millis: u64, #[case] expected_valid: bool) {
        let config = MonitorConfig::new(Duration::from_millis(ping_millis), Duration::from_millis(timeout_millis));
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[test]
    fn test_default_configs_are_valid() {
        BufferedConfig::default().validate().unwrap();
        MonitorConfig::default().validate().unwrap();
        ReliableConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_buffered_config() {
        let mut config = BufferedConfig::default();
        config.retry_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
