//! Configurable timeout defaults
// (c) 2025 Ross Younger

use std::time::Duration;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Environment variable prefix for overriding any field below,
/// e.g. `MXP_POLLING_QUEUE_WAIT_TIMEOUT=10`.
pub const ENV_PREFIX: &str = "MXP_";

/// The tunable durations of the exchange machinery, all in whole seconds.
///
/// The protocol core itself sets no timers (cancellation is realized by
/// closing the transport), so these values parameterize the host: the
/// transport layer it configures per role, its connection pool, and its
/// pending-request queues.
///
/// Each field can be overridden from the environment under the
/// [`ENV_PREFIX`] prefix; anything not overridden keeps the default stated
/// on the field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// How long a pending-request queue holds a dequeue open before giving
    /// up and ending the subscriber session gracefully. [default: 120]
    pub polling_request_queue_timeout: u64,
    /// Upper bound on a polled request being processed before its outcome
    /// is considered lost. [default: 600]
    pub polling_request_maximum_message_processing_timeout: u64,
    /// Pause between attempts to re-establish a listening endpoint.
    /// [default: 1]
    pub retry_listening_sleep_interval: u64,
    /// How long connection errors are retried before the operation is
    /// abandoned. [default: 300]
    pub connection_error_retry_timeout: u64,
    /// Send timeout on an established client transport. [default: 600]
    pub tcp_client_send_timeout: u64,
    /// Receive timeout on an established client transport. [default: 600]
    pub tcp_client_receive_timeout: u64,
    /// How long an idle pooled connection is kept before being discarded.
    /// [default: 540]
    pub tcp_client_pooled_connection_timeout: u64,
    /// Send timeout while heartbeating an idle connection. [default: 60]
    pub tcp_client_heartbeat_send_timeout: u64,
    /// Receive timeout while heartbeating an idle connection. [default: 60]
    pub tcp_client_heartbeat_receive_timeout: u64,
    /// Timeout for establishing a client transport. [default: 60]
    pub tcp_client_connect_timeout: u64,
    /// How long a subscriber-serving loop waits on the queue per poll.
    /// [default: 30]
    pub polling_queue_wait_timeout: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            polling_request_queue_timeout: 120,
            polling_request_maximum_message_processing_timeout: 600,
            retry_listening_sleep_interval: 1,
            connection_error_retry_timeout: 300,
            tcp_client_send_timeout: 600,
            tcp_client_receive_timeout: 600,
            tcp_client_pooled_connection_timeout: 540,
            tcp_client_heartbeat_send_timeout: 60,
            tcp_client_heartbeat_receive_timeout: 60,
            tcp_client_connect_timeout: 60,
            polling_queue_wait_timeout: 30,
        }
    }
}

impl Timeouts {
    /// Resolves the working configuration: compiled-in defaults, overridden
    /// by any `MXP_*` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Timeouts::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
    }

    /// Convenience conversion for any field.
    #[must_use]
    pub fn duration(seconds: u64) -> Duration {
        Duration::from_secs(seconds)
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::Timeouts;

    #[test]
    fn defaults() {
        let t = Timeouts::default();
        assert_eq!(t.polling_request_queue_timeout, 120);
        assert_eq!(t.polling_request_maximum_message_processing_timeout, 600);
        assert_eq!(t.retry_listening_sleep_interval, 1);
        assert_eq!(t.connection_error_retry_timeout, 300);
        assert_eq!(t.tcp_client_send_timeout, 600);
        assert_eq!(t.tcp_client_receive_timeout, 600);
        assert_eq!(t.tcp_client_pooled_connection_timeout, 540);
        assert_eq!(t.tcp_client_heartbeat_send_timeout, 60);
        assert_eq!(t.tcp_client_heartbeat_receive_timeout, 60);
        assert_eq!(t.tcp_client_connect_timeout, 60);
        assert_eq!(t.polling_queue_wait_timeout, 30);
    }

    #[test]
    fn environment_overrides_one_key() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MXP_POLLING_QUEUE_WAIT_TIMEOUT", "7");
            let t = Timeouts::load().expect("load");
            assert_eq!(t.polling_queue_wait_timeout, 7);
            // untouched keys keep their defaults
            assert_eq!(t.tcp_client_connect_timeout, 60);
            Ok(())
        });
    }

    #[test]
    fn duration_helper() {
        assert_eq!(
            Timeouts::duration(Timeouts::default().polling_queue_wait_timeout),
            std::time::Duration::from_secs(30)
        );
    }
}
