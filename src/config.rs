use std::net::SocketAddr;
use std::time::Duration;

/// All of the relay's tunables in one place. Production uses the defaults from
///  [RelayConfig::new]; tests tighten the timing-sensitive fields so that
///  retransmission and eviction behavior can be observed without wall-clock
///  minutes passing.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,

    /// base URL of the identity service that join tokens are checked against
    pub identity_base_url: String,

    /// a peer from which no traffic has been received for this long is evicted
    pub peer_timeout: Duration,

    /// how long an unacknowledged reliable frame waits before it is resent.
    /// There is no backoff: the interval is fixed across retries.
    pub retry_interval: Duration,

    /// number of retransmissions after the initial send; once exhausted, the
    ///  frame is dropped without any upward signal
    pub retry_limit: u32,

    /// pause between iterations of the relay's main loop
    pub tick_interval: Duration,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            bind_addr,
            identity_base_url: "https://api.koneko.cat/".to_string(),
            peer_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(1),
            retry_limit: 5,
            tick_interval: Duration::from_millis(1),
        }
    }
}
