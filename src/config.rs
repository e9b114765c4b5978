use std::time::Duration;

/// Configuration shared by a [`Pool`](crate::Pool), a
/// [`Listener`](crate::Listener) and the links they create.
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval between pings sent by the dialing side. Default: 3 seconds.
    pub keepalive_interval: Duration,
    /// Time without a ping after which the accepting side drops a link.
    /// Default: 10 seconds.
    pub idle_timeout: Duration,
    /// How often the accepting side checks for idle links. Default: 3 seconds.
    pub idle_check_interval: Duration,
    /// Timeout for establishing a physical link. Default: 5 seconds.
    pub dial_timeout: Duration,
    /// Minimum spacing between dial attempts to the same address.
    /// Default: 1 second.
    pub reconnect_interval: Duration,
    /// Attempts made by [`Pool::dial`](crate::Pool::dial). Default: 3.
    pub connect_attempts: usize,
    /// Delay between [`Pool::dial`](crate::Pool::dial) attempts. Default: 200 ms.
    pub connect_retry_delay: Duration,
    /// Capacity of the pending-connect queue. Default: 1000.
    pub connect_queue_depth: usize,
    /// Capacity of the accepted-stream queue. Default: 20000.
    pub accept_backlog: usize,
    /// Largest payload a drain task puts into one packet. Default: 4096 bytes.
    pub transfer_chunk_size: usize,
    /// Chunks a stream buffers for sending before writes block. Default: 64.
    pub write_queue_depth: usize,
    /// Packets a link buffers for its writer task. Default: 256.
    pub link_queue_depth: usize,
    /// Largest payload accepted by the packet codec. Default: 1 MB.
    pub max_payload_size: usize,
    /// Initial read deadline applied to new streams, relative to creation.
    pub read_timeout: Option<Duration>,
    /// Initial write deadline applied to new streams, relative to creation.
    pub write_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(10),
            idle_check_interval: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(200),
            connect_queue_depth: 1000,
            accept_backlog: 20000,
            transfer_chunk_size: 4096,
            write_queue_depth: 64,
            link_queue_depth: 256,
            max_payload_size: 1024 * 1024,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl Config {
    pub fn with_keepalive_interval(mut self, d: Duration) -> Self {
        self.keepalive_interval = d;
        self
    }

    pub fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn with_idle_check_interval(mut self, d: Duration) -> Self {
        self.idle_check_interval = d;
        self
    }

    pub fn with_dial_timeout(mut self, d: Duration) -> Self {
        self.dial_timeout = d;
        self
    }

    pub fn with_reconnect_interval(mut self, d: Duration) -> Self {
        self.reconnect_interval = d;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    pub fn with_connect_retry_delay(mut self, d: Duration) -> Self {
        self.connect_retry_delay = d;
        self
    }

    pub fn with_connect_queue_depth(mut self, depth: usize) -> Self {
        self.connect_queue_depth = depth.max(1);
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog.max(1);
        self
    }

    /// Chunk size is clamped to `max_payload_size` so every chunk fits a packet.
    pub fn with_transfer_chunk_size(mut self, size: usize) -> Self {
        self.transfer_chunk_size = size.clamp(1, self.max_payload_size);
        self
    }

    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth.max(1);
        self
    }

    pub fn with_link_queue_depth(mut self, depth: usize) -> Self {
        self.link_queue_depth = depth.max(1);
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.max(1);
        self.transfer_chunk_size = self.transfer_chunk_size.min(self.max_payload_size);
        self
    }

    pub fn with_read_timeout(mut self, d: Option<Duration>) -> Self {
        self.read_timeout = d;
        self
    }

    pub fn with_write_timeout(mut self, d: Option<Duration>) -> Self {
        self.write_timeout = d;
        self
    }
}
