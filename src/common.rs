use std::time::Duration;

/// Pacing options for a load run.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Pause between opening a stream and sending its first message.
    pub warmup: Duration,
    /// Pause before every send.
    pub send_interval: Duration,
}

impl LoadOptions {
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }
}

/// Options for the timeout of the remote connection.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// Deadline for dialing the endpoint.
    pub connect_timeout: Duration,
    /// Deadline for a single acknowledgment to arrive.
    pub read_timeout: Duration,
    /// Deadline for a single envelope to be accepted by the stream.
    pub write_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
        }
    }
}
