use std::{fmt, sync::{Arc, OnceLock}};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
    common::LoadOptions,
    error::LoadError,
    message::{EnvelopeBuilder, SessionContext},
    transport::{AckReceiver, DuplexStream, StreamSender},
};

/// Parameters of one session, fixed at dispatch time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub stream_index: usize,
    pub message_count: u64,
    pub payload: Bytes,
}

/// Lifecycle of a session as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connecting,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub stream_index: usize,
    /// Either `Completed` or `Failed`.
    pub state: SessionState,
    /// Envelopes accepted by the stream.
    pub send_count: u64,
    /// Successful acknowledgments drained from the stream.
    pub recv_count: u64,
    /// The first error either activity hit.
    pub error: Option<LoadError>,
}

impl SessionResult {
    /// A session that never got a running stream.
    pub fn failed(stream_index: usize, error: LoadError) -> Self {
        Self {
            stream_index,
            state: SessionState::Failed,
            send_count: 0,
            recv_count: 0,
            error: Some(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }
}

/// First-writer-wins error slot shared by the two activities of a session.
struct FirstError {
    stream_index: usize,
    slot: OnceLock<LoadError>,
}

impl FirstError {
    fn new(stream_index: usize) -> Self {
        Self {
            stream_index,
            slot: OnceLock::new(),
        }
    }

    fn record(&self, err: LoadError) {
        match self.slot.set(err) {
            Ok(()) => {
                if let Some(err) = self.slot.get() {
                    error!("Session {} error: {}", self.stream_index, err);
                }
            }
            Err(later) => {
                debug!("Session {} later error ignored: {}", self.stream_index, later);
            }
        }
    }

    fn get(&self) -> Option<LoadError> {
        self.slot.get().cloned()
    }
}

/// Drives one duplex stream: a send activity and a receive activity run
/// concurrently, and the stream is half-closed only after the receive side
/// has finished.
pub struct StreamSession {
    config: SessionConfig,
    builder: Arc<dyn EnvelopeBuilder>,
    options: LoadOptions,
}

impl StreamSession {
    pub fn new(
        config: SessionConfig,
        builder: Arc<dyn EnvelopeBuilder>,
        options: LoadOptions,
    ) -> Self {
        Self {
            config,
            builder,
            options,
        }
    }

    /// Run the session to completion. Every failure ends up in the result.
    pub async fn run(self, stream: DuplexStream) -> SessionResult {
        let stream_index = self.config.stream_index;
        let message_count = self.config.message_count;
        let DuplexStream {
            mut sender,
            receiver,
        } = stream;

        if !self.options.warmup.is_zero() {
            tokio::time::sleep(self.options.warmup).await;
        }
        debug!("Session {} {}", stream_index, SessionState::Running);

        let errors = Arc::new(FirstError::new(stream_index));
        // Number of acks the receive side must drain, lowered if sending stops early.
        let (limit_tx, limit_rx) = watch::channel(message_count);
        // Raised by the receive side when it stops on an error.
        let (halt_tx, halt_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel::<u64>();

        let recv_errors = errors.clone();
        tokio::spawn(async move {
            let received = recv_loop(stream_index, receiver, limit_rx, halt_tx, &recv_errors).await;
            let _ = done_tx.send(received);
        });

        let send_count = self.send_loop(&mut sender, halt_rx, &errors).await;
        if send_count < message_count {
            limit_tx.send_replace(send_count);
        }

        let recv_count = match done_rx.await {
            Ok(received) => received,
            Err(_) => {
                errors.record(LoadError::Internal(
                    "receive activity exited without signalling".to_string(),
                ));
                0
            }
        };

        // The receive side is done, so no pending ack can be lost by closing now.
        if let Err(err) = sender.close_send().await {
            warn!("Session {} failed to close send: {}", stream_index, err);
            errors.record(err);
        }

        let error = errors.get();
        let state = if error.is_none() {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        info!(
            "Session {} exiting: {} sent={} acked={}",
            stream_index, state, send_count, recv_count
        );

        SessionResult {
            stream_index,
            state,
            send_count,
            recv_count,
            error,
        }
    }

    /// Send loop for the session. Returns the number of envelopes sent.
    async fn send_loop(
        &self,
        sender: &mut Box<dyn StreamSender>,
        mut halt_rx: watch::Receiver<bool>,
        errors: &FirstError,
    ) -> u64 {
        let stream_index = self.config.stream_index;
        let mut sent = 0;
        for seq in 0..self.config.message_count {
            if *halt_rx.borrow() {
                debug!("Session {} halted after {} sends", stream_index, sent);
                break;
            }
            if !self.options.send_interval.is_zero() {
                tokio::time::sleep(self.options.send_interval).await;
            }

            let ctx = SessionContext { stream_index, seq };
            let envelope = self.builder.build(&self.config.payload, &ctx);
            tokio::select! {
                biased;
                Ok(()) = halt_rx.changed() => {
                    debug!("Session {} halted while sending message {}", stream_index, seq);
                    break;
                }
                result = sender.send(envelope) => match result {
                    Ok(()) => {
                        sent += 1;
                        debug!("Session {} sent message {}", stream_index, seq);
                    }
                    Err(err) => {
                        errors.record(err);
                        break;
                    }
                }
            }
        }
        sent
    }
}

/// Receive loop for the session. Returns the number of successful acks.
async fn recv_loop(
    stream_index: usize,
    mut receiver: Box<dyn AckReceiver>,
    mut limit_rx: watch::Receiver<u64>,
    halt_tx: watch::Sender<bool>,
    errors: &FirstError,
) -> u64 {
    let mut received = 0;
    loop {
        let limit = *limit_rx.borrow_and_update();
        if received >= limit {
            break;
        }
        tokio::select! {
            biased;
            result = receiver.receive() => match result {
                Ok(ack) if ack.is_success() => {
                    received += 1;
                    debug!("Session {} received ack {}", stream_index, received);
                }
                Ok(ack) => {
                    errors.record(LoadError::ProtocolRejection {
                        status: ack.status,
                        info: ack.info,
                    });
                    let _ = halt_tx.send(true);
                    break;
                }
                Err(err) => {
                    errors.record(err);
                    let _ = halt_tx.send(true);
                    break;
                }
            },
            Ok(()) = limit_rx.changed() => {}
        }
    }
    received
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        memory::{MemoryTransport, StreamFaults},
        message::{RawEnvelopeBuilder, Status},
        transport::Transport,
    };

    fn config(stream_index: usize, message_count: u64) -> SessionConfig {
        SessionConfig {
            stream_index,
            message_count,
            payload: Bytes::from(vec![0u8; 16]),
        }
    }

    async fn run_on(transport: &MemoryTransport, config: SessionConfig) -> SessionResult {
        let stream = transport.open_stream(config.stream_index).await.unwrap();
        StreamSession::new(config, Arc::new(RawEnvelopeBuilder), LoadOptions::default())
            .run(stream)
            .await
    }

    #[tokio::test]
    async fn test_session_completes() {
        let transport = MemoryTransport::new();
        let result = run_on(&transport, config(0, 50)).await;
        assert_eq!(result.state, SessionState::Completed);
        assert_eq!(result.send_count, 50);
        assert_eq!(result.recv_count, 50);
        assert!(result.error.is_none());
        assert_eq!(transport.closed_streams(), 1);
    }

    #[tokio::test]
    async fn test_session_with_no_messages() {
        let transport = MemoryTransport::new();
        let result = run_on(&transport, config(0, 0)).await;
        assert!(result.is_completed());
        assert_eq!((result.send_count, result.recv_count), (0, 0));
        assert_eq!(transport.closed_streams(), 1);
    }

    #[tokio::test]
    async fn test_send_error_drains_sent_acks() {
        let transport = MemoryTransport::new()
            .with_faults(0, StreamFaults::default().fail_send_at(3));
        let result = run_on(&transport, config(0, 10)).await;
        assert_eq!(result.state, SessionState::Failed);
        assert_eq!(result.send_count, 3);
        assert_eq!(result.recv_count, 3);
        assert!(matches!(result.error, Some(LoadError::Send(_))));
        assert_eq!(transport.closed_streams(), 1);
    }

    #[tokio::test]
    async fn test_send_error_on_first_message() {
        let transport = MemoryTransport::new()
            .with_faults(0, StreamFaults::default().fail_send_at(0));
        let result = run_on(&transport, config(0, 4)).await;
        assert_eq!(result.send_count, 0);
        assert_eq!(result.recv_count, 0);
        assert!(matches!(result.error, Some(LoadError::Send(_))));
    }

    #[tokio::test]
    async fn test_rejection_stops_session() {
        let transport = MemoryTransport::new().with_faults(
            0,
            StreamFaults::default().reject_at(2, Status::BadRequest, "payload rejected"),
        );
        // More messages than the stream buffers, so the sender would block
        // forever if it were not halted.
        let result = run_on(&transport, config(0, 1000)).await;
        assert_eq!(result.state, SessionState::Failed);
        assert_eq!(result.recv_count, 2);
        assert_eq!(
            result.error,
            Some(LoadError::ProtocolRejection {
                status: Status::BadRequest,
                info: "payload rejected".to_string(),
            })
        );
        assert!(result.send_count < 1000);
        assert_eq!(transport.closed_streams(), 1);
    }

    #[tokio::test]
    async fn test_recv_error_recorded() {
        let transport = MemoryTransport::new()
            .with_faults(0, StreamFaults::default().fail_recv_at(1));
        let result = run_on(&transport, config(0, 5)).await;
        assert_eq!(result.recv_count, 1);
        assert!(matches!(result.error, Some(LoadError::Recv(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_interval_paces_sends() {
        let transport = MemoryTransport::new();
        let stream = transport.open_stream(0).await.unwrap();
        let options = LoadOptions::default()
            .with_warmup(Duration::from_secs(10))
            .with_send_interval(Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        let result = StreamSession::new(config(0, 3), Arc::new(RawEnvelopeBuilder), options)
            .run(stream)
            .await;
        assert!(result.is_completed());
        assert!(start.elapsed() >= Duration::from_secs(13));
    }
}
