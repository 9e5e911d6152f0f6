use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::{
    common::LoadOptions,
    error::LoadError,
    message::EnvelopeBuilder,
    session::{SessionConfig, SessionResult, SessionState, StreamSession},
    transport::Transport,
};

/// How a flat message budget is split across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub per_session: u64,
    pub effective_total: u64,
    /// Messages dropped because they did not divide evenly.
    pub remainder: u64,
}

/// Split `total_messages` evenly across `session_count` sessions, dropping
/// the remainder.
pub fn partition(total_messages: u64, session_count: usize) -> Result<Partition, LoadError> {
    if session_count == 0 {
        return Err(LoadError::InvalidConfig(
            "session count must be at least 1".to_string(),
        ));
    }
    let sessions = session_count as u64;
    let per_session = total_messages / sessions;
    let effective_total = per_session * sessions;
    Ok(Partition {
        per_session,
        effective_total,
        remainder: total_messages - effective_total,
    })
}

/// Outcome of a load run, one slot per session in stream index order.
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub requested_total: u64,
    pub effective_total: u64,
    pub total_sent: u64,
    pub total_acked: u64,
    pub sessions: Vec<SessionResult>,
    pub elapsed: Duration,
}

impl AggregateResult {
    /// Whether the requested total was rounded down.
    pub fn rounded(&self) -> bool {
        self.requested_total != self.effective_total
    }

    /// Per-session errors, indexed by stream index.
    pub fn per_session_errors(&self) -> Vec<Option<&LoadError>> {
        self.sessions.iter().map(|s| s.error.as_ref()).collect()
    }

    pub fn failed_sessions(&self) -> impl Iterator<Item = &SessionResult> {
        self.sessions.iter().filter(|s| !s.is_completed())
    }

    pub fn completed_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_completed()).count()
    }

    /// Every session completed with no recorded error.
    pub fn is_success(&self) -> bool {
        self.sessions.iter().all(|s| s.is_completed() && s.error.is_none())
    }
}

/// Fans a message budget out over many concurrent sessions and waits for
/// all of them.
pub struct LoadCoordinator {
    transport: Arc<dyn Transport>,
    builder: Arc<dyn EnvelopeBuilder>,
    options: LoadOptions,
}

impl LoadCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        builder: Arc<dyn EnvelopeBuilder>,
        options: LoadOptions,
    ) -> Self {
        Self {
            transport,
            builder,
            options,
        }
    }

    /// Run `session_count` sessions sharing `total_messages` between them.
    ///
    /// Only an unusable configuration is returned as an error; session
    /// failures are reported inside the aggregate result.
    pub async fn run_load(
        &self,
        total_messages: u64,
        session_count: usize,
        payload: Bytes,
    ) -> Result<AggregateResult, LoadError> {
        let partition = partition(total_messages, session_count)?;
        if partition.remainder != 0 {
            info!("Rounding messages to {}", partition.effective_total);
        }

        let start = Instant::now();
        let mut handles = Vec::with_capacity(session_count);
        for stream_index in 0..session_count {
            debug!("Session {} {}", stream_index, SessionState::Pending);
            let config = SessionConfig {
                stream_index,
                message_count: partition.per_session,
                payload: payload.clone(),
            };
            let transport = self.transport.clone();
            let builder = self.builder.clone();
            let options = self.options.clone();
            handles.push(tokio::spawn(async move {
                dispatch(transport, config, builder, options).await
            }));
        }

        // Barrier: join every session, in index order.
        let mut sessions = Vec::with_capacity(session_count);
        for (stream_index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!("Session {} task failed: {}", stream_index, err);
                    SessionResult::failed(
                        stream_index,
                        LoadError::Internal(format!("session task failed: {}", err)),
                    )
                }
            };
            sessions.push(result);
        }

        let aggregate = AggregateResult {
            requested_total: total_messages,
            effective_total: partition.effective_total,
            total_sent: sessions.iter().map(|s| s.send_count).sum(),
            total_acked: sessions.iter().map(|s| s.recv_count).sum(),
            sessions,
            elapsed: start.elapsed(),
        };
        info!(
            "Load finished: {}/{} sessions completed, sent={} acked={} in {:?}",
            aggregate.completed_count(),
            session_count,
            aggregate.total_sent,
            aggregate.total_acked,
            aggregate.elapsed
        );
        Ok(aggregate)
    }
}

/// Open one stream and run its session.
async fn dispatch(
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    builder: Arc<dyn EnvelopeBuilder>,
    options: LoadOptions,
) -> SessionResult {
    let stream_index = config.stream_index;
    debug!("Session {} {}", stream_index, SessionState::Connecting);
    match transport.open_stream(stream_index).await {
        Ok(stream) => StreamSession::new(config, builder, options).run(stream).await,
        Err(err) => {
            error!("Session {} error connecting: {}", stream_index, err);
            let err = match err {
                LoadError::Connect(_) => err,
                other => LoadError::Connect(other.to_string()),
            };
            SessionResult::failed(stream_index, err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_even() {
        let p = partition(8, 4).unwrap();
        assert_eq!(p.per_session, 2);
        assert_eq!(p.effective_total, 8);
        assert_eq!(p.remainder, 0);
    }

    #[test]
    fn test_partition_drops_remainder() {
        let p = partition(10, 4).unwrap();
        assert_eq!(p.per_session, 2);
        assert_eq!(p.effective_total, 8);
        assert_eq!(p.remainder, 2);

        let p = partition(3, 5).unwrap();
        assert_eq!(p.per_session, 0);
        assert_eq!(p.effective_total, 0);
        assert_eq!(p.remainder, 3);
    }

    #[test]
    fn test_partition_holds_for_many_inputs() {
        for sessions in 1..=12usize {
            for total in 0..=100u64 {
                let p = partition(total, sessions).unwrap();
                assert_eq!(p.effective_total, (total / sessions as u64) * sessions as u64);
                assert_eq!(p.effective_total + p.remainder, total);
                assert!(p.remainder < sessions as u64);
            }
        }
    }

    #[test]
    fn test_partition_rejects_zero_sessions() {
        assert!(matches!(
            partition(10, 0),
            Err(LoadError::InvalidConfig(_))
        ));
    }
}
