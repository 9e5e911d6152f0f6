//! An in-process transport that acknowledges every envelope it receives.
//!
//! Each stream gets its own acker task. Faults can be injected per stream
//! index, which is what the test suite uses to exercise partial failures.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{
    error::LoadError,
    message::{Ack, Status},
    transport::{AckReceiver, DuplexStream, StreamSender, Transport},
};

const DEFAULT_BUFFER: usize = 16;

/// Faults injected into one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamFaults {
    connect: bool,
    send_at: Option<u64>,
    recv_at: Option<u64>,
    reject_at: Option<(u64, Status, String)>,
    ack_latency: Duration,
}

impl StreamFaults {
    /// Refuse to open the stream.
    pub fn fail_connect(mut self) -> Self {
        self.connect = true;
        self
    }

    /// Fail the send of message `seq` (zero based).
    pub fn fail_send_at(mut self, seq: u64) -> Self {
        self.send_at = Some(seq);
        self
    }

    /// Fail the receive of ack `seq` with a transport error.
    pub fn fail_recv_at(mut self, seq: u64) -> Self {
        self.recv_at = Some(seq);
        self
    }

    /// Acknowledge message `seq` with a non-success status.
    pub fn reject_at(mut self, seq: u64, status: Status, info: impl Into<String>) -> Self {
        self.reject_at = Some((seq, status, info.into()));
        self
    }

    /// Delay every acknowledgment.
    pub fn ack_latency(mut self, latency: Duration) -> Self {
        self.ack_latency = latency;
        self
    }
}

#[derive(Debug, Default)]
struct MemoryStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Loopback transport acknowledging every envelope with `SUCCESS` unless a
/// fault says otherwise.
#[derive(Debug)]
pub struct MemoryTransport {
    buffer: usize,
    faults: HashMap<usize, StreamFaults>,
    stats: Arc<MemoryStats>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
            faults: HashMap::new(),
            stats: Arc::new(MemoryStats::default()),
        }
    }

    /// Capacity of each direction of every stream.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_faults(mut self, stream_index: usize, faults: StreamFaults) -> Self {
        self.faults.insert(stream_index, faults);
        self
    }

    /// Streams successfully opened so far.
    pub fn opened_streams(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    /// Streams whose send half has been closed.
    pub fn closed_streams(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_stream(&self, stream_index: usize) -> Result<DuplexStream, LoadError> {
        let faults = self.faults.get(&stream_index).cloned().unwrap_or_default();
        if faults.connect {
            return Err(LoadError::Connect(format!(
                "loopback endpoint refused stream {}",
                stream_index
            )));
        }

        let (envelope_tx, envelope_rx) = flume::bounded::<Bytes>(self.buffer);
        let (ack_tx, ack_rx) = flume::bounded::<Ack>(self.buffer);
        let ack_faults = faults.clone();
        tokio::spawn(async move {
            ack_loop(stream_index, envelope_rx, ack_tx, ack_faults).await;
        });
        self.stats.opened.fetch_add(1, Ordering::SeqCst);

        Ok(DuplexStream::new(
            MemorySender {
                tx: Some(envelope_tx),
                sent: 0,
                fail_at: faults.send_at,
                stats: self.stats.clone(),
            },
            MemoryReceiver {
                rx: ack_rx,
                received: 0,
                fail_at: faults.recv_at,
            },
        ))
    }
}

/// The remote side of a loopback stream: one ack per envelope, in order.
async fn ack_loop(
    stream_index: usize,
    envelope_rx: flume::Receiver<Bytes>,
    ack_tx: flume::Sender<Ack>,
    faults: StreamFaults,
) {
    let mut seq = 0u64;
    while let Ok(envelope) = envelope_rx.recv_async().await {
        if !faults.ack_latency.is_zero() {
            tokio::time::sleep(faults.ack_latency).await;
        }
        let ack = match &faults.reject_at {
            Some((at, status, info)) if *at == seq => Ack::rejected(*status, info.clone()),
            _ => Ack::success(),
        };
        debug!(
            "Loopback stream {} acking message {} ({} bytes): {}",
            stream_index,
            seq,
            envelope.len(),
            ack.status
        );
        if ack_tx.send_async(ack).await.is_err() {
            debug!("Loopback stream {} receiver dropped", stream_index);
            break;
        }
        seq += 1;
    }
}

struct MemorySender {
    tx: Option<flume::Sender<Bytes>>,
    sent: u64,
    fail_at: Option<u64>,
    stats: Arc<MemoryStats>,
}

#[async_trait]
impl StreamSender for MemorySender {
    async fn send(&mut self, envelope: Bytes) -> Result<(), LoadError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| LoadError::Send("stream already closed".to_string()))?;
        if self.fail_at == Some(self.sent) {
            return Err(LoadError::Send(format!(
                "injected failure at message {}",
                self.sent
            )));
        }
        tx.send_async(envelope)
            .await
            .map_err(|_| LoadError::Send("loopback endpoint hung up".to_string()))?;
        self.sent += 1;
        Ok(())
    }

    async fn close_send(&mut self) -> Result<(), LoadError> {
        match self.tx.take() {
            Some(_) => {
                self.stats.closed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(LoadError::Send("stream already closed".to_string())),
        }
    }
}

struct MemoryReceiver {
    rx: flume::Receiver<Ack>,
    received: u64,
    fail_at: Option<u64>,
}

#[async_trait]
impl AckReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<Ack, LoadError> {
        if self.fail_at == Some(self.received) {
            return Err(LoadError::Recv(format!(
                "injected failure at ack {}",
                self.received
            )));
        }
        let ack = self
            .rx
            .recv_async()
            .await
            .map_err(|_| LoadError::Recv("stream closed by remote".to_string()))?;
        self.received += 1;
        Ok(ack)
    }
}
