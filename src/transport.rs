use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::LoadError, message::Ack};

/// Produces duplex streams to the remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new stream for the session with the given index.
    ///
    /// Fails with [`LoadError::Connect`] when the endpoint is unreachable or
    /// the handshake fails.
    async fn open_stream(&self, stream_index: usize) -> Result<DuplexStream, LoadError>;
}

/// The outbound half of a duplex stream.
#[async_trait]
pub trait StreamSender: Send {
    /// Write one envelope, waiting on transport backpressure.
    async fn send(&mut self, envelope: Bytes) -> Result<(), LoadError>;

    /// Half-close the stream. No envelope may be sent afterwards.
    async fn close_send(&mut self) -> Result<(), LoadError>;
}

/// The inbound half of a duplex stream.
#[async_trait]
pub trait AckReceiver: Send {
    /// Wait for the next acknowledgment, in the order the remote produced them.
    async fn receive(&mut self) -> Result<Ack, LoadError>;
}

/// An open duplex stream, already split into its two directions so that
/// sending and receiving can progress independently.
pub struct DuplexStream {
    pub sender: Box<dyn StreamSender>,
    pub receiver: Box<dyn AckReceiver>,
}

impl DuplexStream {
    pub fn new<S, R>(sender: S, receiver: R) -> Self
    where
        S: StreamSender + 'static,
        R: AckReceiver + 'static,
    {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}
