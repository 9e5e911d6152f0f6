use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use prost::Message;
use tokio::{task::JoinHandle, time::timeout};
use tonic::{
    client::Grpc,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder, Streaming},
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
    Request, Response, Status as GrpcStatus,
};
use tracing::{debug, info};

use crate::{
    common::TimeoutOptions,
    error::LoadError,
    message::{Ack, BroadcastResponse},
    transport::{AckReceiver, DuplexStream, StreamSender, Transport},
};

/// The bidirectional broadcast method of the ordering service.
pub const BROADCAST_PATH: &str = "/orderer.AtomicBroadcast/Broadcast";

/// Envelopes queued per stream before `send` waits.
const SEND_BUFFER: usize = 1;

/// Writes pre-built envelope bytes untouched and decodes broadcast responses.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec;

impl Codec for EnvelopeCodec {
    type Encode = Bytes;
    type Decode = BroadcastResponse;
    type Encoder = EnvelopeEncoder;
    type Decoder = ResponseDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        EnvelopeEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        ResponseDecoder
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvelopeEncoder;

impl Encoder for EnvelopeEncoder {
    type Item = Bytes;
    type Error = GrpcStatus;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseDecoder;

impl Decoder for ResponseDecoder {
    type Item = BroadcastResponse;
    type Error = GrpcStatus;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        BroadcastResponse::decode(src)
            .map(Some)
            .map_err(|err| GrpcStatus::internal(err.to_string()))
    }
}

/// Opens broadcast streams over one shared connection.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    channel: Channel,
    timeout_options: TimeoutOptions,
}

impl GrpcTransport {
    /// Dial the ordering service at `addr` (`host:port` or a full URI).
    pub async fn connect(addr: &str, timeout_options: TimeoutOptions) -> Result<Self, LoadError> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let endpoint =
            Endpoint::from_shared(uri).map_err(|err| LoadError::Connect(err.to_string()))?;
        let channel = match timeout(timeout_options.connect_timeout, endpoint.connect()).await {
            Ok(result) => result.map_err(|err| LoadError::Connect(err.to_string()))?,
            Err(_) => {
                return Err(LoadError::Connect(format!(
                    "timeout to connect to {}",
                    addr
                )))
            }
        };
        info!("Connected to {}", addr);

        Ok(Self {
            channel,
            timeout_options,
        })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn open_stream(&self, stream_index: usize) -> Result<DuplexStream, LoadError> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|err| LoadError::Connect(format!("service was not ready: {}", err)))?;

        let (tx, rx) = flume::bounded::<Bytes>(SEND_BUFFER);
        let request = Request::new(rx.into_stream());
        let path = PathAndQuery::from_static(BROADCAST_PATH);
        // The server may hold its response headers until the first envelope
        // arrives, so the call is driven in the background.
        let call = tokio::spawn(async move {
            grpc.streaming(request, path, EnvelopeCodec::default()).await
        });
        debug!("Opened broadcast stream {}", stream_index);

        Ok(DuplexStream::new(
            GrpcSender {
                tx: Some(tx),
                write_timeout: self.timeout_options.write_timeout,
            },
            GrpcReceiver {
                inbound: Inbound::Pending(call),
                read_timeout: self.timeout_options.read_timeout,
            },
        ))
    }
}

struct GrpcSender {
    tx: Option<flume::Sender<Bytes>>,
    write_timeout: Duration,
}

#[async_trait]
impl StreamSender for GrpcSender {
    async fn send(&mut self, envelope: Bytes) -> Result<(), LoadError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| LoadError::Send("stream already closed".to_string()))?;
        match timeout(self.write_timeout, tx.send_async(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LoadError::Send("broadcast stream closed".to_string())),
            Err(_) => Err(LoadError::Send("timeout to send envelope".to_string())),
        }
    }

    async fn close_send(&mut self) -> Result<(), LoadError> {
        // Dropping the sender ends the request stream, which half-closes the call.
        self.tx
            .take()
            .map(|_| ())
            .ok_or_else(|| LoadError::Send("stream already closed".to_string()))
    }
}

type BroadcastCall = JoinHandle<Result<Response<Streaming<BroadcastResponse>>, GrpcStatus>>;

enum Inbound {
    Pending(BroadcastCall),
    Open(Streaming<BroadcastResponse>),
    Failed,
}

struct GrpcReceiver {
    inbound: Inbound,
    read_timeout: Duration,
}

impl Drop for GrpcReceiver {
    fn drop(&mut self) {
        // A call nobody will read from must not outlive the session.
        if let Inbound::Pending(call) = &self.inbound {
            call.abort();
        }
    }
}

#[async_trait]
impl AckReceiver for GrpcReceiver {
    async fn receive(&mut self) -> Result<Ack, LoadError> {
        if let Inbound::Pending(call) = &mut self.inbound {
            let opened = match call.await {
                Ok(Ok(response)) => Ok(response.into_inner()),
                Ok(Err(status)) => Err(LoadError::Recv(format!(
                    "broadcast call failed: {}",
                    status
                ))),
                Err(err) => Err(LoadError::Recv(format!("broadcast call aborted: {}", err))),
            };
            match opened {
                Ok(streaming) => self.inbound = Inbound::Open(streaming),
                Err(err) => {
                    self.inbound = Inbound::Failed;
                    return Err(err);
                }
            }
        }

        let streaming = match &mut self.inbound {
            Inbound::Open(streaming) => streaming,
            _ => return Err(LoadError::Recv("broadcast stream is not open".to_string())),
        };
        match timeout(self.read_timeout, streaming.message()).await {
            Ok(Ok(Some(resp))) => Ok(Ack::from(resp)),
            Ok(Ok(None)) => Err(LoadError::Recv("stream closed by remote".to_string())),
            Ok(Err(status)) => Err(LoadError::Recv(status.to_string())),
            Err(_) => Err(LoadError::Recv("timeout to receive ack".to_string())),
        }
    }
}
