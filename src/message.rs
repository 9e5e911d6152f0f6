use std::fmt;

use bytes::Bytes;
use prost::Message;

/// The status code of an acknowledgment, as reported by the ordering service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Unknown = 0,
    /// The message was accepted.
    Success = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    RequestEntityTooLarge = 413,
    InternalServerError = 500,
    NotImplemented = 501,
    ServiceUnavailable = 503,
}

impl Status {
    /// Map a raw wire value, treating unknown codes as `Unknown`.
    pub fn from_code(code: i32) -> Self {
        Self::from_i32(code).unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Success => "SUCCESS",
            Self::BadRequest => "BAD_REQUEST",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::RequestEntityTooLarge => "REQUEST_ENTITY_TOO_LARGE",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-level response to one sent envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// The status of the response.
    pub status: Status,
    /// Diagnostic text, usually empty on success.
    pub info: String,
}

impl Ack {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            info: String::new(),
        }
    }

    pub fn rejected(status: Status, info: impl Into<String>) -> Self {
        Self {
            status,
            info: info.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

impl From<BroadcastResponse> for Ack {
    fn from(resp: BroadcastResponse) -> Self {
        Self {
            status: Status::from_code(resp.status),
            info: resp.info,
        }
    }
}

/// Where an envelope is headed: which stream, which message of that stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub stream_index: usize,
    pub seq: u64,
}

/// Turns a raw payload into the bytes written to the stream.
///
/// Signing and identity are resolved before a load run starts, so building is
/// infallible here.
pub trait EnvelopeBuilder: Send + Sync {
    fn build(&self, payload: &Bytes, ctx: &SessionContext) -> Bytes;
}

/// Sends the payload as-is.
#[derive(Debug, Clone, Default)]
pub struct RawEnvelopeBuilder;

impl EnvelopeBuilder for RawEnvelopeBuilder {
    fn build(&self, payload: &Bytes, _ctx: &SessionContext) -> Bytes {
        payload.clone()
    }
}

/// Wraps every payload in an unsigned `MESSAGE` envelope for one channel.
#[derive(Debug, Clone)]
pub struct ChannelEnvelopeBuilder {
    channel_id: String,
}

impl ChannelEnvelopeBuilder {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl EnvelopeBuilder for ChannelEnvelopeBuilder {
    fn build(&self, payload: &Bytes, _ctx: &SessionContext) -> Bytes {
        let channel_header = ChannelHeader {
            r#type: HeaderType::Message as i32,
            version: 0,
            channel_id: self.channel_id.clone(),
            tx_id: String::new(),
            epoch: 0,
        };
        // The payload travels in the signature slot of an inner envelope.
        let data = Envelope {
            payload: Vec::new(),
            signature: payload.to_vec(),
        };
        let envelope = Envelope {
            payload: Payload {
                header: Some(Header {
                    channel_header: channel_header.encode_to_vec(),
                    signature_header: Vec::new(),
                }),
                data: data.encode_to_vec(),
            }
            .encode_to_vec(),
            signature: Vec::new(),
        };
        Bytes::from(envelope.encode_to_vec())
    }
}

/// Header types understood by the ordering service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum HeaderType {
    Message = 0,
    Config = 1,
    ConfigUpdate = 2,
    EndorserTransaction = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Payload {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_header: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature_header: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelHeader {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(int32, tag = "2")]
    pub version: i32,
    #[prost(string, tag = "4")]
    pub channel_id: String,
    #[prost(string, tag = "5")]
    pub tx_id: String,
    #[prost(uint64, tag = "6")]
    pub epoch: u64,
}

/// The response to one broadcast envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BroadcastResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub info: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_code() {
        assert_eq!(Status::from_code(200), Status::Success);
        assert_eq!(Status::from_code(413), Status::RequestEntityTooLarge);
        assert_eq!(Status::from_code(999), Status::Unknown);
    }

    #[test]
    fn test_ack_from_response() {
        let ack = Ack::from(BroadcastResponse {
            status: Status::ServiceUnavailable as i32,
            info: "no leader".to_string(),
        });
        assert!(!ack.is_success());
        assert_eq!(ack.status, Status::ServiceUnavailable);
        assert_eq!(ack.info, "no leader");
        assert!(Ack::success().is_success());
    }

    #[test]
    fn test_channel_envelope_layout() {
        let builder = ChannelEnvelopeBuilder::new("testchainid");
        let payload = Bytes::from(vec![7u8; 16]);
        let ctx = SessionContext {
            stream_index: 0,
            seq: 0,
        };
        let raw = builder.build(&payload, &ctx);

        let envelope = Envelope::decode(raw).unwrap();
        assert!(envelope.signature.is_empty());
        let outer = Payload::decode(envelope.payload.as_slice()).unwrap();
        let header = outer.header.unwrap();
        let channel_header = ChannelHeader::decode(header.channel_header.as_slice()).unwrap();
        assert_eq!(channel_header.channel_id, "testchainid");
        assert_eq!(channel_header.r#type, HeaderType::Message as i32);
        let inner = Envelope::decode(outer.data.as_slice()).unwrap();
        assert_eq!(inner.signature, vec![7u8; 16]);
    }

    #[test]
    fn test_raw_builder_passthrough() {
        let payload = Bytes::from_static(b"abc");
        let ctx = SessionContext {
            stream_index: 3,
            seq: 9,
        };
        assert_eq!(RawEnvelopeBuilder.build(&payload, &ctx), payload);
    }
}
