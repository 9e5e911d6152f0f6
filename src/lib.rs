//! Load generation for a streaming broadcast endpoint.
//!
//! A [`coordinator::LoadCoordinator`] opens many duplex streams through a
//! [`transport::Transport`], pushes envelopes down each one while draining
//! acknowledgments, and reports one result per stream.

pub mod common;
pub mod coordinator;
pub mod error;
pub mod grpc;
pub mod memory;
pub mod message;
pub mod session;
pub mod transport;

pub use common::{LoadOptions, TimeoutOptions};
pub use coordinator::{partition, AggregateResult, LoadCoordinator, Partition};
pub use error::{LoadError, Result};
pub use session::{SessionConfig, SessionResult, SessionState, StreamSession};
pub use transport::{AckReceiver, DuplexStream, StreamSender, Transport};
