//! Bidirectional request/event RPC between the Encore host and its extension
//! processes.
//!
//! Each side exports a [`Dispatcher`] holding its endpoints. The host wraps
//! every channel to a peer in a [`Connection`] that waits for the channel to
//! be bound, sends typed [`Request`]s and [`Postable`] events, and streams
//! inbound events back as typed values.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod context;
pub mod contract;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod executor;
pub mod memory;
pub mod message;
pub mod role;

pub use channel::{ChannelHandle, LifecycleHandler, MessageSink, PeerMessage, ReplySender};
pub use codec::{Blob, Bytes, Timestamp};
pub use connection::Connection;
pub use context::{Context, ContextKey};
pub use dispatcher::Dispatcher;
pub use endpoint::{Endpoint, Endpoints};
pub use error::{CodecError, RemoteError, RemoteErrorKind, RpcError, RpcResult};
pub use events::{InboundEvent, InboundEvents};
pub use executor::HandlerExecutor;
pub use memory::MemoryChannel;
pub use message::{Postable, Request};
pub use role::Role;

#[doc(hidden)]
pub mod __private {
    pub use serde;
}
