//! Boundary to the externally supplied bidirectional channel.
//!
//! The runtime never moves bytes itself. A [`ChannelHandle`] carries
//! [`PeerMessage`] envelopes to the peer's exported [`MessageSink`] and hands
//! back exactly one reply per message through a [`ReplySender`].

use crate::codec::{base64_bytes, Bytes};
use crate::error::{RemoteError, RpcError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Wire envelope exchanged between the two dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Liveness probe; forces a lazy channel to materialize.
    Ping,
    PostEvent {
        #[serde(with = "base64_bytes")]
        payload: Bytes,
        name: String,
    },
    InvokeEndpoint {
        #[serde(with = "base64_bytes")]
        payload: Bytes,
        target_name: String,
    },
}

impl PeerMessage {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Ping => "ping",
            PeerMessage::PostEvent { .. } => "post_event",
            PeerMessage::InvokeEndpoint { .. } => "invoke_endpoint",
        }
    }
}

pub type Reply = Result<Bytes, RemoteError>;

/// One-shot reply slot handed to the receiving side along with a message.
///
/// `send` consumes the slot, so a reply can never be delivered twice. A slot
/// dropped without an answer is seen by the caller as
/// [`RpcError::ReplyInvalid`].
#[derive(Debug)]
pub struct ReplySender {
    tx: oneshot::Sender<Reply>,
}

impl ReplySender {
    pub fn channel() -> (ReplySender, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        (ReplySender { tx }, ReplyReceiver { rx })
    }

    pub fn send(self, reply: Reply) {
        // The caller may have been cancelled; its answer is simply dropped.
        let _ = self.tx.send(reply);
    }

    /// Whether the caller stopped waiting for this reply.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct ReplyReceiver {
    rx: oneshot::Receiver<Reply>,
}

impl ReplyReceiver {
    pub async fn recv(self) -> Result<Bytes, RpcError> {
        match self.rx.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(remote)) => Err(RpcError::from(remote)),
            Err(_) => Err(RpcError::ReplyInvalid),
        }
    }
}

/// The object a side exports to its peer.
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(self: Arc<Self>, message: PeerMessage, reply: ReplySender);
}

pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

/// An opaque, externally created channel to one peer process.
///
/// Lifecycle: created → configured and `resume`d by its owner → possibly
/// interrupted (the peer may recover) → invalidated (terminal).
pub trait ChannelHandle: Send + Sync + 'static {
    /// Sink that receives messages sent by the peer.
    fn set_exported_sink(&self, sink: Arc<dyn MessageSink>);

    fn set_interruption_handler(&self, handler: LifecycleHandler);

    /// Called once when the channel is invalidated. Installed on a channel
    /// that is already invalidated, it runs immediately.
    fn set_invalidation_handler(&self, handler: LifecycleHandler);

    /// Start delivering inbound messages. Until then they are held.
    fn resume(&self);

    fn invalidate(&self);

    /// Send one message; `reply` is answered exactly once by the transport
    /// or by the peer.
    fn send(&self, message: PeerMessage, reply: ReplySender);
}
