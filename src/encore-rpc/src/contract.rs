//! Shared behavioral suite for [`ChannelHandle`] implementations.
//!
//! Transports call [`run_channel_contract`] from their own tests with a
//! factory producing fresh connected pairs.

use crate::channel::{ChannelHandle, MessageSink, PeerMessage, ReplySender};
use crate::error::RpcError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on how long any single reply may take inside the suite.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelContractError {
    #[error("{step}: no reply in time")]
    Timeout { step: &'static str },
    #[error("{step}: expected a reply, got error: {error}")]
    Failed { step: &'static str, error: String },
    #[error("{step}: expected payload {expected:?}, got {actual:?}")]
    WrongPayload {
        step: &'static str,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    #[error("peer sink saw {actual:?}, expected {expected:?}")]
    WrongDeliveries {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("invalidation handler fired {count} times on the invalidated end")]
    InvalidationHandler { count: usize },
    #[error("invalidation handler installed after invalidation fired {count} times")]
    LateInvalidationHandler { count: usize },
    #[error("send after invalidation succeeded")]
    SentAfterInvalidation,
}

/// Records what it receives and echoes payloads back.
#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn seen(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageSink for RecordingSink {
    fn deliver(self: Arc<Self>, message: PeerMessage, reply: ReplySender) {
        let (label, answer) = match message {
            PeerMessage::Ping => ("ping".to_string(), Vec::new()),
            PeerMessage::PostEvent { payload, name } => (format!("post:{name}"), payload),
            PeerMessage::InvokeEndpoint {
                payload,
                target_name,
            } => (format!("invoke:{target_name}"), payload),
        };
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(label);
        reply.send(Ok(answer));
    }
}

async fn round_trip(
    channel: &dyn ChannelHandle,
    message: PeerMessage,
    step: &'static str,
) -> Result<Result<Vec<u8>, RpcError>, ChannelContractError> {
    let (reply, response) = ReplySender::channel();
    channel.send(message, reply);
    tokio::time::timeout(REPLY_TIMEOUT, response.recv())
        .await
        .map_err(|_| ChannelContractError::Timeout { step })
}

async fn expect_payload(
    channel: &dyn ChannelHandle,
    message: PeerMessage,
    step: &'static str,
    expected: &[u8],
) -> Result<(), ChannelContractError> {
    match round_trip(channel, message, step).await? {
        Ok(actual) if actual == expected => Ok(()),
        Ok(actual) => Err(ChannelContractError::WrongPayload {
            step,
            expected: expected.to_vec(),
            actual,
        }),
        Err(err) => Err(ChannelContractError::Failed {
            step,
            error: err.to_string(),
        }),
    }
}

/// Run the channel contract against pairs produced by `make_pair`.
///
/// Checks that messages reach the peer's exported sink in order and are
/// answered exactly once in both directions, that invalidation fires the
/// invalidation handler once, that a handler installed after invalidation
/// runs right away, and that sends on an invalidated channel fail instead of
/// hanging.
pub async fn run_channel_contract<F>(make_pair: F) -> Result<(), ChannelContractError>
where
    F: Fn() -> (Arc<dyn ChannelHandle>, Arc<dyn ChannelHandle>),
{
    let (near, far) = make_pair();
    let near_sink = Arc::new(RecordingSink::default());
    let far_sink = Arc::new(RecordingSink::default());
    near.set_exported_sink(near_sink.clone());
    far.set_exported_sink(far_sink.clone());
    near.resume();
    far.resume();

    expect_payload(near.as_ref(), PeerMessage::Ping, "ping", &[]).await?;
    expect_payload(
        near.as_ref(),
        PeerMessage::PostEvent {
            payload: b"{\"n\":1}".to_vec(),
            name: "Tick".into(),
        },
        "post",
        b"{\"n\":1}",
    )
    .await?;
    expect_payload(
        near.as_ref(),
        PeerMessage::InvokeEndpoint {
            payload: b"[1,2,3]".to_vec(),
            target_name: "Sum".into(),
        },
        "invoke",
        b"[1,2,3]",
    )
    .await?;
    expect_payload(far.as_ref(), PeerMessage::Ping, "reverse ping", &[]).await?;

    let expected = vec![
        "ping".to_string(),
        "post:Tick".to_string(),
        "invoke:Sum".to_string(),
    ];
    let actual = far_sink.seen();
    if actual != expected {
        return Err(ChannelContractError::WrongDeliveries { expected, actual });
    }
    let reverse = near_sink.seen();
    if reverse != vec!["ping".to_string()] {
        return Err(ChannelContractError::WrongDeliveries {
            expected: vec!["ping".to_string()],
            actual: reverse,
        });
    }

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    near.set_invalidation_handler(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    near.invalidate();
    near.invalidate();
    let count = fired.load(Ordering::SeqCst);
    if count != 1 {
        return Err(ChannelContractError::InvalidationHandler { count });
    }

    let late = Arc::new(AtomicUsize::new(0));
    let counter = late.clone();
    near.set_invalidation_handler(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let count = late.load(Ordering::SeqCst);
    if count != 1 {
        return Err(ChannelContractError::LateInvalidationHandler { count });
    }

    if round_trip(near.as_ref(), PeerMessage::Ping, "send after invalidation")
        .await?
        .is_ok()
    {
        return Err(ChannelContractError::SentAfterInvalidation);
    }
    Ok(())
}
