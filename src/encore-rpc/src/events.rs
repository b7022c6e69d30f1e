//! Fan-out of inbound events to typed subscribers.

use crate::codec::{self, Bytes};
use crate::message::Postable;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// An event as it arrived from the peer, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub payload: Bytes,
    pub name: String,
}

/// Unbounded stream of every inbound event, in arrival order.
pub type InboundEvents = mpsc::UnboundedReceiver<InboundEvent>;

/// Every subscriber gets its own unbounded queue, so a slow consumer never
/// loses events or holds up another.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InboundEvent>>>,
}

impl EventBus {
    /// New subscriber. Subscribers dropped since the last publish are
    /// forgotten here, so a quiet bus does not accumulate them.
    pub(crate) fn subscribe(&self) -> InboundEvents {
        let (tx, rx) = mpsc::unbounded();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sender| !sender.is_closed());
        subscribers.push(tx);
        rx
    }

    /// Hand `event` to every live subscriber, dropping the ones that went away.
    pub(crate) fn publish(&self, event: InboundEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

/// Keep events named `E::name()` and decode them. Payloads that fail to
/// decode are logged and skipped.
pub fn typed<E: Postable>(events: InboundEvents) -> BoxStream<'static, E> {
    events
        .filter_map(|event| async move {
            if event.name != E::name() {
                return None;
            }
            match codec::decode::<E>(&event.payload) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(event = %event.name, error = %err, "dropping undecodable event");
                    None
                }
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl Postable for Tick {}

    fn tick(n: u32) -> InboundEvent {
        InboundEvent {
            payload: codec::encode(&Tick { n }).unwrap(),
            name: "Tick".into(),
        }
    }

    #[tokio::test]
    async fn typed_stream_filters_by_name_and_skips_garbage() {
        let bus = EventBus::default();
        let stream = typed::<Tick>(bus.subscribe());

        bus.publish(tick(1));
        bus.publish(InboundEvent {
            payload: b"{}".to_vec(),
            name: "Other".into(),
        });
        bus.publish(InboundEvent {
            payload: b"not json".to_vec(),
            name: "Tick".into(),
        });
        bus.publish(tick(2));

        let got: Vec<Tick> = stream.take(2).collect().await;
        assert_eq!(got, vec![Tick { n: 1 }, Tick { n: 2 }]);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::default();
        let kept = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish(tick(7));
        assert_eq!(bus.subscriber_count(), 1);

        let first = typed::<Tick>(kept).next().await;
        assert_eq!(first, Some(Tick { n: 7 }));
    }

    #[test]
    fn subscribe_churn_on_a_quiet_bus_stays_bounded() {
        let bus = EventBus::default();
        let _live = bus.subscribe();
        for _ in 0..10_000 {
            drop(bus.subscribe());
        }

        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.retained() <= 2);
    }
}
