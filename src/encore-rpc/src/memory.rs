//! In-process channel pair used by tests, the loopback demo and any host
//! that runs an extension inside its own process.

use crate::channel::{ChannelHandle, LifecycleHandler, MessageSink, PeerMessage, ReplySender};
use crate::error::RemoteError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

#[derive(Default)]
struct EndState {
    sink: Option<Arc<dyn MessageSink>>,
    resumed: bool,
    /// Messages sent by the peer before this end resumed, in arrival order.
    held: Vec<(PeerMessage, ReplySender)>,
    on_interrupt: Option<LifecycleHandler>,
    on_invalidate: Option<LifecycleHandler>,
}

struct Shared {
    invalidated: AtomicBool,
    ends: [Mutex<EndState>; 2],
}

impl Shared {
    fn end(&self, index: usize) -> MutexGuard<'_, EndState> {
        self.ends[index].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of an in-memory channel. Clones refer to the same end.
#[derive(Clone)]
pub struct MemoryChannel {
    shared: Arc<Shared>,
    index: usize,
}

impl MemoryChannel {
    /// Two connected ends. Each end holds inbound messages until it is
    /// resumed.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let shared = Arc::new(Shared {
            invalidated: AtomicBool::new(false),
            ends: [Mutex::default(), Mutex::default()],
        });
        (
            MemoryChannel {
                shared: shared.clone(),
                index: 0,
            },
            MemoryChannel { shared, index: 1 },
        )
    }

    /// Simulate the peer process going away temporarily.
    pub fn interrupt(&self) {
        let handlers: Vec<LifecycleHandler> = (0..2)
            .filter_map(|index| self.shared.end(index).on_interrupt.clone())
            .collect();
        debug!(handlers = handlers.len(), "memory channel interrupted");
        for handler in handlers {
            handler();
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::SeqCst)
    }

    pub fn is_resumed(&self) -> bool {
        self.shared.end(self.index).resumed
    }

    pub fn has_exported_sink(&self) -> bool {
        self.shared.end(self.index).sink.is_some()
    }

    fn peer(&self) -> usize {
        1 - self.index
    }
}

fn closed() -> RemoteError {
    RemoteError::transport("channel invalidated")
}

fn no_sink() -> RemoteError {
    RemoteError::unavailable("peer exports no message sink")
}

fn deliver(sink: Option<Arc<dyn MessageSink>>, message: PeerMessage, reply: ReplySender) {
    match sink {
        Some(sink) => sink.deliver(message, reply),
        None => reply.send(Err(no_sink())),
    }
}

impl ChannelHandle for MemoryChannel {
    fn set_exported_sink(&self, sink: Arc<dyn MessageSink>) {
        self.shared.end(self.index).sink = Some(sink);
    }

    fn set_interruption_handler(&self, handler: LifecycleHandler) {
        self.shared.end(self.index).on_interrupt = Some(handler);
    }

    fn set_invalidation_handler(&self, handler: LifecycleHandler) {
        {
            let mut end = self.shared.end(self.index);
            if !self.is_invalidated() {
                end.on_invalidate = Some(handler);
                return;
            }
        }
        handler();
    }

    fn resume(&self) {
        let (sink, held) = {
            let mut end = self.shared.end(self.index);
            if end.resumed {
                return;
            }
            end.resumed = true;
            (end.sink.clone(), std::mem::take(&mut end.held))
        };
        trace!(held = held.len(), "memory channel resumed");
        for (message, reply) in held {
            deliver(sink.clone(), message, reply);
        }
    }

    fn invalidate(&self) {
        if self.shared.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("memory channel invalidated");
        for index in 0..2 {
            let (held, handler) = {
                let mut end = self.shared.end(index);
                end.sink = None;
                (std::mem::take(&mut end.held), end.on_invalidate.take())
            };
            for (_, reply) in held {
                reply.send(Err(closed()));
            }
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn send(&self, message: PeerMessage, reply: ReplySender) {
        if self.is_invalidated() {
            reply.send(Err(closed()));
            return;
        }
        let sink = {
            let mut peer = self.shared.end(self.peer());
            if !peer.resumed {
                trace!(kind = message.kind(), "holding message until peer resumes");
                peer.held.push((message, reply));
                return;
            }
            peer.sink.clone()
        };
        deliver(sink, message, reply);
    }
}
