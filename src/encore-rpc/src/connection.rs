//! Host-side wrapper around one channel to one peer.
//!
//! A connection starts unbound. Callers that arrive before a channel is
//! bound may wait for one; [`Connection::take_ownership`] binds the first
//! channel offered and releases every waiter. Invalidation returns the
//! connection to the unbound state, and [`Connection::teardown`] retires it
//! for good.

use crate::channel::{ChannelHandle, PeerMessage, ReplySender};
use crate::codec::{self, Bytes};
use crate::dispatcher::Dispatcher;
use crate::error::{RpcError, RpcResult};
use crate::events;
use crate::message::{Postable, Request};
use crate::role::Role;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Channel = Arc<dyn ChannelHandle>;
type Waiter = oneshot::Sender<RpcResult<Channel>>;

#[derive(Default)]
struct State {
    channel: Option<Channel>,
    /// Bumped on every bind so that lifecycle callbacks from an older channel
    /// cannot clear a newer one.
    binding: u64,
    waiters: VecDeque<Waiter>,
    torn_down: bool,
}

struct Inner {
    role: Role,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_interrupted(&self) {
        warn!(role = %self.role, "connection interrupted; waiting for the peer to recover");
    }

    fn on_invalidated(&self, binding: u64) {
        let cleared = {
            let mut state = self.state();
            if state.binding == binding && state.channel.is_some() {
                state.channel = None;
                true
            } else {
                false
            }
        };
        if cleared {
            info!(role = %self.role, "connection invalidated");
        }
    }
}

pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self::with_shared_dispatcher(Arc::new(dispatcher))
    }

    pub fn with_shared_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                role: dispatcher.role(),
                dispatcher,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// A connection with no peer. Every call fails with
    /// [`RpcError::ConnectionInvalid`] without waiting, and it never binds.
    pub fn placeholder() -> Self {
        Self::new(Dispatcher::placeholder())
    }

    /// Process-wide placeholder returned wherever a real connection is
    /// missing.
    pub fn shared_placeholder() -> Arc<Connection> {
        static PLACEHOLDER: OnceLock<Arc<Connection>> = OnceLock::new();
        PLACEHOLDER
            .get_or_init(|| Arc::new(Connection::placeholder()))
            .clone()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn is_bound(&self) -> bool {
        self.inner.state().channel.is_some()
    }

    /// Callers currently parked waiting for a channel.
    pub fn waiting_callers(&self) -> usize {
        self.inner
            .state()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    /// Bind `channel` if nothing is bound yet.
    ///
    /// Returns `false` and leaves `channel` untouched when a channel is
    /// already bound, the connection has been torn down, or this is a
    /// placeholder. On success the channel is configured with this side's
    /// dispatcher and lifecycle handlers, resumed, and every waiting caller
    /// is released in arrival order.
    ///
    /// A channel that turns out to be invalidated while it is being
    /// configured is not kept: the connection stays unbound, waiting callers
    /// stay queued, and `false` is returned.
    pub fn take_ownership(&self, channel: Channel) -> bool {
        let role = self.inner.role;
        if role.is_placeholder() {
            debug!(role = %role, "placeholder connection refuses channels");
            return false;
        }

        let (binding, mut waiters) = {
            let mut state = self.inner.state();
            if state.torn_down {
                debug!(role = %role, "connection torn down; channel rejected");
                return false;
            }
            if state.channel.is_some() {
                debug!(role = %role, "connection already bound; channel rejected");
                return false;
            }
            state.binding += 1;
            state.channel = Some(channel.clone());
            (state.binding, std::mem::take(&mut state.waiters))
        };

        channel.set_exported_sink(self.inner.dispatcher.clone());
        let weak = Arc::downgrade(&self.inner);
        channel.set_interruption_handler(Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_interrupted();
            }
        }));
        let weak = Arc::downgrade(&self.inner);
        channel.set_invalidation_handler(Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_invalidated(binding);
            }
        }));
        channel.resume();

        // The invalidation handler runs at once for a channel that was
        // already dead, so the binding has to be checked again.
        let (bound, target) = {
            let mut state = self.inner.state();
            if state.binding == binding && state.channel.is_some() {
                (true, Some(channel.clone()))
            } else if let Some(newer) = state.channel.clone() {
                (false, Some(newer))
            } else {
                if !state.torn_down {
                    while let Some(waiter) = waiters.pop_back() {
                        state.waiters.push_front(waiter);
                    }
                }
                (false, None)
            }
        };

        if bound {
            info!(role = %role, "connection bound");
        } else {
            warn!(role = %role, "channel invalidated while binding; not kept");
        }
        if !waiters.is_empty() {
            debug!(role = %role, waiters = waiters.len(), "resuming waiters");
        }
        for waiter in waiters {
            // A waiter whose caller was cancelled is simply skipped.
            let _ = waiter.send(target.clone().ok_or(RpcError::ConnectionInvalid));
        }
        bound
    }

    /// Invalidate the bound channel, if any. The connection becomes unbound
    /// and may later take ownership of a new channel.
    pub fn invalidate(&self) {
        let channel = {
            let mut state = self.inner.state();
            state.channel.take()
        };
        if let Some(channel) = channel {
            info!(role = %self.inner.role, "invalidating connection");
            channel.invalidate();
        }
    }

    /// Retire the connection: fail every waiting caller and invalidate the
    /// bound channel. Later calls fail immediately and no channel can be
    /// bound again. Safe to call more than once; also runs on drop.
    pub fn teardown(&self) {
        let (channel, waiters) = {
            let mut state = self.inner.state();
            state.torn_down = true;
            (state.channel.take(), std::mem::take(&mut state.waiters))
        };
        if !waiters.is_empty() {
            debug!(role = %self.inner.role, waiters = waiters.len(), "failing waiters on teardown");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(RpcError::ConnectionInvalid));
        }
        if let Some(channel) = channel {
            channel.invalidate();
        }
    }

    /// Resolve the channel to send on, parking until one is bound when
    /// `wait` is set.
    async fn acquire(&self, wait: bool) -> RpcResult<Channel> {
        if self.inner.role.is_placeholder() {
            return Err(RpcError::ConnectionInvalid);
        }

        let parked = {
            let mut state = self.inner.state();
            if let Some(channel) = &state.channel {
                return Ok(channel.clone());
            }
            if state.torn_down || !wait {
                return Err(RpcError::ConnectionInvalid);
            }
            state.waiters.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(role = %self.inner.role, waiters = state.waiters.len(), "waiting for a channel");
            rx
        };

        parked.await.unwrap_or(Err(RpcError::ConnectionInvalid))
    }

    async fn send(&self, channel: &Channel, message: PeerMessage) -> RpcResult<Bytes> {
        let (reply, response) = ReplySender::channel();
        channel.send(message, reply);
        response.recv().await
    }

    /// Invoke the peer's endpoint for `R` and decode its response.
    pub async fn dispatch<R: Request>(&self, request: &R, wait: bool) -> RpcResult<R::Response> {
        let channel = self.acquire(wait).await?;
        let payload = codec::encode(request)?;
        let message = PeerMessage::InvokeEndpoint {
            payload,
            target_name: R::endpoint().to_string(),
        };
        let reply = self.send(&channel, message).await?;
        Ok(codec::decode(&reply)?)
    }

    /// [`dispatch`](Self::dispatch) that waits for a channel.
    pub async fn dispatch_waiting<R: Request>(&self, request: &R) -> RpcResult<R::Response> {
        self.dispatch(request, true).await
    }

    /// Post a one-way event to the peer. Completes once the peer has
    /// accepted it.
    pub async fn post<E: Postable>(&self, event: &E, wait: bool) -> RpcResult<()> {
        let channel = self.acquire(wait).await?;
        let message = PeerMessage::PostEvent {
            payload: codec::encode(event)?,
            name: E::name().to_string(),
        };
        self.send(&channel, message).await.map(drop)
    }

    /// Round-trip a liveness probe, forcing the channel to establish.
    pub async fn ping(&self, wait: bool) -> RpcResult<()> {
        let channel = self.acquire(wait).await?;
        self.send(&channel, PeerMessage::Ping).await.map(drop)
    }

    /// Every `E` the peer posts from now on, in arrival order.
    pub fn receive<E: Postable>(&self) -> BoxStream<'static, E> {
        events::typed(self.inner.dispatcher.subscribe())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("bound", &state.channel.is_some())
            .field("waiters", &state.waiters.len())
            .field("torn_down", &state.torn_down)
            .finish()
    }
}
