//! The object each side exports to its peer.
//!
//! A dispatcher owns the endpoint registry for one role, routes inbound
//! invocations to handlers on the handler executor, and fans inbound events
//! out to subscribers.

use crate::channel::{MessageSink, PeerMessage, ReplySender};
use crate::codec::Bytes;
use crate::context::Context;
use crate::endpoint::Endpoints;
use crate::error::{RemoteError, RpcError, RpcResult};
use crate::events::{EventBus, InboundEvent, InboundEvents};
use crate::executor::HandlerExecutor;
use crate::message::Request;
use crate::role::Role;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace, warn};

pub struct Dispatcher {
    role: Role,
    endpoints: RwLock<Arc<Endpoints>>,
    events: EventBus,
    context: Context,
    executor: HandlerExecutor,
}

impl Dispatcher {
    pub fn new(role: Role, endpoints: Endpoints) -> Self {
        Self::with_executor(role, endpoints, HandlerExecutor::shared())
    }

    pub fn with_executor(role: Role, endpoints: Endpoints, executor: HandlerExecutor) -> Self {
        Self {
            role,
            endpoints: RwLock::new(Arc::new(endpoints)),
            events: EventBus::default(),
            context: Context::new(),
            executor,
        }
    }

    /// Dispatcher with no endpoints for the placeholder role.
    pub fn placeholder() -> Self {
        Self::new(Role::Placeholder, Endpoints::new())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Base context. Each handler invocation receives a branch of it, so
    /// values set here are visible to every later handler.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Add or replace the handler for `R` under its default endpoint name.
    pub fn register<R, H, Fut>(&self, handler: H)
    where
        R: Request,
        H: Fn(R, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, RemoteError>> + 'static,
    {
        self.register_named(R::endpoint(), handler);
    }

    /// Add or replace one handler under `name`. The whole registry is
    /// swapped, so calls already in flight keep the set they started with.
    pub fn register_named<R, H, Fut>(&self, name: impl Into<String>, handler: H)
    where
        R: Request,
        H: Fn(R, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, RemoteError>> + 'static,
    {
        let mut slot = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Endpoints::clone(&slot);
        next.insert(name, handler);
        *slot = Arc::new(next);
    }

    /// Replace the whole registry.
    pub fn set_endpoints(&self, endpoints: Endpoints) {
        let mut slot = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::new(endpoints);
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    fn snapshot(&self) -> Arc<Endpoints> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run the handler registered as `name` with `payload` and return its
    /// encoded response. Handler failures pass through unchanged.
    pub async fn route(&self, payload: Bytes, name: &str) -> RpcResult<Bytes> {
        let Some(endpoint) = self.snapshot().get(name) else {
            warn!(role = %self.role, endpoint = name, "no endpoint registered");
            return Err(RpcError::EndpointNotFound(name.to_string()));
        };

        trace!(role = %self.role, endpoint = name, request = endpoint.request_type(), "routing");
        let context = self.context.branch();
        let outcome = self
            .executor
            .run(move || endpoint.call(payload, context))
            .await
            .map_err(RpcError::Remote)
            .and_then(|result| result);

        if let Err(err) = &outcome {
            debug!(role = %self.role, endpoint = name, error = %err, "handler failed");
        }
        outcome
    }

    /// Forward an inbound event to every subscriber. Never fails.
    pub fn route_event(&self, payload: Bytes, name: String) {
        trace!(role = %self.role, event = %name, "event received");
        self.events.publish(InboundEvent { payload, name });
    }

    /// Answer a liveness probe.
    pub fn ping(&self) -> RpcResult<()> {
        Ok(())
    }

    /// Stream of every event the peer posts from now on.
    pub fn subscribe(&self) -> InboundEvents {
        self.events.subscribe()
    }
}

impl MessageSink for Dispatcher {
    fn deliver(self: Arc<Self>, message: PeerMessage, reply: ReplySender) {
        match message {
            PeerMessage::Ping => {
                reply.send(self.ping().map(|()| Vec::new()).map_err(|err| err.to_remote()));
            }
            PeerMessage::PostEvent { payload, name } => {
                self.route_event(payload, name);
                reply.send(Ok(Vec::new()));
            }
            PeerMessage::InvokeEndpoint {
                payload,
                target_name,
            } => {
                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime,
                    Err(_) => {
                        warn!(role = %self.role, endpoint = %target_name, "no async runtime to route on");
                        reply.send(Err(RemoteError::unavailable("no async runtime to route on")));
                        return;
                    }
                };
                runtime.spawn(async move {
                    let outcome = self.route(payload, &target_name).await;
                    reply.send(outcome.map_err(|err| err.to_remote()));
                });
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("role", &self.role)
            .field("endpoints", &self.endpoint_names())
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::context::ContextKey;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl Request for Greet {
        type Response = String;
    }

    struct Salutation;

    impl ContextKey for Salutation {
        type Value = String;

        fn default_value() -> String {
            "hello".into()
        }
    }

    fn greeter() -> Dispatcher {
        Dispatcher::new(
            Role::HostMain,
            Endpoints::new().with(|req: Greet, ctx: Context| async move {
                Ok::<_, RemoteError>(format!("{} {}", ctx.get::<Salutation>(), req.name))
            }),
        )
    }

    #[tokio::test]
    async fn routes_to_the_named_handler() {
        let dispatcher = greeter();
        let payload = codec::encode(&Greet { name: "ada".into() }).unwrap();
        let reply = dispatcher.route(payload, "Greet").await.unwrap();
        assert_eq!(codec::decode::<String>(&reply).unwrap(), "hello ada");
    }

    #[tokio::test]
    async fn handlers_see_the_base_context_but_cannot_change_it() {
        let dispatcher = greeter();
        dispatcher.context().set::<Salutation>("hi".into());
        dispatcher.register(|_: Greet, ctx: Context| async move {
            ctx.set::<Salutation>("mutated".into());
            Ok::<_, RemoteError>(ctx.get::<Salutation>())
        });

        let payload = codec::encode(&Greet { name: "x".into() }).unwrap();
        let reply = dispatcher.route(payload, "Greet").await.unwrap();
        assert_eq!(codec::decode::<String>(&reply).unwrap(), "mutated");
        assert_eq!(dispatcher.context().get::<Salutation>(), "hi");
    }

    #[tokio::test]
    async fn unknown_endpoint_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = Dispatcher::new(
            Role::HostView,
            Endpoints::new().with(move |_: Greet, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RemoteError>(String::new()) }
            }),
        );

        let err = dispatcher.route(b"{}".to_vec(), "Missing").await.unwrap_err();
        assert!(matches!(err, RpcError::EndpointNotFound(name) if name == "Missing"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_endpoints_replaces_the_registry() {
        let dispatcher = greeter();
        assert_eq!(dispatcher.endpoint_names(), vec!["Greet".to_string()]);

        dispatcher.set_endpoints(Endpoints::new());
        assert!(dispatcher.endpoint_names().is_empty());
        let err = dispatcher.route(b"{}".to_vec(), "Greet").await.unwrap_err();
        assert!(matches!(err, RpcError::EndpointNotFound(_)));
    }

    #[tokio::test]
    async fn in_flight_calls_keep_the_registry_they_started_with() {
        let (release, parked) = tokio::sync::oneshot::channel::<()>();
        let parked = Arc::new(std::sync::Mutex::new(Some(parked)));
        let entered = Arc::new(tokio::sync::Notify::new());
        let signal = entered.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            Role::HostMain,
            Endpoints::new().with(move |req: Greet, _| {
                let parked = parked.lock().unwrap().take();
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    if let Some(parked) = parked {
                        let _ = parked.await;
                    }
                    Ok::<_, RemoteError>(format!("old {}", req.name))
                }
            }),
        ));

        let payload = codec::encode(&Greet { name: "slow".into() }).unwrap();
        let routing = dispatcher.clone();
        let in_flight = tokio::spawn(async move { routing.route(payload, "Greet").await });
        entered.notified().await;

        dispatcher.set_endpoints(Endpoints::new());
        let late = codec::encode(&Greet { name: "late".into() }).unwrap();
        assert!(matches!(
            dispatcher.route(late, "Greet").await,
            Err(RpcError::EndpointNotFound(name)) if name == "Greet"
        ));

        release.send(()).unwrap();
        let reply = in_flight.await.unwrap().unwrap();
        assert_eq!(codec::decode::<String>(&reply).unwrap(), "old slow");
    }

    #[tokio::test]
    async fn handlers_may_hold_thread_bound_state() {
        let dispatcher = Dispatcher::with_executor(
            Role::HostView,
            Endpoints::new().with(|req: Greet, _| async move {
                let name = std::rc::Rc::new(req.name);
                tokio::task::yield_now().await;
                Ok::<_, RemoteError>(format!("local {name}"))
            }),
            HandlerExecutor::spawn("test-thread-bound"),
        );

        let payload = codec::encode(&Greet { name: "rc".into() }).unwrap();
        let reply = dispatcher.route(payload, "Greet").await.unwrap();
        assert_eq!(codec::decode::<String>(&reply).unwrap(), "local rc");
    }

    #[tokio::test]
    async fn last_registration_for_a_name_wins() {
        let dispatcher = greeter();
        dispatcher.register_named("Hello", |req: Greet, _| async move {
            Ok::<_, RemoteError>(format!("first {}", req.name))
        });
        dispatcher.register_named("Hello", |req: Greet, _| async move {
            Ok::<_, RemoteError>(format!("second {}", req.name))
        });
        assert_eq!(
            dispatcher.endpoint_names(),
            vec!["Greet".to_string(), "Hello".to_string()]
        );

        let payload = codec::encode(&Greet { name: "bo".into() }).unwrap();
        let reply = dispatcher.route(payload, "Hello").await.unwrap();
        assert_eq!(codec::decode::<String>(&reply).unwrap(), "second bo");
    }

    #[tokio::test]
    async fn deliver_answers_each_message_once() {
        let dispatcher = Arc::new(greeter());
        let mut events = dispatcher.subscribe();

        let (tx, rx) = ReplySender::channel();
        dispatcher.clone().deliver(PeerMessage::Ping, tx);
        assert!(rx.recv().await.unwrap().is_empty());

        let (tx, rx) = ReplySender::channel();
        dispatcher.clone().deliver(
            PeerMessage::PostEvent {
                payload: b"1".to_vec(),
                name: "Count".into(),
            },
            tx,
        );
        rx.recv().await.unwrap();
        let event = futures::StreamExt::next(&mut events).await.unwrap();
        assert_eq!(event.name, "Count");

        let (tx, rx) = ReplySender::channel();
        dispatcher.clone().deliver(
            PeerMessage::InvokeEndpoint {
                payload: b"{}".to_vec(),
                target_name: "Nope".into(),
            },
            tx,
        );
        assert!(matches!(rx.recv().await, Err(RpcError::EndpointNotFound(_))));
    }
}
