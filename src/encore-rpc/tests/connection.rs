use encore_rpc::{
    codec, ChannelHandle, Connection, Context, Dispatcher, Endpoints, MemoryChannel,
    MessageSink, PeerMessage, Postable, RemoteError, RemoteErrorKind, ReplySender, Request, Role,
    RpcError,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl Request for Echo {
    type Response = Echo;
}

#[derive(Debug, Serialize, Deserialize)]
struct Missing;

impl Request for Missing {
    type Response = ();
}

#[derive(Debug, Serialize, Deserialize)]
struct Restricted;

impl Request for Restricted {
    type Response = ();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlaybackChanged {
    position: u32,
}

impl Postable for PlaybackChanged {}

fn echo(text: &str) -> Echo {
    Echo { text: text.into() }
}

/// Extension-side endpoints: `Echo` echoes and counts, `Restricted` always
/// fails with a handler-chosen error.
fn extension_endpoints(calls: Arc<AtomicUsize>) -> Endpoints {
    Endpoints::new()
        .with(move |req: Echo, _: Context| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, RemoteError>(req) }
        })
        .with(|_: Restricted, _| async {
            Err::<(), _>(RemoteError::permission_denied("playback not granted"))
        })
}

fn host() -> Arc<Connection> {
    Arc::new(Connection::new(Dispatcher::new(Role::HostMain, Endpoints::new())))
}

/// An extension-side connection already bound to `end`.
fn extension(end: MemoryChannel, calls: Arc<AtomicUsize>) -> Connection {
    let connection = Connection::new(Dispatcher::new(
        Role::HostMain,
        extension_endpoints(calls),
    ));
    assert!(connection.take_ownership(Arc::new(end)));
    connection
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn dispatch_round_trips_through_the_peer() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let calls = Arc::new(AtomicUsize::new(0));
    let _extension = extension(ext_end, calls.clone());
    let host = host();

    assert!(host.take_ownership(Arc::new(host_end)));
    let reply = host.dispatch(&echo("hi"), false).await.unwrap();

    assert_eq!(reply, echo("hi"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn waiting_call_completes_after_binding() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let _extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let host = host();

    let caller = host.clone();
    let pending = tokio::spawn(async move { caller.dispatch_waiting(&echo("later")).await });
    until(|| host.waiting_callers() == 1).await;
    assert!(!pending.is_finished());

    assert!(host.take_ownership(Arc::new(host_end)));
    assert_eq!(pending.await.unwrap().unwrap(), echo("later"));
    assert_eq!(host.waiting_callers(), 0);
}

#[test]
fn concurrent_binding_admits_exactly_one_channel() {
    let host = host();
    let (first, _first_peer) = MemoryChannel::pair();
    let (second, _second_peer) = MemoryChannel::pair();
    let barrier = Arc::new(Barrier::new(2));

    let attempts: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|end| {
            let host = host.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                host.take_ownership(Arc::new(end))
            })
        })
        .collect();
    let results: Vec<bool> = attempts
        .into_iter()
        .map(|attempt| attempt.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    let loser = if results[0] { &second } else { &first };
    assert!(!loser.is_resumed());
    assert!(!loser.has_exported_sink());
}

/// Peer sink that records the text of every `Echo` as it comes off the wire
/// and answers with the same payload.
#[derive(Default)]
struct Arrivals {
    order: Mutex<Vec<String>>,
}

impl MessageSink for Arrivals {
    fn deliver(self: Arc<Self>, message: PeerMessage, reply: ReplySender) {
        match message {
            PeerMessage::InvokeEndpoint { payload, .. } => {
                let request: Echo = codec::decode(&payload).unwrap();
                self.order.lock().unwrap().push(request.text);
                reply.send(Ok(payload));
            }
            _ => reply.send(Ok(Vec::new())),
        }
    }
}

#[tokio::test]
async fn every_waiter_is_released_exactly_once_in_arrival_order() {
    const CALLERS: usize = 16;
    let (host_end, ext_end) = MemoryChannel::pair();
    let arrivals = Arc::new(Arrivals::default());
    ext_end.set_exported_sink(arrivals.clone());
    ext_end.resume();
    let host = host();

    let mut pending = Vec::new();
    for i in 0..CALLERS {
        let caller = host.clone();
        pending.push(tokio::spawn(async move {
            caller.dispatch(&echo(&i.to_string()), true).await
        }));
        until(|| host.waiting_callers() == i + 1).await;
    }

    assert!(host.take_ownership(Arc::new(host_end)));
    for (i, call) in pending.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), echo(&i.to_string()));
    }
    let expected: Vec<String> = (0..CALLERS).map(|i| i.to_string()).collect();
    assert_eq!(*arrivals.order.lock().unwrap(), expected);
    assert_eq!(host.waiting_callers(), 0);
}

#[tokio::test]
async fn a_channel_dead_before_binding_is_not_kept() {
    let (host_end, ext_end) = MemoryChannel::pair();
    ext_end.invalidate();
    let host = host();

    assert!(!host.take_ownership(Arc::new(host_end)));
    assert!(!host.is_bound());
    assert!(matches!(
        host.dispatch(&echo("dead"), false).await,
        Err(RpcError::ConnectionInvalid)
    ));

    let (fresh, ext_fresh) = MemoryChannel::pair();
    let _extension = extension(ext_fresh, Arc::new(AtomicUsize::new(0)));
    assert!(host.take_ownership(Arc::new(fresh)));
    assert_eq!(host.dispatch(&echo("alive"), false).await.unwrap(), echo("alive"));
}

#[tokio::test]
async fn waiters_outlast_a_dead_channel() {
    let host = host();
    let caller = host.clone();
    let pending = tokio::spawn(async move { caller.dispatch_waiting(&echo("patient")).await });
    until(|| host.waiting_callers() == 1).await;

    let (dead, dead_peer) = MemoryChannel::pair();
    dead_peer.invalidate();
    assert!(!host.take_ownership(Arc::new(dead)));
    assert_eq!(host.waiting_callers(), 1);
    assert!(!pending.is_finished());

    let (fresh, ext_fresh) = MemoryChannel::pair();
    let _extension = extension(ext_fresh, Arc::new(AtomicUsize::new(0)));
    assert!(host.take_ownership(Arc::new(fresh)));
    assert_eq!(pending.await.unwrap().unwrap(), echo("patient"));
}

#[tokio::test]
async fn placeholder_fails_without_waiting() {
    let placeholder = Connection::placeholder();
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        placeholder.dispatch(&echo("x"), true),
    )
    .await
    .expect("placeholder suspended");
    assert!(matches!(outcome, Err(RpcError::ConnectionInvalid)));

    let (end, _peer) = MemoryChannel::pair();
    assert!(!placeholder.take_ownership(Arc::new(end.clone())));
    assert!(!end.is_resumed());
    assert_eq!(Connection::shared_placeholder().role(), Role::Placeholder);
}

#[tokio::test]
async fn unknown_endpoint_invokes_no_handler() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let calls = Arc::new(AtomicUsize::new(0));
    let _extension = extension(ext_end, calls.clone());
    let host = host();
    host.take_ownership(Arc::new(host_end));

    let err = host.dispatch(&Missing, false).await.unwrap_err();
    match err {
        RpcError::EndpointNotFound(name) => assert_eq!(name, "Missing"),
        other => panic!("expected EndpointNotFound, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_errors_reach_the_caller_unchanged() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let _extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let host = host();
    host.take_ownership(Arc::new(host_end));

    match host.dispatch(&Restricted, false).await {
        Err(RpcError::Remote(err)) => {
            assert_eq!(err.kind, RemoteErrorKind::PermissionDenied);
            assert_eq!(err.message, "playback not granted");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn invalidation_unbinds_and_allows_rebinding() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let _extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let host = host();
    host.take_ownership(Arc::new(host_end.clone()));

    host.invalidate();
    assert!(!host.is_bound());
    assert!(host_end.is_invalidated());
    assert!(matches!(
        host.dispatch(&echo("gone"), false).await,
        Err(RpcError::ConnectionInvalid)
    ));

    let (fresh, ext_fresh) = MemoryChannel::pair();
    let _extension = extension(ext_fresh, Arc::new(AtomicUsize::new(0)));
    assert!(host.take_ownership(Arc::new(fresh)));
    assert_eq!(host.dispatch(&echo("back"), false).await.unwrap(), echo("back"));
}

#[tokio::test]
async fn peer_side_invalidation_unbinds_the_host() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let host = host();
    host.take_ownership(Arc::new(host_end));

    extension.invalidate();
    assert!(!host.is_bound());
}

#[tokio::test]
async fn interruption_keeps_the_binding() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let _extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let host = host();
    host.take_ownership(Arc::new(host_end.clone()));

    host_end.interrupt();
    assert!(host.is_bound());
    assert_eq!(host.dispatch(&echo("still"), false).await.unwrap(), echo("still"));
}

#[tokio::test]
async fn cancelled_waiters_are_pruned() {
    let host = host();

    let caller = host.clone();
    let abandoned = tokio::spawn(async move { caller.dispatch_waiting(&echo("never")).await });
    until(|| host.waiting_callers() == 1).await;
    abandoned.abort();
    let _ = abandoned.await;
    assert_eq!(host.waiting_callers(), 0);

    let (host_end, ext_end) = MemoryChannel::pair();
    let _extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let caller = host.clone();
    let kept = tokio::spawn(async move { caller.dispatch_waiting(&echo("kept")).await });
    until(|| host.waiting_callers() == 1).await;

    assert!(host.take_ownership(Arc::new(host_end)));
    assert_eq!(kept.await.unwrap().unwrap(), echo("kept"));
}

#[tokio::test]
async fn teardown_fails_waiters_and_refuses_new_channels() {
    let host = host();
    let caller = host.clone();
    let pending = tokio::spawn(async move { caller.dispatch_waiting(&echo("x")).await });
    until(|| host.waiting_callers() == 1).await;

    host.teardown();
    host.teardown();
    assert!(matches!(
        pending.await.unwrap(),
        Err(RpcError::ConnectionInvalid)
    ));

    let (end, _peer) = MemoryChannel::pair();
    assert!(!host.take_ownership(Arc::new(end)));
    assert!(matches!(
        host.dispatch(&echo("x"), true).await,
        Err(RpcError::ConnectionInvalid)
    ));
}

#[tokio::test]
async fn dropping_a_connection_invalidates_its_channel() {
    let (host_end, _ext_end) = MemoryChannel::pair();
    let host = Connection::new(Dispatcher::new(Role::HostView, Endpoints::new()));
    host.take_ownership(Arc::new(host_end.clone()));

    drop(host);
    assert!(host_end.is_invalidated());
}

#[tokio::test]
async fn every_subscriber_sees_every_event_in_order() {
    let (host_end, ext_end) = MemoryChannel::pair();
    let extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    let host = host();
    host.take_ownership(Arc::new(host_end));

    let first = host.receive::<PlaybackChanged>();
    let second = host.receive::<PlaybackChanged>();

    for position in [10, 20, 30] {
        extension
            .post(&PlaybackChanged { position }, false)
            .await
            .unwrap();
    }

    let expected: Vec<PlaybackChanged> = [10, 20, 30]
        .into_iter()
        .map(|position| PlaybackChanged { position })
        .collect();
    assert_eq!(first.take(3).collect::<Vec<_>>().await, expected);
    assert_eq!(second.take(3).collect::<Vec<_>>().await, expected);
}

#[tokio::test]
async fn ping_forces_a_round_trip() {
    let host = host();
    assert!(matches!(host.ping(false).await, Err(RpcError::ConnectionInvalid)));

    let (host_end, ext_end) = MemoryChannel::pair();
    let _extension = extension(ext_end, Arc::new(AtomicUsize::new(0)));
    host.take_ownership(Arc::new(host_end));
    host.ping(false).await.unwrap();
}
