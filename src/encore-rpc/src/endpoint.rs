//! Endpoint registry: endpoint name → type-erased handler.

use crate::codec::{self, Bytes};
use crate::context::Context;
use crate::error::{RemoteError, RpcError, RpcResult};
use crate::message::Request;
use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A handler with its request and response types erased.
pub trait Endpoint: Send + Sync {
    /// Name of the request type this endpoint decodes, for logs.
    fn request_type(&self) -> &'static str;

    /// Decode `payload`, run the handler and encode its response.
    ///
    /// The returned future may hold thread-bound state; it is polled on the
    /// thread that called `call`.
    fn call(&self, payload: Bytes, context: Context) -> LocalBoxFuture<'static, RpcResult<Bytes>>;
}

struct TypedEndpoint<R, H, Fut> {
    handler: H,
    _signature: PhantomData<fn(R) -> Fut>,
}

impl<R, H, Fut> Endpoint for TypedEndpoint<R, H, Fut>
where
    R: Request,
    H: Fn(R, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Response, RemoteError>> + 'static,
{
    fn request_type(&self) -> &'static str {
        std::any::type_name::<R>()
    }

    fn call(&self, payload: Bytes, context: Context) -> LocalBoxFuture<'static, RpcResult<Bytes>> {
        let request: R = match codec::decode(&payload) {
            Ok(request) => request,
            Err(err) => return futures::future::ready(Err(err.into())).boxed_local(),
        };
        let pending = (self.handler)(request, context);
        async move {
            let response = pending.await.map_err(RpcError::Remote)?;
            Ok(codec::encode(&response)?)
        }
        .boxed_local()
    }
}

/// Immutable set of endpoints. Build one with [`Endpoints::with`], then hand
/// it to a dispatcher; later registrations replace the dispatcher's set as a
/// whole.
#[derive(Clone, Default)]
pub struct Endpoints {
    handlers: HashMap<String, Arc<dyn Endpoint>>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `R::endpoint()`.
    pub fn with<R, H, Fut>(self, handler: H) -> Self
    where
        R: Request,
        H: Fn(R, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, RemoteError>> + 'static,
    {
        self.with_name(R::endpoint(), handler)
    }

    pub fn with_name<R, H, Fut>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        R: Request,
        H: Fn(R, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, RemoteError>> + 'static,
    {
        self.insert(name, handler);
        self
    }

    /// Register or replace the handler for `name`.
    pub fn insert<R, H, Fut>(&mut self, name: impl Into<String>, handler: H)
    where
        R: Request,
        H: Fn(R, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, RemoteError>> + 'static,
    {
        let endpoint = TypedEndpoint {
            handler,
            _signature: PhantomData::<fn(R) -> Fut>,
        };
        self.handlers.insert(name.into(), Arc::new(endpoint));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Merge `other` into `self`; entries in `other` win on collisions.
    pub fn extend(&mut self, other: Endpoints) {
        self.handlers.extend(other.handlers);
    }
}

impl fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoints")
            .field("names", &self.names())
            .finish()
    }
}
