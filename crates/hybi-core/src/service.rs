//! Services bound to a conversation.
//!
//! A service is a named, per-connection handler. The server registers a
//! factory per name at startup; each conversation asks the registry for the
//! names its client requested and drives every instance through
//! auth → load → ready → (messages) → destroy.
//!
//! Only factories producing `Arc<dyn Service>` can be registered, so a name
//! can never resolve to something that is not a service.

use crate::conversation::ConversationHandle;
use crate::error::{HybiError, HybiResult};
use crate::request::UpgradeRequest;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::http::HeaderMap;

/// Boxed future returned by service hooks.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = HybiResult<T>> + Send + 'a>>;

/// What a service is asked to authorize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub service: String,
    pub action: String,
}

impl AuthRequest {
    pub fn new(service: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
        }
    }
}

/// Per-connection service behaviour.
///
/// Hooks take `&self`; services keep mutable state behind their own locks.
pub trait Service: Send + Sync {
    /// Decide whether this client may use the service. Bounded by the
    /// conversation's auth timeout.
    fn request_auth<'a>(&'a self, _request: &'a AuthRequest) -> ServiceFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }

    /// Acquire whatever the service needs. Bounded by the load timeout; a
    /// service whose load times out is destroyed and never bound.
    fn load(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Called once the service is bound. Writes issued here reach the client
    /// before any write of a service bound later.
    fn ready<'a>(&'a self, _token: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Handle one inbound text or binary message.
    fn handle_message(&self, payload: Vec<u8>, is_text: bool) -> ServiceFuture<'_, ()>;

    /// Release resources. Called at most once per instance by the
    /// conversation.
    fn destroy(&self) -> HybiResult<()> {
        Ok(())
    }
}

/// Everything a service instance learns at construction.
#[derive(Clone)]
pub struct ServiceContext {
    name: String,
    conversation: ConversationHandle,
    request: Arc<UpgradeRequest>,
}

impl ServiceContext {
    pub fn new(
        name: impl Into<String>,
        conversation: ConversationHandle,
        request: Arc<UpgradeRequest>,
    ) -> Self {
        Self {
            name: name.into(),
            conversation,
            request,
        }
    }

    /// The name the service was bound under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Back-reference to the owning conversation.
    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }

    pub fn pathname(&self) -> &str {
        &self.request.pathname
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.request.params
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.request.headers
    }

    /// Single header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }
}

/// Factory producing one service instance per conversation.
pub type ServiceFactory = dyn Fn(ServiceContext) -> Arc<dyn Service> + Send + Sync;

/// Name → factory table, filled at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, Arc<ServiceFactory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(ServiceContext) -> Arc<dyn Service> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Look up the factory for `name`.
    pub fn resolve(&self, name: &str) -> HybiResult<Arc<ServiceFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| HybiError::ServiceNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
