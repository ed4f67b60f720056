//! One server-side WebSocket conversation.
//!
//! A conversation owns a single transport. It answers the upgrade request,
//! binds the services the client asked for, dispatches inbound messages and
//! serializes every outbound frame.
//!
//! An inbound message wrapped in a target envelope (see
//! [`codec::split_target`](crate::codec::split_target)) goes to the named
//! service. Anything else goes to the default service, the first one bound.
//!
//! ```text
//! Constructed ──start──▶ Handshaking ──ok──▶ Open ──close──▶ Closed
//!                             │                                 ▲
//!                             └──────────── reject ─────────────┘
//! ```
//!
//! Inbound reads do not start until binding settles, so no message reaches a
//! service before every requested service has been through auth and load.

use crate::codec::{split_target, FrameEvent, FrameReader, OutboundFrame, PING_SENTINEL};
use crate::context::ServerContext;
use crate::error::{HybiError, HybiResult};
use crate::event::{self, ConversationEvent};
use crate::handshake;
use crate::request::UpgradeRequest;
use crate::service::{AuthRequest, Service, ServiceContext};
use crate::transport::Transport;
use crate::writer::WriteSerializer;
use futures_util::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

tokio::task_local! {
    /// Token of the conversation whose bind sequence runs on this task.
    static BINDING: String;
}

/// Lifecycle phase. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Constructed,
    Handshaking,
    Open,
    Closed,
}

#[derive(Default)]
struct ServiceTable {
    handles: HashMap<String, Arc<dyn Service>>,
    /// First successfully bound service; receives all inbound messages.
    default_service: Option<String>,
}

pub struct Conversation {
    token: String,
    context: Arc<ServerContext>,
    request: Arc<UpgradeRequest>,
    requested: Vec<String>,
    phase: watch::Sender<Phase>,
    gzip: AtomicBool,
    writer: WriteSerializer,
    services: Mutex<ServiceTable>,
    events: broadcast::Sender<ConversationEvent>,
    created: Instant,
    /// Milliseconds after `created` plus one; zero means no pong yet.
    last_pong: AtomicU64,
    read_stop: CancellationToken,
    /// True while the bind sequence is running.
    binding: watch::Sender<bool>,
}

impl Conversation {
    /// Create a conversation for `request` that will bind the comma-separated
    /// `bind_services` once open.
    pub fn new(
        context: Arc<ServerContext>,
        request: UpgradeRequest,
        bind_services: &str,
    ) -> HybiResult<Arc<Self>> {
        let mut names = bind_services.split(',').map(str::trim);
        let first = names.next().unwrap_or_default();
        if first.is_empty() {
            return Err(HybiError::InvalidBindList(
                "bind service undefined".to_string(),
            ));
        }
        let requested = std::iter::once(first)
            .chain(names.filter(|n| !n.is_empty()))
            .map(str::to_string)
            .collect();

        let events = event::channel();
        Ok(Arc::new(Self {
            token: generate_token(),
            context,
            request: Arc::new(request),
            requested,
            phase: watch::channel(Phase::Constructed).0,
            gzip: AtomicBool::new(false),
            writer: WriteSerializer::new(events.clone()),
            services: Mutex::new(ServiceTable::default()),
            events,
            created: Instant::now(),
            last_pong: AtomicU64::new(0),
            read_stop: CancellationToken::new(),
            binding: watch::channel(false).0,
        }))
    }

    /// Run the handshake over `transport`, wire the codec and bind services.
    ///
    /// `early_data` holds bytes read past the request head. On success the
    /// read loop runs in its own task. On a rejected handshake the transport
    /// is dropped and no `Close` event fires. On a failed bind the
    /// conversation waits `bind_failure_delay`, closes, and the bind error is
    /// returned.
    pub async fn start<T: Transport>(
        self: &Arc<Self>,
        mut transport: T,
        early_data: Vec<u8>,
    ) -> HybiResult<()> {
        if !self.advance(Phase::Constructed, Phase::Handshaking) {
            return Err(HybiError::ConnectionClosed);
        }

        let accept = match handshake::validate(&self.request.headers, &self.context.origins) {
            Ok(accept) => accept,
            Err(e) => {
                warn!(url = %self.request.target, error = %e, "handshake rejected");
                self.mark_closed();
                return Err(e);
            }
        };

        let response = handshake::build_response(&self.token, &accept);
        let written = async {
            transport.write_all(response.as_bytes()).await?;
            transport.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(token = %self.token, error = %e, "failed to send handshake response");
            self.mark_closed();
            return Err(e.into());
        }

        if let Err(e) = transport.configure(&self.context.config.socket) {
            debug!(token = %self.token, error = %e, "failed to apply socket options");
        }

        let ws = WebSocketStream::from_partially_read(
            transport,
            early_data,
            Role::Server,
            Some(self.context.config.websocket_config()),
        )
        .await;
        let (sink, stream) = ws.split();
        self.writer.attach(Box::pin(sink)).await;

        self.context.conversations.insert(self.clone()).await;
        self.binding.send_replace(true);
        if !self.advance(Phase::Handshaking, Phase::Open) {
            self.binding.send_replace(false);
            self.context.conversations.remove(&self.token).await;
            self.writer.shutdown(self.context.config.close_grace).await;
            return Err(HybiError::ConnectionClosed);
        }
        self.lifecycle("WS conv open", "");
        event::emit(&self.events, ConversationEvent::Open);

        let reader = FrameReader::new(stream.boxed());

        let bound = BINDING
            .scope(self.token.clone(), self.bind_services(&self.requested))
            .await;
        self.binding.send_replace(false);

        if !self.is_open() {
            return Err(HybiError::ConnectionClosed);
        }
        if let Err(e) = bound {
            warn!(token = %self.token, url = %self.request.target, error = %e, "service binding failed");
            tokio::time::sleep(self.context.config.bind_failure_delay).await;
            self.close().await;
            return Err(e);
        }

        let conversation = self.clone();
        tokio::spawn(async move { conversation.read_loop(reader).await });
        Ok(())
    }

    /// Bind `names` in order, stopping at the first failure.
    async fn bind_services(self: &Arc<Self>, names: &[String]) -> HybiResult<()> {
        for name in names {
            if !self.is_open() {
                return Err(HybiError::ConnectionClosed);
            }
            self.bind_service(name).await?;
        }
        Ok(())
    }

    async fn bind_service(self: &Arc<Self>, name: &str) -> HybiResult<()> {
        let factory = self.context.services.resolve(name)?;
        if self.services.lock().await.handles.contains_key(name) {
            return Err(HybiError::RepeatBinding(name.to_string()));
        }

        let service = factory(ServiceContext::new(
            name,
            self.handle(),
            self.request.clone(),
        ));
        let config = &self.context.config;

        let auth = AuthRequest::new(name, "");
        let denied = match tokio::time::timeout(config.auth_timeout, service.request_auth(&auth))
            .await
        {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(HybiError::AuthFailed(name.to_string())),
            Ok(Err(e)) => {
                debug!(service = name, error = %e, "auth raised an error");
                Some(HybiError::AuthFailed(name.to_string()))
            }
            Err(_) => Some(HybiError::timeout(
                format!("auth {name}"),
                config.auth_timeout,
            )),
        };
        if let Some(e) = denied {
            warn!(
                token = %self.token,
                service = name,
                pathname = %self.request.pathname,
                params = ?self.request.params,
                error = %e,
                "illegal access"
            );
            release(name, service.as_ref());
            return Err(e);
        }

        self.gzip
            .store(self.request.header("use-gzip") == Some("on"), Ordering::Release);

        match tokio::time::timeout(config.load_timeout, service.load()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(service = name, error = %e, "service load failed"),
            Err(_) => {
                warn!(
                    service = name,
                    timeout_ms = config.load_timeout.as_millis() as u64,
                    "service load timed out, skipping"
                );
                release(name, service.as_ref());
                return Ok(());
            }
        }

        {
            let mut table = self.services.lock().await;
            // close() flips the phase before sweeping the table, so anything
            // inserted while still open gets swept.
            if !self.is_open() {
                drop(table);
                release(name, service.as_ref());
                return Err(HybiError::ConnectionClosed);
            }
            if table.default_service.is_none() {
                table.default_service = Some(name.to_string());
            }
            table.handles.insert(name.to_string(), service.clone());
        }

        match tokio::time::timeout(config.load_timeout, service.ready(&self.token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(service = name, error = %e, "service ready failed"),
            Err(_) => warn!(service = name, "service ready timed out"),
        }

        self.lifecycle("service bound", name);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader) {
        let idle = self.context.config.read_timeout;
        loop {
            let next = async {
                match idle {
                    Some(limit) => tokio::time::timeout(limit, reader.next_event()).await.ok(),
                    None => Some(reader.next_event().await),
                }
            };
            let event = tokio::select! {
                _ = self.read_stop.cancelled() => break,
                event = next => event,
            };

            let result = match event {
                None => {
                    debug!(token = %self.token, "read timeout");
                    break;
                }
                Some(FrameEvent::Text(payload)) => self.dispatch(payload, true).await,
                Some(FrameEvent::Data(payload)) => self.dispatch(payload, false).await,
                Some(FrameEvent::Ping(payload)) => self.answer_ping(&payload).await,
                Some(FrameEvent::Pong(_)) => {
                    self.touch_pong();
                    Ok(())
                }
                Some(FrameEvent::Close) => break,
                Some(FrameEvent::Error(detail)) => {
                    warn!(token = %self.token, error = %detail, "web socket parser error");
                    break;
                }
            };
            if let Err(e) = result {
                if !matches!(e, HybiError::ConnectionClosed) {
                    warn!(token = %self.token, error = %e, "message handling failed");
                }
                break;
            }
        }
        self.close().await;
    }

    async fn dispatch(&self, payload: Vec<u8>, is_text: bool) -> HybiResult<()> {
        let routed = split_target(&payload).map(|(name, body)| (name.to_string(), body.to_vec()));
        let (target, payload) = match routed {
            Some((name, body)) => (Some(name), body),
            None => (None, payload),
        };
        let service = {
            let table = self.services.lock().await;
            let name = target.as_ref().or(table.default_service.as_ref());
            name.and_then(|name| table.handles.get(name).cloned())
        };
        match (service, target) {
            (Some(service), _) => service.handle_message(payload, is_text).await,
            (None, Some(name)) => {
                warn!(token = %self.token, service = %name, "message for unbound service dropped");
                Ok(())
            }
            (None, None) => {
                debug!(token = %self.token, "no bound service, dropping message");
                Ok(())
            }
        }
    }

    /// Sentinel pings get a sentinel pong. Native pings are answered by the
    /// codec itself.
    async fn answer_ping(&self, payload: &[u8]) -> HybiResult<()> {
        if payload == PING_SENTINEL {
            self.pong().await
        } else {
            Ok(())
        }
    }

    fn touch_pong(&self) {
        let since = Instant::now().duration_since(self.created).as_millis() as u64;
        self.last_pong.store(since + 1, Ordering::Release);
    }

    /// Send a binary message.
    pub async fn send(&self, data: Vec<u8>) -> HybiResult<()> {
        self.write(OutboundFrame::Data(data)).await
    }

    /// Send a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> HybiResult<()> {
        self.write(OutboundFrame::Text(text.into())).await
    }

    /// Send a sentinel ping.
    pub async fn ping(&self) -> HybiResult<()> {
        self.write(OutboundFrame::sentinel_ping()).await
    }

    /// Send a sentinel pong.
    pub async fn pong(&self) -> HybiResult<()> {
        self.write(OutboundFrame::sentinel_pong()).await
    }

    async fn write(&self, frame: OutboundFrame) -> HybiResult<()> {
        if !self.is_open() {
            return Err(HybiError::ConnectionClosed);
        }
        self.writer.write(frame).await
    }

    /// Close the conversation. Idempotent.
    ///
    /// Stops reading and closes the transport, forcefully after the
    /// configured grace. An in-flight bind is allowed to settle, then every
    /// bound service is destroyed once and `Close` is raised. Calls made from
    /// a service hook during binding skip the wait.
    pub async fn close(&self) {
        let Some(previous) = self.mark_closed() else {
            return;
        };
        if previous != Phase::Open {
            debug!(token = %self.token, phase = ?previous, "closed before open");
            return;
        }

        self.writer.shutdown(self.context.config.close_grace).await;

        let inside_bind = BINDING
            .try_with(|token| token == &self.token)
            .unwrap_or(false);
        if !inside_bind {
            let mut binding = self.binding.subscribe();
            let _ = binding.wait_for(|running| !*running).await;
        }

        let bound: Vec<(String, Arc<dyn Service>)> = {
            let mut table = self.services.lock().await;
            table.default_service = None;
            table.handles.drain().collect()
        };
        for (name, service) in bound {
            release(&name, service.as_ref());
        }

        self.context.conversations.remove(&self.token).await;
        event::emit(&self.events, ConversationEvent::Close);
        self.lifecycle("WS conv close", "");
    }

    /// Wait until the conversation is closed.
    pub async fn closed(&self) {
        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|p| *p == Phase::Closed).await;
    }

    /// Subscribe to lifecycle and flow-control notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Non-owning handle for services.
    pub fn handle(self: &Arc<Self>) -> ConversationHandle {
        ConversationHandle {
            inner: Arc::downgrade(self),
            token: self.token.clone(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    pub fn is_gzip(&self) -> bool {
        self.gzip.load(Ordering::Acquire)
    }

    /// Whether the transport is currently refusing writes.
    pub fn overflow(&self) -> bool {
        self.writer.overflow()
    }

    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// When the last pong arrived, if any.
    pub fn last_pong(&self) -> Option<Instant> {
        match self.last_pong.load(Ordering::Acquire) {
            0 => None,
            since => Some(self.created + Duration::from_millis(since - 1)),
        }
    }

    /// Names of the bound services, sorted.
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.lock().await.handles.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn default_service(&self) -> Option<String> {
        self.services.lock().await.default_service.clone()
    }

    fn advance(&self, from: Phase, to: Phase) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Closed`, returning the previous phase if this call made the
    /// move.
    fn mark_closed(&self) -> Option<Phase> {
        let mut previous = None;
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Closed {
                return false;
            }
            previous = Some(*phase);
            *phase = Phase::Closed;
            true
        });
        if previous.is_some() {
            self.read_stop.cancel();
        }
        previous
    }

    fn lifecycle(&self, message: &str, service: &str) {
        if self.context.print_log {
            info!(token = %self.token, service, url = %self.request.target, "{message}");
        } else {
            debug!(token = %self.token, service, url = %self.request.target, "{message}");
        }
    }
}

/// Destroy a service, logging instead of propagating failure.
fn release(name: &str, service: &dyn Service) {
    if let Err(e) = service.destroy() {
        warn!(service = name, error = %e, "service destroy failed");
    }
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Weak back-reference from a service to its conversation.
#[derive(Clone)]
pub struct ConversationHandle {
    inner: Weak<Conversation>,
    token: String,
}

impl ConversationHandle {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn upgrade(&self) -> Option<Arc<Conversation>> {
        self.inner.upgrade()
    }

    fn live(&self) -> HybiResult<Arc<Conversation>> {
        self.inner.upgrade().ok_or(HybiError::ConnectionClosed)
    }

    pub async fn send(&self, data: Vec<u8>) -> HybiResult<()> {
        self.live()?.send(data).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> HybiResult<()> {
        self.live()?.send_text(text).await
    }

    pub async fn ping(&self) -> HybiResult<()> {
        self.live()?.ping().await
    }

    pub async fn pong(&self) -> HybiResult<()> {
        self.live()?.pong().await
    }

    pub async fn close(&self) {
        if let Some(conversation) = self.upgrade() {
            conversation.close().await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.upgrade().is_some_and(|c| c.is_open())
    }

    pub fn is_gzip(&self) -> bool {
        self.upgrade().is_some_and(|c| c.is_gzip())
    }

    pub fn overflow(&self) -> bool {
        self.upgrade().is_some_and(|c| c.overflow())
    }
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("token", &self.token)
            .finish()
    }
}
