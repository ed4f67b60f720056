//! Server-wide context shared by every conversation.
//!
//! Built once at startup and passed down explicitly. Everything in it is
//! read-only except the live-conversation set.

use crate::conversation::Conversation;
use crate::origin::OriginAllowList;
use crate::service::ServiceRegistry;
use crate::transport::SocketOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

/// Default inbound message limit (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Timing and transport knobs for conversations.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Bound on a service's auth step.
    pub auth_timeout: Duration,
    /// Bound on a service's load and ready steps.
    pub load_timeout: Duration,
    /// Wait before tearing down a conversation whose binding failed.
    pub bind_failure_delay: Duration,
    /// Time allowed for a graceful transport close.
    pub close_grace: Duration,
    /// Close after this long without inbound traffic. `None` disables.
    pub read_timeout: Option<Duration>,
    pub max_message_size: usize,
    pub socket: SocketOptions,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(20),
            load_timeout: Duration::from_secs(20),
            bind_failure_delay: Duration::from_secs(5),
            close_grace: Duration::from_secs(1),
            read_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            socket: SocketOptions::default(),
        }
    }
}

impl ConversationConfig {
    /// Codec limits derived from this config.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Context handed to every conversation.
pub struct ServerContext {
    pub origins: OriginAllowList,
    pub services: ServiceRegistry,
    pub config: ConversationConfig,
    /// Raise conversation lifecycle logging from debug to info.
    pub print_log: bool,
    pub conversations: ConversationSet,
}

impl ServerContext {
    pub fn new(
        origins: OriginAllowList,
        services: ServiceRegistry,
        config: ConversationConfig,
    ) -> Self {
        Self {
            origins,
            services,
            config,
            print_log: false,
            conversations: ConversationSet::new(),
        }
    }

    pub fn with_print_log(mut self, print_log: bool) -> Self {
        self.print_log = print_log;
        self
    }
}

/// Live conversations keyed by token.
///
/// Conversations add themselves when they open and remove themselves when
/// they close.
#[derive(Clone, Default)]
pub struct ConversationSet {
    inner: Arc<RwLock<HashMap<String, Arc<Conversation>>>>,
}

impl ConversationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conversation: Arc<Conversation>) {
        let token = conversation.token().to_string();
        self.inner.write().await.insert(token, conversation);
    }

    pub async fn remove(&self, token: &str) -> bool {
        self.inner.write().await.remove(token).is_some()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Close every live conversation through its normal close path.
    pub async fn close_all(&self) {
        let all: Vec<Arc<Conversation>> = self.inner.read().await.values().cloned().collect();
        debug!(count = all.len(), "closing all conversations");
        for conversation in all {
            conversation.close().await;
        }
    }
}
