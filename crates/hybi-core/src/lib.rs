//! hybi-core: server-side WebSocket conversation layer.
//!
//! Answers the upgrade handshake (origin allow-list, accept key, session
//! token), serializes outbound frames with overflow/drain notifications, and
//! multiplexes named services over one connection with timed auth and load
//! steps. Bit-level framing is delegated to tungstenite.

pub mod codec;
pub mod context;
pub mod conversation;
pub mod error;
pub mod event;
pub mod handshake;
pub mod origin;
pub mod request;
pub mod service;
pub mod transport;
pub mod writer;

pub use codec::{
    split_target, target_envelope, FrameEvent, OutboundFrame, PING_SENTINEL, PONG_SENTINEL,
    TARGET_MARKER,
};
pub use context::{ConversationConfig, ConversationSet, ServerContext};
pub use conversation::{Conversation, ConversationHandle, Phase};
pub use error::{ErrorCode, HybiError, HybiResult};
pub use event::ConversationEvent;
pub use origin::OriginAllowList;
pub use request::{read_upgrade_request, UpgradeRequest};
pub use service::{AuthRequest, Service, ServiceContext, ServiceFuture, ServiceRegistry};
pub use transport::{SocketOptions, Transport};
