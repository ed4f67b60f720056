//! Core server: accepts connections and hands each one to a conversation.
//!
//! Owns the shared [`ServerContext`]. Each accepted socket (optionally
//! wrapped in TLS) has its upgrade request head read here; the conversation
//! does the rest.

use crate::config::ServerConfig;
use hybi_core::{
    read_upgrade_request, Conversation, HybiError, HybiResult, OriginAllowList, ServerContext,
    ServiceRegistry, Transport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time allowed for a client to deliver its upgrade request head.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// The hybi server instance.
pub struct HybiServer {
    context: Arc<ServerContext>,
    tls: Option<TlsAcceptor>,
}

impl HybiServer {
    /// Create a server from resolved config and a service registry.
    pub fn new(
        config: &ServerConfig,
        services: ServiceRegistry,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let context = ServerContext::new(
            OriginAllowList::new(&config.origins),
            services,
            config.conversation.clone(),
        )
        .with_print_log(config.print_log);
        Self {
            context: Arc::new(context),
            tls: tls.map(TlsAcceptor::from),
        }
    }

    /// Bind `addr` and serve until `shutdown` fires.
    pub async fn run(self, addr: &str, shutdown: CancellationToken) -> HybiResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HybiError::Transport(format!("bind {addr} failed: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires, then close
    /// every live conversation.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> HybiResult<()> {
        let server = Arc::new(self);
        info!(
            addr = %listener.local_addr()?,
            tls = server.tls.is_some(),
            services = ?server.context.services.names(),
            "hybi-server ready"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let srv = server.clone();
                        tokio::spawn(async move {
                            let result = match &srv.tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls) => srv.handle_connection(tls, remote).await,
                                    Err(e) => Err(HybiError::Transport(format!("TLS accept failed: {e}"))),
                                },
                                None => srv.handle_connection(stream, remote).await,
                            };
                            if let Err(e) = result {
                                warn!(remote = %remote, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
            }
        }

        let live = server.context.conversations.count().await;
        info!(live, "shutting down, closing conversations");
        server.context.conversations.close_all().await;
        Ok(())
    }

    async fn handle_connection<T: Transport>(
        &self,
        mut stream: T,
        remote: SocketAddr,
    ) -> HybiResult<()> {
        let (request, early_data) =
            tokio::time::timeout(REQUEST_HEAD_TIMEOUT, read_upgrade_request(&mut stream))
                .await
                .map_err(|_| HybiError::ExecuteTimeout {
                    operation: "read upgrade request".to_string(),
                    millis: REQUEST_HEAD_TIMEOUT.as_millis(),
                })??;
        debug!(remote = %remote, target = %request.target, "upgrade request");

        let bind = request.bind_services();
        let conversation = Conversation::new(self.context.clone(), request, &bind)?;
        conversation.start(stream, early_data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use hybi_core::handshake::accept_key;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    async fn start(config: &ServerConfig) -> (SocketAddr, Arc<ServerContext>, CancellationToken) {
        let server = HybiServer::new(config, crate::services::registry(config), None);
        let context = server.context.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, token).await.unwrap() });
        (addr, context, shutdown)
    }

    async fn upgrade(addr: SocketAddr, target: &str, extra: &str) -> (String, TcpStream) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {target} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {KEY}\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Origin: http://localhost\r\n{extra}\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        (String::from_utf8(head).unwrap(), stream)
    }

    async fn next_message(ws: &mut WebSocketStream<TcpStream>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no message in time")
            .expect("stream ended")
            .expect("codec error")
    }

    async fn drained(context: &ServerContext) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while context.conversations.count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("conversations still live");
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::load(None, None, None, None, None, false).unwrap();
        config.conversation.bind_failure_delay = Duration::ZERO;
        config
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn serve_future_is_send() {
        let config = test_config();
        let server = HybiServer::new(&config, crate::services::registry(&config), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let serving = server.serve(listener, shutdown);
        assert_send(&serving);
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn echo_over_tcp() {
        let (addr, context, _shutdown) = start(&test_config()).await;
        let (head, stream) = upgrade(addr, "/echo", "").await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains(&accept_key(KEY)));

        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
        ws.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(next_message(&mut ws).await, Message::Text("hello".into()));
        ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
        assert_eq!(next_message(&mut ws).await.into_data(), vec![1, 2, 3]);

        assert_eq!(context.conversations.count().await, 1);
    }

    #[tokio::test]
    async fn token_service_announces_session_token() {
        let mut config = test_config();
        config.token_secret = Some("s3cret".to_string());
        let (addr, _context, _shutdown) = start(&config).await;

        let (head, stream) = upgrade(
            addr,
            "/?bind_services=token,echo",
            "x-hybi-secret: s3cret\r\n",
        )
        .await;
        let token = head
            .lines()
            .find_map(|line| line.strip_prefix("Session-Token: "))
            .unwrap()
            .to_string();

        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
        assert_eq!(next_message(&mut ws).await, Message::Text(token));
    }

    #[tokio::test]
    async fn missing_secret_closes_after_bind_failure() {
        let mut config = test_config();
        config.token_secret = Some("s3cret".to_string());
        let (addr, context, _shutdown) = start(&config).await;

        let (head, stream) = upgrade(addr, "/token", "").await;
        assert!(head.starts_with("HTTP/1.1 101"));
        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
        assert!(matches!(next_message(&mut ws).await, Message::Close(_)));
        drained(&context).await;
    }

    #[tokio::test]
    async fn shutdown_closes_live_conversations() {
        let (addr, context, shutdown) = start(&test_config()).await;
        let (_, stream) = upgrade(addr, "/echo", "").await;
        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
        ws.send(Message::Text("up".into())).await.unwrap();
        next_message(&mut ws).await;

        shutdown.cancel();
        assert!(matches!(next_message(&mut ws).await, Message::Close(_)));
        drained(&context).await;
    }

    #[tokio::test]
    async fn bad_request_gets_no_upgrade() {
        let (addr, context, _shutdown) = start(&test_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /echo HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(context.conversations.count().await, 0);
    }
}
