//! Byte-stream transports a conversation can run over.
//!
//! A transport is any duplex async stream. The only extra capability asked of
//! it is applying socket options once the handshake succeeds; in-memory
//! streams ignore them.

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket-level options applied when a conversation opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle send coalescing.
    pub no_delay: bool,
    /// Idle time before TCP keep-alive starts, and the spacing between
    /// keep-alive packets after that. `None` leaves keep-alive off.
    pub keep_alive: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: Some(Duration::from_secs(50)),
        }
    }
}

/// A duplex byte stream owned by exactly one conversation.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Apply socket-level options.
    fn configure(&self, options: &SocketOptions) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn configure(&self, options: &SocketOptions) -> std::io::Result<()> {
        configure_tcp(self, options)
    }
}

impl Transport for tokio_rustls::server::TlsStream<TcpStream> {
    fn configure(&self, options: &SocketOptions) -> std::io::Result<()> {
        configure_tcp(self.get_ref().0, options)
    }
}

impl Transport for tokio::io::DuplexStream {
    fn configure(&self, _options: &SocketOptions) -> std::io::Result<()> {
        Ok(())
    }
}

fn configure_tcp(stream: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    stream.set_nodelay(options.no_delay)?;
    let sock = SockRef::from(stream);
    match options.keep_alive {
        Some(interval) => {
            let keepalive = TcpKeepalive::new().with_time(interval);
            #[cfg(any(
                target_os = "linux",
                target_os = "android",
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                windows,
            ))]
            let keepalive = keepalive.with_interval(interval);
            sock.set_tcp_keepalive(&keepalive)
        }
        None => sock.set_keepalive(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_options_apply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();

        server.configure(&SocketOptions::default()).unwrap();
        assert!(server.nodelay().unwrap());
        assert!(SockRef::from(&server).keepalive().unwrap());

        drop(client.await.unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn keepalive_uses_interval_for_idle_and_spacing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();

        let options = SocketOptions {
            no_delay: false,
            keep_alive: Some(Duration::from_secs(17)),
        };
        server.configure(&options).unwrap();
        let sock = SockRef::from(&server);
        assert!(!server.nodelay().unwrap());
        assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(17));
        assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(17));

        server
            .configure(&SocketOptions {
                keep_alive: None,
                ..options
            })
            .unwrap();
        assert!(!sock.keepalive().unwrap());

        drop(client.await.unwrap());
    }
}
