//! Server configuration: TOML file + CLI overrides.

use hybi_core::{ConversationConfig, HybiError, HybiResult, SocketOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub services: ServicesSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Origin allow-list entries, `host[:port]`, `*` wildcards allowed.
    #[serde(default = "default_origins")]
    pub origins: Vec<String>,
    #[serde(default)]
    pub print_log: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cert: None,
            key: None,
            origins: default_origins(),
            print_log: false,
        }
    }
}

/// `[conversation]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSection {
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    #[serde(default = "default_bind_failure_delay_ms")]
    pub bind_failure_delay_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Zero disables the read-idle timeout.
    #[serde(default)]
    pub read_timeout_secs: u64,
    /// Zero disables TCP keep-alive.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub no_delay: bool,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            auth_timeout_ms: default_auth_timeout_ms(),
            load_timeout_ms: default_load_timeout_ms(),
            bind_failure_delay_ms: default_bind_failure_delay_ms(),
            close_grace_ms: default_close_grace_ms(),
            read_timeout_secs: 0,
            keep_alive_secs: default_keep_alive_secs(),
            no_delay: true,
            max_message_size: default_max_message_size(),
        }
    }
}

impl ConversationSection {
    fn resolve(&self) -> ConversationConfig {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        ConversationConfig {
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            load_timeout: Duration::from_millis(self.load_timeout_ms),
            bind_failure_delay: Duration::from_millis(self.bind_failure_delay_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
            read_timeout: secs(self.read_timeout_secs),
            max_message_size: self.max_message_size,
            socket: SocketOptions {
                no_delay: self.no_delay,
                keep_alive: secs(self.keep_alive_secs),
            },
        }
    }
}

/// `[services]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesSection {
    /// Shared secret the `token` service checks against `x-hybi-secret`.
    #[serde(default)]
    pub token_secret: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_origins() -> Vec<String> {
    vec!["*:*".to_string()]
}
fn default_auth_timeout_ms() -> u64 {
    20_000
}
fn default_load_timeout_ms() -> u64 {
    20_000
}
fn default_bind_failure_delay_ms() -> u64 {
    5_000
}
fn default_close_grace_ms() -> u64 {
    1_000
}
fn default_keep_alive_secs() -> u64 {
    50
}
fn default_max_message_size() -> usize {
    hybi_core::context::DEFAULT_MAX_MESSAGE_SIZE
}
fn default_true() -> bool {
    true
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub origins: Vec<String>,
    pub print_log: bool,
    pub conversation: ConversationConfig,
    pub token_secret: Option<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_host: Option<&str>,
        cli_port: Option<u16>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
        cli_print_log: bool,
    ) -> HybiResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let server = file_config.server;
        let cert = cli_cert.map(str::to_string).or(server.cert);
        let key = cli_key.map(str::to_string).or(server.key);

        Ok(Self {
            host: cli_host.map(str::to_string).unwrap_or(server.host),
            port: cli_port.unwrap_or(server.port),
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            origins: server.origins,
            print_log: cli_print_log || server.print_log,
            conversation: file_config.conversation.resolve(),
            token_secret: file_config.services.token_secret,
        })
    }

    /// Listen address as `host:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse(content: &str) -> HybiResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HybiError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let file = parse("").unwrap();
        assert_eq!(file.server.port, 8080);
        assert_eq!(file.server.origins, vec!["*:*"]);
        let conversation = file.conversation.resolve();
        assert_eq!(conversation.auth_timeout, Duration::from_secs(20));
        assert_eq!(conversation.bind_failure_delay, Duration::from_secs(5));
        assert_eq!(conversation.read_timeout, None);
        assert_eq!(conversation.socket.keep_alive, Some(Duration::from_secs(50)));
    }

    #[test]
    fn sections_override_defaults() {
        let file = parse(
            r#"
            [server]
            port = 9000
            origins = ["example.com:443", "localhost"]
            print_log = true

            [conversation]
            auth_timeout_ms = 500
            read_timeout_secs = 30
            keep_alive_secs = 0

            [services]
            token_secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(file.server.port, 9000);
        assert_eq!(file.server.origins.len(), 2);
        assert!(file.server.print_log);
        assert_eq!(file.services.token_secret.as_deref(), Some("s3cret"));

        let conversation = file.conversation.resolve();
        assert_eq!(conversation.auth_timeout, Duration::from_millis(500));
        assert_eq!(conversation.load_timeout, Duration::from_secs(20));
        assert_eq!(conversation.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(conversation.socket.keep_alive, None);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(parse("[server"), Err(HybiError::Config(_))));
    }

    #[test]
    fn cli_overrides_win() {
        let config = ServerConfig::load(
            None,
            Some("127.0.0.1"),
            Some(1234),
            Some("/tmp/cert.pem"),
            Some("/tmp/key.pem"),
            true,
        )
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:1234");
        assert_eq!(config.cert_path, Some(PathBuf::from("/tmp/cert.pem")));
        assert!(config.print_log);
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x.pem"), home.join("x.pem"));
        }
        assert_eq!(expand_tilde_str("/abs/x.pem"), PathBuf::from("/abs/x.pem"));
    }
}
