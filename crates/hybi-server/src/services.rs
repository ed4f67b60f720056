//! Services shipped with the server binary.

use crate::config::ServerConfig;
use hybi_core::{AuthRequest, Service, ServiceContext, ServiceFuture, ServiceRegistry};
use std::sync::Arc;
use tracing::debug;

/// Header the `token` service checks.
pub const SECRET_HEADER: &str = "x-hybi-secret";

/// Build the registry of built-in services.
pub fn registry(config: &ServerConfig) -> ServiceRegistry {
    let secret: Option<Arc<str>> = config.token_secret.as_deref().map(Arc::from);
    let mut registry = ServiceRegistry::new();
    registry
        .register("echo", |ctx| Arc::new(EchoService { ctx }) as Arc<dyn Service>)
        .register("token", move |ctx| {
            Arc::new(TokenService {
                ctx,
                secret: secret.clone(),
            }) as Arc<dyn Service>
        });
    registry
}

/// Sends every message straight back, preserving text/binary.
pub struct EchoService {
    ctx: ServiceContext,
}

impl Service for EchoService {
    fn handle_message(&self, payload: Vec<u8>, is_text: bool) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            let conversation = self.ctx.conversation();
            if is_text {
                conversation
                    .send_text(String::from_utf8_lossy(&payload).into_owned())
                    .await
            } else {
                conversation.send(payload).await
            }
        })
    }
}

/// Admits clients presenting the shared secret and tells them their session
/// token once bound.
pub struct TokenService {
    ctx: ServiceContext,
    secret: Option<Arc<str>>,
}

impl Service for TokenService {
    fn request_auth<'a>(&'a self, _request: &'a AuthRequest) -> ServiceFuture<'a, bool> {
        Box::pin(async move {
            let presented = self.ctx.header(SECRET_HEADER);
            Ok(match (&self.secret, presented) {
                (Some(secret), Some(presented)) => secret.as_ref() == presented,
                _ => false,
            })
        })
    }

    fn ready<'a>(&'a self, token: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move { self.ctx.conversation().send_text(token).await })
    }

    fn handle_message(&self, payload: Vec<u8>, _is_text: bool) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            debug!(bytes = payload.len(), "token service ignores inbound messages");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybi_core::{Conversation, OriginAllowList, ServerContext, UpgradeRequest};

    fn config(secret: Option<&str>) -> ServerConfig {
        let mut config = ServerConfig::load(None, None, None, None, None, false).unwrap();
        config.token_secret = secret.map(str::to_string);
        config
    }

    fn token_service(secret: Option<&str>, presented: Option<&str>) -> Arc<dyn Service> {
        let config = config(secret);
        let registry = registry(&config);
        let headers: Vec<(&str, &str)> = presented
            .map(|p| vec![(SECRET_HEADER, p)])
            .unwrap_or_default();
        let request = UpgradeRequest::new("GET", "/token", headers).unwrap();
        let ctx = Arc::new(ServerContext::new(
            OriginAllowList::default(),
            registry.clone(),
            config.conversation.clone(),
        ));
        let conversation = Conversation::new(ctx, request.clone(), "token").unwrap();
        let factory = registry.resolve("token").unwrap();
        factory(ServiceContext::new(
            "token",
            conversation.handle(),
            Arc::new(request),
        ))
    }

    #[test]
    fn registry_has_builtins() {
        let registry = registry(&config(None));
        assert_eq!(registry.names(), vec!["echo", "token"]);
    }

    #[tokio::test]
    async fn token_auth_checks_secret() {
        let auth = AuthRequest::new("token", "");
        let cases = [
            (Some("s3cret"), Some("s3cret"), true),
            (Some("s3cret"), Some("wrong"), false),
            (Some("s3cret"), None, false),
            (None, Some("anything"), false),
        ];
        for (secret, presented, expected) in cases {
            let service = token_service(secret, presented);
            assert_eq!(
                service.request_auth(&auth).await.unwrap(),
                expected,
                "{secret:?} / {presented:?}"
            );
        }
    }
}
