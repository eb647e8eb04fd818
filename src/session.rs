//! Client session plumbing shared by the kernel and terminal bridges
//!
//! A session is one client websocket. The router hands matching upgrade
//! requests to [`accept`], which answers the handshake and runs the bridge's
//! session future on the upgraded connection in its own task.

use crate::error::{json_error_response, GatewayBody, GatewayErrorCode};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Path prefix of the session layer
pub const SESSION_MULTIPLEX_PREFIX: &str = "/socket.io/";

/// Client connection of a session
pub type ClientSocket = WebSocketStream<TokioIo<Upgraded>>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Adapter between a client session and some upstream resource
pub trait SessionBridge: Send + Sync {
    /// Path prefix this bridge owns
    fn prefix(&self) -> &str;

    /// Run one session until either side ends it
    fn run(&self, socket: ClientSocket, id: SessionId) -> BoxFuture<'static, ()>;
}

/// Answer a websocket handshake and start the bridge session on the upgraded connection
pub fn accept(req: Request<Incoming>, bridge: Arc<dyn SessionBridge>) -> Response<GatewayBody> {
    let key = match websocket_key(&req) {
        Some(key) => key,
        None => {
            debug!(path = req.uri().path(), "Session path requested without websocket upgrade");
            return json_error_response(
                GatewayErrorCode::UpgradeRequired,
                "Expected a websocket upgrade",
            );
        }
    };
    let accept_key = derive_accept_key(key.as_bytes());
    let path = req.uri().path().to_string();

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(%path, error = %e, "Session upgrade failed");
                return;
            }
        };

        let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let id = SessionId::next();
        info!(session = %id, %path, "Session opened");

        if AssertUnwindSafe(bridge.run(socket, id)).catch_unwind().await.is_err() {
            error!(session = %id, %path, "Session task panicked");
        }

        info!(session = %id, "Session closed");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid switching protocols response")
}

/// `Sec-WebSocket-Key` of a websocket upgrade request
fn websocket_key<B>(req: &Request<B>) -> Option<String> {
    let upgrade = req.headers().get(UPGRADE)?.to_str().ok()?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    req.headers()
        .get(SEC_WEBSOCKET_KEY)?
        .to_str()
        .ok()
        .map(|key| key.trim().to_string())
}

/// Send one event as a JSON text frame
pub async fn emit<T: Serialize>(socket: &mut ClientSocket, event: &T) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Failed to encode session event");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await
}

/// End the session from the gateway side
pub async fn disconnect(socket: &mut ClientSocket, id: SessionId) {
    debug!(session = %id, "Disconnecting session");
    if let Err(e) = socket.close(None).await {
        debug!(session = %id, error = %e, "Close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("session-"));
    }

    #[test]
    fn test_websocket_key() {
        let req = Request::builder()
            .uri("/socket.io/kernel")
            .header("Upgrade", "WebSocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert_eq!(websocket_key(&req).as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn test_websocket_key_requires_upgrade() {
        let req = Request::builder()
            .uri("/socket.io/kernel")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert!(websocket_key(&req).is_none());

        let req = Request::builder()
            .uri("/socket.io/kernel")
            .header("Upgrade", "h2c")
            .body(())
            .unwrap();
        assert!(websocket_key(&req).is_none());
    }

    #[test]
    fn test_accept_key_derivation() {
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzo+xOo0="
        );
    }
}
