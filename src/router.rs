//! Single entry point for every request and upgrade
//!
//! Dispatch order, first match wins:
//! 1. a registered session bridge prefix
//! 2. any other path under the session prefix (404)
//! 3. `/_proxy/<port>` for a port other than our own (plain requests only)
//! 4. the kernel server supervisor
//! 5. 404 when no supervisor is attached

use crate::error::{json_error_response, GatewayBody, GatewayErrorCode};
use crate::reverse::{get_request_port, ReverseProxyDispatcher};
use crate::session::{self, SessionBridge, SESSION_MULTIPLEX_PREFIX};
use crate::supervisor::Supervisor;
use crate::upstream::is_upgrade_request;
use futures::FutureExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Why a request ended without a response
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("upgrade dropped, kernel server not ready")]
    UpgradeDropped,
}

/// Session bridges by path prefix, fixed once serving starts
#[derive(Default)]
pub struct BridgeRegistry {
    bridges: Vec<Arc<dyn SessionBridge>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, bridge: Arc<dyn SessionBridge>) -> Self {
        self.bridges.push(bridge);
        self
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// First bridge whose prefix owns `path`
    pub fn find(&self, path: &str) -> Option<&Arc<dyn SessionBridge>> {
        self.bridges
            .iter()
            .find(|bridge| owns_path(bridge.prefix(), path))
    }
}

/// `path` is `prefix` itself or lies below it
fn owns_path(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

pub struct Router {
    listen_port: u16,
    bridges: BridgeRegistry,
    reverse: Option<ReverseProxyDispatcher>,
    supervisor: Option<Arc<Supervisor>>,
}

impl Router {
    pub fn new(listen_port: u16, bridges: BridgeRegistry) -> Self {
        Self {
            listen_port,
            bridges,
            reverse: None,
            supervisor: None,
        }
    }

    /// Serve `/_proxy/<port>` requests
    pub fn with_reverse_proxy(mut self, dispatcher: ReverseProxyDispatcher) -> Self {
        self.reverse = Some(dispatcher);
        self
    }

    /// Forward everything unclaimed to the kernel server
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Handle one request. `Err` means the connection is closed without a response.
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<GatewayBody>, DispatchError> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Overwrite rather than append: the gateway is the first trusted hop
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        let method = req.method().clone();
        let uri = req.uri().clone();

        let outcome = match AssertUnwindSafe(self.dispatch(req, request_id.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(%uri, request_id, "Panic while handling request");
                Ok(json_error_response(
                    GatewayErrorCode::InternalError,
                    "Internal error",
                ))
            }
        };

        match &outcome {
            Ok(response) => {
                info!(
                    method = %method,
                    path = uri.path(),
                    status = response.status().as_u16(),
                    request_id,
                    "Request handled"
                );
            }
            Err(e) => {
                warn!(method = %method, path = uri.path(), request_id, error = %e, "Request dropped");
            }
        }

        outcome
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        request_id: String,
    ) -> Result<Response<GatewayBody>, DispatchError> {
        let upgrade = is_upgrade_request(&req);
        let path = req.uri().path();

        if let Some(bridge) = self.bridges.find(path) {
            debug!(path, prefix = bridge.prefix(), request_id, "Routing to session bridge");
            return Ok(session::accept(req, Arc::clone(bridge)));
        }

        if path.starts_with(SESSION_MULTIPLEX_PREFIX) {
            return Ok(json_error_response(
                GatewayErrorCode::RouteNotFound,
                "Unknown session namespace",
            ));
        }

        if !upgrade {
            if let Some(reverse) = &self.reverse {
                let port = get_request_port(path);
                if port != 0 && port != self.listen_port {
                    return Ok(reverse.handle_request(req, port).await);
                }
            }
        }

        match &self.supervisor {
            Some(supervisor) if upgrade => supervisor
                .handle_socket(req, request_id)
                .await
                .ok_or(DispatchError::UpgradeDropped),
            Some(supervisor) => Ok(supervisor.handle_request(req).await),
            None => Ok(json_error_response(
                GatewayErrorCode::RouteNotFound,
                "No route for request",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientSocket, SessionId};
    use futures::future::BoxFuture;

    struct NamedBridge(&'static str);

    impl SessionBridge for NamedBridge {
        fn prefix(&self) -> &str {
            self.0
        }

        fn run(&self, _socket: ClientSocket, _id: SessionId) -> BoxFuture<'static, ()> {
            async {}.boxed()
        }
    }

    #[test]
    fn test_owns_path() {
        assert!(owns_path("/socket.io/kernel", "/socket.io/kernel"));
        assert!(owns_path("/socket.io/kernel", "/socket.io/kernel/"));
        assert!(owns_path("/socket.io/kernel", "/socket.io/kernel/abc"));
        assert!(!owns_path("/socket.io/kernel", "/socket.io/kernels"));
        assert!(!owns_path("/socket.io/kernel", "/socket.io/terminal"));
        assert!(owns_path("/socket.io/", "/socket.io/anything"));
    }

    #[test]
    fn test_registry_first_match_wins() {
        let registry = BridgeRegistry::new()
            .with(Arc::new(NamedBridge("/socket.io/kernel")))
            .with(Arc::new(NamedBridge("/socket.io/terminal")));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.find("/socket.io/terminal").map(|b| b.prefix()),
            Some("/socket.io/terminal")
        );
        assert_eq!(
            registry.find("/socket.io/kernel/x").map(|b| b.prefix()),
            Some("/socket.io/kernel")
        );
        assert!(registry.find("/socket.io/other").is_none());
        assert!(registry.find("/api/contents").is_none());
    }

    #[test]
    fn test_empty_registry() {
        let registry = BridgeRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.find("/socket.io/kernel").is_none());
    }

    #[test]
    fn test_router_builder() {
        let router = Router::new(8081, BridgeRegistry::new());
        assert_eq!(router.listen_port(), 8081);
        assert!(router.reverse.is_none());
        assert!(router.supervisor.is_none());
    }
}
