//! Kernelgate - a front-end gateway for a notebook kernel server
//!
//! This library provides a single listener that:
//! - Supervises one kernel server process and forwards unclaimed traffic to it
//! - Relays the kernel server's log output into structured logging
//! - Forwards `/_proxy/<port>/...` requests to other services on the host
//! - Bridges client sessions to kernel websockets
//! - Bridges client sessions to terminal processes with ack-based backpressure

pub mod config;
pub mod error;
pub mod flow;
pub mod kernel_bridge;
pub mod log_bridge;
pub mod pool;
pub mod pty_bridge;
pub mod reverse;
pub mod router;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod upstream;

use config::Config;
use kernel_bridge::KernelSocketBridge;
use pool::ConnectionPool;
use pty_bridge::PtyBridge;
use reverse::ReverseProxyDispatcher;
use router::{BridgeRegistry, Router};
use std::sync::Arc;
use supervisor::Supervisor;

/// Assemble the router for `config`, honoring the feature toggles
pub fn build_router(
    config: &Config,
    listen_port: u16,
    pool: Arc<ConnectionPool>,
    supervisor: Option<Arc<Supervisor>>,
) -> Router {
    let mut bridges = BridgeRegistry::new().with(Arc::new(KernelSocketBridge::new(&config.backend)));
    if config.features.terminal {
        bridges = bridges.with(Arc::new(PtyBridge::new(
            &config.terminal,
            &config.features,
            &config.backend.content_dir,
        )));
    }

    let mut router = Router::new(listen_port, bridges);
    if config.features.reverse_proxy {
        router = router.with_reverse_proxy(ReverseProxyDispatcher::new(
            pool,
            config.server.request_timeout(),
        ));
    }
    if let Some(supervisor) = supervisor {
        router = router.with_supervisor(supervisor);
    }
    router
}
