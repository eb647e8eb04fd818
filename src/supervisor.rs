use crate::config::BackendConfig;
use crate::error::{empty_response, GatewayBody, SupervisorError};
use crate::log_bridge::{relay_line, OutputStream};
use crate::pool::ConnectionPool;
use crate::upstream::UpstreamProxy;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Interval between TCP reachability probes while the kernel server starts
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the supervised kernel server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No usable process (never started, exited, closed, or never reachable)
    Absent,
    /// Process spawned, waiting for it to accept connections
    Launching,
    /// Process reachable and receiving traffic
    Ready,
}

/// The one running kernel server
struct UpstreamProcess {
    generation: u64,
    pid: Option<u32>,
    proxy: Arc<UpstreamProxy>,
    stop_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    state: SupervisorState,
    process: Option<UpstreamProcess>,
}

/// Owns the kernel server process and the proxy bound to its address.
///
/// Callers only see [`init`](Supervisor::init), [`close`](Supervisor::close),
/// [`handle_request`](Supervisor::handle_request) and
/// [`handle_socket`](Supervisor::handle_socket); each call re-checks liveness,
/// so nothing outside the supervisor holds on to a process across calls.
///
/// Background tasks (exit watcher, readiness probe, output relays) carry the
/// generation of the process they were started for and only act while that
/// generation is still current.
pub struct Supervisor {
    config: BackendConfig,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SupervisorState>,
    next_generation: AtomicU64,
}

impl Supervisor {
    pub fn new(config: BackendConfig, pool: Arc<ConnectionPool>, request_timeout: Duration) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SupervisorState::Absent);
        Arc::new(Self {
            config,
            pool,
            request_timeout,
            inner: Mutex::new(Inner {
                state: SupervisorState::Absent,
                process: None,
            }),
            state_tx,
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Port of the registered process, if any
    pub fn port(&self) -> Option<u16> {
        self.inner.lock().process.as_ref().map(|p| p.proxy.port())
    }

    /// OS process id of the registered process, if any
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().process.as_ref().and_then(|p| p.pid)
    }

    /// Launch the kernel server and start waiting for it to become reachable.
    ///
    /// Returns once the process is spawned; readiness is reported through
    /// [`subscribe`](Supervisor::subscribe). A previously registered process
    /// is closed first.
    pub fn init(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.close();

        let port = find_free_port(self.config.port)?;
        let host = self.config.bind_host();
        let args = launch_args(&self.config, port);

        info!(command = %self.config.command, ?args, %host, port, "Launching kernel server");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, port, "Kernel server process spawned");

        if let Some(stdout) = child.stdout.take() {
            spawn_output_relay(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_relay(stderr, OutputStream::Stderr);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let proxy = Arc::new(UpstreamProxy::new(
            host.clone(),
            port,
            Arc::clone(&self.pool),
            self.request_timeout,
        ));
        let (stop_tx, stop_rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock();
            inner.process = Some(UpstreamProcess {
                generation,
                pid,
                proxy,
                stop_tx: Some(stop_tx),
            });
            self.set_state(&mut inner, SupervisorState::Launching);
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.watch_exit(generation, child, stop_rx).await;
        });

        let supervisor = Arc::clone(self);
        let timeout = self.config.startup_timeout();
        tokio::spawn(async move {
            supervisor.await_reachable(generation, host, port, timeout).await;
        });

        Ok(())
    }

    /// Ask the registered process to terminate gracefully. Always ends `Absent`.
    pub fn close(&self) {
        let process = {
            let mut inner = self.inner.lock();
            let process = inner.process.take();
            self.set_state(&mut inner, SupervisorState::Absent);
            process
        };

        if let Some(mut process) = process {
            info!(pid = process.pid, port = process.proxy.port(), "Closing kernel server");
            if let Some(stop_tx) = process.stop_tx.take() {
                // The exit watcher may already be gone if the process exited
                let _ = stop_tx.send(());
            }
        }
    }

    /// Forward a plain request to the kernel server, or 500 when it is not ready
    pub async fn handle_request(&self, req: Request<Incoming>) -> Response<GatewayBody> {
        match self.ready_proxy() {
            Some(proxy) => proxy.forward(req).await,
            None => {
                debug!(path = req.uri().path(), state = ?self.state(), "Kernel server not ready");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Forward an upgrade request to the kernel server.
    ///
    /// Returns `None` when the kernel server is not ready; the caller drops
    /// the connection without answering.
    pub async fn handle_socket(&self, req: Request<Incoming>, request_id: String) -> Option<Response<GatewayBody>> {
        match self.ready_proxy() {
            Some(proxy) => Some(proxy.forward_upgrade(req, request_id).await),
            None => {
                error!(path = req.uri().path(), state = ?self.state(), "Dropping upgrade request, kernel server not ready");
                None
            }
        }
    }

    fn ready_proxy(&self) -> Option<Arc<UpstreamProxy>> {
        let inner = self.inner.lock();
        if inner.state != SupervisorState::Ready {
            return None;
        }
        inner.process.as_ref().map(|p| Arc::clone(&p.proxy))
    }

    fn set_state(&self, inner: &mut Inner, state: SupervisorState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "Supervisor state change");
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Move `from` to `to` only while `generation` is the registered process
    fn transition(&self, generation: u64, from: SupervisorState, to: SupervisorState) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .process
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false);
        if current && inner.state == from {
            self.set_state(&mut inner, to);
            return true;
        }
        false
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .lock()
            .process
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false)
    }

    async fn await_reachable(&self, generation: u64, host: String, port: u16, timeout: Duration) {
        let addr = format!("{}:{}", host, port);
        debug!(%addr, timeout_secs = timeout.as_secs(), "Waiting for kernel server to accept connections");

        let probe = async {
            loop {
                if !self.is_current(generation) {
                    return false;
                }
                if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                    return true;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(true) => {
                if self.transition(generation, SupervisorState::Launching, SupervisorState::Ready) {
                    info!(%addr, "Kernel server is ready");
                }
            }
            Ok(false) => {
                debug!(%addr, "Readiness probe abandoned, process replaced or gone");
            }
            Err(_) => {
                error!(
                    %addr,
                    timeout_secs = timeout.as_secs(),
                    "Kernel server did not become reachable; it keeps running but receives no traffic"
                );
                self.transition(generation, SupervisorState::Launching, SupervisorState::Absent);
            }
        }
    }

    async fn watch_exit(&self, generation: u64, mut child: Child, mut stop_rx: oneshot::Receiver<()>) {
        let mut requested = false;
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut stop_rx => {
                requested = true;
                terminate(&mut child);
                child.wait().await
            }
        };

        match status {
            Ok(status) => {
                let code = status.code();
                let signal = exit_signal(&status);
                if requested {
                    info!(code, signal, "Kernel server stopped");
                } else {
                    error!(code, signal, "Kernel server exited");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to wait for kernel server");
            }
        }

        let mut inner = self.inner.lock();
        let current = inner
            .process
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false);
        if current {
            inner.process = None;
            self.set_state(&mut inner, SupervisorState::Absent);
        }
    }
}

/// Send a graceful termination request; failures mean the process is already gone
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill not delivered");
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn spawn_output_relay<R>(reader: R, stream: OutputStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => relay_line(stream, &String::from_utf8_lossy(&line)),
                Err(e) => {
                    warn!(stream = stream.as_str(), error = %e, "Kernel server output closed");
                    break;
                }
            }
        }
    });
}

/// Build the kernel server argument vector
pub fn launch_args(config: &BackendConfig, port: u16) -> Vec<String> {
    let mut args = Vec::with_capacity(config.args.len() + 4);
    args.push(config.subcommand.clone());
    args.extend(config.args.iter().cloned());
    args.push(format!("--port={}", port));
    args.push(format!("--notebook-dir={}", config.root_dir));
    args.push(format!("--NotebookApp.preferred_dir={}", config.content_dir));
    args
}

/// First port at or above `start` that can be bound on loopback
pub fn find_free_port(start: u16) -> Result<u16, SupervisorError> {
    (start..=u16::MAX)
        .find(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok())
        .ok_or(SupervisorError::NoFreePort(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_config(script: &str) -> BackendConfig {
        BackendConfig {
            command: "sh".to_string(),
            subcommand: "-c".to_string(),
            args: vec![script.to_string()],
            port: 47100,
            startup_timeout_secs: 15,
            ..BackendConfig::default()
        }
    }

    fn supervisor(config: BackendConfig) -> Arc<Supervisor> {
        Supervisor::new(config, Arc::new(ConnectionPool::default()), Duration::from_secs(5))
    }

    async fn wait_for_state(supervisor: &Supervisor, state: SupervisorState) -> bool {
        let mut rx = supervisor.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    #[test]
    fn test_launch_args() {
        let config = BackendConfig {
            args: vec!["--ip=\"0.0.0.0\"".to_string(), "--debug".to_string()],
            root_dir: "/srv".to_string(),
            content_dir: "/srv/content".to_string(),
            ..BackendConfig::default()
        };

        assert_eq!(
            launch_args(&config, 9001),
            vec![
                "notebook",
                "--ip=\"0.0.0.0\"",
                "--debug",
                "--port=9001",
                "--notebook-dir=/srv",
                "--NotebookApp.preferred_dir=/srv/content",
            ]
        );
    }

    #[test]
    fn test_find_free_port_skips_bound_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();

        let port = find_free_port(taken).unwrap();
        assert!(port > taken);
    }

    #[test]
    fn test_initial_state_is_absent() {
        let supervisor = Supervisor::new(
            BackendConfig::default(),
            Arc::new(ConnectionPool::default()),
            Duration::from_secs(5),
        );
        assert_eq!(supervisor.state(), SupervisorState::Absent);
        assert!(supervisor.port().is_none());
        assert!(supervisor.pid().is_none());
    }

    #[test]
    fn test_close_without_process_is_noop() {
        let supervisor = supervisor(BackendConfig::default());
        supervisor.close();
        supervisor.close();
        assert_eq!(supervisor.state(), SupervisorState::Absent);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_absent() {
        let mut config = BackendConfig::default();
        config.command = "/nonexistent/kernelgate-test-binary".to_string();
        let supervisor = supervisor(config);

        let err = supervisor.init().unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Absent);
    }

    #[tokio::test]
    async fn test_init_then_close() {
        let supervisor = supervisor(sh_config("sleep 30"));

        supervisor.init().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Launching);
        assert!(supervisor.pid().is_some());
        assert!(supervisor.port().unwrap() >= 47100);

        supervisor.close();
        assert_eq!(supervisor.state(), SupervisorState::Absent);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_process_exit_resets_state() {
        let supervisor = supervisor(sh_config("exit 3"));

        supervisor.init().unwrap();
        assert!(wait_for_state(&supervisor, SupervisorState::Absent).await);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_becomes_ready_when_port_accepts() {
        let supervisor = supervisor(sh_config("sleep 30"));

        supervisor.init().unwrap();
        let port = supervisor.port().unwrap();
        let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        assert!(wait_for_state(&supervisor, SupervisorState::Ready).await);
        supervisor.close();
    }

    #[tokio::test]
    async fn test_unreachable_process_stays_registered() {
        let mut config = sh_config("sleep 30");
        config.startup_timeout_secs = 0;
        let supervisor = supervisor(config);

        supervisor.init().unwrap();
        assert!(wait_for_state(&supervisor, SupervisorState::Absent).await);
        // Still running, so close can terminate it
        assert!(supervisor.pid().is_some());

        supervisor.close();
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_init_replaces_previous_process() {
        let supervisor = supervisor(sh_config("sleep 30"));

        supervisor.init().unwrap();
        let first = supervisor.pid();
        supervisor.init().unwrap();
        let second = supervisor.pid();

        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
        supervisor.close();
    }
}
