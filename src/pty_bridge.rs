//! Terminal sessions over a pseudo-terminal
//!
//! Each client session gets its own terminal process attached to a pty. By
//! default that process attaches to a shared multiplexer session so terminals
//! survive reconnects; with `plain_shell` a bare shell is started instead.
//!
//! Output is throttled by client acknowledgements, see [`crate::flow`].

use crate::config::{FeatureConfig, TerminalConfig};
use crate::error::SessionError;
use crate::flow::{FlowControl, FlowSignal, ReadGate};
use crate::session::{disconnect, emit, ClientSocket, SessionBridge, SessionId};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Chunks buffered between the reader thread and the session task
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

const READ_BUFFER_SIZE: usize = 8192;

/// How long output left in the pty is still forwarded after the process exits
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Events a client sends on a terminal session
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TerminalClientEvent {
    /// `data` holds a JSON-encoded [`PtyInput`]
    Data { data: String },
    Ack,
}

/// Events the gateway sends on a terminal session
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TerminalServerEvent<'a> {
    Data {
        data: &'a str,
        pause: bool,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<u32>,
        signal: Option<String>,
    },
}

/// Keystrokes and resize requests carried by a client `data` event
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct PtyInput {
    pub data: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl PtyInput {
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// New size, only when both dimensions are given
    pub fn resize(&self) -> Option<(u16, u16)> {
        match (self.cols, self.rows) {
            (Some(cols), Some(rows)) => Some((cols, rows)),
            _ => None,
        }
    }
}

/// How a terminal process ended
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitReport {
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

/// A running terminal process and its pty
pub struct TerminalProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    gate: Arc<ReadGate>,
    killed: bool,
}

/// What a terminal process produces, consumed by the session task
pub struct TerminalOutput {
    /// Output chunks in read order; closed once the pty is
    pub chunks: mpsc::Receiver<Vec<u8>>,
    /// Fires once when the process exits
    pub exit: oneshot::Receiver<ExitReport>,
}

impl TerminalOutput {
    /// Next chunk left over after the process exited, until the reader
    /// reaches end of output or `deadline` passes
    pub async fn next_remaining(&mut self, deadline: Instant) -> Option<Vec<u8>> {
        tokio::time::timeout_at(deadline, self.chunks.recv())
            .await
            .ok()
            .flatten()
    }
}

impl TerminalProcess {
    pub fn spawn(
        argv: Vec<String>,
        cwd: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, TerminalOutput), SessionError> {
        let mut cmd = CommandBuilder::from_argv(argv.into_iter().map(OsString::from).collect());
        cmd.cwd(cwd);
        if cmd.get_env("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(terminal_error)?;

        let mut child = pair.slave.spawn_command(cmd).map_err(terminal_error)?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(terminal_error)?;
        let writer = pair.master.take_writer().map_err(terminal_error)?;
        let killer = child.clone_killer();

        let gate = Arc::new(ReadGate::new());
        let (output_tx, chunks) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        spawn_reader(reader, output_tx, Arc::clone(&gate))?;

        let (exit_tx, exit) = oneshot::channel();
        std::thread::Builder::new()
            .name("kernelgate-pty-wait".to_string())
            .spawn(move || {
                let report = match child.wait() {
                    Ok(status) => ExitReport {
                        exit_code: Some(status.exit_code()),
                        signal: status.signal().map(ToOwned::to_owned),
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to wait for terminal process");
                        ExitReport::default()
                    }
                };
                let _ = exit_tx.send(report);
            })
            .map_err(terminal_error)?;

        let process = Self {
            master: pair.master,
            writer,
            killer,
            gate,
            killed: false,
        };
        Ok((process, TerminalOutput { chunks, exit }))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.writer.write_all(bytes).map_err(terminal_error)?;
        self.writer.flush().map_err(terminal_error)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(terminal_error)
    }

    pub fn apply_flow(&self, signal: FlowSignal) {
        self.gate.apply(signal);
    }

    /// Gate the reader thread waits on
    pub fn gate(&self) -> Arc<ReadGate> {
        Arc::clone(&self.gate)
    }

    /// Terminate the process. Safe to call more than once.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.gate.close();
        if let Err(e) = self.killer.kill() {
            debug!(error = %e, "Terminal process already gone");
        }
    }
}

impl Drop for TerminalProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<Vec<u8>>,
    gate: Arc<ReadGate>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name("kernelgate-pty-reader".to_string())
        .spawn(move || {
            let mut buffer = [0_u8; READ_BUFFER_SIZE];
            loop {
                if !gate.wait_open() {
                    break;
                }
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(error = %e, "Terminal output closed");
                        break;
                    }
                }
            }
        })
        .map_err(terminal_error)?;
    Ok(())
}

fn terminal_error<E: std::fmt::Display>(error: E) -> SessionError {
    SessionError::Terminal(error.to_string())
}

/// Session bridge for `/socket.io/terminal`
pub struct PtyBridge {
    argv: Vec<String>,
    cwd: String,
    cols: u16,
    rows: u16,
}

impl PtyBridge {
    pub const PREFIX: &'static str = "/socket.io/terminal";

    pub fn new(terminal: &TerminalConfig, features: &FeatureConfig, content_dir: &str) -> Self {
        Self {
            argv: launch_argv(terminal, features.plain_shell),
            cwd: content_dir.to_string(),
            cols: terminal.cols,
            rows: terminal.rows,
        }
    }
}

/// Command line of the terminal process
pub fn launch_argv(terminal: &TerminalConfig, plain_shell: bool) -> Vec<String> {
    if plain_shell {
        vec![terminal.shell.clone()]
    } else {
        vec![
            terminal.multiplexer.clone(),
            "new-session".to_string(),
            "-A".to_string(),
            "-s".to_string(),
            terminal.session_name.clone(),
        ]
    }
}

impl SessionBridge for PtyBridge {
    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    fn run(&self, socket: ClientSocket, id: SessionId) -> BoxFuture<'static, ()> {
        run_session(socket, id, self.argv.clone(), self.cwd.clone(), self.cols, self.rows).boxed()
    }
}

/// Outcome of one client frame
enum ClientStep {
    Continue,
    End,
}

async fn run_session(mut socket: ClientSocket, id: SessionId, argv: Vec<String>, cwd: String, cols: u16, rows: u16) {
    let (mut process, mut output) = match TerminalProcess::spawn(argv.clone(), &cwd, cols, rows) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!(session = %id, ?argv, error = %e, "Failed to start terminal");
            disconnect(&mut socket, id).await;
            return;
        }
    };
    info!(session = %id, ?argv, %cwd, "Terminal started");

    let mut flow = FlowControl::new();
    let gate = process.gate();

    loop {
        tokio::select! {
            incoming = socket.next() => {
                let message = match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(session = %id, error = %e, "Client connection error");
                        break;
                    }
                };
                match handle_client_message(&mut process, &mut flow, message) {
                    Ok(ClientStep::Continue) => {}
                    Ok(ClientStep::End) => break,
                    Err(e) => {
                        error!(session = %id, error = %e, "Ending terminal session");
                        disconnect(&mut socket, id).await;
                        break;
                    }
                }
            }
            Some(chunk) = output.chunks.recv() => {
                if send_output(&mut socket, &mut flow, &gate, &chunk).await.is_err() {
                    break;
                }
            }
            report = &mut output.exit => {
                let report = report.unwrap_or_default();
                // Whatever the pty still holds is delivered without throttling
                gate.apply(FlowSignal::Resume);
                let deadline = Instant::now() + EXIT_DRAIN_TIMEOUT;
                while let Some(chunk) = output.next_remaining(deadline).await {
                    if emit_output(&mut socket, &chunk).await.is_err() {
                        break;
                    }
                }
                info!(session = %id, exit_code = report.exit_code, signal = report.signal.as_deref(), "Terminal exited");
                let event = TerminalServerEvent::Exit {
                    exit_code: report.exit_code,
                    signal: report.signal,
                };
                if let Err(e) = emit(&mut socket, &event).await {
                    debug!(session = %id, error = %e, "Failed to deliver exit event");
                }
                disconnect(&mut socket, id).await;
                break;
            }
        }
    }

    process.kill();
}

fn handle_client_message(
    process: &mut TerminalProcess,
    flow: &mut FlowControl,
    message: Message,
) -> Result<ClientStep, SessionError> {
    let text = match message {
        Message::Text(text) => text,
        Message::Close(_) => return Ok(ClientStep::End),
        _ => return Ok(ClientStep::Continue),
    };

    match serde_json::from_str::<TerminalClientEvent>(&text)? {
        TerminalClientEvent::Data { data } => {
            let input = PtyInput::parse(&data)?;
            if let Some(keys) = &input.data {
                process.write(keys.as_bytes())?;
            }
            if let Some((cols, rows)) = input.resize() {
                process.resize(cols, rows)?;
            }
        }
        TerminalClientEvent::Ack => {
            if let Some(signal) = flow.on_ack() {
                process.apply_flow(signal);
            }
        }
    }
    Ok(ClientStep::Continue)
}

async fn send_output(
    socket: &mut ClientSocket,
    flow: &mut FlowControl,
    gate: &ReadGate,
    chunk: &[u8],
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    emit_output(socket, chunk).await?;
    if let Some(signal) = flow.on_chunk_sent() {
        debug!(unacked = flow.unacked(), "Pausing terminal output");
        gate.apply(signal);
    }
    Ok(())
}

async fn emit_output(socket: &mut ClientSocket, chunk: &[u8]) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let data = String::from_utf8_lossy(chunk);
    emit(socket, &TerminalServerEvent::Data { data: &data, pause: true }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_events() {
        let event: TerminalClientEvent =
            serde_json::from_str(r#"{"event":"data","data":"{\"data\":\"ls\\r\"}"}"#).unwrap();
        assert_eq!(
            event,
            TerminalClientEvent::Data {
                data: r#"{"data":"ls\r"}"#.to_string()
            }
        );

        let event: TerminalClientEvent = serde_json::from_str(r#"{"event":"ack"}"#).unwrap();
        assert_eq!(event, TerminalClientEvent::Ack);
    }

    #[test]
    fn test_pty_input() {
        let input = PtyInput::parse(r#"{"data":"echo hi\r"}"#).unwrap();
        assert_eq!(input.data.as_deref(), Some("echo hi\r"));
        assert_eq!(input.resize(), None);

        let input = PtyInput::parse(r#"{"cols":120,"rows":40}"#).unwrap();
        assert_eq!(input.data, None);
        assert_eq!(input.resize(), Some((120, 40)));

        // One dimension alone does not resize
        let input = PtyInput::parse(r#"{"cols":120}"#).unwrap();
        assert_eq!(input.resize(), None);
    }

    #[test]
    fn test_malformed_pty_input() {
        let err = PtyInput::parse("{oops").unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage(_)));
    }

    #[test]
    fn test_server_event_encoding() {
        let json = serde_json::to_string(&TerminalServerEvent::Data {
            data: "$ ",
            pause: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"data","data":"$ ","pause":true}"#);

        let json = serde_json::to_string(&TerminalServerEvent::Exit {
            exit_code: Some(0),
            signal: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"exit","exitCode":0,"signal":null}"#);
    }

    #[test]
    fn test_launch_argv() {
        let terminal = TerminalConfig {
            shell: "/bin/zsh".to_string(),
            session_name: "main".to_string(),
            ..TerminalConfig::default()
        };

        assert_eq!(
            launch_argv(&terminal, false),
            vec!["tmux", "new-session", "-A", "-s", "main"]
        );
        assert_eq!(launch_argv(&terminal, true), vec!["/bin/zsh"]);
    }

    #[tokio::test]
    async fn test_terminal_process_output_and_exit() {
        let cwd = std::env::temp_dir();
        let (mut process, mut output) = TerminalProcess::spawn(
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo ready; exit 3".to_string()],
            cwd.to_str().unwrap(),
            80,
            24,
        )
        .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), &mut output.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.exit_code, Some(3));

        let mut seen = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(500), output.chunks.recv()).await
        {
            seen.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&seen).contains("ready"));

        process.kill();
        process.kill();
    }

    #[tokio::test]
    async fn test_output_after_exit_is_not_lost() {
        let cwd = std::env::temp_dir();
        let (mut process, mut output) = TerminalProcess::spawn(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "seq 1 3000; echo TAIL-MARK; exit 7".to_string(),
            ],
            cwd.to_str().unwrap(),
            80,
            24,
        )
        .unwrap();

        // Nothing is consumed until the process is gone, so the reader backs up
        let report = tokio::time::timeout(Duration::from_secs(10), &mut output.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.exit_code, Some(7));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while let Some(chunk) = output.next_remaining(deadline).await {
            seen.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&seen).contains("TAIL-MARK"));

        process.kill();
    }

    #[tokio::test]
    async fn test_kill_ends_process() {
        let cwd = std::env::temp_dir();
        let (mut process, mut output) = TerminalProcess::spawn(
            vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            cwd.to_str().unwrap(),
            80,
            24,
        )
        .unwrap();

        process.kill();
        let report = tokio::time::timeout(Duration::from_secs(10), &mut output.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(report.signal.is_some() || report.exit_code != Some(0));
    }
}
