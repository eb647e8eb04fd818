//! Relay between client sessions and kernel websockets
//!
//! A client asks for a kernel channel with `start{url}`; the bridge opens a
//! websocket to the same path on the kernel server and relays frames in both
//! directions until either side closes or the client sends `stop`. There is
//! no flow control on this path.

use crate::config::BackendConfig;
use crate::error::SessionError;
use crate::session::{disconnect, ClientSocket, SessionBridge, SessionId};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

/// Events a client sends on a kernel session
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum KernelClientEvent {
    Start {
        url: String,
    },
    Stop {
        #[serde(default)]
        url: Option<String>,
    },
    Data {
        #[serde(default)]
        channel: Option<String>,
        data: serde_json::Value,
    },
}

/// Events the gateway sends on a kernel session
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum KernelServerEvent<'a> {
    Open { url: &'a str },
    Close { url: &'a str },
    Data { data: &'a str },
}

/// What happened on an upstream kernel websocket
#[derive(Debug)]
pub enum UpstreamEvent {
    Open,
    Message(Message),
    Closed,
    Failed { refused: bool, message: String },
}

/// What the session has to do on the client side after an upstream event
#[derive(Debug, PartialEq)]
pub enum ClientAction {
    Send(Message),
    Disconnect,
}

/// The kernel websocket a session currently relays to
struct UpstreamLink {
    id: u64,
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
}

/// State of one kernel session, owned by the session task
pub struct KernelSession {
    id: SessionId,
    host: String,
    port: u16,
    upstream: Option<UpstreamLink>,
    next_link: u64,
    events_tx: mpsc::UnboundedSender<(u64, UpstreamEvent)>,
}

impl KernelSession {
    pub fn new(
        id: SessionId,
        host: String,
        port: u16,
        events_tx: mpsc::UnboundedSender<(u64, UpstreamEvent)>,
    ) -> Self {
        Self {
            id,
            host,
            port,
            upstream: None,
            next_link: 1,
            events_tx,
        }
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// Handle one frame from the client. An error ends the session.
    pub fn handle_client_message(&mut self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::Text(text) => {
                let event: KernelClientEvent = serde_json::from_str(&text)?;
                self.handle_client_event(event)
            }
            Message::Binary(data) => {
                self.send_upstream(Message::Binary(data));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn handle_client_event(&mut self, event: KernelClientEvent) -> Result<(), SessionError> {
        match event {
            KernelClientEvent::Start { url } => self.start(url),
            KernelClientEvent::Stop { url } => {
                debug!(session = %self.id, url = url.as_deref().unwrap_or(""), "Kernel channel stop requested");
                self.stop();
                Ok(())
            }
            KernelClientEvent::Data { channel, data } => {
                let text = match data {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                debug!(session = %self.id, channel = channel.as_deref().unwrap_or(""), "Relaying data to kernel");
                self.send_upstream(Message::Text(text));
                Ok(())
            }
        }
    }

    fn start(&mut self, url: String) -> Result<(), SessionError> {
        let target = self.upstream_target(&url)?;
        self.stop();

        let link_id = self.next_link;
        self.next_link += 1;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        info!(session = %self.id, %url, %target, "Opening kernel websocket");
        tokio::spawn(relay_upstream(
            link_id,
            target,
            outgoing_rx,
            self.events_tx.clone(),
        ));

        self.upstream = Some(UpstreamLink {
            id: link_id,
            url,
            outgoing,
        });
        Ok(())
    }

    /// `ws://<kernel host>:<kernel port><path and query of url>`
    pub fn upstream_target(&self, url: &str) -> Result<String, SessionError> {
        let parsed = url::Url::parse(url).map_err(|source| SessionError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let mut target = format!("ws://{}:{}{}", self.host, self.port, parsed.path());
        if let Some(query) = parsed.query() {
            target.push('?');
            target.push_str(query);
        }
        Ok(target)
    }

    /// Close and forget the upstream websocket, if any
    pub fn stop(&mut self) {
        // Dropping the sender makes the relay task close the websocket
        if let Some(link) = self.upstream.take() {
            debug!(session = %self.id, url = %link.url, "Closing kernel websocket");
        }
    }

    fn send_upstream(&mut self, message: Message) {
        match &self.upstream {
            Some(link) => {
                if link.outgoing.send(message).is_err() {
                    error!(session = %self.id, url = %link.url, "Failed to send to kernel websocket");
                }
            }
            None => {
                error!(session = %self.id, "No kernel websocket for session, dropping message");
            }
        }
    }

    /// Translate an upstream event into client-side work
    pub fn handle_upstream_event(&mut self, link_id: u64, event: UpstreamEvent) -> Option<ClientAction> {
        let link = match &self.upstream {
            Some(link) if link.id == link_id => link,
            _ => {
                debug!(session = %self.id, link_id, ?event, "Ignoring event from stale kernel websocket");
                return None;
            }
        };

        match event {
            UpstreamEvent::Open => {
                info!(session = %self.id, url = %link.url, "Kernel websocket open");
                Some(text_action(&KernelServerEvent::Open { url: &link.url }))
            }
            UpstreamEvent::Message(Message::Text(text)) => {
                Some(text_action(&KernelServerEvent::Data { data: &text }))
            }
            UpstreamEvent::Message(Message::Binary(data)) => Some(ClientAction::Send(Message::Binary(data))),
            UpstreamEvent::Message(_) => None,
            UpstreamEvent::Closed => {
                let link = self.upstream.take()?;
                info!(session = %self.id, url = %link.url, "Kernel websocket closed");
                Some(text_action(&KernelServerEvent::Close { url: &link.url }))
            }
            UpstreamEvent::Failed { refused: true, message } => {
                error!(session = %self.id, url = %link.url, error = %message, "Kernel websocket refused, disconnecting client");
                self.upstream = None;
                Some(ClientAction::Disconnect)
            }
            UpstreamEvent::Failed { refused: false, message } => {
                error!(session = %self.id, url = %link.url, error = %message, "Kernel websocket error");
                None
            }
        }
    }
}

fn text_action(event: &KernelServerEvent<'_>) -> ClientAction {
    // Serializing these borrowed-string variants cannot fail
    ClientAction::Send(Message::Text(serde_json::to_string(event).unwrap_or_default()))
}

/// Own one upstream kernel websocket until it closes or the session drops it
async fn relay_upstream(
    link_id: u64,
    target: String,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<(u64, UpstreamEvent)>,
) {
    let (mut ws, _) = match connect_async(target.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            let refused = is_connection_refused(&e);
            let _ = events.send((link_id, UpstreamEvent::Failed { refused, message: e.to_string() }));
            // A failed handshake still ends the link
            let _ = events.send((link_id, UpstreamEvent::Closed));
            return;
        }
    };
    let _ = events.send((link_id, UpstreamEvent::Open));

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    let _ = events.send((link_id, UpstreamEvent::Message(message)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send((link_id, UpstreamEvent::Failed { refused: false, message: e.to_string() }));
                    break;
                }
            },
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = ws.send(message).await {
                        warn!(%target, error = %e, "Kernel websocket send failed");
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    return;
                }
            },
        }
    }

    let _ = events.send((link_id, UpstreamEvent::Closed));
}

fn is_connection_refused(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused)
}

/// Session bridge for `/socket.io/kernel`
pub struct KernelSocketBridge {
    host: String,
    port: u16,
}

impl KernelSocketBridge {
    pub const PREFIX: &'static str = "/socket.io/kernel";

    pub fn new(config: &BackendConfig) -> Self {
        let (host, port) = config.kernel_target();
        Self { host, port }
    }
}

impl SessionBridge for KernelSocketBridge {
    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    fn run(&self, socket: ClientSocket, id: SessionId) -> BoxFuture<'static, ()> {
        run_session(socket, id, self.host.clone(), self.port).boxed()
    }
}

async fn run_session(mut socket: ClientSocket, id: SessionId, host: String, port: u16) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = KernelSession::new(id, host, port, events_tx);

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
                if let Err(e) = session.handle_client_message(message) {
                    error!(session = %id, error = %e, "Ending kernel session");
                    disconnect(&mut socket, id).await;
                    break;
                }
            }
            Some((link_id, event)) = events_rx.recv() => {
                match session.handle_upstream_event(link_id, event) {
                    Some(ClientAction::Send(message)) => {
                        if let Err(e) = socket.send(message).await {
                            debug!(session = %id, error = %e, "Failed to send to client");
                            break;
                        }
                    }
                    Some(ClientAction::Disconnect) => {
                        disconnect(&mut socket, id).await;
                        break;
                    }
                    None => {}
                }
            }
        }
    }

    session.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (KernelSession, mpsc::UnboundedReceiver<(u64, UpstreamEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (KernelSession::new(SessionId::next(), "127.0.0.1".to_string(), 1, tx), rx)
    }

    #[test]
    fn test_parse_client_events() {
        let event: KernelClientEvent =
            serde_json::from_str(r#"{"event":"start","url":"ws://localhost/api/kernels/k1/channels"}"#).unwrap();
        assert_eq!(
            event,
            KernelClientEvent::Start {
                url: "ws://localhost/api/kernels/k1/channels".to_string()
            }
        );

        let event: KernelClientEvent = serde_json::from_str(r#"{"event":"stop"}"#).unwrap();
        assert_eq!(event, KernelClientEvent::Stop { url: None });

        let event: KernelClientEvent =
            serde_json::from_str(r#"{"event":"data","channel":"shell","data":"{\"a\":1}"}"#).unwrap();
        assert_eq!(
            event,
            KernelClientEvent::Data {
                channel: Some("shell".to_string()),
                data: serde_json::Value::String("{\"a\":1}".to_string()),
            }
        );
    }

    #[test]
    fn test_server_event_encoding() {
        let json = serde_json::to_string(&KernelServerEvent::Open { url: "ws://x/a" }).unwrap();
        assert_eq!(json, r#"{"event":"open","url":"ws://x/a"}"#);

        let json = serde_json::to_string(&KernelServerEvent::Data { data: "hi" }).unwrap();
        assert_eq!(json, r#"{"event":"data","data":"hi"}"#);
    }

    #[test]
    fn test_upstream_target_keeps_path_and_query() {
        let (session, _rx) = session();
        let target = session
            .upstream_target("ws://example.com:1234/api/kernels/k1/channels?session_id=s1")
            .unwrap();
        assert_eq!(target, "ws://127.0.0.1:1/api/kernels/k1/channels?session_id=s1");
    }

    #[test]
    fn test_invalid_url_is_session_error() {
        let (mut session, _rx) = session();
        let err = session
            .handle_client_event(KernelClientEvent::Start {
                url: "not a url".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidUrl { .. }));
        assert!(!session.has_upstream());
    }

    #[test]
    fn test_malformed_message_is_session_error() {
        let (mut session, _rx) = session();
        let err = session
            .handle_client_message(Message::Text("{not json".to_string()))
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn test_data_after_stop_is_dropped() {
        let (mut session, _rx) = session();

        session
            .handle_client_event(KernelClientEvent::Start {
                url: "ws://x".to_string(),
            })
            .unwrap();
        assert!(session.has_upstream());

        session
            .handle_client_event(KernelClientEvent::Stop { url: None })
            .unwrap();
        assert!(!session.has_upstream());

        let result = session.handle_client_event(KernelClientEvent::Data {
            channel: Some("shell".to_string()),
            data: serde_json::Value::String("payload".to_string()),
        });
        assert!(result.is_ok());
        assert!(!session.has_upstream());
    }

    #[test]
    fn test_stop_without_upstream_is_noop() {
        let (mut session, _rx) = session();
        session.stop();
        session.stop();
        assert!(!session.has_upstream());
    }

    #[tokio::test]
    async fn test_upstream_events_map_to_client_actions() {
        let (mut session, _rx) = session();
        session
            .handle_client_event(KernelClientEvent::Start {
                url: "ws://x/api/kernels/k1/channels".to_string(),
            })
            .unwrap();

        let action = session.handle_upstream_event(1, UpstreamEvent::Open);
        assert_eq!(
            action,
            Some(ClientAction::Send(Message::Text(
                r#"{"event":"open","url":"ws://x/api/kernels/k1/channels"}"#.to_string()
            )))
        );

        let action = session.handle_upstream_event(1, UpstreamEvent::Message(Message::Binary(vec![1, 2])));
        assert_eq!(action, Some(ClientAction::Send(Message::Binary(vec![1, 2]))));

        // Events from an older link are ignored
        assert_eq!(session.handle_upstream_event(7, UpstreamEvent::Closed), None);
        assert!(session.has_upstream());

        let action = session.handle_upstream_event(1, UpstreamEvent::Closed);
        assert_eq!(
            action,
            Some(ClientAction::Send(Message::Text(
                r#"{"event":"close","url":"ws://x/api/kernels/k1/channels"}"#.to_string()
            )))
        );
        assert!(!session.has_upstream());
    }

    #[tokio::test]
    async fn test_refused_upstream_disconnects_client() {
        let (mut session, _rx) = session();
        session
            .handle_client_event(KernelClientEvent::Start {
                url: "ws://x/".to_string(),
            })
            .unwrap();

        let action = session.handle_upstream_event(
            1,
            UpstreamEvent::Failed {
                refused: true,
                message: "connection refused".to_string(),
            },
        );
        assert_eq!(action, Some(ClientAction::Disconnect));
        assert!(!session.has_upstream());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = KernelSession::new(SessionId::next(), "127.0.0.1".to_string(), port, tx);
        session
            .handle_client_event(KernelClientEvent::Start {
                url: "ws://x/api/kernels/k1/channels".to_string(),
            })
            .unwrap();

        let (link_id, event) = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link_id, 1);
        assert!(matches!(event, UpstreamEvent::Failed { refused: true, .. }));
    }

    #[tokio::test]
    async fn test_rejected_handshake_closes_link() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0_u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = KernelSession::new(SessionId::next(), "127.0.0.1".to_string(), port, tx);
        session
            .handle_client_event(KernelClientEvent::Start {
                url: "ws://x/api/kernels/gone/channels".to_string(),
            })
            .unwrap();

        let mut actions = Vec::new();
        while session.has_upstream() {
            let (link_id, event) = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            actions.extend(session.handle_upstream_event(link_id, event));
        }

        assert_eq!(
            actions,
            vec![ClientAction::Send(Message::Text(
                r#"{"event":"close","url":"ws://x/api/kernels/gone/channels"}"#.to_string()
            ))]
        );
    }
}
