//! Per-connection terminal session: message classification, the
//! provisioning/attach lifecycle, and guaranteed subprocess cleanup.
//!
//! One WebSocket carries both structured control messages and raw terminal
//! bytes. Each inbound frame is classified fresh: a JSON control message is
//! dispatched through the lifecycle state machine, anything else is raw
//! input for the attached PTY. PTY output bypasses the state machine and is
//! forwarded straight to the outbound channel as binary frames.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::WebSocketUpgrade,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::docker::{self, DEFAULT_IMAGE};
use crate::pty::PtyBridge;

const OUTBOUND_CHANNEL_SIZE: usize = 256;
const LOG_CHANNEL_SIZE: usize = 64;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

// =============================================================================
// Channel protocol
// =============================================================================

/// Structured control messages recognized on the channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "create")]
    Create { image: Option<String> },

    #[serde(rename = "attach")]
    Attach {
        #[serde(rename = "sandboxId")]
        sandbox_id: String,
        cols: Option<u16>,
        rows: Option<u16>,
    },

    #[serde(rename = "resize")]
    Resize { cols: Option<u16>, rows: Option<u16> },
}

/// Events sent back to the client. Raw PTY output is not an event; it goes
/// out as binary frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "log")]
    Log { data: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "created")]
    Created {
        #[serde(rename = "sandboxId")]
        sandbox_id: String,
        #[serde(rename = "sandboxName")]
        sandbox_name: String,
    },

    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "exit")]
    Exit { code: Option<i32> },
}

/// Classification of one inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Control(ControlMessage),
    /// Valid JSON that is not a recognized control message. Ignored rather
    /// than forwarded, so unknown message types stay a no-op.
    Ignored,
    Raw(Vec<u8>),
}

/// Classify an inbound frame. Attempted fresh per frame; there is no
/// persistent mode flag.
pub fn classify(payload: &[u8]) -> Inbound {
    if let Ok(text) = std::str::from_utf8(payload) {
        if let Ok(msg) = serde_json::from_str::<ControlMessage>(text) {
            return Inbound::Control(msg);
        }
        if serde_json::from_str::<serde_json::Value>(text).is_ok() {
            return Inbound::Ignored;
        }
    }
    Inbound::Raw(payload.to_vec())
}

// =============================================================================
// Lifecycle state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Provisioning,
    Provisioned,
    Attaching,
    Attached,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Provisioning => "provisioning",
            SessionState::Provisioned => "provisioned",
            SessionState::Attaching => "attaching",
            SessionState::Attached => "attached",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Completion notifications posted back to the session loop by its
/// background tasks.
#[derive(Debug)]
enum SessionEvent {
    Provisioned {
        sandbox_id: String,
        sandbox_name: String,
    },
    ProvisionFailed {
        message: String,
    },
    PtyExit {
        code: Option<i32>,
    },
}

/// State for one client channel. Owned exclusively by the WebSocket handler
/// task for the lifetime of the connection.
struct Session {
    id: String,
    state: SessionState,
    sandbox_id: Option<String>,
    sandbox_name: Option<String>,
    cols: u16,
    rows: u16,
    bridge: Option<Arc<PtyBridge>>,
    provision_task: Option<JoinHandle<()>>,
    io_task: Option<JoinHandle<()>>,
    out_tx: mpsc::Sender<Message>,
    ctrl_tx: mpsc::Sender<SessionEvent>,
}

impl Session {
    fn new(id: String, out_tx: mpsc::Sender<Message>, ctrl_tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            sandbox_id: None,
            sandbox_name: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            bridge: None,
            provision_task: None,
            io_task: None,
            out_tx,
            ctrl_tx,
        }
    }

    async fn send_event(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(json) => {
                let _ = self.out_tx.send(Message::Text(json)).await;
            }
            Err(e) => warn!("[ws:{}] Failed to serialize event: {}", self.id, e),
        }
    }

    async fn handle_frame(&mut self, payload: Vec<u8>) {
        match classify(&payload) {
            Inbound::Control(msg) => self.handle_control(msg).await,
            Inbound::Ignored => debug!("[ws:{}] Ignoring unrecognized control frame", self.id),
            Inbound::Raw(bytes) => self.handle_raw(bytes),
        }
    }

    /// Raw terminal input: forwarded verbatim to the attached PTY, silently
    /// dropped when nothing is attached.
    fn handle_raw(&self, bytes: Vec<u8>) {
        if let Some(bridge) = &self.bridge {
            bridge.write(bytes);
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Create { image } => self.handle_create(image).await,
            ControlMessage::Attach {
                sandbox_id,
                cols,
                rows,
            } => self.handle_attach(sandbox_id, cols, rows).await,
            ControlMessage::Resize { cols, rows } => self.handle_resize(cols, rows).await,
        }
    }

    async fn handle_create(&mut self, image: Option<String>) {
        if self.state != SessionState::Idle {
            self.send_event(Event::Error {
                message: format!("create rejected: session is {}", self.state),
            })
            .await;
            return;
        }

        let image = image.unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        info!("[ws:{}] Creating container with image: {}", self.id, image);
        self.state = SessionState::Provisioning;

        // Provisioning log lines become `log` events on the channel.
        let (log_tx, mut log_rx) = mpsc::channel::<String>(LOG_CHANNEL_SIZE);
        let out_tx = self.out_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = log_rx.recv().await {
                let Ok(json) = serde_json::to_string(&Event::Log { data }) else {
                    continue;
                };
                if out_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // The docker children are spawned with kill_on_drop, so aborting
        // this task on close also terminates any in-flight subprocess.
        let ctrl_tx = self.ctrl_tx.clone();
        self.provision_task = Some(tokio::spawn(async move {
            let event = match docker::provision(image, log_tx).await {
                Ok(p) => SessionEvent::Provisioned {
                    sandbox_id: p.container_id,
                    sandbox_name: p.container_name,
                },
                Err(e) => SessionEvent::ProvisionFailed {
                    message: e.to_string(),
                },
            };
            let _ = ctrl_tx.send(event).await;
        }));
    }

    async fn handle_attach(&mut self, sandbox_id: String, cols: Option<u16>, rows: Option<u16>) {
        match self.state {
            SessionState::Idle | SessionState::Provisioned => {}
            SessionState::Closed => return,
            state => {
                self.send_event(Event::Error {
                    message: format!("attach rejected: session is {state}"),
                })
                .await;
                return;
            }
        }

        self.cols = cols.unwrap_or(self.cols);
        self.rows = rows.unwrap_or(self.rows);
        self.state = SessionState::Attaching;
        info!(
            "[ws:{}] Attaching to container {} ({}x{})",
            self.id, sandbox_id, self.cols, self.rows
        );

        match PtyBridge::attach(&sandbox_id, self.cols, self.rows) {
            Ok((bridge, mut output_rx, exit_rx)) => {
                self.bridge = Some(bridge);
                self.state = SessionState::Attached;
                self.send_event(Event::Ready).await;

                // Hot path: PTY output goes straight to the outbound channel
                // as binary frames. Only the exit notification loops back
                // through the state machine.
                let out_tx = self.out_tx.clone();
                let ctrl_tx = self.ctrl_tx.clone();
                self.io_task = Some(tokio::spawn(async move {
                    while let Some(bytes) = output_rx.recv().await {
                        if out_tx.send(Message::Binary(bytes)).await.is_err() {
                            return;
                        }
                    }
                    if let Ok(code) = exit_rx.await {
                        let _ = ctrl_tx.send(SessionEvent::PtyExit { code }).await;
                    }
                }));
            }
            Err(e) => {
                warn!("[ws:{}] Attach failed: {}", self.id, e);
                self.state = if self.sandbox_id.is_some() {
                    SessionState::Provisioned
                } else {
                    SessionState::Idle
                };
                self.send_event(Event::Error {
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    /// Resize is only meaningful while attached; otherwise it is a silent
    /// no-op.
    async fn handle_resize(&mut self, cols: Option<u16>, rows: Option<u16>) {
        if self.state != SessionState::Attached {
            return;
        }
        let Some(bridge) = &self.bridge else { return };

        self.cols = cols.unwrap_or(DEFAULT_COLS);
        self.rows = rows.unwrap_or(DEFAULT_ROWS);
        if let Err(e) = bridge.resize(self.cols, self.rows) {
            warn!("[ws:{}] Failed to resize PTY: {}", self.id, e);
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Provisioned {
                sandbox_id,
                sandbox_name,
            } => {
                self.provision_task = None;
                if self.state != SessionState::Provisioning {
                    return;
                }
                self.state = SessionState::Provisioned;
                self.sandbox_id = Some(sandbox_id.clone());
                self.sandbox_name = Some(sandbox_name.clone());
                self.send_event(Event::Created {
                    sandbox_id,
                    sandbox_name,
                })
                .await;
            }
            SessionEvent::ProvisionFailed { message } => {
                self.provision_task = None;
                if self.state == SessionState::Provisioning {
                    // Recoverable: the client may retry with another create.
                    self.state = SessionState::Idle;
                }
                self.send_event(Event::Error { message }).await;
            }
            SessionEvent::PtyExit { code } => {
                info!("[ws:{}] Attached process exited: {:?}", self.id, code);
                self.bridge = None;
                self.io_task = None;
                self.state = if self.sandbox_id.is_some() {
                    SessionState::Provisioned
                } else {
                    SessionState::Idle
                };
                self.send_event(Event::Exit { code }).await;
            }
        }
    }

    /// The single cleanup path: terminates any owned provisioning chain and
    /// any attached process. Runs exactly once regardless of the prior
    /// state; a second call is a no-op.
    fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Some(task) = self.provision_task.take() {
            task.abort();
        }
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.kill();
        }
        if let Some(name) = &self.sandbox_name {
            info!("[ws:{}] Session closed (sandbox {})", self.id, name);
        }
    }
}

// =============================================================================
// WebSocket handler
// =============================================================================

pub async fn websocket_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let ws_id = Uuid::new_v4().to_string()[..8].to_string();
    info!("[ws:{}] Client connected", ws_id);

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_SIZE);
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<SessionEvent>(16);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(ws_id.clone(), out_tx, ctrl_tx);
    session.send_event(Event::Connected).await;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(inbound) = inbound else { break };
                match inbound {
                    Ok(Message::Text(text)) => session.handle_frame(text.into_bytes()).await,
                    Ok(Message::Binary(bytes)) => session.handle_frame(bytes).await,
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Err(e) => {
                        warn!("[ws:{}] Receive error: {}", ws_id, e);
                        break;
                    }
                }
            }
            Some(event) = ctrl_rx.recv() => session.handle_event(event).await,
        }
    }

    session.close();
    send_task.abort();
    info!("[ws:{}] Client disconnected", ws_id);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use portable_pty::CommandBuilder;
    use tokio::time::{timeout, Duration};

    fn test_session() -> (Session, mpsc::Receiver<Message>, mpsc::Receiver<SessionEvent>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        (Session::new("test".to_string(), out_tx, ctrl_tx), out_rx, ctrl_rx)
    }

    fn event_type(msg: &Message) -> Option<String> {
        let Message::Text(text) = msg else { return None };
        serde_json::from_str::<serde_json::Value>(text)
            .ok()?
            .get("type")?
            .as_str()
            .map(String::from)
    }

    #[test]
    fn classify_recognizes_control_messages() {
        match classify(br#"{"type":"create","image":"alpine:latest"}"#) {
            Inbound::Control(ControlMessage::Create { image }) => {
                assert_eq!(image.as_deref(), Some("alpine:latest"));
            }
            other => panic!("expected create, got {other:?}"),
        }

        match classify(br#"{"type":"attach","sandboxId":"3f4a9b2c1d0e","cols":100,"rows":30}"#) {
            Inbound::Control(ControlMessage::Attach {
                sandbox_id,
                cols,
                rows,
            }) => {
                assert_eq!(sandbox_id, "3f4a9b2c1d0e");
                assert_eq!(cols, Some(100));
                assert_eq!(rows, Some(30));
            }
            other => panic!("expected attach, got {other:?}"),
        }

        match classify(br#"{"type":"resize","cols":120,"rows":40}"#) {
            Inbound::Control(ControlMessage::Resize { cols, rows }) => {
                assert_eq!(cols, Some(120));
                assert_eq!(rows, Some(40));
            }
            other => panic!("expected resize, got {other:?}"),
        }
    }

    #[test]
    fn classify_ignores_unknown_json() {
        assert!(matches!(
            classify(br#"{"type":"shutdown"}"#),
            Inbound::Ignored
        ));
        assert!(matches!(classify(br#"{"cols":80}"#), Inbound::Ignored));
    }

    #[test]
    fn classify_falls_back_to_raw_input() {
        assert!(matches!(classify(b"ls\n"), Inbound::Raw(_)));
        assert!(matches!(classify(b"\x1b[A"), Inbound::Raw(_)));
        assert!(matches!(classify(&[0xff, 0xfe]), Inbound::Raw(_)));
    }

    #[tokio::test]
    async fn resize_before_attach_is_a_noop() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session
            .handle_frame(br#"{"type":"resize","cols":100,"rows":30}"#.to_vec())
            .await;

        assert_eq!(session.state, SessionState::Idle);
        assert!(out_rx.try_recv().is_err(), "no event should be emitted");
        // Dimensions are untouched until an attach provides them.
        assert_eq!((session.cols, session.rows), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[tokio::test]
    async fn raw_input_without_attached_process_is_dropped() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session.handle_frame(b"ls\n".to_vec()).await;

        assert!(out_rx.try_recv().is_err(), "no error should be emitted");
        assert_eq!(session.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn create_while_provisioning_is_rejected() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session.state = SessionState::Provisioning;

        session.handle_frame(br#"{"type":"create"}"#.to_vec()).await;

        let msg = out_rx.try_recv().expect("error event expected");
        assert_eq!(event_type(&msg).as_deref(), Some("error"));
        assert_eq!(session.state, SessionState::Provisioning);
        assert!(session.provision_task.is_none());
    }

    #[tokio::test]
    async fn attach_while_attached_is_rejected() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session.state = SessionState::Attached;

        session
            .handle_frame(br#"{"type":"attach","sandboxId":"abc123def456"}"#.to_vec())
            .await;

        let msg = out_rx.try_recv().expect("error event expected");
        assert_eq!(event_type(&msg).as_deref(), Some("error"));
        assert_eq!(session.state, SessionState::Attached);
    }

    #[tokio::test]
    async fn provision_failure_returns_to_idle() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session.state = SessionState::Provisioning;

        session
            .handle_event(SessionEvent::ProvisionFailed {
                message: "Failed to create container: no such image".to_string(),
            })
            .await;

        assert_eq!(session.state, SessionState::Idle);
        let msg = out_rx.try_recv().expect("error event expected");
        assert_eq!(event_type(&msg).as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn provision_success_emits_created_and_sets_id_once() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session.state = SessionState::Provisioning;

        session
            .handle_event(SessionEvent::Provisioned {
                sandbox_id: "3f4a9b2c1d0e".to_string(),
                sandbox_name: "svelte-terminal-1".to_string(),
            })
            .await;

        assert_eq!(session.state, SessionState::Provisioned);
        assert_eq!(session.sandbox_id.as_deref(), Some("3f4a9b2c1d0e"));
        assert_eq!(session.sandbox_name.as_deref(), Some("svelte-terminal-1"));
        let msg = out_rx.try_recv().expect("created event expected");
        assert_eq!(event_type(&msg).as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn pty_exit_emits_exit_event_and_releases_bridge() {
        let (mut session, mut out_rx, _ctrl_rx) = test_session();
        session.state = SessionState::Attached;
        session.sandbox_id = Some("3f4a9b2c1d0e".to_string());

        session
            .handle_event(SessionEvent::PtyExit { code: Some(0) })
            .await;

        assert_eq!(session.state, SessionState::Provisioned);
        assert!(session.bridge.is_none());
        let msg = out_rx.try_recv().expect("exit event expected");
        assert_eq!(event_type(&msg).as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn close_kills_attached_process_and_is_idempotent() {
        let (mut session, _out_rx, _ctrl_rx) = test_session();

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.cwd("/tmp");
        let (bridge, mut output_rx, exit_rx) = PtyBridge::spawn(cmd, 80, 24).unwrap();
        session.bridge = Some(bridge);
        session.state = SessionState::Attached;

        session.close();
        session.close(); // second close must be a no-op

        assert_eq!(session.state, SessionState::Closed);
        assert!(session.bridge.is_none());

        // The kill is observable: the reader drains and the exit fires.
        while let Ok(Some(_)) = timeout(Duration::from_secs(5), output_rx.recv()).await {}
        assert!(timeout(Duration::from_secs(5), exit_rx).await.is_ok());
    }

    #[tokio::test]
    async fn close_from_idle_releases_nothing_but_transitions() {
        let (mut session, _out_rx, _ctrl_rx) = test_session();
        session.close();
        assert_eq!(session.state, SessionState::Closed);
    }
}
