//! GET /terminal - WebSocket for terminal streaming and task rooms.
//!
//! One socket is one observer. Clients send JSON messages tagged by `type`:
//! `subscribe`, `unsubscribe`, `input`, `resize` for terminal panes and
//! `join_task` / `leave_task` for per-task event rooms. The server pushes
//! `output` for terminal bytes and `event` for loop events. Loop and spec
//! events reach every socket; progress, steering and summary events only
//! reach sockets in that task's room.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use ralph_core::LoopEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::AppContext;
use crate::terminal::{PtyDimensions, SessionKey, TerminalOutput};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        session_id: String,
        pane_id: String,
    },
    Unsubscribe {
        session_id: String,
        pane_id: String,
    },
    Input {
        session_id: String,
        pane_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        pane_id: String,
        rows: u16,
        cols: u16,
    },
    JoinTask {
        task_id: String,
    },
    LeaveTask {
        task_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        session_id: String,
        pane_id: String,
        data: String,
    },
    Event {
        event: LoopEvent,
    },
    Error {
        message: String,
    },
}

impl From<TerminalOutput> for ServerMessage {
    fn from(output: TerminalOutput) -> Self {
        Self::Output {
            session_id: output.key.session_id,
            pane_id: output.key.pane_id,
            data: String::from_utf8_lossy(&output.data).into_owned(),
        }
    }
}

/// Task rooms a socket has joined.
#[derive(Debug, Default)]
pub struct Rooms {
    tasks: HashSet<String>,
}

impl Rooms {
    pub fn join(&mut self, task_id: String) {
        self.tasks.insert(task_id);
    }

    pub fn leave(&mut self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    /// Whether `event` should go to this socket.
    pub fn admits(&self, event: &LoopEvent) -> bool {
        !event.kind().is_room_scoped() || self.tasks.contains(event.task_id())
    }
}

pub async fn terminal_socket(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let observer = Uuid::now_v7().to_string();
    let (mut sender, mut receiver) = socket.split();
    let mut output = ctx.terminals.connect(&observer).await;
    let mut events = ctx.bus.subscribe();
    let mut rooms = Rooms::default();
    info!(observer = %observer, "terminal socket connected");

    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            maybe_msg = receiver.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => apply_message(&ctx, &observer, &mut rooms, msg).await,
                            Err(e) => Some(ServerMessage::Error {
                                message: format!("invalid message: {e}"),
                            }),
                        };
                        if let Some(reply) = reply {
                            if send_json(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            Some(chunk) = output.recv() => {
                if send_json(&mut sender, &ServerMessage::from(chunk)).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if rooms.admits(&event) {
                            let message = ServerMessage::Event { event };
                            if send_json(&mut sender, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(observer = %observer, skipped = n, "socket lagged behind events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    ctx.terminals.cleanup_observer(&observer).await;
    info!(observer = %observer, "terminal socket disconnected");
}

/// Apply one client message. Returns a reply to send, if any.
async fn apply_message(
    ctx: &AppContext,
    observer: &str,
    rooms: &mut Rooms,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    let result = match msg {
        ClientMessage::Subscribe {
            session_id,
            pane_id,
        } => ctx
            .terminals
            .subscribe(observer, &SessionKey::new(session_id, pane_id))
            .await,
        ClientMessage::Unsubscribe {
            session_id,
            pane_id,
        } => {
            ctx.terminals
                .unsubscribe(observer, &SessionKey::new(session_id, pane_id))
                .await;
            Ok(())
        }
        ClientMessage::Input {
            session_id,
            pane_id,
            data,
        } => {
            ctx.terminals
                .write(&SessionKey::new(session_id, pane_id), data.as_bytes())
                .await
        }
        ClientMessage::Resize {
            session_id,
            pane_id,
            rows,
            cols,
        } => {
            ctx.terminals
                .resize(
                    &SessionKey::new(session_id, pane_id),
                    PtyDimensions { rows, cols },
                )
                .await
        }
        ClientMessage::JoinTask { task_id } => {
            debug!(observer = %observer, task_id = %task_id, "joined task room");
            rooms.join(task_id);
            Ok(())
        }
        ClientMessage::LeaveTask { task_id } => {
            rooms.leave(&task_id);
            Ok(())
        }
    };

    result.err().map(|e| ServerMessage::Error {
        message: e.to_string(),
    })
}
