//! Device WebSocket: binary frames carry Opus packets, text frames carry JSON control.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxloop::collaborators::OutboundSink;
use voxloop::messages::{Inbound, ListenState, Outbound};
use voxloop::{DialogueOrchestrator, RoleBinding, Session};

use crate::AppState;
use crate::metrics;

// Time the writer gets to flush the close frame once the reader is gone.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl WsQuery {
    /// The role to bind on connect; the server default applies when the device names none.
    pub fn binding(&self, default_role: Option<&str>) -> Option<RoleBinding> {
        let role_id = self
            .role_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .or(default_role)?;
        Some(RoleBinding {
            role_id: role_id.to_owned(),
            voice: self.voice.clone(),
            description: self.description.clone(),
            location: self.location.clone(),
            vad: None,
        })
    }
}

enum WsOut {
    Frame(Outbound),
    Close,
}

/// Outbound sink backed by the socket writer task. Order is preserved by the channel.
struct WsSink {
    tx: mpsc::UnboundedSender<WsOut>,
}

impl OutboundSink for WsSink {
    fn send(&self, message: Outbound) -> voxloop::Result<()> {
        self.tx
            .send(WsOut::Frame(message))
            .map_err(|_| anyhow!("connection closed").into())
    }

    fn close(&self) {
        let _ = self.tx.send(WsOut::Close);
    }
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsOut>();

    let session_id = query
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let device_id = query.device_id.clone().unwrap_or_else(|| session_id.clone());

    let orchestrator = Arc::clone(&state.orchestrator);
    let session = match orchestrator.open_session(&session_id, &device_id, Arc::new(WsSink { tx })) {
        Ok(session) => session,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "failed to open session");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    if let Some(binding) = query.binding(state.default_role.as_deref()) {
        if let Err(err) = orchestrator.bind_role(&session, binding) {
            warn!(session_id = %session_id, error = %err, "role binding rejected");
        }
    }
    metrics::session_opened();
    info!(session_id = %session_id, device_id = %device_id, "device connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let message = match out {
                WsOut::Frame(Outbound::Audio(packet)) => {
                    metrics::ws_message("out", "audio");
                    Message::Binary(packet.into())
                }
                WsOut::Frame(Outbound::Control(control)) => match serde_json::to_string(&control) {
                    Ok(text) => {
                        metrics::ws_message("out", "control");
                        Message::Text(text.into())
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to encode control message");
                        continue;
                    }
                },
                WsOut::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let recv_orchestrator = Arc::clone(&orchestrator);
    let recv_session = Arc::clone(&session);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Binary(packet) => {
                    metrics::ws_message("in", "audio");
                    recv_orchestrator.on_audio(&recv_session, &packet);
                }
                Message::Text(text) => {
                    metrics::ws_message("in", "control");
                    dispatch_control(&recv_orchestrator, &recv_session, text.as_str());
                }
                Message::Close(_) => break,
                _ => {}
            }
            if recv_session.is_closed() {
                break;
            }
        }
    });

    let writer_done = tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            true
        }
        _ = &mut recv_task => false,
    };

    // A reconnect may already own this session id.
    let still_live = orchestrator
        .registry()
        .get(&session_id)
        .is_some_and(|live| Arc::ptr_eq(&live, &session));
    if still_live {
        orchestrator.close_session(&session_id);
    }
    if !writer_done && tokio::time::timeout(CLOSE_GRACE, send_task).await.is_err() {
        debug!(session_id = %session_id, "writer did not finish in time");
    }

    metrics::session_closed();
    info!(session_id = %session_id, "device disconnected");
}

fn dispatch_control(orchestrator: &Arc<DialogueOrchestrator>, session: &Arc<Session>, raw: &str) {
    let inbound: Inbound = match serde_json::from_str(raw) {
        Ok(inbound) => inbound,
        Err(err) => {
            debug!(session_id = %session.id(), error = %err, "ignoring malformed control message");
            return;
        }
    };

    match inbound {
        Inbound::Listen {
            state: ListenState::Detect,
            text: Some(text),
        } if !text.trim().is_empty() => orchestrator.on_wake_word(session, text),
        Inbound::Listen {
            state: ListenState::Text,
            text: Some(text),
        } if !text.trim().is_empty() => orchestrator.on_text(session, text),
        Inbound::Listen { state, .. } => {
            debug!(session_id = %session.id(), ?state, "listen state");
            session.touch();
        }
        Inbound::Abort { reason } => {
            orchestrator.on_abort(session, reason.as_deref().unwrap_or("device abort"));
        }
        Inbound::Ping => session.touch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_role_wins_over_default() {
        let query = WsQuery {
            role_id: Some("7".to_owned()),
            voice: Some("xiaoyi".to_owned()),
            ..WsQuery::default()
        };
        let binding = query.binding(Some("1"));
        assert_eq!(binding.as_ref().map(|b| b.role_id.as_str()), Some("7"));
        assert_eq!(binding.and_then(|b| b.voice).as_deref(), Some("xiaoyi"));
    }

    #[test]
    fn blank_role_falls_back_to_default() {
        let query = WsQuery {
            role_id: Some("  ".to_owned()),
            ..WsQuery::default()
        };
        assert_eq!(query.binding(Some("1")).map(|b| b.role_id), Some("1".to_owned()));
        assert!(query.binding(None).is_none());
    }

    #[test]
    fn closed_sink_reports_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = WsSink { tx };
        drop(rx);
        assert!(sink.send(Outbound::Audio(vec![1, 2, 3])).is_err());
    }
}
