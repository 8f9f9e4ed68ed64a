use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tandem_core::types::DbId;
use tandem_events::{ChannelEvent, ChannelHub, ClientFrame, PushChannels, ServerFrame, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::state::AppState;
use crate::ws::manager::WsSender;

/// HTTP handler that upgrades the connection to a push connection.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage a single push connection after upgrade.
///
/// Outbound frames go through the manager's channel to a sender task;
/// inbound frames are handled on the current task. When the socket goes
/// away, every presence this connection tracked is published as a leave.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "Push connection opened");

    let (outbound, mut rx) = state.ws_manager.add(conn_id.clone()).await;
    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "Push sink closed");
                break;
            }
        }
    });

    let mut conn = Connection {
        conn_id: conn_id.clone(),
        channels: state.channels.clone(),
        outbound,
        forwards: HashMap::new(),
        tracked: HashSet::new(),
    };

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => conn.on_text(text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "Push receive error");
                break;
            }
        }
    }

    conn.close();
    let open_for = state.ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(
        conn_id = %conn_id,
        open_secs = open_for.map(|d| d.num_seconds()),
        "Push connection closed"
    );
}

/// Topic subscriptions and tracked presence of one connection.
struct Connection {
    conn_id: String,
    channels: Arc<ChannelHub>,
    outbound: WsSender,
    forwards: HashMap<Topic, JoinHandle<()>>,
    tracked: HashSet<(Topic, DbId)>,
}

impl Connection {
    fn on_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::Subscribe { topic }) => self.subscribe(topic),
            Ok(ClientFrame::Unsubscribe { topic }) => {
                if let Some(forward) = self.forwards.remove(&topic) {
                    forward.abort();
                }
            }
            Ok(ClientFrame::Publish { topic, event }) => self.publish(topic, event),
            Err(e) => {
                tracing::debug!(conn_id = %self.conn_id, error = %e, "Malformed push frame");
                self.reply(&ServerFrame::Error {
                    message: format!("Malformed frame: {e}"),
                });
            }
        }
    }

    fn subscribe(&mut self, topic: Topic) {
        if self.forwards.contains_key(&topic) {
            return;
        }
        let rx = match self.channels.subscribe(&topic) {
            Ok(rx) => rx,
            Err(e) => {
                self.reply(&ServerFrame::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        // A late joiner first hears about everyone already present.
        for snapshot in self.channels.presence_sync(&topic) {
            self.reply(&ServerFrame::Event {
                topic,
                event: ChannelEvent::PresenceTrack { snapshot },
            });
        }

        let forward = tokio::spawn(forward_topic(
            topic,
            rx,
            self.outbound.clone(),
            self.conn_id.clone(),
        ));
        self.forwards.insert(topic, forward);
        tracing::debug!(conn_id = %self.conn_id, %topic, "Subscribed");
    }

    fn publish(&mut self, topic: Topic, event: ChannelEvent) {
        match &event {
            ChannelEvent::PresenceTrack { snapshot } => {
                self.tracked.insert((topic, snapshot.user_id));
            }
            ChannelEvent::PresenceLeave { user_id } => {
                self.tracked.remove(&(topic, *user_id));
            }
            _ => {
                self.reply(&ServerFrame::Error {
                    message: "Only presence events can be published".into(),
                });
                return;
            }
        }
        if let Err(e) = self.channels.publish(&topic, event) {
            self.reply(&ServerFrame::Error {
                message: e.to_string(),
            });
        }
    }

    fn reply(&self, frame: &ServerFrame) {
        send_frame(&self.outbound, frame, &self.conn_id);
    }

    fn close(self) {
        for forward in self.forwards.into_values() {
            forward.abort();
        }
        for (topic, user_id) in self.tracked {
            if let Err(e) = self
                .channels
                .publish(&topic, ChannelEvent::PresenceLeave { user_id })
            {
                tracing::debug!(%topic, %user_id, error = %e, "Leave on disconnect dropped");
            }
        }
    }
}

/// Relay one topic to the connection until either side goes away.
async fn forward_topic(
    topic: Topic,
    mut rx: broadcast::Receiver<ChannelEvent>,
    outbound: WsSender,
    conn_id: String,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if !send_frame(&outbound, &ServerFrame::Event { topic, event }, &conn_id) {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(conn_id = %conn_id, %topic, skipped, "Push forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Queue a frame for the socket. Returns `false` once the connection is gone.
fn send_frame(outbound: &WsSender, frame: &ServerFrame, conn_id: &str) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => outbound.send(Message::Text(json.into())).is_ok(),
        Err(e) => {
            tracing::error!(conn_id = %conn_id, error = %e, "Failed to encode push frame");
            true
        }
    }
}
