//! The `/api/v1/ws` push endpoint, driven by a plain WebSocket client.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use tandem_api::state::AppState;
use tandem_core::matching::{BrokenReason, MatchState};
use tandem_core::presence::{PresenceSnapshot, PresenceStatus};
use tandem_core::remote::RemoteProcedures;
use tandem_core::types::{new_id, DbId};
use tandem_events::{ChannelEvent, ClientFrame, PushChannels, ServerFrame, Topic};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{build_test_app, test_state};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (AppState, String) {
    let state = test_state();
    let app = build_test_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr.to_string())
}

async fn connect(addr: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/api/v1/ws")).await.unwrap();
    client
}

async fn send(client: &mut Client, frame: ClientFrame) {
    let json = serde_json::to_string(&frame).unwrap();
    client.send(Message::Text(json.into())).await.unwrap();
}

/// Next JSON frame from the server, skipping pings.
async fn recv(client: &mut Client) -> ServerFrame {
    let next = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("unexpected push message: {other:?}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .expect("no push frame in time")
}

fn snapshot(user_id: DbId) -> PresenceSnapshot {
    PresenceSnapshot {
        user_id,
        avatar_id: "fox".into(),
        display_name: "Cy".into(),
        status: PresenceStatus::Active,
        goal_text: "draft chapter two".into(),
        last_heartbeat: 0,
    }
}

/// Subscribe and wait until the server is forwarding `topic`.
///
/// A presence publish on the topic comes back once the forward is live.
async fn subscribed(client: &mut Client, topic: Topic) -> DbId {
    let user_id = new_id();
    send(client, ClientFrame::Subscribe { topic }).await;
    send(
        client,
        ClientFrame::Publish {
            topic,
            event: ChannelEvent::PresenceTrack {
                snapshot: snapshot(user_id),
            },
        },
    )
    .await;
    assert_matches!(
        recv(client).await,
        ServerFrame::Event { event: ChannelEvent::PresenceTrack { snapshot }, .. }
            if snapshot.user_id == user_id
    );
    user_id
}

#[tokio::test]
async fn subscribed_connection_receives_match_changes() {
    let (state, addr) = serve().await;
    let m = state
        .procedures
        .pair_users(new_id(), new_id(), 25, "rainy_cafe")
        .await
        .unwrap();
    let topic = Topic::Match(m.id);

    let mut client = connect(&addr).await;
    subscribed(&mut client, topic).await;

    state
        .procedures
        .break_match(m.id, BrokenReason::UserExit)
        .await
        .unwrap();

    let frame = recv(&mut client).await;
    assert_eq!(
        frame,
        ServerFrame::Event {
            topic,
            event: ChannelEvent::MatchUpdated {
                match_id: m.id,
                state: MatchState::Broken,
                broken_reason: Some(BrokenReason::UserExit),
            },
        }
    );
}

#[tokio::test]
async fn late_subscriber_hears_who_is_present() {
    let (_state, addr) = serve().await;
    let topic = Topic::Session(new_id());

    let mut first = connect(&addr).await;
    let cy = subscribed(&mut first, topic).await;

    let mut second = connect(&addr).await;
    send(&mut second, ClientFrame::Subscribe { topic }).await;
    assert_matches!(
        recv(&mut second).await,
        ServerFrame::Event { event: ChannelEvent::PresenceTrack { snapshot }, .. }
            if snapshot.user_id == cy
    );
}

#[tokio::test]
async fn disconnect_publishes_a_leave_for_tracked_presence() {
    let (state, addr) = serve().await;
    let topic = Topic::Session(new_id());

    let mut leaving = connect(&addr).await;
    let cy = subscribed(&mut leaving, topic).await;
    let mut watching = connect(&addr).await;
    send(&mut watching, ClientFrame::Subscribe { topic }).await;
    assert_matches!(recv(&mut watching).await, ServerFrame::Event { .. });

    leaving.close(None).await.unwrap();

    assert_eq!(
        recv(&mut watching).await,
        ServerFrame::Event {
            topic,
            event: ChannelEvent::PresenceLeave { user_id: cy },
        }
    );
    assert!(state.channels.presence_sync(&topic).is_empty());
}

#[tokio::test]
async fn clients_may_only_publish_presence() {
    let (_state, addr) = serve().await;
    let mut client = connect(&addr).await;
    let match_id = new_id();

    send(
        &mut client,
        ClientFrame::Publish {
            topic: Topic::Match(match_id),
            event: ChannelEvent::MatchUpdated {
                match_id,
                state: MatchState::Broken,
                broken_reason: None,
            },
        },
    )
    .await;
    assert_matches!(recv(&mut client).await, ServerFrame::Error { .. });
}

#[tokio::test]
async fn malformed_frames_are_answered_with_an_error() {
    let (_state, addr) = serve().await;
    let mut client = connect(&addr).await;

    client
        .send(Message::Text("{\"op\":\"shout\"}".to_string().into()))
        .await
        .unwrap();
    assert_matches!(
        recv(&mut client).await,
        ServerFrame::Error { message } if message.starts_with("Malformed frame")
    );
}

#[tokio::test]
async fn health_counts_open_push_connections() {
    let (state, addr) = serve().await;
    let mut client = connect(&addr).await;
    subscribed(&mut client, Topic::Session(new_id())).await;
    assert_eq!(state.ws_manager.connection_count().await, 1);

    client.close(None).await.unwrap();
    for _ in 0..500 {
        if state.ws_manager.connection_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection still registered after close");
}
