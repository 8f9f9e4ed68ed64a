//! The engine's HTTP client against a live server on a loopback port.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tandem_api::state::AppState;
use tandem_core::clock::SystemClock;
use tandem_core::matching::{BrokenReason, MatchAssignment};
use tandem_core::remote::{Beacon, BeaconRequest, RemoteError, RemoteProcedures};
use tandem_core::session::{SessionMode, SessionStatus};
use tandem_core::types::{new_id, DbId};
use tandem_engine::{
    ControllerEvent, EngineConfig, HttpRemote, PresenceProfile, SessionController,
    SessionOutcome, WsChannels,
};
use tandem_events::{ChannelHub, PushChannels, Topic};
use tokio::sync::broadcast;

use common::{build_test_app, test_state};

/// Serve the app on an ephemeral port.
///
/// Returns a client for it, the server's state and its base URL.
async fn serve_with_state() -> (HttpRemote, AppState, String) {
    let state = test_state();
    let app = build_test_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let url = format!("http://{addr}/");
    let remote = HttpRemote::new(url.clone(), Duration::from_secs(5)).unwrap();
    (remote, state, url)
}

async fn serve() -> HttpRemote {
    serve_with_state().await.0
}

/// A controller whose push topics travel over the server's `/ws` endpoint.
///
/// Polling and re-publishing are slowed far past the test's length, so
/// anything the clients learn from each other arrives by push.
async fn push_client(remote: &Arc<HttpRemote>, url: &str, name: &str) -> (SessionController, DbId) {
    let profile = PresenceProfile {
        user_id: new_id(),
        avatar_id: "owl".into(),
        display_name: name.into(),
        goal_text: "deep work".into(),
    };
    let user_id = profile.user_id;
    let channels = WsChannels::connect(url).await.unwrap();
    let config = EngineConfig {
        heartbeat_interval: Duration::from_secs(300),
        presence_interval: Duration::from_secs(300),
        ..EngineConfig::default()
    };
    let controller = SessionController::new(
        profile,
        remote.clone(),
        Arc::new(channels),
        remote.clone(),
        Arc::new(SystemClock),
        config,
    );
    (controller, user_id)
}

/// Poll `check` in real time until it holds.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn next_event<F>(rx: &mut broadcast::Receiver<ControllerEvent>, mut pred: F) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    let seen = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("controller dropped"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), seen)
        .await
        .expect("event not pushed in time")
}

#[tokio::test]
async fn procedures_round_trip_over_http() {
    let remote = serve().await;
    let user_id = new_id();

    let id = remote
        .create_session(user_id, 25, SessionMode::Solo)
        .await
        .unwrap();
    let active = remote.transition_session_to_active(id).await.unwrap();
    assert_eq!(active.status, SessionStatus::Active);

    let again = remote.transition_session_to_active(id).await.unwrap();
    assert_eq!(again.started_at, active.started_at);

    remote.record_early_exit(id, user_id, 2, 25).await.unwrap();
    let closed = remote.fetch_session(id).await.unwrap();
    assert_eq!(closed.status, SessionStatus::Abandoned);
}

#[tokio::test]
async fn server_errors_arrive_as_rejections() {
    let remote = serve().await;

    assert_matches!(
        remote.fetch_session(new_id()).await,
        Err(RemoteError::Rejected { status: 404, .. })
    );
    assert_matches!(
        remote.create_session(new_id(), 0, SessionMode::Solo).await,
        Err(RemoteError::Rejected { status: 400, .. })
    );
}

#[tokio::test]
async fn beacons_are_delivered_without_being_awaited() {
    let remote = serve().await;
    let user_id = new_id();
    let id = remote
        .create_session(user_id, 25, SessionMode::Solo)
        .await
        .unwrap();

    remote.send(BeaconRequest::AbandonSession { session_id: id });
    remote.send(BeaconRequest::LeaveSession {
        session_id: id,
        user_id,
    });

    let mut status = SessionStatus::Waiting;
    for _ in 0..100 {
        status = remote.fetch_session(id).await.unwrap().status;
        if status == SessionStatus::Abandoned {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, SessionStatus::Abandoned);
}

#[tokio::test]
async fn controller_runs_a_solo_session_over_http() {
    let remote = Arc::new(serve().await);
    let profile = PresenceProfile {
        user_id: new_id(),
        avatar_id: "owl".into(),
        display_name: "Ada".into(),
        goal_text: "inbox zero".into(),
    };
    let controller = SessionController::new(
        profile,
        remote.clone(),
        Arc::new(ChannelHub::default()),
        remote.clone(),
        Arc::new(SystemClock),
        EngineConfig::default(),
    );

    let session = controller.start(25).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);

    let outcome = controller.finish_now(true).await.unwrap();
    assert_matches!(outcome, SessionOutcome::Completed(_));
    let row = remote.fetch_session(session.id).await.unwrap();
    assert_eq!(row.status, SessionStatus::Completed);
}

#[tokio::test]
async fn duo_partners_meet_and_break_over_push_channels() {
    let (remote, state, url) = serve_with_state().await;
    let remote = Arc::new(remote);
    let (ada, ada_id) = push_client(&remote, &url, "Ada").await;
    let (bo, bo_id) = push_client(&remote, &url, "Bo").await;

    let m = state
        .procedures
        .pair_users(ada_id, bo_id, 25, "rainy_cafe")
        .await
        .unwrap();
    let assignment = MatchAssignment::from(&m);
    let on_server = |user_id: DbId| {
        state
            .channels
            .presence_sync(&Topic::Session(assignment.session_id))
            .iter()
            .any(|s| s.user_id == user_id)
    };
    let mut ada_events = ada.subscribe();
    let mut bo_events = bo.subscribe();

    // Each client's presence reaching the server also means its topic
    // subscriptions, sent before it, are in place.
    ada.join_match(assignment.clone()).unwrap();
    eventually(|| on_server(ada_id)).await;
    bo.join_match(assignment.clone()).unwrap();
    eventually(|| on_server(bo_id)).await;

    eventually(|| ada.partner().is_some() && bo.partner().is_some()).await;
    assert_eq!(ada.partner().map(|s| s.user_id), Some(bo_id));
    assert_eq!(bo.partner().map(|s| s.display_name), Some("Ada".to_string()));

    let first = ada.mark_ready().await.unwrap();
    assert!(!first.both_ready);
    let second = bo.mark_ready().await.unwrap();
    assert!(second.both_ready);
    next_event(&mut ada_events, |e| matches!(e, ControllerEvent::Active { .. })).await;

    remote
        .break_match(m.id, BrokenReason::PartnerTimeout)
        .await
        .unwrap();
    for events in [&mut ada_events, &mut bo_events] {
        let broken = next_event(events, |e| matches!(e, ControllerEvent::MatchBroken { .. })).await;
        assert_matches!(
            broken,
            ControllerEvent::MatchBroken {
                reason: BrokenReason::PartnerTimeout
            }
        );
    }
}
