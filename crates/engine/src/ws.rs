//! Push channels over the server's `/ws` endpoint.
//!
//! [`WsChannels`] mirrors the server's topics into a local [`ChannelHub`]:
//! subscribing locally also subscribes the connection, events the server
//! forwards are republished locally, and presence the engine publishes is
//! sent up and comes back through the same forward. When the connection
//! drops it is re-established with exponential backoff and every topic is
//! subscribed again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tandem_core::presence::PresenceSnapshot;
use tandem_events::{ChannelError, ChannelEvent, ChannelHub, ClientFrame, PushChannels, ServerFrame, Topic};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineResult;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How often topics nobody listens to locally are unsubscribed.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// The delay after `current`, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Retry `url` with backoff until it connects or `cancel` fires.
async fn reconnect_loop(
    url: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<WsStream> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(url, attempt, "Reconnecting push connection");
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(url, "Push reconnect cancelled");
                return None;
            }
            result = open(url) => match result {
                Ok(stream) => {
                    tracing::info!(url, attempt, "Push connection restored");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "Reconnect attempt {attempt} failed");
                }
            }
        }

        delay = next_delay(delay, config);
    }
}

// ---------------------------------------------------------------------------
// WsChannels
// ---------------------------------------------------------------------------

struct Shared {
    url: String,
    local: ChannelHub,
    topics: Mutex<HashSet<Topic>>,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, HashSet<Topic>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_text(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Event { topic, event }) => {
                if let Err(e) = self.local.publish(&topic, event) {
                    tracing::debug!(%topic, error = %e, "Pushed event dropped");
                }
            }
            Ok(ServerFrame::Error { message }) => {
                tracing::warn!(url = %self.url, message, "Push server rejected a frame");
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Malformed push frame");
            }
        }
    }

    /// Forget topics with no local state left; returns the ones to
    /// unsubscribe upstream.
    fn prune(&self) -> Vec<Topic> {
        self.local.prune();
        let mut topics = self.topics();
        let gone: Vec<Topic> = topics
            .iter()
            .filter(|topic| !self.local.has_topic(topic))
            .copied()
            .collect();
        for topic in &gone {
            topics.remove(topic);
        }
        gone
    }
}

/// [`PushChannels`] backed by a live push connection to `tandem-api`.
///
/// Dropping it closes the connection; local subscribers then observe
/// `RecvError::Closed`.
pub struct WsChannels {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WsChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannels").finish_non_exhaustive()
    }
}

impl WsChannels {
    /// Connect to the push endpoint of the API at `api_url`.
    pub async fn connect(api_url: &str) -> EngineResult<Self> {
        Self::connect_with(api_url, ReconnectConfig::default()).await
    }

    pub async fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        Self::connect(&config.api_url).await
    }

    pub async fn connect_with(api_url: &str, reconnect: ReconnectConfig) -> EngineResult<Self> {
        let url = push_url(api_url);
        let stream = open(&url).await?;
        tracing::info!(url = %url, "Push connection established");

        let shared = Arc::new(Shared {
            url,
            local: ChannelHub::default(),
            topics: Mutex::new(HashSet::new()),
        });
        let (outbound, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(shared.clone(), stream, rx, reconnect, cancel.clone()));

        Ok(Self {
            shared,
            outbound,
            cancel,
        })
    }

    /// Topics currently subscribed upstream.
    pub fn topic_count(&self) -> usize {
        self.shared.topics().len()
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.outbound.send(frame).map_err(|_| ChannelError::Closed)
    }
}

impl PushChannels for WsChannels {
    fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<ChannelEvent>, ChannelError> {
        let rx = self.shared.local.subscribe(topic)?;
        if self.shared.topics().insert(*topic) {
            self.send(ClientFrame::Subscribe { topic: *topic })?;
        }
        Ok(rx)
    }

    /// Sent upstream only. The server forwards it back on the topic, so
    /// local subscribers see it in the same order as everyone else.
    fn publish(&self, topic: &Topic, event: ChannelEvent) -> Result<(), ChannelError> {
        self.send(ClientFrame::Publish {
            topic: *topic,
            event,
        })
    }

    fn presence_sync(&self, topic: &Topic) -> Vec<PresenceSnapshot> {
        self.shared.local.presence_sync(topic)
    }
}

impl Drop for WsChannels {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// `http(s)://host/` to `ws(s)://host/api/v1/ws`.
pub fn push_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/api/v1/ws")
}

async fn open(url: &str) -> Result<WsStream, ChannelError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| ChannelError::Connection(format!("Failed to connect to {url}: {e}")))?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum Ended {
    Stopped,
    Dropped,
}

async fn run(
    shared: Arc<Shared>,
    mut stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    loop {
        match pump(&shared, &mut stream, &mut outbound, &cancel).await {
            Ended::Stopped => {
                let _ = stream.close(None).await;
                break;
            }
            Ended::Dropped => {
                tracing::warn!(url = %shared.url, "Push connection dropped");
                match reconnect_loop(&shared.url, &reconnect, &cancel).await {
                    Some(restored) => stream = restored,
                    None => break,
                }
            }
        }
    }
    shared.local.shutdown();
    tracing::info!(url = %shared.url, "Push connection closed");
}

/// Drive one connection until it drops or the channels are dropped.
async fn pump(
    shared: &Shared,
    stream: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    cancel: &CancellationToken,
) -> Ended {
    // Frames queued while disconnected follow; the server ignores repeats.
    let topics: Vec<Topic> = shared.topics().iter().copied().collect();
    for topic in topics {
        if send(stream, &ClientFrame::Subscribe { topic }).await.is_err() {
            return Ended::Dropped;
        }
    }

    let mut prune = tokio::time::interval_at(
        tokio::time::Instant::now() + PRUNE_INTERVAL,
        PRUNE_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ended::Stopped,
            frame = outbound.recv() => {
                let Some(frame) = frame else { return Ended::Stopped };
                if send(stream, &frame).await.is_err() {
                    return Ended::Dropped;
                }
            }
            _ = prune.tick() => {
                for topic in shared.prune() {
                    if send(stream, &ClientFrame::Unsubscribe { topic }).await.is_err() {
                        return Ended::Dropped;
                    }
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.on_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(url = %shared.url, ?frame, "Push server closed the connection");
                    return Ended::Dropped;
                }
                Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(url = %shared.url, error = %e, "Push receive error");
                    return Ended::Dropped;
                }
                None => return Ended::Dropped,
            }
        }
    }
}

async fn send(stream: &mut WsStream, frame: &ClientFrame) -> Result<(), ChannelError> {
    let json = serde_json::to_string(frame)
        .map_err(|e| ChannelError::Connection(format!("Failed to encode frame: {e}")))?;
    stream
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ChannelError::Connection(e.to_string()))
}
