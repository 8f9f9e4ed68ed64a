//! Client-side coordination engine for tandem focus sessions.
//!
//! [`SessionController`] is the entry point: it owns the timer, the
//! presence broadcaster and the match heartbeat monitor of the current
//! session, and talks to the server through [`tandem_core::remote`] and,
//! for push topics, [`WsChannels`].

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod lifecycle;
pub mod presence;
pub mod tasks;
pub mod teardown;
pub mod timer;
pub mod ws;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use http::HttpRemote;
pub use lifecycle::{ControllerEvent, Phase, SessionController, SessionOutcome, SessionView};
pub use presence::{PresenceBroadcaster, PresenceProfile};
pub use ws::{ReconnectConfig, WsChannels};
