//! Push connections over WebSocket.
//!
//! Clients subscribe to `match:{id}` and `session:{id}` topics and publish
//! their own presence; every event the server publishes on a subscribed
//! topic is forwarded as a [`tandem_events::ServerFrame`].

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
