use std::sync::Arc;

use tandem_db::StoreProcedures;
use tandem_events::ChannelHub;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// Server side of the remote procedures.
    pub procedures: Arc<StoreProcedures>,
    /// Push channels every store change is published to.
    pub channels: Arc<ChannelHub>,
    pub config: Arc<ServerConfig>,
    /// Open push connections.
    pub ws_manager: Arc<WsManager>,
}
