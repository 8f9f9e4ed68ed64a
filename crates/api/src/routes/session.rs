use axum::routing::{get, post};
use axum::Router;

use crate::handlers::session;
use crate::state::AppState;

/// Routes mounted at `/sessions`.
///
/// ```text
/// POST   /                       -> create
/// GET    /{id}                   -> get_by_id
/// GET    /{id}/participants      -> participants
/// POST   /{id}/activate          -> activate
/// POST   /{id}/complete          -> complete
/// POST   /{id}/early-exit        -> early_exit
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(session::create))
        .route("/{id}", get(session::get_by_id))
        .route("/{id}/participants", get(session::participants))
        .route("/{id}/activate", post(session::activate))
        .route("/{id}/complete", post(session::complete))
        .route("/{id}/early-exit", post(session::early_exit))
}
