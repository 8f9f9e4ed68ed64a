use axum::routing::post;
use axum::Router;

use crate::handlers::beacon;
use crate::state::AppState;

/// Routes mounted at `/beacon/sessions`.
///
/// ```text
/// POST   /{id}/abandon                            -> abandon
/// POST   /{id}/participants/{user_id}/leave       -> leave
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/abandon", post(beacon::abandon))
        .route("/{id}/participants/{user_id}/leave", post(beacon::leave))
}
