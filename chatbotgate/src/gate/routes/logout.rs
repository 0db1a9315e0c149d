use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use tower_cookies::Cookies;

use crate::gate::AppState;

/// `GET <prefix>/logout` — destroy the server-side session and expire the
/// cookie.
pub(crate) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: Cookies,
) -> Response {
    if let Some(id) = state.session_id(&cookies) {
        if let Err(error) = state.sessions.delete(&id).await {
            // The cookie still gets cleared; the record expires on TTL.
            tracing::warn!(%error, "session delete on logout failed");
        }
    }
    state.clear_session_cookie(&cookies);

    let lang = state.lang(&headers);
    Html(state.renderer.logout_page(&state.translator, &lang)).into_response()
}
