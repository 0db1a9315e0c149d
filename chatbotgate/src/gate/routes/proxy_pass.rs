use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tower_cookies::Cookies;

use crate::gate::AppState;
use crate::pages::MessagePage;
use crate::session::Session;

/// Fallback for every path outside the auth prefix: resolve the session,
/// decorate the request with identity, hand it to the upstream.
pub(crate) async fn handle(
    State(state): State<AppState>,
    cookies: Cookies,
    req: Request,
) -> Response {
    let original = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let Some(id) = state.session_id(&cookies) else {
        return state.login_redirect(&original);
    };

    // A store failure fails closed: no provable session, no pass-through.
    let session = match state.sessions.get(&id).await {
        Ok(session) if session.is_valid() => session,
        Ok(_) | Err(_) => return state.login_redirect(&original),
    };

    forward(state, req, Some(session)).await
}

/// Shared upstream hand-off for authenticated and `allow`-rule traffic.
pub(crate) async fn forward(state: AppState, mut req: Request, session: Option<Session>) -> Response {
    let snapshot = state.proxy.forwarder();
    let Some(forwarder) = snapshot.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let headers = match &session {
        Some(session) => match state.forwarder.add_to_headers(req.headers(), session) {
            Ok(headers) => headers,
            Err(error) => {
                tracing::error!(%error, "identity header projection failed");
                let lang = state.lang(req.headers());
                return state.page(
                    &lang,
                    MessagePage::Internal,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "/",
                );
            }
        },
        None => req.headers().clone(),
    };

    // Query-parameter fields rewrite the request URI before forwarding.
    if let Some(session) = &session {
        if state.forwarder.has_query_fields() {
            match decorated_uri(&state, req.uri(), session) {
                Ok(uri) => *req.uri_mut() = uri,
                Err(error) => {
                    tracing::error!(%error, "identity query projection failed");
                    let lang = state.lang(req.headers());
                    return state.page(
                        &lang,
                        MessagePage::Internal,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "/",
                    );
                }
            }
        }
    }

    forwarder.forward(req, headers).await
}

fn decorated_uri(state: &AppState, uri: &Uri, session: &Session) -> anyhow::Result<Uri> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut scratch = url::Url::parse("http://upstream.invalid")?.join(path_and_query)?;
    state.forwarder.add_to_query(&mut scratch, session)?;
    let rebuilt = match scratch.query() {
        Some(query) => format!("{}?{}", scratch.path(), query),
        None => scratch.path().to_string(),
    };
    Ok(rebuilt.parse()?)
}
