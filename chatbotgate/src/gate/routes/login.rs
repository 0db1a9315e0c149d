use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;

use crate::gate::security::sanitize_redirect;
use crate::gate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct LoginQuery {
    #[serde(default)]
    redirect: Option<String>,
}

/// `GET <prefix>/login` — the provider chooser.
pub(crate) async fn login_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Response {
    let lang = state.lang(&headers);
    let redirect = sanitize_redirect(query.redirect.as_deref());
    let view = state.login_view(&redirect, None);
    Html(
        state
            .renderer
            .login_page(&state.translator, &lang, &view),
    )
    .into_response()
}
