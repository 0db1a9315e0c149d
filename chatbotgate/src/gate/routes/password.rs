use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use tower_cookies::Cookies;

use crate::gate::security::sanitize_redirect;
use crate::gate::AppState;

/// The fixed identity shared-password logins run under.
const PASSWORD_IDENTITY: &str = "password@localhost";

#[derive(Debug, Deserialize)]
pub(crate) struct PasswordForm {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    redirect: Option<String>,
}

/// `POST <prefix>/password/login` — shared-password auth, JSON in and out.
pub(crate) async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<PasswordForm>,
) -> Response {
    let Some(expected) = &state.password else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(submitted) = form.password else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "password is required"})),
        )
            .into_response();
    };

    if submitted != *expected {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    let redirect = sanitize_redirect(form.redirect.as_deref());
    let created = state
        .create_session(
            &cookies,
            PASSWORD_IDENTITY,
            "",
            "password",
            serde_json::Map::new(),
        )
        .await;
    match created {
        Ok(_) => Json(serde_json::json!({"redirect_url": redirect})).into_response(),
        Err(error) => {
            tracing::error!(%error, "session creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}
