use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use serde::Deserialize;
use tower_cookies::Cookies;

use crate::email::EmailAuthError;
use crate::gate::security::{sanitize_redirect, validate_email};
use crate::gate::AppState;
use crate::pages::MessagePage;

#[derive(Debug, Deserialize)]
pub(crate) struct SendForm {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    redirect: Option<String>,
}

/// `POST <prefix>/email/send` — issue and mail a login link.
pub(crate) async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<SendForm>,
) -> Response {
    let lang = state.lang(&headers);
    let Some(email_auth) = &state.email else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Malformed input gets the same page as a disallowed address: no
    // signal distinguishes "bad syntax" from "not invited".
    let Some(email) = form.email.as_deref().and_then(validate_email) else {
        return state.page(&lang, MessagePage::Forbidden, StatusCode::OK, "/");
    };
    let redirect = sanitize_redirect(form.redirect.as_deref());

    match email_auth.send_login_link(&email, &redirect, &lang).await {
        Ok(()) => crate::gate::found(&format!("{}/email/sent", state.prefix)),
        Err(EmailAuthError::NotAuthorized) => {
            state.page(&lang, MessagePage::Forbidden, StatusCode::OK, "/")
        }
        Err(EmailAuthError::RateLimited) => {
            state.page(&lang, MessagePage::RateLimited, StatusCode::OK, "/")
        }
        Err(error) => {
            tracing::error!(%error, "login link issuance failed");
            state.page(&lang, MessagePage::Internal, StatusCode::INTERNAL_SERVER_ERROR, "/")
        }
    }
}

/// `GET <prefix>/email/sent` — confirmation after a successful send.
pub(crate) async fn sent(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let lang = state.lang(&headers);
    let html = state
        .renderer
        .message_page(&state.translator, &lang, MessagePage::EmailSent, "/");
    Html(html).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct VerifyQuery {
    #[serde(default)]
    token: Option<String>,
}

/// `GET <prefix>/email/verify?token=…` — redeem a magic link.
pub(crate) async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: Cookies,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let Some(token) = query.token else {
        let lang = state.lang(&headers);
        return state.page(&lang, MessagePage::LinkInvalid, StatusCode::OK, "/");
    };
    let outcome = match &state.email {
        Some(email_auth) => email_auth.verify_token(&token).await,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    finish_redemption(state, headers, cookies, outcome).await
}

#[derive(Debug, Deserialize)]
pub(crate) struct OtpForm {
    #[serde(default)]
    otp: Option<String>,
}

/// `POST <prefix>/email/verify-otp` — redeem a hand-typed code.
pub(crate) async fn verify_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: Cookies,
    Form(form): Form<OtpForm>,
) -> Response {
    let Some(otp) = form.otp else {
        let lang = state.lang(&headers);
        return state.page(&lang, MessagePage::LinkInvalid, StatusCode::OK, "/");
    };
    let outcome = match &state.email {
        Some(email_auth) => email_auth.verify_otp(&otp).await,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    finish_redemption(state, headers, cookies, outcome).await
}

/// Shared tail of both redemption paths: session on success, the uniform
/// link page otherwise.
async fn finish_redemption(
    state: AppState,
    headers: HeaderMap,
    cookies: Cookies,
    outcome: Result<(String, String), EmailAuthError>,
) -> Response {
    let lang = state.lang(&headers);
    match outcome {
        Ok((email, redirect)) => {
            let created = state
                .create_session(&cookies, &email, "", "email", serde_json::Map::new())
                .await;
            match created {
                Ok(_) => crate::gate::found(&sanitize_redirect(Some(&redirect))),
                Err(error) => {
                    tracing::error!(%error, "session creation failed");
                    state.page(&lang, MessagePage::Internal, StatusCode::INTERNAL_SERVER_ERROR, "/")
                }
            }
        }
        Err(EmailAuthError::NotFound | EmailAuthError::AlreadyUsed) => {
            state.page(&lang, MessagePage::LinkInvalid, StatusCode::OK, "/")
        }
        Err(error) => {
            tracing::error!(%error, "token redemption failed");
            state.page(&lang, MessagePage::Internal, StatusCode::INTERNAL_SERVER_ERROR, "/")
        }
    }
}
