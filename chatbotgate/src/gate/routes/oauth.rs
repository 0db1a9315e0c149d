use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tower_cookies::Cookies;

use crate::gate::security::sanitize_redirect;
use crate::gate::AppState;
use crate::oauth::{ProviderError, StatePayload};
use crate::pages::MessagePage;

#[derive(Debug, Deserialize)]
pub(crate) struct StartQuery {
    provider: String,
    #[serde(default)]
    redirect: Option<String>,
}

/// `GET <prefix>/oauth2/start` — issue the state cookie and bounce the
/// browser to the provider's consent page.
pub(crate) async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: Cookies,
    Query(query): Query<StartQuery>,
) -> Response {
    let lang = state.lang(&headers);
    let provider = match state.providers.get(&query.provider) {
        Ok(provider) => provider,
        Err(_) => {
            tracing::debug!(provider = %query.provider, "login with unknown provider");
            return state.page(&lang, MessagePage::OauthFailed, StatusCode::BAD_REQUEST, "/");
        }
    };

    let redirect = sanitize_redirect(query.redirect.as_deref());
    let payload = StatePayload::new(provider.id(), &redirect);
    state.set_state_cookie(&cookies, &payload);

    let url = provider.auth_url(&state.oauth_redirect_uri(), &payload.state);
    crate::gate::found(url.as_str())
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `GET <prefix>/oauth2/callback` — verify CSRF state, exchange the code,
/// admit the user.
pub(crate) async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: Cookies,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let lang = state.lang(&headers);
    let failed = |page| state.page(&lang, page, StatusCode::OK, "/");

    if let Some(error) = &query.error {
        tracing::debug!(%error, "provider returned an error on callback");
        // The state cookie is spent either way.
        let _ = state.take_state_cookie(&cookies);
        return failed(MessagePage::OauthFailed);
    }

    let Some(payload) = state.take_state_cookie(&cookies) else {
        tracing::debug!("oauth2 callback without a state cookie");
        return failed(MessagePage::OauthFailed);
    };
    let (Some(echoed_state), Some(code)) = (&query.state, &query.code) else {
        return failed(MessagePage::OauthFailed);
    };

    // Byte-exact: a single differing byte refuses the login before any
    // token endpoint call is made.
    if *echoed_state != payload.state {
        tracing::warn!(provider = %payload.provider, "oauth2 state mismatch");
        return failed(MessagePage::OauthFailed);
    }

    let provider = match state.providers.get(&payload.provider) {
        Ok(provider) => provider,
        Err(_) => return failed(MessagePage::OauthFailed),
    };

    let token = match provider.exchange(code, &state.oauth_redirect_uri()).await {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(provider = %payload.provider, %error, "code exchange failed");
            return failed(MessagePage::OauthFailed);
        }
    };

    let info = match provider.user_info(&token).await {
        Ok(info) => info,
        Err(ProviderError::EmailNotFound) => {
            tracing::info!(provider = %payload.provider, "no verified email, refusing login");
            return failed(MessagePage::Forbidden);
        }
        Err(error) => {
            tracing::warn!(provider = %payload.provider, %error, "userinfo failed");
            return failed(MessagePage::OauthFailed);
        }
    };

    if !state.access.is_allowed(&info.email) {
        tracing::info!(email = %info.email, "email not in allowlist");
        return failed(MessagePage::Forbidden);
    }

    let created = state
        .create_session(
            &cookies,
            &info.email,
            info.name.as_deref().unwrap_or_default(),
            &provider.session_provider(),
            info.extra,
        )
        .await;
    match created {
        Ok(_) => crate::gate::found(&sanitize_redirect(Some(&payload.redirect))),
        Err(error) => {
            tracing::error!(%error, "session creation failed");
            state.page(&lang, MessagePage::Internal, StatusCode::INTERNAL_SERVER_ERROR, "/")
        }
    }
}
