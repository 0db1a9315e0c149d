mod email;
mod login;
mod logout;
mod oauth;
mod password;
mod proxy_pass;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use crate::pages::MessagePage;
use crate::rules::RuleAction;

/// Compose one snapshot's router: the internal endpoints under the auth
/// prefix, the protected fallback, and the rule gate in front of it all.
pub(crate) fn create_router(state: AppState, prefix: &str) -> Router {
    let auth_routes = Router::new()
        .route("/login", get(login::login_page))
        .route("/oauth2/start", get(oauth::start))
        .route("/oauth2/callback", get(oauth::callback))
        .route("/email/send", post(email::send))
        .route("/email/sent", get(email::sent))
        .route("/email/verify", get(email::verify))
        .route("/email/verify-otp", post(email::verify_otp))
        .route("/password/login", post(password::login))
        .route("/logout", get(logout::logout))
        .route("/assets/{*path}", get(super::assets::asset))
        .route("/health", get(super::health::health));

    Router::new()
        .nest(prefix, auth_routes)
        .fallback(proxy_pass::handle)
        .layer(middleware::from_fn_with_state(state.clone(), evaluate_rules))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Path rules run before anything else: a `deny` never reaches a handler
/// and an `allow` goes straight upstream with no identity attached.
async fn evaluate_rules(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match state.rules.evaluate(req.uri().path()) {
        RuleAction::Auth => next.run(req).await,
        RuleAction::Allow => proxy_pass::forward(state, req, None).await,
        RuleAction::Deny => {
            let lang = state.lang(req.headers());
            state.page(&lang, MessagePage::Denied, StatusCode::FORBIDDEN, "/")
        }
    }
}
