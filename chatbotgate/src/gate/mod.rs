//!
//! The auth middleware: the dispatcher every request runs through.
//!
//! One [`AuthGate`] is an immutable snapshot built from one config
//! snapshot. The supervisor publishes gates atomically; a request keeps
//! the gate it entered with for its whole lifetime.
//!

mod assets;
mod health;
mod routes;
mod security;

pub(crate) use health::{Health, Phase};

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tower::util::ServiceExt;
use tower_cookies::cookie::time::{Duration as CookieDuration, OffsetDateTime};
use tower_cookies::cookie::SameSite;
use tower_cookies::{Cookie, Cookies};

use crate::authz::AccessList;
use crate::config::{Config, CookieConfig, SameSitePolicy};
use crate::constants::{STATE_COOKIE_NAME, STATE_COOKIE_TTL};
use crate::email::{EmailAuth, EmailSender};
use crate::forward::Forwarder;
use crate::i18n::Translator;
use crate::kv::KvStore;
use crate::oauth::{ProviderSet, StatePayload};
use crate::pages::{LoginView, MessagePage, PageRenderer, ProviderLink};
use crate::proxy::ProxySupervisor;
use crate::ratelimit::RateLimiter;
use crate::rules::PathRules;
use crate::session::{Session, SessionStore};

/// Everything one snapshot's handlers share.
pub(crate) struct GateInner {
    pub(crate) base_url: String,
    pub(crate) prefix: String,
    pub(crate) cookie: CookieConfig,
    pub(crate) session_ttl: std::time::Duration,
    pub(crate) translator: Arc<Translator>,
    pub(crate) renderer: Arc<PageRenderer>,
    pub(crate) rules: PathRules,
    pub(crate) access: Arc<AccessList>,
    pub(crate) providers: ProviderSet,
    pub(crate) email: Option<EmailAuth>,
    pub(crate) password: Option<String>,
    pub(crate) sessions: SessionStore,
    pub(crate) forwarder: Forwarder,
    pub(crate) health: Health,
    pub(crate) proxy: Arc<ProxySupervisor>,
}

pub(crate) type AppState = Arc<GateInner>;

/// A plain `302 Found`. Values reaching this helper have been sanitized
/// into valid header content.
pub(crate) fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

impl GateInner {
    /// Page/email language for this request.
    pub(crate) fn lang(&self, headers: &HeaderMap) -> String {
        let accept = headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok());
        self.translator.resolve_lang(accept)
    }

    /// Render one of the uniform result pages with `status`.
    pub(crate) fn page(
        &self,
        lang: &str,
        page: MessagePage,
        status: StatusCode,
        redirect: &str,
    ) -> Response {
        let html = self
            .renderer
            .message_page(&self.translator, lang, page, redirect);
        (status, Html(html)).into_response()
    }

    /// 302 to the login page, carrying the original target.
    pub(crate) fn login_redirect(&self, original: &str) -> Response {
        let encoded = utf8_percent_encode(original, NON_ALPHANUMERIC).to_string();
        found(&format!("{}/login?redirect={}", self.prefix, encoded))
    }

    /// Providers as the login page shows them.
    pub(crate) fn provider_links(&self) -> Vec<ProviderLink> {
        self.providers
            .iter()
            .map(|p| ProviderLink {
                id: p.id().to_string(),
                label: p.label().to_string(),
                icon: p.kind().icon(),
            })
            .collect()
    }

    pub(crate) fn login_view(&self, redirect: &str, error: Option<String>) -> LoginView {
        LoginView {
            providers: self.provider_links(),
            email_enabled: self.email.is_some(),
            password_enabled: self.password.is_some(),
            redirect: redirect.to_string(),
            error,
        }
    }

    /// The OAuth2 callback URL the provider redirects back to.
    pub(crate) fn oauth_redirect_uri(&self) -> String {
        format!("{}{}/oauth2/callback", self.base_url, self.prefix)
    }

    fn same_site(&self) -> SameSite {
        match self.cookie.same_site {
            SameSitePolicy::Lax => SameSite::Lax,
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::None => SameSite::None,
        }
    }

    /// Create the session record, persist it, and set the cookie.
    pub(crate) async fn create_session(
        &self,
        cookies: &Cookies,
        email: &str,
        display_name: &str,
        provider: &str,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Session, crate::session::SessionError> {
        let mut session = Session::new(email, display_name, provider, self.session_ttl);
        session.extra = extra;
        self.sessions.set(&session).await?;

        let mut cookie = Cookie::new(self.cookie.name.clone(), session.id.clone());
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_secure(self.cookie.secure);
        cookie.set_same_site(self.same_site());
        let ttl = CookieDuration::seconds(self.session_ttl.as_secs() as i64);
        cookie.set_max_age(ttl);
        cookie.set_expires(OffsetDateTime::now_utc() + ttl);
        cookies.add(cookie);

        tracing::info!(email = %session.email, provider = %session.provider, "session created");
        Ok(session)
    }

    /// Expire the session cookie in the browser.
    pub(crate) fn clear_session_cookie(&self, cookies: &Cookies) {
        let mut cookie = Cookie::new(self.cookie.name.clone(), "");
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_max_age(CookieDuration::ZERO);
        cookies.add(cookie);
    }

    /// Issue the short-lived OAuth2 state cookie.
    pub(crate) fn set_state_cookie(&self, cookies: &Cookies, payload: &StatePayload) {
        let mut cookie = Cookie::new(STATE_COOKIE_NAME, payload.encode());
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_secure(self.cookie.secure);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_max_age(CookieDuration::seconds(STATE_COOKIE_TTL.as_secs() as i64));
        cookies.add(cookie);
    }

    /// Read and consume the state cookie, whatever the outcome.
    pub(crate) fn take_state_cookie(&self, cookies: &Cookies) -> Option<StatePayload> {
        let cookie = cookies.get(STATE_COOKIE_NAME)?;
        let payload = StatePayload::decode(cookie.value());
        let mut removal = Cookie::new(STATE_COOKIE_NAME, "");
        removal.set_path("/");
        cookies.remove(removal);
        payload
    }

    /// Session id presented by the browser, if any.
    pub(crate) fn session_id(&self, cookies: &Cookies) -> Option<String> {
        cookies
            .get(&self.cookie.name)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Hourly housekeeping for rate-limit buckets that fell out of use. The
/// task ends itself once the gate's store is closed.
fn spawn_bucket_janitor(limiter: RateLimiter) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match limiter
                .cleanup(std::time::Duration::from_secs(24 * 3600))
                .await
            {
                Ok(dropped) if dropped > 0 => {
                    tracing::debug!(dropped, "stale rate-limit buckets removed")
                }
                Ok(_) => {}
                Err(crate::kv::KvError::Closed) => return,
                Err(error) => tracing::debug!(%error, "rate-limit cleanup failed"),
            }
        }
    });
}

/// One published middleware snapshot.
pub struct AuthGate {
    router: axum::Router,
    state: AppState,
    /// Root KV handle; closing it tears down every namespaced view.
    store_root: KvStore,
}

impl AuthGate {
    /// Build a gate from a validated config snapshot. New KV stores are
    /// opened here; the previous snapshot keeps its own until torn down.
    pub async fn build(config: &Config, proxy: Arc<ProxySupervisor>) -> anyhow::Result<Self> {
        let prefix = config.auth.normalized_prefix();
        let health = Health::starting();

        let translator = Arc::new(Translator::new(&config.service.language));
        let renderer = Arc::new(PageRenderer::new(&config.service.name, &prefix));
        let access = Arc::new(AccessList::new(&config.auth.allowlist));

        // Everything fallible that needs no I/O happens before any store
        // is opened, so a rejected build never strands a sweeper.
        let rules = PathRules::compile(&config.rules)
            .map_err(|errors| anyhow::anyhow!("rules: {}", errors.join("; ")))?;
        let providers = ProviderSet::from_configs(&config.auth.providers)
            .map_err(|errors| anyhow::anyhow!("providers: {}", errors.join("; ")))?;
        let forwarder = Forwarder::new(&config.forwarding)
            .map_err(|e| anyhow::anyhow!("forwarding: {e}"))?;
        let sender = match &config.auth.email {
            Some(email_config) if email_config.enabled => Some(
                EmailSender::from_config(&email_config.sender)
                    .map_err(|e| anyhow::anyhow!("email sender: {e}"))?,
            ),
            _ => None,
        };

        let store_root = KvStore::open_with_sweep(
            &config.store.backend,
            config.store.sweep_interval(),
            "session",
        )
        .await
        .map_err(|e| anyhow::anyhow!("opening kv store: {e}"))?;
        let sessions = SessionStore::new(store_root.clone());

        let email = match (&config.auth.email, sender) {
            (Some(email_config), Some(sender)) => {
                let limiter = RateLimiter::new(
                    store_root.with_namespace("ratelimit"),
                    email_config.rate_limit.capacity,
                    email_config.rate_limit.interval(),
                );
                spawn_bucket_janitor(limiter.clone());
                Some(EmailAuth::new(
                    store_root.with_namespace("email_token"),
                    store_root.with_namespace("email_otp"),
                    limiter,
                    Arc::clone(&access),
                    Arc::new(sender),
                    Arc::clone(&translator),
                    Arc::clone(&renderer),
                    &config.service.base_url,
                    &prefix,
                    email_config.token_ttl(),
                    &config.auth.cookie.secret,
                ))
            }
            _ => None,
        };

        let state: AppState = Arc::new(GateInner {
            base_url: config.service.base_url.trim_end_matches('/').to_string(),
            prefix: prefix.clone(),
            cookie: config.auth.cookie.clone(),
            session_ttl: config.auth.cookie.session_ttl(),
            translator,
            renderer,
            rules,
            access,
            providers,
            email,
            password: config.auth.password.as_ref().map(|p| p.password.clone()),
            sessions,
            forwarder,
            health: health.clone(),
            proxy,
        });

        let router = routes::create_router(state.clone(), &prefix);

        health.set(Phase::Ready);
        Ok(Self {
            router,
            state,
            store_root,
        })
    }

    /// Dispatch one request through this snapshot.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        match self.router.clone().oneshot(req).await {
            Ok(response) => response,
            // The router's error type is Infallible.
            Err(never) => match never {},
        }
    }

    #[cfg(test)]
    pub(crate) fn router(&self) -> axum::Router {
        self.router.clone()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> AppState {
        self.state.clone()
    }

    #[cfg(test)]
    pub(crate) fn health(&self) -> &Health {
        &self.state.health
    }

    /// Flip readiness off ahead of shutdown or supersession.
    pub fn start_draining(&self) {
        self.state.health.set(Phase::Draining);
    }

    /// Release owned resources (stores and their sweepers).
    pub async fn close(&self) {
        self.store_root.close().await;
    }
}
