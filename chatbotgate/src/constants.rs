//! Shared defaults and limits.

use std::time::Duration;

/// URL path segment namespacing all authentication endpoints.
pub const DEFAULT_AUTH_PREFIX: &str = "/_auth";

/// Name of the session cookie unless overridden in the config.
pub const DEFAULT_SESSION_COOKIE: &str = "chatbotgate_session";

/// Name of the short-lived OAuth2 CSRF state cookie.
pub const STATE_COOKIE_NAME: &str = "chatbotgate_oauth2_state";

/// The state cookie only has to survive one round-trip to the provider.
pub const STATE_COOKIE_TTL: Duration = Duration::from_secs(10 * 60);

/// Session lifetime unless overridden in the config.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Magic-link token lifetime unless overridden in the config.
pub const DEFAULT_EMAIL_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Per-call deadline for key-value store operations. A slow store must not
/// stall request handling.
pub const KV_OP_TIMEOUT: Duration = Duration::from_millis(100);

/// Interval between background expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Hard cap for any header value emitted toward the upstream.
pub const HEADER_VALUE_MAX_BYTES: usize = 8192;

/// Canonical identity headers used by existing deployments.
pub const USER_HEADER: &str = "X-ChatbotGate-User";
pub const EMAIL_HEADER: &str = "X-ChatbotGate-Email";

/// Debounce window for config file change notifications.
pub const DEFAULT_WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Grace delay before a superseded middleware's stores are torn down.
pub const RELOAD_TEARDOWN_GRACE: Duration = Duration::from_secs(30);
