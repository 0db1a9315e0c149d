//!
//! The configuration snapshot and its loader.
//!
//! Files are YAML or JSON, selected by extension. `${VAR}` and
//! `${VAR:-default}` are expanded from the environment before parsing.
//! Validation collects every problem so a broken file reports all of its
//! errors at once, at startup as well as on reload.
//!

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::constants::{
    DEFAULT_AUTH_PREFIX, DEFAULT_EMAIL_TOKEN_TTL, DEFAULT_SESSION_COOKIE, DEFAULT_SESSION_TTL,
};
use crate::email::EmailSenderConfig;
use crate::forward::ForwardingConfig;
use crate::kv::KvBackendConfig;
use crate::oauth::ProviderConfig;
use crate::rules::RuleConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    ConfigFileNotFound(PathBuf),
    #[error("config file could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file has unsupported extension {0:?} (expected .yml, .yaml or .json)")]
    UnsupportedExtension(String),
    #[error("config file is not valid: {0}")]
    Parse(String),
    #[error("configuration is invalid:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    /// Shown on login pages and in email subjects.
    pub name: String,
    /// External base URL, used to build login links in emails.
    pub base_url: String,
    /// Default page/email language when the request does not express one.
    pub language: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "ChatbotGate".to_string(),
            base_url: "http://localhost:8080".to_string(),
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_s: u64,
    pub write_timeout_s: u64,
    pub idle_timeout_s: u64,
    /// How long in-flight requests get to finish on shutdown.
    pub graceful_shutdown_s: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            read_timeout_s: 15,
            write_timeout_s: 15,
            idle_timeout_s: 60,
            graceful_shutdown_s: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SecretHeaderConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Root URL requests are forwarded to.
    pub url: Url,
    /// Optional shared-secret header injected into every upstream request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_header: Option<SecretHeaderConfig>,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
}

fn default_connect_timeout_s() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CookieConfig {
    pub name: String,
    /// Signs and derives secrets (OTPs); at least 32 characters.
    pub secret: String,
    pub secure: bool,
    pub same_site: SameSitePolicy,
    /// Session lifetime in seconds. Values below zero mean "no expiry".
    pub session_ttl_s: i64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SESSION_COOKIE.to_string(),
            secret: String::new(),
            secure: true,
            same_site: SameSitePolicy::Lax,
            session_ttl_s: DEFAULT_SESSION_TTL.as_secs() as i64,
        }
    }
}

impl CookieConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_s.max(0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub interval_s: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            interval_s: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s.max(0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_token_ttl_s")]
    pub token_ttl_s: i64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub sender: EmailSenderConfig,
}

fn default_true() -> bool {
    true
}

fn default_token_ttl_s() -> i64 {
    DEFAULT_EMAIL_TOKEN_TTL.as_secs() as i64
}

impl EmailConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_s.max(0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PasswordConfig {
    /// The single shared password.
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub cookie: CookieConfig,
    /// Emails and `@domain` entries; empty admits everyone.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordConfig>,
}

fn default_prefix() -> String {
    DEFAULT_AUTH_PREFIX.to_string()
}

impl AuthConfig {
    /// The auth prefix always starts with `/` and never ends with one.
    pub fn normalized_prefix(&self) -> String {
        let mut prefix = self.prefix.trim().trim_end_matches('/').to_string();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if prefix == "/" {
            prefix = DEFAULT_AUTH_PREFIX.to_string();
        }
        prefix
    }

    pub fn email_enabled(&self) -> bool {
        self.email.as_ref().is_some_and(|e| e.enabled)
    }
}

/// Backend plus sweep cadence for the KV substrate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub backend: KvBackendConfig,
    /// Seconds between background expiry sweeps (memory and disk
    /// backends; Redis expires natively).
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
}

fn default_sweep_interval_s() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: KvBackendConfig::default(),
            sweep_interval_s: default_sweep_interval_s(),
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s.max(1))
    }
}

/// The immutable configuration snapshot. One snapshot is active at a
/// time; reload replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load, expand, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::ConfigFileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let expanded = expand_env(&raw, |name| std::env::var(name).ok());

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let config: Config = match extension.as_str() {
            "yml" | "yaml" => {
                serde_yml::from_str(&expanded).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            "json" => {
                serde_json::from_str(&expanded).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            other => return Err(ConfigError::UnsupportedExtension(other.to_string())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check everything, returning the full list of problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if Url::parse(&self.service.base_url).is_err() {
            errors.push(format!(
                "service.base_url {:?} is not a valid URL",
                self.service.base_url
            ));
        }

        if self.auth.cookie.secret.len() < 32 {
            errors.push("auth.cookie.secret must be at least 32 characters".to_string());
        }

        let has_method = !self.auth.providers.is_empty()
            || self.auth.email_enabled()
            || self.auth.password.is_some();
        if !has_method {
            errors.push(
                "no login method configured (providers, email or password)".to_string(),
            );
        }

        if let Err(provider_errors) = crate::oauth::ProviderSet::from_configs(&self.auth.providers)
        {
            errors.extend(provider_errors);
        }

        if let Err(rule_errors) = crate::rules::PathRules::compile(&self.rules) {
            errors.extend(rule_errors);
        }

        if let Err(e) = crate::forward::Forwarder::new(&self.forwarding) {
            errors.push(format!("forwarding: {e}"));
        }
        if let Some(key) = &self.forwarding.encryption.key {
            if key.len() < 32 {
                errors.push("forwarding.encryption.key must be at least 32 characters".to_string());
            }
        }

        if let Some(upstream) = &self.upstream {
            if !matches!(upstream.url.scheme(), "http" | "https") {
                errors.push(format!(
                    "upstream.url must be http or https, got {:?}",
                    upstream.url.scheme()
                ));
            }
        }

        if let Some(email) = &self.auth.email {
            if email.enabled {
                if let Err(e) = crate::email::EmailSender::from_config(&email.sender) {
                    errors.push(format!("auth.email.sender: {e}"));
                }
                if email.rate_limit.capacity == 0 {
                    errors.push("auth.email.rate_limit.capacity must be at least 1".to_string());
                }
            }
        }

        if let Some(password) = &self.auth.password {
            if password.password.is_empty() {
                errors.push("auth.password.password must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Expand `${VAR}` (empty when unset) and `${VAR:-default}` occurrences.
fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let body = &rest[start + 2..start + 2 + end];
                let (name, default) = match body.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (body, None),
                };
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(default.unwrap_or("")),
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated expression; keep the text as-is.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_YAML: &str = r#"
service:
  name: Test Gate
  base_url: https://gate.example.com
auth:
  cookie:
    secret: "0123456789abcdef0123456789abcdef"
  password:
    password: letmein
"#;

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_expand_env() {
        let lookup = |name: &str| match name {
            "HOST" => Some("example.com".to_string()),
            _ => None,
        };
        assert_eq!(expand_env("url: ${HOST}/x", lookup), "url: example.com/x");
        assert_eq!(expand_env("v: ${MISSING}", lookup), "v: ");
        assert_eq!(expand_env("v: ${MISSING:-fallback}", lookup), "v: fallback");
        assert_eq!(expand_env("v: ${HOST:-fallback}", lookup), "v: example.com");
        assert_eq!(expand_env("no vars", lookup), "no vars");
        assert_eq!(expand_env("broken ${OPEN", lookup), "broken ${OPEN");
    }

    #[test]
    fn test_load_minimal_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "gate.yml", MINIMAL_YAML);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.service.name, "Test Gate");
        assert_eq!(config.auth.normalized_prefix(), "/_auth");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "gate.json",
            r#"{
  "auth": {
    "cookie": {"secret": "0123456789abcdef0123456789abcdef"},
    "password": {"password": "letmein"}
  }
}"#,
        );
        let config = Config::load(&path).unwrap();
        assert!(config.auth.password.is_some());
    }

    #[test]
    fn test_missing_file_is_a_distinct_error() {
        let err = Config::load(Path::new("/nonexistent/gate.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "gate.toml", "x = 1");
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::UnsupportedExtension(_)
        ));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "gate.yml",
            r#"
service:
  base_url: "not a url"
auth:
  cookie:
    secret: short
rules:
  - action: allow
"#,
        );
        let err = Config::load(&path).unwrap_err();
        let ConfigError::Validation(errors) = err else {
            panic!("expected validation error, got {err:?}");
        };
        // base_url, secret length, no login method, matcherless rule.
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_env_expansion_in_file() {
        std::env::set_var("CHATBOTGATE_TEST_SECRET", "0123456789abcdef0123456789abcdef");
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "gate.yml",
            r#"
auth:
  cookie:
    secret: "${CHATBOTGATE_TEST_SECRET}"
  password:
    password: "${CHATBOTGATE_TEST_MISSING:-fallback}"
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.cookie.secret, "0123456789abcdef0123456789abcdef");
        assert_eq!(config.auth.password.unwrap().password, "fallback");
        std::env::remove_var("CHATBOTGATE_TEST_SECRET");
    }

    #[test]
    fn test_prefix_normalization() {
        let mut auth = AuthConfig {
            prefix: "_auth/".to_string(),
            cookie: CookieConfig::default(),
            allowlist: vec![],
            providers: vec![],
            email: None,
            password: None,
        };
        assert_eq!(auth.normalized_prefix(), "/_auth");
        auth.prefix = "/sso/".to_string();
        assert_eq!(auth.normalized_prefix(), "/sso");
        auth.prefix = "/".to_string();
        assert_eq!(auth.normalized_prefix(), "/_auth");
    }

    #[test]
    fn test_negative_ttls_clamp_to_zero() {
        let cookie = CookieConfig {
            session_ttl_s: -5,
            ..CookieConfig::default()
        };
        assert_eq!(cookie.session_ttl(), Duration::ZERO);
    }
}
