//!
//! The statically-configured OAuth2 provider set.
//!
//! Providers are a closed set: Google, GitHub, Microsoft and custom
//! OIDC-like providers. Endpoint URLs default per kind and can be
//! overridden; scopes merge with the per-kind defaults unless
//! `reset_scopes` makes the configured list authoritative.
//!
//! CSRF state is owned by the middleware's state cookie; nothing here
//! persists anything.
//!

mod state;

pub use state::StatePayload;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Outbound call budget for token and userinfo endpoints.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Github,
    Microsoft,
    Custom,
}

impl ProviderKind {
    fn default_label(self) -> &'static str {
        match self {
            ProviderKind::Google => "Google",
            ProviderKind::Github => "GitHub",
            ProviderKind::Microsoft => "Microsoft",
            ProviderKind::Custom => "OpenID",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            ProviderKind::Google => "icons/google.svg",
            ProviderKind::Github => "icons/github.svg",
            ProviderKind::Microsoft => "icons/microsoft.svg",
            ProviderKind::Custom => "icons/openid.svg",
        }
    }

    fn default_authorize_url(self) -> Option<&'static str> {
        match self {
            ProviderKind::Google => Some("https://accounts.google.com/o/oauth2/v2/auth"),
            ProviderKind::Github => Some("https://github.com/login/oauth/authorize"),
            ProviderKind::Microsoft => {
                Some("https://login.microsoftonline.com/common/oauth2/v2.0/authorize")
            }
            ProviderKind::Custom => None,
        }
    }

    fn default_token_url(self) -> Option<&'static str> {
        match self {
            ProviderKind::Google => Some("https://oauth2.googleapis.com/token"),
            ProviderKind::Github => Some("https://github.com/login/oauth/access_token"),
            ProviderKind::Microsoft => {
                Some("https://login.microsoftonline.com/common/oauth2/v2.0/token")
            }
            ProviderKind::Custom => None,
        }
    }

    fn default_userinfo_url(self) -> Option<&'static str> {
        match self {
            ProviderKind::Google => Some("https://openidconnect.googleapis.com/v1/userinfo"),
            ProviderKind::Github => Some("https://api.github.com/user"),
            ProviderKind::Microsoft => Some("https://graph.microsoft.com/v1.0/me"),
            ProviderKind::Custom => None,
        }
    }

    fn default_scopes(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Google => &["openid", "email", "profile"],
            ProviderKind::Github => &["read:user", "user:email"],
            ProviderKind::Microsoft => &["openid", "email", "profile", "User.Read"],
            ProviderKind::Custom => &[],
        }
    }
}

/// One provider entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Registry id; defaults to the kind name. Must be unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Display label on the login page; defaults per kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When set, the configured scope list replaces the per-kind defaults.
    #[serde(default)]
    pub reset_scopes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_url: Option<Url>,
    /// Local testing only. Never enable against real providers.
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

impl ProviderConfig {
    pub fn registry_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| match self.kind {
            ProviderKind::Google => "google".to_string(),
            ProviderKind::Github => "github".to_string(),
            ProviderKind::Microsoft => "microsoft".to_string(),
            ProviderKind::Custom => "custom".to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown provider {0:?}")]
    Unknown(String),
    #[error("provider {provider} rejected the code exchange: {detail}")]
    Exchange { provider: String, detail: String },
    #[error("provider {provider} userinfo request failed: {detail}")]
    UserInfo { provider: String, detail: String },
    #[error("no verified email address available from the provider")]
    EmailNotFound,
    #[error("provider {provider} request failed: {source}")]
    Http {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Access token returned by the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// What a completed login knows about the end-user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub email: String,
    pub name: Option<String>,
    /// Raw provider claims, attached to the session as-is.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Provider {
    id: String,
    kind: ProviderKind,
    label: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    authorize_url: Url,
    token_url: Url,
    userinfo_url: Url,
    http: reqwest::Client,
}

impl Provider {
    fn from_config(config: &ProviderConfig) -> Result<Self, String> {
        let id = config.registry_id();

        let resolve = |override_url: &Option<Url>,
                       default_url: Option<&'static str>,
                       which: &str|
         -> Result<Url, String> {
            if let Some(url) = override_url {
                return Ok(url.clone());
            }
            match default_url {
                Some(url) => Ok(Url::parse(url).expect("default endpoint urls are valid")),
                None => Err(format!("provider {id:?}: {which} is required for custom providers")),
            }
        };

        let authorize_url = resolve(
            &config.authorize_url,
            config.kind.default_authorize_url(),
            "authorize_url",
        )?;
        let token_url = resolve(&config.token_url, config.kind.default_token_url(), "token_url")?;
        let userinfo_url = resolve(
            &config.userinfo_url,
            config.kind.default_userinfo_url(),
            "userinfo_url",
        )?;

        let mut scopes: Vec<String> = if config.reset_scopes {
            Vec::new()
        } else {
            config
                .kind
                .default_scopes()
                .iter()
                .map(|s| s.to_string())
                .collect()
        };
        for scope in &config.scopes {
            if !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.clone());
            }
        }

        let mut builder = reqwest::Client::builder().timeout(CLIENT_TIMEOUT);
        if config.tls_insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| format!("provider {id:?}: http client: {e}"))?;

        Ok(Self {
            label: config
                .name
                .clone()
                .unwrap_or_else(|| config.kind.default_label().to_string()),
            id,
            kind: config.kind,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes,
            authorize_url,
            token_url,
            userinfo_url,
            http,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The provider string recorded in sessions: `google`, `github`,
    /// `microsoft` or `custom:<id>`.
    pub fn session_provider(&self) -> String {
        match self.kind {
            ProviderKind::Custom => format!("custom:{}", self.id),
            ProviderKind::Google => "google".to_string(),
            ProviderKind::Github => "github".to_string(),
            ProviderKind::Microsoft => "microsoft".to_string(),
        }
    }

    /// Build the consent URL the browser is redirected to.
    pub fn auth_url(&self, redirect_uri: &str, state: &str) -> Url {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        url
    }

    /// Exchange the authorization code at the token endpoint. The same
    /// `redirect_uri` used for the consent URL must be passed.
    pub async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<Token, ProviderError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: self.id.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| ProviderError::Http {
            provider: self.id.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(ProviderError::Exchange {
                provider: self.id.clone(),
                detail: format!("{status}: {body}"),
            });
        }
        // Some providers answer 200 with an `error` payload.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                return Err(ProviderError::Exchange {
                    provider: self.id.clone(),
                    detail: error.to_string(),
                });
            }
        }
        serde_json::from_str(&body).map_err(|e| ProviderError::Exchange {
            provider: self.id.clone(),
            detail: format!("unparseable token response: {e}"),
        })
    }

    /// Fetch the end-user's identity with the access token.
    pub async fn user_info(&self, token: &Token) -> Result<UserInfo, ProviderError> {
        match self.kind {
            ProviderKind::Github => self.github_user_info(token).await,
            ProviderKind::Microsoft => self.microsoft_user_info(token).await,
            ProviderKind::Google | ProviderKind::Custom => self.oidc_user_info(token).await,
        }
    }

    async fn get_json(&self, url: Url, token: &Token) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, "chatbotgate")
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: self.id.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UserInfo {
                provider: self.id.clone(),
                detail: format!("{status}: {body}"),
            });
        }
        response.json().await.map_err(|source| ProviderError::Http {
            provider: self.id.clone(),
            source,
        })
    }

    /// Google and custom providers: one JSON userinfo document. A present
    /// but false `email_verified` claim disqualifies the address.
    async fn oidc_user_info(&self, token: &Token) -> Result<UserInfo, ProviderError> {
        let value = self.get_json(self.userinfo_url.clone(), token).await?;
        let claims = value.as_object().cloned().unwrap_or_default();

        if let Some(verified) = claims.get("email_verified").and_then(|v| v.as_bool()) {
            if !verified {
                return Err(ProviderError::EmailNotFound);
            }
        }
        let email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ProviderError::EmailNotFound)?
            .to_string();
        let name = claims
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(UserInfo {
            email,
            name,
            extra: claims,
        })
    }

    /// GitHub: the profile has no trustworthy email; list the account's
    /// addresses and pick the primary verified one.
    async fn github_user_info(&self, token: &Token) -> Result<UserInfo, ProviderError> {
        let profile = self.get_json(self.userinfo_url.clone(), token).await?;
        let claims = profile.as_object().cloned().unwrap_or_default();

        let mut emails_url = self.userinfo_url.clone();
        emails_url.set_path(&format!("{}/emails", self.userinfo_url.path().trim_end_matches('/')));
        let emails = self.get_json(emails_url, token).await?;

        let email = select_github_email(&emails).ok_or(ProviderError::EmailNotFound)?;
        let name = claims
            .get("name")
            .and_then(|v| v.as_str())
            .or_else(|| claims.get("login").and_then(|v| v.as_str()))
            .map(|s| s.to_string());
        Ok(UserInfo {
            email,
            name,
            extra: claims,
        })
    }

    /// Microsoft Graph `me`: `mail` first, `userPrincipalName` second.
    async fn microsoft_user_info(&self, token: &Token) -> Result<UserInfo, ProviderError> {
        let value = self.get_json(self.userinfo_url.clone(), token).await?;
        let claims = value.as_object().cloned().unwrap_or_default();

        let email = claims
            .get("mail")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                claims
                    .get("userPrincipalName")
                    .and_then(|v| v.as_str())
                    .filter(|s| s.contains('@'))
            })
            .ok_or(ProviderError::EmailNotFound)?
            .to_string();
        let name = claims
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(UserInfo {
            email,
            name,
            extra: claims,
        })
    }
}

/// Primary verified address, falling back to the first verified one.
fn select_github_email(emails: &serde_json::Value) -> Option<String> {
    let list = emails.as_array()?;
    let verified = |entry: &&serde_json::Value| {
        entry
            .get("verified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    let primary = |entry: &&serde_json::Value| {
        entry
            .get("primary")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    list.iter()
        .filter(verified)
        .find(primary)
        .or_else(|| list.iter().find(verified))
        .and_then(|entry| entry.get("email").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

/// All configured providers, looked up by registry id.
#[derive(Debug, Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Provider>,
}

impl ProviderSet {
    /// Build every provider, collecting all configuration errors.
    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self, Vec<String>> {
        let mut providers: Vec<Provider> = Vec::with_capacity(configs.len());
        let mut errors = Vec::new();
        for config in configs {
            match Provider::from_config(config) {
                Ok(provider) => {
                    if providers.iter().any(|p| p.id() == provider.id()) {
                        errors.push(format!("duplicate provider id {:?}", provider.id()));
                    } else {
                        providers.push(provider);
                    }
                }
                Err(error) => errors.push(error),
            }
        }
        if errors.is_empty() {
            Ok(Self { providers })
        } else {
            Err(errors)
        }
    }

    pub fn get(&self, id: &str) -> Result<&Provider, ProviderError> {
        self.providers
            .iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| ProviderError::Unknown(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn google_config() -> ProviderConfig {
        ProviderConfig {
            id: None,
            kind: ProviderKind::Google,
            name: None,
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![],
            reset_scopes: false,
            authorize_url: None,
            token_url: None,
            userinfo_url: None,
            tls_insecure_skip_verify: false,
        }
    }

    #[test]
    fn test_auth_url_parameters() {
        let set = ProviderSet::from_configs(&[google_config()]).unwrap();
        let provider = set.get("google").unwrap();
        let url = provider.auth_url("https://gate/_auth/oauth2/callback", "STATE123");
        assert!(url.as_str().starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["redirect_uri"], "https://gate/_auth/oauth2/callback");
        assert_eq!(pairs["state"], "STATE123");
        assert_eq!(pairs["scope"], "openid email profile");
    }

    #[test]
    fn test_scope_merging() {
        let mut config = google_config();
        config.scopes = vec!["email".to_string(), "https://extra".to_string()];
        let set = ProviderSet::from_configs(&[config]).unwrap();
        let provider = set.get("google").unwrap();
        assert_eq!(provider.scopes, vec!["openid", "email", "profile", "https://extra"]);

        let mut config = google_config();
        config.scopes = vec!["email".to_string()];
        config.reset_scopes = true;
        let set = ProviderSet::from_configs(&[config]).unwrap();
        assert_eq!(set.get("google").unwrap().scopes, vec!["email"]);
    }

    #[test]
    fn test_custom_provider_requires_urls() {
        let config = ProviderConfig {
            kind: ProviderKind::Custom,
            ..google_config()
        };
        let errors = ProviderSet::from_configs(&[config]).unwrap_err();
        assert!(errors[0].contains("authorize_url"));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let errors =
            ProviderSet::from_configs(&[google_config(), google_config()]).unwrap_err();
        assert!(errors[0].contains("duplicate provider id"));
    }

    #[test]
    fn test_session_provider_string() {
        let mut config = google_config();
        config.kind = ProviderKind::Custom;
        config.id = Some("corp".to_string());
        config.authorize_url = Some(Url::parse("https://idp/authorize").unwrap());
        config.token_url = Some(Url::parse("https://idp/token").unwrap());
        config.userinfo_url = Some(Url::parse("https://idp/userinfo").unwrap());
        let set = ProviderSet::from_configs(&[config]).unwrap();
        assert_eq!(set.get("corp").unwrap().session_provider(), "custom:corp");
    }

    #[test]
    fn test_select_github_email() {
        let emails = serde_json::json!([
            {"email": "unverified@x.com", "primary": true, "verified": false},
            {"email": "secondary@x.com", "primary": false, "verified": true},
            {"email": "primary@x.com", "primary": true, "verified": true},
        ]);
        assert_eq!(select_github_email(&emails).as_deref(), Some("primary@x.com"));

        let emails = serde_json::json!([
            {"email": "unverified@x.com", "primary": true, "verified": false},
            {"email": "secondary@x.com", "primary": false, "verified": true},
        ]);
        assert_eq!(select_github_email(&emails).as_deref(), Some("secondary@x.com"));

        let emails = serde_json::json!([
            {"email": "unverified@x.com", "primary": true, "verified": false},
        ]);
        assert_eq!(select_github_email(&emails), None);
    }

    async fn mock_provider(server: &MockServer) -> ProviderSet {
        let mut config = google_config();
        config.token_url = Some(Url::parse(&format!("{}/token", server.uri())).unwrap());
        config.userinfo_url = Some(Url::parse(&format!("{}/userinfo", server.uri())).unwrap());
        ProviderSet::from_configs(&[config]).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_and_userinfo() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("accept", "application/json"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=C"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT",
                "token_type": "Bearer",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer AT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "email": "alice@example.com",
                "email_verified": true,
                "name": "Alice",
                "hd": "example.com",
            })))
            .mount(&server)
            .await;

        let set = mock_provider(&server).await;
        let provider = set.get("google").unwrap();
        let token = provider.exchange("C", "https://gate/cb").await.unwrap();
        assert_eq!(token.access_token, "AT");

        let info = provider.user_info(&token).await.unwrap();
        assert_eq!(info.email, "alice@example.com");
        assert_eq!(info.name.as_deref(), Some("Alice"));
        assert_eq!(info.extra["hd"], "example.com");
    }

    #[tokio::test]
    async fn test_exchange_surfaces_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let set = mock_provider(&server).await;
        let err = set
            .get("google")
            .unwrap()
            .exchange("bad", "https://gate/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exchange { detail, .. } if detail == "invalid_grant"));
    }

    #[tokio::test]
    async fn test_unverified_email_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "email": "alice@example.com",
                "email_verified": false,
            })))
            .mount(&server)
            .await;

        let set = mock_provider(&server).await;
        let token = Token {
            access_token: "AT".to_string(),
            token_type: None,
            expires_in: None,
        };
        let err = set.get("google").unwrap().user_info(&token).await.unwrap_err();
        assert!(matches!(err, ProviderError::EmailNotFound));
    }
}
