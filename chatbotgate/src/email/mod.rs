//!
//! Email magic-link and one-time-password login.
//!
//! A login token is a random URL-safe value; the 8-digit OTP is derived
//! from it under the cookie secret so either can redeem the same login.
//! Both are single-use and share one TTL. A reverse `otp → value` index
//! makes code-entry redemption a single lookup.
//!

mod sender;

pub use sender::{EmailSender, EmailSenderConfig, OutgoingEmail, SendError, SmtpTls};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use crate::authz::AccessList;
use crate::i18n::Translator;
use crate::kv::{KvError, KvStore};
use crate::pages::PageRenderer;
use crate::ratelimit::RateLimiter;
use crate::session::random_token;

/// One outstanding magic link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailToken {
    /// Random URL-safe value; doubles as the URL parameter.
    pub value: String,
    /// Canonical 8-digit code (no separators).
    pub otp: String,
    pub email: String,
    /// Where to send the browser after redemption.
    pub redirect: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Terminal: a used token can never be redeemed again.
    pub used: bool,
}

/// Derive the 8-digit OTP for a token value. The formula stays
/// server-side; only its output is ever mailed out.
pub(crate) fn derive_otp(secret: &str, token_value: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(token_value.as_bytes());
    let digest = mac.finalize().into_bytes();
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100_000_000;
    format!("{n:08}")
}

/// Grouped for human eyes: `12345678` → `1234 5678`.
pub(crate) fn format_otp_display(otp: &str) -> String {
    match otp.char_indices().nth(4) {
        Some((mid, _)) => format!("{} {}", &otp[..mid], &otp[mid..]),
        None => otp.to_string(),
    }
}

/// Strip everything but digits; users paste codes with spaces and dashes.
fn normalize_otp(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum EmailAuthError {
    /// The address is not in the allowlist.
    #[error("address is not authorized")]
    NotAuthorized,
    /// The per-recipient send quota is exhausted.
    #[error("too many login links requested")]
    RateLimited,
    /// Token absent, expired, or never issued; indistinguishable on
    /// purpose.
    #[error("token not found")]
    NotFound,
    /// The token was already redeemed.
    #[error("token already used")]
    AlreadyUsed,
    #[error("mail delivery failed: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Store(#[from] KvError),
}

/// Issues, mails and redeems login tokens.
#[derive(Debug, Clone)]
pub struct EmailAuth {
    tokens: KvStore,
    otp_index: KvStore,
    limiter: RateLimiter,
    access: Arc<AccessList>,
    sender: Arc<EmailSender>,
    translator: Arc<Translator>,
    renderer: Arc<PageRenderer>,
    base_url: String,
    auth_prefix: String,
    token_ttl: Duration,
    cookie_secret: String,
}

impl EmailAuth {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokens: KvStore,
        otp_index: KvStore,
        limiter: RateLimiter,
        access: Arc<AccessList>,
        sender: Arc<EmailSender>,
        translator: Arc<Translator>,
        renderer: Arc<PageRenderer>,
        base_url: &str,
        auth_prefix: &str,
        token_ttl: Duration,
        cookie_secret: &str,
    ) -> Self {
        Self {
            tokens,
            otp_index,
            limiter,
            access,
            sender,
            translator,
            renderer,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_prefix: auth_prefix.to_string(),
            token_ttl,
            cookie_secret: cookie_secret.to_string(),
        }
    }

    /// Issue a token + OTP for `email` and hand the rendered message to
    /// the sender. On transport failure both store entries are rolled
    /// back so the token cannot linger unredeemed.
    pub async fn send_login_link(
        &self,
        email: &str,
        redirect: &str,
        lang: &str,
    ) -> Result<(), EmailAuthError> {
        let email = email.trim().to_lowercase();
        if !self.access.is_allowed(&email) {
            return Err(EmailAuthError::NotAuthorized);
        }
        if !self.limiter.allow(&email).await {
            return Err(EmailAuthError::RateLimited);
        }

        let now = Utc::now();
        let value = random_token(24);
        let otp = derive_otp(&self.cookie_secret, &value);
        let token = EmailToken {
            value: value.clone(),
            otp: otp.clone(),
            email: email.clone(),
            redirect: redirect.to_string(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.token_ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            used: false,
        };

        let bytes = serde_json::to_vec(&token).map_err(|e| KvError::Backend(e.to_string()))?;
        self.tokens.set(&value, &bytes, self.token_ttl).await?;
        if let Err(e) = self
            .otp_index
            .set(&otp, value.as_bytes(), self.token_ttl)
            .await
        {
            let _ = self.tokens.delete(&value).await;
            return Err(e.into());
        }

        let login_url = format!(
            "{}{}/email/verify?token={}",
            self.base_url, self.auth_prefix, value
        );
        let bodies = self.renderer.email_bodies(
            &self.translator,
            lang,
            &login_url,
            &format_otp_display(&otp),
            self.token_ttl.as_secs() / 60,
        );

        let outcome = self
            .sender
            .send(OutgoingEmail {
                to: email.clone(),
                subject: bodies.subject,
                html: bodies.html,
                text: bodies.text,
            })
            .await;

        if let Err(error) = outcome {
            // Roll back so a failed send leaves no redeemable state.
            let _ = self.tokens.delete(&value).await;
            let _ = self.otp_index.delete(&otp).await;
            tracing::warn!(%email, %error, "login link delivery failed");
            return Err(error.into());
        }

        tracing::info!(%email, "login link dispatched");
        Ok(())
    }

    /// Redeem a token value. Succeeds at most once per token.
    pub async fn verify_token(&self, value: &str) -> Result<(String, String), EmailAuthError> {
        let bytes = match self.tokens.get(value).await {
            Ok(bytes) => bytes,
            Err(KvError::NotFound) => return Err(EmailAuthError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let mut token: EmailToken =
            serde_json::from_slice(&bytes).map_err(|_| EmailAuthError::NotFound)?;

        if token.used {
            return Err(EmailAuthError::AlreadyUsed);
        }
        if Utc::now() >= token.expires_at {
            return Err(EmailAuthError::NotFound);
        }

        token.used = true;
        // The spent record stays around until the original TTL so repeat
        // redemptions can answer AlreadyUsed instead of NotFound.
        let remaining = (token.expires_at - Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(1));
        let bytes = serde_json::to_vec(&token).map_err(|e| KvError::Backend(e.to_string()))?;
        self.tokens.set(value, &bytes, remaining).await?;
        // The OTP can no longer redeem either.
        let _ = self.otp_index.delete(&token.otp).await;

        Ok((token.email, token.redirect))
    }

    /// Test access to the token store, for driving flows end-to-end
    /// without a mailbox.
    #[cfg(test)]
    pub(crate) fn tokens_store(&self) -> &KvStore {
        &self.tokens
    }

    /// Redeem an OTP entered by hand.
    pub async fn verify_otp(&self, otp: &str) -> Result<(String, String), EmailAuthError> {
        let otp = normalize_otp(otp);
        if otp.is_empty() {
            return Err(EmailAuthError::NotFound);
        }
        let value = match self.otp_index.get(&otp).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| EmailAuthError::NotFound)?,
            Err(KvError::NotFound) => return Err(EmailAuthError::NotFound),
            Err(e) => return Err(e.into()),
        };
        self.verify_token(&value).await
    }
}
