//!
//! Projection of session identity into upstream-bound headers and query
//! parameters.
//!

mod crypto;

pub use crypto::{CipherError, FieldCipher};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::constants::{EMAIL_HEADER, HEADER_VALUE_MAX_BYTES, USER_HEADER};
use crate::session::Session;

/// Forwarding section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ForwardingConfig {
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Projected fields in emission order. When empty, the canonical
    /// `X-ChatbotGate-Email` / `X-ChatbotGate-User` pair is used.
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seed for the AES-256-GCM key; at least 32 characters.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    /// `email`, `name`, or a dot-separated path into the provider claims.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Overrides the global encryption switch for this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
}

impl ForwardingConfig {
    /// The effective field list: config order, or the canonical pair.
    pub fn effective_fields(&self) -> Vec<FieldConfig> {
        if !self.fields.is_empty() {
            return self.fields.clone();
        }
        vec![
            FieldConfig {
                path: "email".to_string(),
                header: Some(EMAIL_HEADER.to_string()),
                query: None,
                encrypt: None,
            },
            FieldConfig {
                path: "name".to_string(),
                header: Some(USER_HEADER.to_string()),
                query: None,
                encrypt: None,
            },
        ]
    }
}

/// Remove bytes that could smuggle extra headers and cap the length.
pub fn sanitize_header_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\0'))
        .collect();
    if out.len() > HEADER_VALUE_MAX_BYTES {
        // Truncate on a char boundary at or below the cap.
        let mut cut = HEADER_VALUE_MAX_BYTES;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

#[derive(Debug, Clone)]
struct CompiledField {
    path: String,
    header: Option<HeaderName>,
    query: Option<String>,
    encrypt: bool,
}

/// Applies the configured projection to outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct Forwarder {
    fields: Vec<CompiledField>,
    cipher: Option<FieldCipher>,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("field {path:?} has an invalid header name {name:?}")]
    HeaderName { path: String, name: String },
    #[error("field {path:?} targets neither a header nor a query parameter")]
    NoTarget { path: String },
    #[error("field {path:?} requires encryption but no key is configured")]
    MissingKey { path: String },
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl Forwarder {
    pub fn new(config: &ForwardingConfig) -> Result<Self, ForwardError> {
        let cipher = config
            .encryption
            .key
            .as_deref()
            .map(FieldCipher::new);

        let mut fields = Vec::new();
        for field in config.effective_fields() {
            let header = match &field.header {
                Some(name) => Some(HeaderName::try_from(name.as_str()).map_err(|_| {
                    ForwardError::HeaderName {
                        path: field.path.clone(),
                        name: name.clone(),
                    }
                })?),
                None => None,
            };
            if header.is_none() && field.query.is_none() {
                return Err(ForwardError::NoTarget { path: field.path });
            }
            let encrypt = field.encrypt.unwrap_or(config.encryption.enabled);
            if encrypt && cipher.is_none() {
                return Err(ForwardError::MissingKey { path: field.path });
            }
            fields.push(CompiledField {
                path: field.path,
                header,
                query: field.query,
                encrypt,
            });
        }
        Ok(Self { fields, cipher })
    }

    /// Clone `headers` and write every configured header field resolved
    /// from `session`. Empty values are skipped.
    pub fn add_to_headers(
        &self,
        headers: &HeaderMap,
        session: &Session,
    ) -> Result<HeaderMap, ForwardError> {
        let mut out = headers.clone();
        for field in &self.fields {
            let Some(name) = &field.header else { continue };
            let Some(value) = self.emit(field, session)? else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                out.insert(name.clone(), value);
            }
        }
        Ok(out)
    }

    /// Whether any field targets a query parameter at all; callers skip
    /// the URI rewrite when none do.
    pub fn has_query_fields(&self) -> bool {
        self.fields.iter().any(|f| f.query.is_some())
    }

    /// Merge every configured query field into `url`, preserving the
    /// parameters already present.
    pub fn add_to_query(&self, url: &mut url::Url, session: &Session) -> Result<(), ForwardError> {
        for field in &self.fields {
            let Some(name) = &field.query else { continue };
            let Some(value) = self.emit(field, session)? else {
                continue;
            };
            url.query_pairs_mut().append_pair(name, &value);
        }
        Ok(())
    }

    /// Resolve, encrypt and sanitize one field. `None` means skip.
    fn emit(&self, field: &CompiledField, session: &Session) -> Result<Option<String>, ForwardError> {
        let Some(plain) = resolve_path(&field.path, session) else {
            return Ok(None);
        };
        if plain.is_empty() {
            return Ok(None);
        }
        let value = if field.encrypt {
            let cipher = self.cipher.as_ref().ok_or(ForwardError::MissingKey {
                path: field.path.clone(),
            })?;
            cipher.seal(&plain)?
        } else {
            plain
        };
        Ok(Some(sanitize_header_value(&value)))
    }
}

/// `email` and `name` address the session itself; everything else is a
/// dot-path into the provider claims. Only scalar leaves are emitted.
fn resolve_path(path: &str, session: &Session) -> Option<String> {
    match path {
        "email" => return Some(session.email.clone()),
        "name" => return Some(session.display_name.clone()),
        _ => {}
    }

    let mut value: &serde_json::Value = {
        let (first, _) = path.split_once('.').unwrap_or((path, ""));
        session.extra.get(first)?
    };
    for segment in path.split('.').skip(1) {
        value = value.as_object()?.get(segment)?;
    }

    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> Session {
        let mut session = Session::new("alice@example.com", "Alice", "google", Duration::from_secs(60));
        session.extra.insert("hd".to_string(), serde_json::json!("example.com"));
        session.extra.insert(
            "profile".to_string(),
            serde_json::json!({"locale": "en", "age": 30, "verified": true, "nested": {}}),
        );
        session
    }

    fn field(path: &str, header: Option<&str>, query: Option<&str>) -> FieldConfig {
        FieldConfig {
            path: path.to_string(),
            header: header.map(|s| s.to_string()),
            query: query.map(|s| s.to_string()),
            encrypt: None,
        }
    }

    #[test]
    fn test_default_fields_emit_canonical_headers() {
        let forwarder = Forwarder::new(&ForwardingConfig::default()).unwrap();
        let headers = forwarder.add_to_headers(&HeaderMap::new(), &session()).unwrap();
        assert_eq!(headers.get(EMAIL_HEADER).unwrap(), "alice@example.com");
        assert_eq!(headers.get(USER_HEADER).unwrap(), "Alice");
    }

    #[test]
    fn test_dot_path_resolution() {
        let s = session();
        assert_eq!(resolve_path("hd", &s).as_deref(), Some("example.com"));
        assert_eq!(resolve_path("profile.locale", &s).as_deref(), Some("en"));
        assert_eq!(resolve_path("profile.age", &s).as_deref(), Some("30"));
        assert_eq!(resolve_path("profile.verified", &s).as_deref(), Some("true"));
        // Non-scalar leaves and missing paths are skipped.
        assert_eq!(resolve_path("profile.nested", &s), None);
        assert_eq!(resolve_path("profile.missing", &s), None);
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let config = ForwardingConfig {
            fields: vec![field("name", Some("X-User"), None)],
            ..Default::default()
        };
        let forwarder = Forwarder::new(&config).unwrap();
        let mut s = session();
        s.display_name.clear();
        let headers = forwarder.add_to_headers(&HeaderMap::new(), &s).unwrap();
        assert!(headers.get("X-User").is_none());
    }

    #[test]
    fn test_query_merge_preserves_existing_parameters() {
        let config = ForwardingConfig {
            fields: vec![field("email", None, Some("user_email"))],
            ..Default::default()
        };
        let forwarder = Forwarder::new(&config).unwrap();
        let mut url = url::Url::parse("http://upstream.local/app?page=2").unwrap();
        forwarder.add_to_query(&mut url, &session()).unwrap();
        assert_eq!(
            url.as_str(),
            "http://upstream.local/app?page=2&user_email=alice%40example.com"
        );
    }

    #[test]
    fn test_encrypted_field_roundtrip() {
        let key = "0123456789abcdef0123456789abcdef";
        let config = ForwardingConfig {
            encryption: EncryptionConfig {
                enabled: true,
                key: Some(key.to_string()),
            },
            fields: vec![field("email", Some("X-Enc-Email"), None)],
        };
        let forwarder = Forwarder::new(&config).unwrap();
        let headers = forwarder.add_to_headers(&HeaderMap::new(), &session()).unwrap();
        let sealed = headers.get("X-Enc-Email").unwrap().to_str().unwrap();
        assert_ne!(sealed, "alice@example.com");
        let cipher = FieldCipher::new(key);
        assert_eq!(cipher.open(sealed).unwrap(), "alice@example.com");
    }

    #[test]
    fn test_per_field_encrypt_override() {
        let config = ForwardingConfig {
            encryption: EncryptionConfig {
                enabled: true,
                key: Some("0123456789abcdef0123456789abcdef".to_string()),
            },
            fields: vec![FieldConfig {
                encrypt: Some(false),
                ..field("email", Some("X-Plain-Email"), None)
            }],
        };
        let forwarder = Forwarder::new(&config).unwrap();
        let headers = forwarder.add_to_headers(&HeaderMap::new(), &session()).unwrap();
        assert_eq!(headers.get("X-Plain-Email").unwrap(), "alice@example.com");
    }

    #[test]
    fn test_encryption_without_key_is_rejected() {
        let config = ForwardingConfig {
            encryption: EncryptionConfig {
                enabled: true,
                key: None,
            },
            fields: vec![field("email", Some("X-Email"), None)],
        };
        assert!(matches!(
            Forwarder::new(&config),
            Err(ForwardError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_sanitize_header_value() {
        assert_eq!(sanitize_header_value("ok"), "ok");
        assert_eq!(sanitize_header_value("a\r\nb\0c"), "abc");
        let long = "x".repeat(HEADER_VALUE_MAX_BYTES + 100);
        assert_eq!(sanitize_header_value(&long).len(), HEADER_VALUE_MAX_BYTES);
    }
}
