use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::session::random_token;

/// Contents of the OAuth2 state cookie: the CSRF nonce plus the login
/// context that has to survive the round-trip to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatePayload {
    pub state: String,
    pub provider: String,
    pub redirect: String,
}

impl StatePayload {
    pub fn new(provider: &str, redirect: &str) -> Self {
        Self {
            state: random_token(16),
            provider: provider.to_string(),
            redirect: redirect.to_string(),
        }
    }

    /// Encode for the cookie value.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("state payload serializes");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a cookie value; `None` for anything malformed.
    pub fn decode(raw: &str) -> Option<Self> {
        let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .ok()?;
        serde_json::from_slice(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let payload = StatePayload::new("google", "/private");
        let decoded = StatePayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
        assert!(payload.state.len() >= 20);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(StatePayload::decode("not base64 at all!").is_none());
        let junk = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"not json");
        assert!(StatePayload::decode(&junk).is_none());
    }
}
