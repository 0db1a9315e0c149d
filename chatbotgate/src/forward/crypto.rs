use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("value is not valid base64")]
    Encoding,
    #[error("value is too short to carry a nonce")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// AES-256-GCM for single header / query parameter values.
///
/// The configured key string is stretched to 32 bytes with SHA-256, which
/// is what the upstreams decrypting these fields expect. Output layout is
/// `base64(nonce ‖ ciphertext)` with a fresh random 12-byte nonce per value.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldCipher")
    }
}

impl FieldCipher {
    pub fn new(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest)
            .expect("a SHA-256 digest is a valid AES-256 key");
        Self { cipher }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        let mut buf = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(buf))
    }

    pub fn open(&self, value: &str) -> Result<String, CipherError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|_| CipherError::Encoding)?;
        if raw.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = FieldCipher::new("an encryption key of sufficient length");
        let sealed = cipher.seal("alice@example.com").unwrap();
        assert_ne!(sealed, "alice@example.com");
        assert_eq!(cipher.open(&sealed).unwrap(), "alice@example.com");
    }

    #[test]
    fn test_nonce_makes_output_unique() {
        let cipher = FieldCipher::new("an encryption key of sufficient length");
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealer = FieldCipher::new("an encryption key of sufficient length");
        let opener = FieldCipher::new("a different key of sufficient length!!");
        let sealed = sealer.seal("secret").unwrap();
        assert!(matches!(opener.open(&sealed), Err(CipherError::Decrypt)));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let cipher = FieldCipher::new("an encryption key of sufficient length");
        assert!(matches!(cipher.open("!!"), Err(CipherError::Encoding)));
        assert!(matches!(cipher.open("c2hvcnQ"), Err(CipherError::Truncated)));
    }
}
