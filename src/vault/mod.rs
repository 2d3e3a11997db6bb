//! Encrypted credential vault — AES-256-GCM with a PBKDF2-derived session key.
//!
//! Provider keys are encrypted before they hit disk. A fresh salt is drawn
//! per encryption and the session key derived from it and the process-wide
//! master secret, so two encryptions of the same plaintext never match.
//! Wire format: `base64(salt(16) || nonce(12) || ciphertext || tag(16))`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{AiError, AiResult};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;
const MIN_MASTER_LEN: usize = 32;

pub struct Vault {
    master_key: Vec<u8>,
}

impl Vault {
    /// Build a vault from the configured master secret. Refuses to operate
    /// on anything shorter than 32 bytes.
    pub fn new(master_key: &str) -> AiResult<Self> {
        if master_key.len() < MIN_MASTER_LEN {
            return Err(AiError::CryptoFailure(format!(
                "master encryption key must be at least {MIN_MASTER_LEN} bytes"
            )));
        }
        Ok(Self {
            master_key: master_key.as_bytes().to_vec(),
        })
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(&self.master_key, salt, PBKDF2_ITERATIONS, &mut key);
        key
    }

    /// Encrypt a plaintext credential for storage.
    pub fn encrypt(&self, plaintext: &str) -> AiResult<String> {
        if plaintext.is_empty() {
            return Err(AiError::BadInput("cannot encrypt empty value".into()));
        }

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let mut key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| AiError::CryptoFailure("bad key length".into()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| AiError::CryptoFailure("encryption failed".into()))?;
        key.zeroize();

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a stored blob. The caller should zeroize the result when done.
    pub fn decrypt(&self, encrypted: &str) -> AiResult<String> {
        if encrypted.is_empty() {
            return Err(AiError::BadInput("cannot decrypt empty value".into()));
        }

        let data = BASE64
            .decode(encrypted)
            .map_err(|_| AiError::CryptoFailure("blob is not valid base64".into()))?;
        if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(AiError::CryptoFailure("blob truncated".into()));
        }

        let salt = &data[..SALT_LEN];
        let nonce = &data[SALT_LEN..SALT_LEN + NONCE_LEN];
        let ciphertext = &data[SALT_LEN + NONCE_LEN..];

        let mut key = self.derive_key(salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| AiError::CryptoFailure("bad key length".into()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AiError::CryptoFailure("authentication failed or data corrupted".into()));
        key.zeroize();

        let mut plaintext = plaintext?;
        let result = String::from_utf8(plaintext.clone())
            .map_err(|_| AiError::CryptoFailure("plaintext is not valid UTF-8".into()));
        plaintext.zeroize();
        result
    }
}

/// Safe display preview: last four characters only, e.g. `...2345`.
pub fn key_preview(api_key: &str) -> String {
    const VISIBLE: usize = 4;
    if api_key.is_empty() {
        return String::new();
    }
    if api_key.len() <= VISIBLE {
        return "*".repeat(api_key.len());
    }
    format!("...{}", &api_key[api_key.len() - VISIBLE..])
}

/// Masked form showing head and tail, e.g. `sk-a...2345`.
pub fn masked_form(api_key: &str) -> String {
    const SHOW_START: usize = 4;
    const SHOW_END: usize = 4;
    if api_key.is_empty() {
        return String::new();
    }
    if api_key.len() <= SHOW_START + SHOW_END {
        return "*".repeat(api_key.len());
    }
    format!(
        "{}...{}",
        &api_key[..SHOW_START],
        &api_key[api_key.len() - SHOW_END..]
    )
}

/// Per-provider format rules. Returns `(true, None)` or `(false, reason)`.
pub fn validate_format(provider: &str, api_key: &str) -> (bool, Option<String>) {
    if api_key.len() < 10 {
        return (false, Some("API key is too short".to_string()));
    }

    let ok = match provider.to_lowercase().as_str() {
        "openai" => api_key.starts_with("sk-") || api_key.starts_with("sk-proj-"),
        "anthropic" => api_key.starts_with("sk-ant-"),
        "gemini" => api_key.len() >= 20,
        "azure_openai" => api_key.len() >= 20,
        _ => true,
    };

    if ok {
        (true, None)
    } else {
        (false, Some(format!("Invalid {provider} API key format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(&"A".repeat(32)).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let v = vault();
        let blob = v.encrypt("sk-abc12345").unwrap();
        assert_ne!(blob, "sk-abc12345");
        assert_eq!(v.decrypt(&blob).unwrap(), "sk-abc12345");
    }

    #[test]
    fn test_distinct_ciphertexts() {
        let v = vault();
        let e1 = v.encrypt("same-key").unwrap();
        let e2 = v.encrypt("same-key").unwrap();
        // Fresh salt + nonce per call
        assert_ne!(e1, e2);
        assert_eq!(v.decrypt(&e1).unwrap(), "same-key");
        assert_eq!(v.decrypt(&e2).unwrap(), "same-key");
    }

    #[test]
    fn test_roundtrip_large_value() {
        let v = vault();
        let plaintext = "x".repeat(64 * 1024);
        let blob = v.encrypt(&plaintext).unwrap();
        assert_eq!(v.decrypt(&blob).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_input_rejected() {
        let v = vault();
        assert!(matches!(v.encrypt(""), Err(AiError::BadInput(_))));
        assert!(matches!(v.decrypt(""), Err(AiError::BadInput(_))));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let v = vault();
        let blob = v.encrypt("secret-api-key").unwrap();
        let mut raw = BASE64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = BASE64.encode(raw);
        assert!(matches!(v.decrypt(&tampered), Err(AiError::CryptoFailure(_))));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let v = vault();
        let truncated = BASE64.encode([0u8; SALT_LEN + NONCE_LEN]);
        assert!(matches!(v.decrypt(&truncated), Err(AiError::CryptoFailure(_))));
    }

    #[test]
    fn test_short_master_key_refused() {
        assert!(matches!(Vault::new("too-short"), Err(AiError::CryptoFailure(_))));
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let blob = vault().encrypt("secret").unwrap();
        let other = Vault::new(&"B".repeat(32)).unwrap();
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn test_preview_and_mask() {
        assert_eq!(key_preview("sk-abc12345"), "...2345");
        assert_eq!(masked_form("sk-abc12345"), "sk-a...2345");
        assert_eq!(key_preview("abc"), "***");
        assert_eq!(masked_form("abcdefgh"), "********");
        assert_eq!(key_preview(""), "");
    }

    #[test]
    fn test_validate_format_rules() {
        assert!(validate_format("openai", "sk-abc12345").0);
        assert!(validate_format("openai", "sk-proj-abc123").0);
        assert!(!validate_format("openai", "pk-abc12345").0);
        assert!(validate_format("anthropic", "sk-ant-abc123").0);
        assert!(!validate_format("anthropic", "sk-abc12345").0);
        assert!(validate_format("gemini", "AIzaSyDHD6xhNtU0AKSCSfdX").0);
        assert!(!validate_format("gemini", "AIzaShort12").0);
        assert!(validate_format("azure_openai", "a".repeat(20).as_str()).0);
        // Minimum length applies to every provider
        let (ok, reason) = validate_format("openai", "sk-short");
        assert!(!ok);
        assert_eq!(reason.unwrap(), "API key is too short");
    }
}
