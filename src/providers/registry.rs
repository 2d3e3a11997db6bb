//! Credential registry — the seam between the vault, the store and the
//! adapters. Hands out decrypted keys for the duration of a call and keeps
//! the usage bookkeeping on the credential row.

use std::sync::Arc;
use zeroize::Zeroize;

use crate::error::{AiError, AiResult};
use crate::store::credentials::CredentialRecord;
use crate::store::Store;
use crate::vault::{self, Vault};

pub struct CredentialRegistry {
    store: Arc<Store>,
    vault: Arc<Vault>,
}

impl CredentialRegistry {
    pub fn new(store: Arc<Store>, vault: Arc<Vault>) -> Self {
        Self { store, vault }
    }

    /// Decrypted key of the provider's primary active credential, stamping
    /// `usage_count` / `last_used_at` as a side effect. `None` when no
    /// active credential exists.
    pub fn active_key_for(&self, provider: &str) -> AiResult<Option<String>> {
        let record = match self.store.primary_credential(provider)? {
            Some(record) => record,
            None => {
                tracing::debug!(provider, "No active credential");
                return Ok(None);
            }
        };

        let key = self.vault.decrypt(&record.encrypted_key)?;
        self.store.touch_credential(record.id)?;
        Ok(Some(key))
    }

    /// Whether generation can even be attempted for a provider.
    pub fn is_available(&self, provider: &str) -> bool {
        self.store.has_active_credential(provider).unwrap_or(false)
    }

    /// Validate, encrypt and persist a new credential. The plaintext is
    /// zeroized before returning.
    pub fn create(
        &self,
        provider: &str,
        mut api_key: String,
        label: Option<&str>,
        notes: Option<&str>,
        created_by: Option<i64>,
    ) -> AiResult<CredentialRecord> {
        let (ok, reason) = vault::validate_format(provider, &api_key);
        if !ok {
            api_key.zeroize();
            return Err(AiError::BadInput(
                reason.unwrap_or_else(|| "invalid API key".into()),
            ));
        }

        let encrypted = self.vault.encrypt(&api_key)?;
        let preview = vault::key_preview(&api_key);
        api_key.zeroize();

        let id = self
            .store
            .insert_credential(provider, &encrypted, &preview, label, notes, created_by)?;
        self.store
            .get_credential(id)?
            .ok_or_else(|| AiError::Internal("credential vanished after insert".into()))
    }

    pub fn get(&self, id: i64) -> AiResult<CredentialRecord> {
        self.store
            .get_credential(id)?
            .ok_or_else(|| AiError::NotFound(format!("credential {id}")))
    }

    pub fn list(&self, provider: Option<&str>, active_only: bool) -> AiResult<Vec<CredentialRecord>> {
        self.store.list_credentials(provider, active_only)
    }

    pub fn update(
        &self,
        id: i64,
        label: Option<&str>,
        notes: Option<&str>,
        is_active: Option<bool>,
    ) -> AiResult<CredentialRecord> {
        self.store.update_credential(id, label, notes, is_active)
    }

    pub fn delete(&self, id: i64) -> AiResult<bool> {
        self.store.delete_credential(id)
    }

    /// Decrypt a stored credential for the liveness probe.
    pub fn decrypted_key(&self, id: i64) -> AiResult<String> {
        let record = self.get(id)?;
        self.vault.decrypt(&record.encrypted_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CredentialRegistry {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let vault = Arc::new(Vault::new(&"A".repeat(32)).unwrap());
        CredentialRegistry::new(store, vault)
    }

    #[test]
    fn test_create_and_retrieve_key() {
        let reg = registry();
        let record = reg
            .create("gemini", "AIzaSyDHD6xhNtU0AKSCSfdX".into(), Some("prod"), None, Some(1))
            .unwrap();
        assert_eq!(record.key_preview, "...SfdX");
        assert!(reg.is_available("gemini"));
        assert!(!reg.is_available("openai"));

        let key = reg.active_key_for("gemini").unwrap().unwrap();
        assert_eq!(key, "AIzaSyDHD6xhNtU0AKSCSfdX");
        // Usage was stamped
        let refreshed = reg.get(record.id).unwrap();
        assert_eq!(refreshed.usage_count, 1);
        assert!(refreshed.last_used_at.is_some());
    }

    #[test]
    fn test_create_rejects_bad_format() {
        let reg = registry();
        let err = reg
            .create("anthropic", "sk-wrong-prefix-123".into(), None, None, None)
            .unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));
        assert!(!reg.is_available("anthropic"));
    }

    #[test]
    fn test_no_credential_yields_none() {
        let reg = registry();
        assert!(reg.active_key_for("gemini").unwrap().is_none());
    }

    #[test]
    fn test_newest_active_wins() {
        let reg = registry();
        reg.create("openai", "sk-older-0123456789".into(), None, None, None)
            .unwrap();
        reg.create("openai", "sk-newer-0123456789".into(), None, None, None)
            .unwrap();
        let key = reg.active_key_for("openai").unwrap().unwrap();
        assert_eq!(key, "sk-newer-0123456789");
    }
}
