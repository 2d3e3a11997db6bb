//! Provider credential records — encrypted CRUD and primary-key selection.
//!
//! Plaintext never touches this module; encryption happens in the vault and
//! the registry layer above. Among active credentials for a provider, the
//! most recently created one is the primary.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::{AiError, AiResult};

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct CredentialRecord {
    pub id: i64,
    pub provider: String,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    pub key_preview: String,
    pub label: Option<String>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.get(0)?,
        provider: row.get(1)?,
        encrypted_key: row.get(2)?,
        key_preview: row.get(3)?,
        label: row.get(4)?,
        notes: row.get(5)?,
        is_active: row.get(6)?,
        usage_count: row.get(7)?,
        last_used_at: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        created_by: row.get(9)?,
        created_at: row
            .get::<_, String>(10)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_default(),
    })
}

const COLUMNS: &str = "id, provider, encrypted_key, key_preview, label, notes, \
                       is_active, usage_count, last_used_at, created_by, created_at";

impl Store {
    pub fn insert_credential(
        &self,
        provider: &str,
        encrypted_key: &str,
        key_preview: &str,
        label: Option<&str>,
        notes: Option<&str>,
        created_by: Option<i64>,
    ) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO api_keys (provider, encrypted_key, key_preview, label, notes, \
             is_active, usage_count, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6, ?7)",
            params![
                provider.to_lowercase(),
                encrypted_key,
                key_preview,
                label,
                notes,
                created_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = db.last_insert_rowid();
        tracing::info!(credential_id = id, provider = provider, "Provider credential stored");
        Ok(id)
    }

    pub fn get_credential(&self, id: i64) -> AiResult<Option<CredentialRecord>> {
        let db = self.conn();
        let record = db
            .query_row(
                &format!("SELECT {COLUMNS} FROM api_keys WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// The primary active credential for a provider: active with the
    /// greatest `created_at`.
    pub fn primary_credential(&self, provider: &str) -> AiResult<Option<CredentialRecord>> {
        let db = self.conn();
        let record = db
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM api_keys \
                     WHERE provider = ?1 AND is_active = 1 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![provider.to_lowercase()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn has_active_credential(&self, provider: &str) -> AiResult<bool> {
        let db = self.conn();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE provider = ?1 AND is_active = 1",
            params![provider.to_lowercase()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List credential metadata, newest first. Plaintext is never included.
    pub fn list_credentials(
        &self,
        provider_filter: Option<&str>,
        active_only: bool,
    ) -> AiResult<Vec<CredentialRecord>> {
        let db = self.conn();
        let mut sql = format!("SELECT {COLUMNS} FROM api_keys WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();
        if let Some(p) = provider_filter {
            sql.push_str(" AND provider = ?1");
            args.push(p.to_lowercase());
        }
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stamp a credential as used: bump `usage_count`, set `last_used_at`.
    pub fn touch_credential(&self, id: i64) -> AiResult<()> {
        let db = self.conn();
        db.execute(
            "UPDATE api_keys SET usage_count = usage_count + 1, last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn update_credential(
        &self,
        id: i64,
        label: Option<&str>,
        notes: Option<&str>,
        is_active: Option<bool>,
    ) -> AiResult<CredentialRecord> {
        {
            let db = self.conn();
            if let Some(label) = label {
                db.execute("UPDATE api_keys SET label = ?1 WHERE id = ?2", params![label, id])?;
            }
            if let Some(notes) = notes {
                db.execute("UPDATE api_keys SET notes = ?1 WHERE id = ?2", params![notes, id])?;
            }
            if let Some(active) = is_active {
                db.execute(
                    "UPDATE api_keys SET is_active = ?1 WHERE id = ?2",
                    params![active, id],
                )?;
            }
        }
        self.get_credential(id)?
            .ok_or_else(|| AiError::NotFound(format!("credential {id}")))
    }

    pub fn delete_credential(&self, id: i64) -> AiResult<bool> {
        let db = self.conn();
        let rows = db.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        if rows > 0 {
            tracing::info!(credential_id = id, "Provider credential deleted");
        }
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_list_without_plaintext() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_credential("gemini", "ENCBLOB", "...3w", Some("prod"), None, Some(1))
            .unwrap();
        let listed = store.list_credentials(None, false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].provider, "gemini");
        assert_eq!(listed[0].key_preview, "...3w");
        let json = serde_json::to_value(&listed[0]).unwrap();
        assert!(json.get("encrypted_key").is_none());
    }

    #[test]
    fn test_primary_is_newest_active() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .insert_credential("gemini", "OLD", "...old", None, None, None)
            .unwrap();
        let second = store
            .insert_credential("gemini", "NEW", "...new", None, None, None)
            .unwrap();

        let primary = store.primary_credential("gemini").unwrap().unwrap();
        assert_eq!(primary.id, second);

        // Deactivating the newest falls back to the older record
        store.update_credential(second, None, None, Some(false)).unwrap();
        let primary = store.primary_credential("gemini").unwrap().unwrap();
        assert_eq!(primary.id, first);

        store.update_credential(first, None, None, Some(false)).unwrap();
        assert!(store.primary_credential("gemini").unwrap().is_none());
        assert!(!store.has_active_credential("gemini").unwrap());
    }

    #[test]
    fn test_touch_updates_usage() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_credential("openai", "ENC", "...2345", None, None, None)
            .unwrap();
        store.touch_credential(id).unwrap();
        store.touch_credential(id).unwrap();
        let rec = store.get_credential(id).unwrap().unwrap();
        assert_eq!(rec.usage_count, 2);
        assert!(rec.last_used_at.is_some());
    }

    #[test]
    fn test_delete() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_credential("openai", "ENC", "...2345", None, None, None)
            .unwrap();
        assert!(store.delete_credential(id).unwrap());
        assert!(!store.delete_credential(id).unwrap());
        assert!(store.get_credential(id).unwrap().is_none());
    }
}
