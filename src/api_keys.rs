use crate::bots::{Bot, BotStore};
use crate::store::{bool_flag, format_ts, get_bool, get_opt_ts, get_ts};
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};

pub const API_KEY_PREFIX: &str = "ak_";
pub const DEFAULT_PERMISSIONS: &str = "chat";
pub const DEFAULT_RATE_LIMIT: i64 = 100;
pub const CHAT_PERMISSION: &str = "chat";

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub permissions: String,
    pub rate_limit: i64,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.permissions
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.scopes().any(|s| s == permission)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateApiKeyInput {
    pub name: String,
    pub permissions: Option<String>,
    pub rate_limit: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateApiKeyInput {
    pub name: Option<String>,
    pub permissions: Option<String>,
    pub rate_limit: Option<i64>,
    pub is_active: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// Why a presented credential was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRejection {
    Unknown,
    Disabled,
    BotInactive,
    Expired,
    Storage(String),
}

impl KeyRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
            Self::BotInactive => "bot_inactive",
            Self::Expired => "expired",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unknown => "invalid api key",
            Self::Disabled => "api key is disabled",
            Self::BotInactive => "bot is inactive",
            Self::Expired => "api key has expired",
            Self::Storage(msg) => msg,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedKey {
    pub key: ApiKey,
    pub bot: Bot,
}

pub fn generate_secret() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    format!("{API_KEY_PREFIX}{}", hex::encode(raw))
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// `ak_1234...abcd`: first seven characters, last four.
pub fn display_prefix(secret: &str) -> String {
    if secret.len() <= 11 {
        return secret.to_string();
    }
    format!("{}...{}", &secret[..7], &secret[secret.len() - 4..])
}

const KEY_COLUMNS: &str = "id, bot_id, name, key_prefix, key_hash, permissions, rate_limit, is_active, expires_at, usage_count, last_used_at, created_at, updated_at";

#[derive(Clone)]
pub struct ApiKeyStore {
    pool: Pool<Sqlite>,
    bots: BotStore,
}

impl ApiKeyStore {
    pub async fn new(pool: Pool<Sqlite>, bots: BotStore) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                permissions TEXT NOT NULL DEFAULT 'chat',
                rate_limit INTEGER NOT NULL DEFAULT 100,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_at TEXT,
                usage_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (bot_id) REFERENCES bots(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_bot_id ON api_keys(bot_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool, bots })
    }

    /// Issues a new key. The plaintext secret is returned once and never stored.
    pub async fn create_api_key(
        &self,
        bot_id: &str,
        input: CreateApiKeyInput,
    ) -> Result<(ApiKey, String), String> {
        let id = uuid::Uuid::new_v4().to_string();
        let secret = generate_secret();
        let now = Utc::now();
        let permissions = input
            .permissions
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PERMISSIONS.to_string());
        let rate_limit = input.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT);

        let key = ApiKey {
            id,
            bot_id: bot_id.to_string(),
            name: input.name,
            key_prefix: display_prefix(&secret),
            key_hash: hash_secret(&secret),
            permissions,
            rate_limit,
            is_active: true,
            expires_at: input.expires_at,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"INSERT INTO api_keys (id, bot_id, name, key_prefix, key_hash, permissions, rate_limit,
                                     is_active, expires_at, usage_count, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, 0, ?, ?)"#,
        )
        .bind(&key.id)
        .bind(&key.bot_id)
        .bind(&key.name)
        .bind(&key.key_prefix)
        .bind(&key.key_hash)
        .bind(&key.permissions)
        .bind(key.rate_limit)
        .bind(key.expires_at.map(format_ts))
        .bind(format_ts(now))
        .bind(format_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok((key, secret))
    }

    pub async fn list_by_bot(&self, bot_id: &str) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE bot_id = ? ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_api_key).collect()
    }

    pub async fn get_api_key(&self, id: &str) -> Result<Option<ApiKey>, String> {
        let row = sqlx::query(&format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_api_key).transpose()
    }

    pub async fn update_api_key(
        &self,
        id: &str,
        input: UpdateApiKeyInput,
    ) -> Result<Option<ApiKey>, String> {
        let mut updates: Vec<&str> = Vec::new();
        let mut bindings: Vec<Option<String>> = Vec::new();

        if let Some(name) = input.name {
            updates.push("name = ?");
            bindings.push(Some(name));
        }
        if let Some(permissions) = input.permissions {
            updates.push("permissions = ?");
            bindings.push(Some(permissions));
        }
        if let Some(rate_limit) = input.rate_limit {
            updates.push("rate_limit = ?");
            bindings.push(Some(rate_limit.to_string()));
        }
        if let Some(is_active) = input.is_active {
            updates.push("is_active = ?");
            bindings.push(Some(bool_flag(is_active).to_string()));
        }
        if let Some(expires_at) = input.expires_at {
            updates.push("expires_at = ?");
            bindings.push(expires_at.map(format_ts));
        }

        if updates.is_empty() {
            return self.get_api_key(id).await;
        }
        updates.push("updated_at = ?");
        bindings.push(Some(format_ts(Utc::now())));

        let sql = format!("UPDATE api_keys SET {} WHERE id = ?", updates.join(", "));
        let mut query = sqlx::query(&sql);
        for value in &bindings {
            query = query.bind(value);
        }
        let result = query
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_api_key(id).await
    }

    pub async fn delete_api_key(&self, id: &str) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces the secret and resets usage. The old secret stops working immediately.
    pub async fn regenerate_api_key(&self, id: &str) -> Result<Option<(ApiKey, String)>, String> {
        let secret = generate_secret();
        let result = sqlx::query(
            r#"UPDATE api_keys
               SET key_prefix = ?, key_hash = ?, usage_count = 0, last_used_at = NULL, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(display_prefix(&secret))
        .bind(hash_secret(&secret))
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(self.get_api_key(id).await?.map(|key| (key, secret)))
    }

    /// Checks a presented secret and records one use of it.
    ///
    /// The usage bump is a single `usage_count = usage_count + 1` statement guarded
    /// on `is_active`, so concurrent validations of one key never lose an increment.
    pub async fn validate(&self, secret: &str) -> Result<ValidatedKey, KeyRejection> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE key_hash = ?"
        ))
        .bind(hash_secret(secret))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeyRejection::Storage(e.to_string()))?;
        let mut key = row
            .as_ref()
            .map(row_to_api_key)
            .transpose()
            .map_err(KeyRejection::Storage)?
            .ok_or(KeyRejection::Unknown)?;

        if !key.is_active {
            return Err(KeyRejection::Disabled);
        }

        let bot = self
            .bots
            .get_bot(&key.bot_id)
            .await
            .map_err(KeyRejection::Storage)?
            .ok_or(KeyRejection::Unknown)?;
        if !bot.is_active {
            return Err(KeyRejection::BotInactive);
        }

        let now = Utc::now();
        if key.is_expired_at(now) {
            return Err(KeyRejection::Expired);
        }

        let row = sqlx::query(
            r#"UPDATE api_keys SET usage_count = usage_count + 1, last_used_at = ?
               WHERE id = ? AND is_active = 1
               RETURNING usage_count"#,
        )
        .bind(format_ts(now))
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeyRejection::Storage(e.to_string()))?
        .ok_or(KeyRejection::Disabled)?;

        key.usage_count = row
            .try_get("usage_count")
            .map_err(|e| KeyRejection::Storage(e.to_string()))?;
        key.last_used_at = Some(now);

        Ok(ValidatedKey { key, bot })
    }
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        bot_id: row.try_get("bot_id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        key_prefix: row.try_get("key_prefix").map_err(|e| e.to_string())?,
        key_hash: row.try_get("key_hash").map_err(|e| e.to_string())?,
        permissions: row.try_get("permissions").map_err(|e| e.to_string())?,
        rate_limit: row.try_get("rate_limit").map_err(|e| e.to_string())?,
        is_active: get_bool(row, "is_active")?,
        expires_at: get_opt_ts(row, "expires_at")?,
        usage_count: row.try_get("usage_count").map_err(|e| e.to_string())?,
        last_used_at: get_opt_ts(row, "last_used_at")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_has_prefix_and_hex_body() {
        let secret = generate_secret();
        assert!(secret.starts_with(API_KEY_PREFIX));
        assert_eq!(secret.len(), 3 + 64);
        assert!(secret[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn display_prefix_keeps_head_and_tail() {
        let secret = format!("ak_{}", "0123456789abcdef".repeat(4));
        assert_eq!(display_prefix(&secret), "ak_0123...cdef");
    }

    #[test]
    fn hash_is_stable_and_hides_secret() {
        let a = hash_secret("ak_abc");
        assert_eq!(a, hash_secret("ak_abc"));
        assert_ne!(a, hash_secret("ak_abd"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn permissions_parse_as_comma_list() {
        let now = Utc::now();
        let key = ApiKey {
            id: "k".into(),
            bot_id: "b".into(),
            name: "n".into(),
            key_prefix: String::new(),
            key_hash: String::new(),
            permissions: "admin, chat".into(),
            rate_limit: 100,
            is_active: true,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(key.has_permission("chat"));
        assert!(key.has_permission("admin"));
        assert!(!key.has_permission("cha"));
        assert!(key.is_expired_at(now));
    }
}
