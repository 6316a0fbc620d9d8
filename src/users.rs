use crate::store::{format_ts, get_bool, get_opt_ts, get_ts, is_unique_violation};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

const SESSION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl User {
    /// Admins see every bot; everyone else only the bots they created.
    pub fn can_manage_bot(&self, created_by: &str) -> bool {
        self.role.is_admin() || self.id == created_by
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreateUserError {
    #[error("username already taken")]
    UsernameTaken,
    #[error("{0}")]
    Storage(String),
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_login_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub fn hash_password(password: &str) -> Result<String, String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| e.to_string())
    }

    pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| e.to_string())?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    pub async fn user_count(&self) -> Result<i64, String> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.try_get::<i64, _>("count").map_err(|e| e.to_string())
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: UserRole,
    ) -> Result<User, CreateUserError> {
        let id = uuid::Uuid::new_v4().to_string();
        let password_hash = Self::hash_password(password).map_err(CreateUserError::Storage)?;
        let now = Utc::now();

        sqlx::query(
            r#"INSERT INTO users (id, username, password_hash, role, created_at, updated_at, enabled)
               VALUES (?, ?, ?, ?, ?, ?, 1)"#,
        )
        .bind(&id)
        .bind(username)
        .bind(&password_hash)
        .bind(role.as_str())
        .bind(format_ts(now))
        .bind(format_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CreateUserError::UsernameTaken
            } else {
                CreateUserError::Storage(e.to_string())
            }
        })?;

        Ok(User {
            id,
            username: username.to_string(),
            password_hash,
            role,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            enabled: true,
        })
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, role, created_at, updated_at, last_login_at, enabled FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, role, created_at, updated_at, last_login_at, enabled FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn update_last_login(&self, id: &str) -> Result<(), String> {
        sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
            .bind(format_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn create_session(&self, user_id: &str) -> Result<Session, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut raw = [0u8; 24];
        OsRng.fill_bytes(&mut raw);
        let token = format!("brs_{}", hex::encode(raw));
        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(SESSION_TTL_DAYS);

        sqlx::query(
            r#"INSERT INTO sessions (id, user_id, token, created_at, expires_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(&token)
        .bind(format_ts(now))
        .bind(format_ts(expires_at))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Session {
            id,
            user_id: user_id.to_string(),
            token,
            created_at: now,
            expires_at,
        })
    }

    pub async fn get_session_by_token(&self, token: &str) -> Result<Option<Session>, String> {
        let row = sqlx::query(
            "SELECT id, user_id, token, created_at, expires_at FROM sessions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at = get_ts(&row, "expires_at")?;
        if expires_at < Utc::now() {
            self.delete_session(token).await?;
            return Ok(None);
        }

        Ok(Some(Session {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
            token: row.try_get("token").map_err(|e| e.to_string())?,
            created_at: get_ts(&row, "created_at")?,
            expires_at,
        }))
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    let role_str: String = row.try_get("role").map_err(|e| e.to_string())?;
    let role = UserRole::from_str(&role_str).ok_or_else(|| "invalid role".to_string())?;

    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        password_hash: row.try_get("password_hash").map_err(|e| e.to_string())?,
        role,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
        last_login_at: get_opt_ts(row, "last_login_at")?,
        enabled: get_bool(row, "enabled")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect_pool;

    async fn store() -> UserStore {
        let pool = connect_pool("sqlite::memory:").await.unwrap();
        UserStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_username_is_reported_as_taken() {
        let store = store().await;
        store
            .create_user("alice", "secret123", UserRole::Admin)
            .await
            .unwrap();
        let err = store
            .create_user("alice", "other-secret", UserRole::User)
            .await
            .unwrap_err();
        assert_eq!(err, CreateUserError::UsernameTaken);
        assert_eq!(err.to_string(), "username already taken");
        assert_eq!(CreateUserError::Storage("disk full".into()).to_string(), "disk full");
    }

    #[tokio::test]
    async fn sessions_resolve_until_deleted() {
        let store = store().await;
        let user = store
            .create_user("bob", "secret123", UserRole::User)
            .await
            .unwrap();
        let session = store.create_session(&user.id).await.unwrap();
        assert!(session.token.starts_with("brs_"));
        let found = store.get_session_by_token(&session.token).await.unwrap();
        assert_eq!(found.map(|s| s.user_id), Some(user.id.clone()));

        store.delete_session(&session.token).await.unwrap();
        assert!(store.get_session_by_token(&session.token).await.unwrap().is_none());
    }

    #[test]
    fn password_hash_verifies_only_the_original() {
        let hash = UserStore::hash_password("hunter22").unwrap();
        assert!(UserStore::verify_password("hunter22", &hash).unwrap());
        assert!(!UserStore::verify_password("hunter23", &hash).unwrap());
    }
}
