use crate::store::{bool_flag, format_ts, get_bool, get_ts};
use crate::upstream::UpstreamTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotCategory {
    #[default]
    CustomerService,
    Sales,
    Support,
    General,
}

impl BotCategory {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CUSTOMER_SERVICE" => Some(Self::CustomerService),
            "SALES" => Some(Self::Sales),
            "SUPPORT" => Some(Self::Support),
            "GENERAL" => Some(Self::General),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerService => "CUSTOMER_SERVICE",
            Self::Sales => "SALES",
            Self::Support => "SUPPORT",
            Self::General => "GENERAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Bot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub category: BotCategory,
    #[serde(skip_serializing)]
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub is_active: bool,
    pub welcome_message: Option<String>,
    pub fallback_message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    pub fn upstream_target(&self) -> UpstreamTarget {
        UpstreamTarget {
            base_url: self.upstream_base_url.clone(),
            api_key: self.upstream_api_key.clone(),
        }
    }
}

/// Directory entry for the active-bot listing; carries no upstream settings.
#[derive(Debug, Clone, Serialize)]
pub struct PublicBot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub category: BotCategory,
    pub welcome_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub creator_username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBotInput {
    pub name: String,
    pub description: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub category: BotCategory,
    pub upstream_api_key: String,
    pub upstream_base_url: Option<String>,
    pub welcome_message: Option<String>,
    pub fallback_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBotInput {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub avatar: Option<Option<String>>,
    pub category: Option<BotCategory>,
    pub upstream_api_key: Option<String>,
    pub upstream_base_url: Option<String>,
    pub is_active: Option<bool>,
    pub welcome_message: Option<Option<String>>,
    pub fallback_message: Option<Option<String>>,
}

/// Fields refreshed from the provider by a metadata sync. `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotMetadataUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub welcome_message: Option<String>,
    pub avatar: Option<String>,
}

impl BotMetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.welcome_message.is_none()
            && self.avatar.is_none()
    }
}

const BOT_COLUMNS: &str = "id, name, description, avatar, category, upstream_api_key, upstream_base_url, is_active, welcome_message, fallback_message, created_by, created_at, updated_at";

#[derive(Clone)]
pub struct BotStore {
    pool: Pool<Sqlite>,
    default_base_url: String,
}

impl BotStore {
    pub async fn new(pool: Pool<Sqlite>, default_base_url: String) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                avatar TEXT,
                category TEXT NOT NULL DEFAULT 'CUSTOMER_SERVICE',
                upstream_api_key TEXT NOT NULL,
                upstream_base_url TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                welcome_message TEXT,
                fallback_message TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (created_by) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bots_created_by ON bots(created_by)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            pool,
            default_base_url,
        })
    }

    pub async fn create_bot(&self, created_by: &str, input: CreateBotInput) -> Result<Bot, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let base_url = input
            .upstream_base_url
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.default_base_url.clone());

        sqlx::query(
            r#"INSERT INTO bots (id, name, description, avatar, category, upstream_api_key, upstream_base_url,
                                 is_active, welcome_message, fallback_message, created_by, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.avatar)
        .bind(input.category.as_str())
        .bind(&input.upstream_api_key)
        .bind(&base_url)
        .bind(&input.welcome_message)
        .bind(&input.fallback_message)
        .bind(created_by)
        .bind(format_ts(now))
        .bind(format_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Bot {
            id,
            name: input.name,
            description: input.description,
            avatar: input.avatar,
            category: input.category,
            upstream_api_key: input.upstream_api_key,
            upstream_base_url: base_url,
            is_active: true,
            welcome_message: input.welcome_message,
            fallback_message: input.fallback_message,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_bot(&self, id: &str) -> Result<Option<Bot>, String> {
        let row = sqlx::query(&format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_bot).transpose()
    }

    /// Lists bots newest first. `owner = None` lists every bot.
    pub async fn list_bots(
        &self,
        owner: Option<&str>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Bot>, i64), String> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut bindings: Vec<String> = Vec::new();
        if let Some(owner) = owner {
            conditions.push("created_by = ?");
            bindings.push(owner.to_string());
        }
        if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
            conditions.push("(name LIKE ? OR description LIKE ?)");
            let pattern = format!("%{search}%");
            bindings.push(pattern.clone());
            bindings.push(pattern);
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as count FROM bots{where_clause}");
        let mut count_query = sqlx::query(&count_sql);
        for value in &bindings {
            count_query = count_query.bind(value);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .try_get("count")
            .map_err(|e| e.to_string())?;

        let list_sql = format!(
            "SELECT {BOT_COLUMNS} FROM bots{where_clause} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        let mut list_query = sqlx::query(&list_sql);
        for value in &bindings {
            list_query = list_query.bind(value);
        }
        let rows = list_query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let bots = rows.iter().map(row_to_bot).collect::<Result<Vec<_>, _>>()?;
        Ok((bots, total))
    }

    pub async fn list_active_bots(&self) -> Result<Vec<Bot>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {BOT_COLUMNS} FROM bots WHERE is_active = 1 ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_bot).collect()
    }

    /// Active bots, newest first, with their creator's username.
    pub async fn list_public_bots(&self) -> Result<Vec<PublicBot>, String> {
        let rows = sqlx::query(
            r#"SELECT b.id, b.name, b.description, b.avatar, b.category, b.welcome_message,
                      b.created_at, u.username AS creator_username
               FROM bots b
               LEFT JOIN users u ON u.id = b.created_by
               WHERE b.is_active = 1
               ORDER BY b.created_at DESC, b.rowid DESC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter().map(row_to_public_bot).collect()
    }

    pub async fn update_bot(&self, id: &str, input: UpdateBotInput) -> Result<Option<Bot>, String> {
        let mut updates: Vec<&str> = Vec::new();
        let mut bindings: Vec<Option<String>> = Vec::new();

        if let Some(name) = input.name {
            updates.push("name = ?");
            bindings.push(Some(name));
        }
        if let Some(description) = input.description {
            updates.push("description = ?");
            bindings.push(description);
        }
        if let Some(avatar) = input.avatar {
            updates.push("avatar = ?");
            bindings.push(avatar);
        }
        if let Some(category) = input.category {
            updates.push("category = ?");
            bindings.push(Some(category.as_str().to_string()));
        }
        if let Some(key) = input.upstream_api_key {
            updates.push("upstream_api_key = ?");
            bindings.push(Some(key));
        }
        if let Some(base_url) = input.upstream_base_url {
            updates.push("upstream_base_url = ?");
            bindings.push(Some(base_url));
        }
        if let Some(is_active) = input.is_active {
            updates.push("is_active = ?");
            bindings.push(Some(bool_flag(is_active).to_string()));
        }
        if let Some(welcome) = input.welcome_message {
            updates.push("welcome_message = ?");
            bindings.push(welcome);
        }
        if let Some(fallback) = input.fallback_message {
            updates.push("fallback_message = ?");
            bindings.push(fallback);
        }

        self.apply_updates(id, updates, bindings).await
    }

    /// Writes back whatever a metadata sync managed to fetch.
    pub async fn apply_metadata(
        &self,
        id: &str,
        update: BotMetadataUpdate,
    ) -> Result<Option<Bot>, String> {
        let mut updates: Vec<&str> = Vec::new();
        let mut bindings: Vec<Option<String>> = Vec::new();
        if let Some(name) = update.name {
            updates.push("name = ?");
            bindings.push(Some(name));
        }
        if let Some(description) = update.description {
            updates.push("description = ?");
            bindings.push(Some(description));
        }
        if let Some(welcome) = update.welcome_message {
            updates.push("welcome_message = ?");
            bindings.push(Some(welcome));
        }
        if let Some(avatar) = update.avatar {
            updates.push("avatar = ?");
            bindings.push(Some(avatar));
        }
        self.apply_updates(id, updates, bindings).await
    }

    async fn apply_updates(
        &self,
        id: &str,
        mut updates: Vec<&str>,
        mut bindings: Vec<Option<String>>,
    ) -> Result<Option<Bot>, String> {
        if updates.is_empty() {
            return self.get_bot(id).await;
        }
        updates.push("updated_at = ?");
        bindings.push(Some(format_ts(Utc::now())));

        let sql = format!("UPDATE bots SET {} WHERE id = ?", updates.join(", "));
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
        self.get_bot(id).await
    }

    /// Deletes the bot; keys, conversations and messages go with it.
    pub async fn delete_bot(&self, id: &str) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM bots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_bot(row: &sqlx::sqlite::SqliteRow) -> Result<Bot, String> {
    let category_str: String = row.try_get("category").map_err(|e| e.to_string())?;
    let category = BotCategory::from_str(&category_str)
        .ok_or_else(|| format!("invalid bot category: {category_str}"))?;

    Ok(Bot {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        avatar: row.try_get("avatar").map_err(|e| e.to_string())?,
        category,
        upstream_api_key: row.try_get("upstream_api_key").map_err(|e| e.to_string())?,
        upstream_base_url: row.try_get("upstream_base_url").map_err(|e| e.to_string())?,
        is_active: get_bool(row, "is_active")?,
        welcome_message: row.try_get("welcome_message").map_err(|e| e.to_string())?,
        fallback_message: row.try_get("fallback_message").map_err(|e| e.to_string())?,
        created_by: row.try_get("created_by").map_err(|e| e.to_string())?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_public_bot(row: &sqlx::sqlite::SqliteRow) -> Result<PublicBot, String> {
    let category_str: String = row.try_get("category").map_err(|e| e.to_string())?;
    Ok(PublicBot {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        avatar: row.try_get("avatar").map_err(|e| e.to_string())?,
        category: BotCategory::from_str(&category_str)
            .ok_or_else(|| format!("invalid bot category: {category_str}"))?,
        welcome_message: row.try_get("welcome_message").map_err(|e| e.to_string())?,
        created_at: get_ts(row, "created_at")?,
        creator_username: row.try_get("creator_username").map_err(|e| e.to_string())?,
    })
}
