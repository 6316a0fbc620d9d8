use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::PathBuf;

/// Creates the sqlite file (and its parent directory) for file-backed DSNs.
pub fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub async fn connect_pool(dsn: &str) -> Result<Pool<Sqlite>, String> {
    ensure_sqlite_file(dsn)?;
    let options = dsn
        .parse::<SqliteConnectOptions>()
        .map_err(|err| format!("database_dsn_parse_failed: {err}"))?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));
    // An in-memory database lives per connection, so keep exactly one.
    let max_connections = if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        1
    } else {
        5
    };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|err| format!("database_init_failed: {err}"))
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

pub fn get_ts(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    parse_ts(&raw)
}

pub fn get_opt_ts(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
    raw.as_deref().map(parse_ts).transpose()
}

pub fn get_bool(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<bool, String> {
    Ok(row.try_get::<i64, _>(column).map_err(|e| e.to_string())? == 1)
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

pub fn bool_flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_with_micro_precision() {
        let now = Utc::now();
        let parsed = parse_ts(&format_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn memory_dsn_needs_no_file() {
        assert!(ensure_sqlite_file("sqlite::memory:").is_ok());
        assert!(ensure_sqlite_file("sqlite://file:x?mode=memory").is_ok());
    }
}
