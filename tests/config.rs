use botrelay::app::RuntimeConfig;
use botrelay::users::UserRole;
use tempfile::TempDir;

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("botrelay.db");
    assert!(!db_path.exists());

    let runtime = RuntimeConfig::with_database(format!("sqlite://{}", db_path.display()));
    let _state = botrelay::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = RuntimeConfig::with_database("sqlite::memory:");
    let state = botrelay::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    assert_eq!(state.user_store.user_count().await.unwrap(), 0);
}

#[tokio::test]
async fn admin_account_seeded_once_on_empty_database() {
    let temp_dir = TempDir::new().expect("temp dir");
    let dsn = format!("sqlite://{}", temp_dir.path().join("botrelay.db").display());

    let mut runtime = RuntimeConfig::with_database(dsn.clone());
    runtime.admin_username = Some("root".to_string());
    runtime.admin_password = Some("root-password".to_string());
    let state = botrelay::app::load_state_with_runtime(runtime.clone())
        .await
        .expect("load state");

    let admin = state
        .user_store
        .get_user_by_username("root")
        .await
        .unwrap()
        .expect("admin seeded");
    assert_eq!(admin.role, UserRole::Admin);
    drop(state);

    runtime.admin_username = Some("other".to_string());
    let state = botrelay::app::load_state_with_runtime(runtime)
        .await
        .expect("reload state");
    assert_eq!(state.user_store.user_count().await.unwrap(), 1);
    assert!(
        state
            .user_store
            .get_user_by_username("other")
            .await
            .unwrap()
            .is_none()
    );
}

#[test]
fn runtime_defaults_match_documented_values() {
    let runtime = RuntimeConfig::with_database("sqlite::memory:");
    assert_eq!(runtime.metrics_path, "/metrics");
    assert_eq!(runtime.upstream_timeout_ms, 30_000);
    assert_eq!(runtime.bot_sync_interval_secs, 0);
    assert_eq!(runtime.fallback_message, botrelay::app::DEFAULT_FALLBACK_MESSAGE);
}
