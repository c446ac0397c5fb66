use super::{normalize_database_url, prepare_database_url, resolve_settings, DEFAULT_PUSH_CAPACITY};

use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_memory_and_explicit_urls() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite://./data/x.db?mode=rwc"),
        "sqlite://./data/x.db?mode=rwc"
    );
    assert_eq!(normalize_database_url("  "), "sqlite://./data/mori.db");
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("mori_server_test_{suffix}"));
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn environment_overrides_file_values() {
    let file = r#"
bind_addr = "0.0.0.0:9000"
database_url = "sqlite://./file.db"
api_key = "from-file"
"#;
    let settings = resolve_settings(
        Some(file),
        env_from(&[("APP__DATABASE_URL", "sqlite::memory:"), ("MORI_API_KEY", "from-env")]),
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.api_key.as_deref(), Some("from-env"));
    assert_eq!(settings.push_capacity, DEFAULT_PUSH_CAPACITY);
}

#[test]
fn blank_api_key_disables_the_check_and_bad_capacity_is_ignored() {
    let settings = resolve_settings(
        Some("push_capacity = \"zero\""),
        env_from(&[("MORI_API_KEY", "  "), ("APP__PUSH_CAPACITY", "0")]),
    );
    assert!(settings.api_key.is_none());
    assert_eq!(settings.push_capacity, DEFAULT_PUSH_CAPACITY);

    let settings = resolve_settings(None, env_from(&[("APP__PUSH_CAPACITY", "64")]));
    assert_eq!(settings.push_capacity, 64);
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("mori_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
