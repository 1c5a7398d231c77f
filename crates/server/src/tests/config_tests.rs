use super::{normalize_database_url, Settings};

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn normalizes_sqlite_shorthand() {
    assert_eq!(
        normalize_database_url("sqlite:data/test.db"),
        "sqlite://data/test.db"
    );
}

#[test]
fn memory_and_scheme_urls_pass_through() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite://./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn blank_url_falls_back_to_the_default() {
    assert_eq!(
        normalize_database_url("   "),
        Settings::default().database_url
    );
}

#[test]
fn delivery_policy_reflects_the_configured_windows() {
    let settings = Settings {
        edit_window_seconds: 60,
        delete_window_seconds: 120,
        notify_batch_ms: 500,
        ..Settings::default()
    };
    let policy = settings.delivery_policy();
    assert_eq!(policy.edit_window, chrono::Duration::seconds(60));
    assert_eq!(policy.delete_window, chrono::Duration::seconds(120));
    assert_eq!(policy.batch_window, std::time::Duration::from_millis(500));
}
