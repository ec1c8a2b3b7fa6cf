use std::env;
use std::time::Duration;

use conversation_scope::config::AppConfig;
use serial_test::serial;

#[test]
#[serial]
fn default_config() {
    let config = AppConfig::load_from_args(["conversation-scope"]).expect("defaults load");

    assert_eq!(config.server.port, 3000);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.conversation.timeout_secs, 1800);
    assert_eq!(config.conversation.sweep_interval_secs, 300);
    assert_eq!(config.conversation.session_cookie, "sid");
    assert_eq!(config.conversation.timeout(), Duration::from_secs(1800));
    assert_eq!(
        config.conversation.sweep_interval(),
        Duration::from_secs(300)
    );
}

#[test]
fn cli_overrides() {
    let config = AppConfig::load_from_args([
        "conversation-scope",
        "--port",
        "9090",
        "--conversation-timeout-secs",
        "60",
        "--sweep-interval-secs",
        "10",
        "--database-url",
        "postgres://db.example/checkout",
    ])
    .expect("cli config");

    assert_eq!(config.server.port, 9090);
    assert_eq!(config.conversation.timeout(), Duration::from_secs(60));
    assert_eq!(config.conversation.sweep_interval(), Duration::from_secs(10));
    assert_eq!(
        config.persistence.database_url,
        "postgres://db.example/checkout"
    );
}

#[test]
#[serial]
fn env_overrides() {
    unsafe {
        env::set_var("CONVO_SERVER__PORT", "8081");
        env::set_var(
            "CONVO_CONVERSATION__INITIATORS",
            "/wizard/open.*;/wizard/resume.*",
        );
    }

    let config = AppConfig::load_from_args(["conversation-scope"]).expect("env config");
    assert_eq!(config.server.port, 8081);
    assert_eq!(
        config.conversation.initiators,
        "/wizard/open.*;/wizard/resume.*"
    );

    unsafe {
        env::remove_var("CONVO_SERVER__PORT");
        env::remove_var("CONVO_CONVERSATION__INITIATORS");
    }
}

#[test]
#[serial]
fn file_config() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("conversations.yaml");
    std::fs::write(
        &path,
        "server:\n  port: 7070\nconversation:\n  terminators: /wizard/done.*\n",
    )
    .expect("write config file");

    let config = AppConfig::load_from_args([
        "conversation-scope",
        "--config",
        path.to_str().expect("utf-8 path"),
    ])
    .expect("file config");

    assert_eq!(config.server.port, 7070);
    assert_eq!(config.conversation.terminators, "/wizard/done.*");
    // Keys the file does not mention keep their defaults.
    assert_eq!(config.conversation.timeout_secs, 1800);
    assert_eq!(config.conversation.initiators, "/checkout/start.*");
}
