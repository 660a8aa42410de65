//! Configuration reload: the file is re-parsed atomically, in-flight
//! requests keep the snapshot they started with, the next request sees the
//! new one.

mod common;

use std::sync::Arc;
use thriftroute::config::Config;
use thriftroute::facade::RouterFacade;

#[tokio::test]
async fn reload_swaps_the_snapshot_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");

    let mut config_yaml = common::BASE_CONFIG.to_string();
    config_yaml = config_yaml.replace("data/conversations.db", &format!(
        "{}/conversations.db",
        dir.path().display()
    ));
    std::fs::write(&config_path, &config_yaml).unwrap();

    let config = Config::from_file(&config_path).unwrap();
    let facade = Arc::new(
        RouterFacade::new(config, Some(config_path.clone()))
            .await
            .unwrap(),
    );

    // A request in flight would hold this snapshot.
    let before = facade.config();
    assert_eq!(before.server.request_timeout_seconds, 30);

    // Operator edits the file and reloads.
    let edited = config_yaml.replace("request_timeout_seconds: 30", "request_timeout_seconds: 77");
    std::fs::write(&config_path, edited).unwrap();
    facade.reload_config().await.unwrap();

    // The old snapshot is untouched; the next request sees the new one.
    assert_eq!(before.server.request_timeout_seconds, 30);
    assert_eq!(facade.config().server.request_timeout_seconds, 77);
}

#[tokio::test]
async fn reload_rejects_a_broken_file_and_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    let config_yaml = common::BASE_CONFIG.replace(
        "data/conversations.db",
        &format!("{}/conversations.db", dir.path().display()),
    );
    std::fs::write(&config_path, &config_yaml).unwrap();

    let config = Config::from_file(&config_path).unwrap();
    let facade = Arc::new(
        RouterFacade::new(config, Some(config_path.clone()))
            .await
            .unwrap(),
    );

    // Break the file: an empty fallback chain fails validation.
    let broken = config_yaml.replace("chain: [\"local\", \"cloud\"]", "chain: []");
    std::fs::write(&config_path, broken).unwrap();
    assert!(facade.reload_config().await.is_err());

    // The previous configuration stays active.
    assert_eq!(facade.config().fallback.chain, vec!["local", "cloud"]);
}
