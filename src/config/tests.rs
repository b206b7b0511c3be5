#![cfg(test)]

use std::path::PathBuf;

use crate::config::{Config, ConfigError, DuplicatePolicy};

/// Parse a TOML string into a `Config` and run the validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(toml_str)?;
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_basic_config() {
    let toml = r#"
        remotes = "VIEWER@10.0.0.5:104;WORKSTATION@ws.local:11113"

        [archive]
        storage_dir = "/var/lib/mupacs"
        duplicate_policy = "overwrite"
        match_absent_attributes = false

        [dimse]
        local_aet = "ARCHIVE"
        port = 4242
        max_concurrent_moves = 3

        [[remote]]
        ae_title = "MODALITY"
        host = "192.168.1.20"
        port = 104
        move_destination = false

        [logging]
        level = "debug,redb=warn"
    "#;

    let config = load_config_from_str(toml).expect("config should validate");

    assert_eq!(config.archive.storage_dir, PathBuf::from("/var/lib/mupacs"));
    assert_eq!(
        config.archive.index_path(),
        PathBuf::from("/var/lib/mupacs/index.redb")
    );
    assert_eq!(config.archive.duplicate_policy, DuplicatePolicy::Overwrite);
    assert!(!config.archive.match_absent_attributes);
    assert_eq!(config.dimse.local_aet, "ARCHIVE");
    assert_eq!(config.dimse.max_concurrent_moves, 3);

    let peers = config.peers().unwrap();
    assert_eq!(peers.len(), 3);
    assert_eq!(peers[0].ae_title, "MODALITY");
    assert!(peers[0].store);
    assert!(!peers[0].move_destination);
    assert_eq!(peers[2].to_string(), "WORKSTATION@ws.local:11113");
}

#[test]
fn test_defaults() {
    let config = load_config_from_str("").unwrap();
    assert_eq!(config.dimse.local_aet, "MUPACS");
    assert_eq!(config.archive.duplicate_policy, DuplicatePolicy::Reject);
    assert!(config.archive.match_absent_attributes);
    assert_eq!(config.logging.level, "info");
    assert!(config.peers().unwrap().is_empty());
}

#[test]
fn test_duplicate_remote_is_rejected() {
    let toml = r#"
        remotes = "VIEWER@10.0.0.5:104"

        [[remote]]
        ae_title = "VIEWER"
        host = "10.0.0.6"
        port = 104
    "#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_invalid_values() {
    assert!(load_config_from_str("remotes = \"VIEWER@nowhere\"").is_err());
    assert!(load_config_from_str("[dimse]\nlocal_aet = \"THIS_AE_IS_TOO_LONG\"").is_err());
    assert!(load_config_from_str("[archive]\nduplicate_policy = \"merge\"").is_err());
    assert!(load_config_from_str("[logging]\nlog_to_file = true\nlog_file_path = \"\"").is_err());
}

#[test]
fn test_from_file_resolves_relative_paths() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("mupacs.toml");
    std::fs::write(&path, "[archive]\nstorage_dir = \"data\"\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.archive.storage_dir, dir.path().join("data"));
    assert_eq!(config.archive.index_path(), dir.path().join("data").join("index.redb"));

    assert!(matches!(
        Config::from_file(dir.path().join("missing.toml")),
        Err(ConfigError::Io { .. })
    ));
}
