use jogkit_core::{Axis, Position, Units};
use jogkit_settings::{Config, SettingsError};
use tempfile::TempDir;

#[test]
fn test_toml_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::new();
    config.connection.port = "COM3".to_string();
    config.connection.reconnect_backoff = 1.5;
    config.machine.units = Units::Inches;
    config.machine.homing_sequence = vec![Axis::Z, Axis::Y];
    config.machine.homing_retract = Position::new(2.0, 2.0, -1.0);

    config.save_to_file(&path).unwrap();
    let loaded = Config::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_json_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");

    let mut config = Config::new();
    config.dispatcher.queue_capacity = 16;
    config.event_bus.enable_history = true;

    config.save_to_file(&path).unwrap();
    assert_eq!(Config::load_from_file(&path).unwrap(), config);
}

#[test]
fn test_partial_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[connection]\nport = \"mock\"\nmax_reconnect_attempts = 2\n",
    )
    .unwrap();

    let config = Config::load_from_file(&path).unwrap();
    assert_eq!(config.connection.port, "mock");
    assert_eq!(config.connection.max_reconnect_attempts, 2);
    assert_eq!(config.connection.baud_rate, 115200);
    assert_eq!(config.machine, Config::default().machine);
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[dispatcher]\nqueue_capacity = 0\n").unwrap();

    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::InvalidSetting { .. })
    ));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}
