use std::process::Command;

#[test]
fn init_creates_valid_toml() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_concord"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(output.status.success(), "concord init failed: {}", String::from_utf8_lossy(&output.stderr));

    let config_path = dir.path().join(".concord.toml");
    assert!(config_path.exists(), ".concord.toml should exist");

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[llm]"));
    assert!(content.contains("[check]"));
    assert!(content.contains("[progress]"));

    // Every value is commented out, so parsing yields the defaults
    let config: concord_core::ConcordConfig = toml::from_str(&content).unwrap();
    assert_eq!(config.check, concord_core::CheckSettings::default());
    assert!(config.rules.is_empty());
}

#[test]
fn init_refuses_if_exists() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".concord.toml"), "# existing").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_concord"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let content = std::fs::read_to_string(dir.path().join(".concord.toml")).unwrap();
    assert_eq!(content, "# existing");
}
