//! Integration tests for config parsing against the real config.toml.

use std::path::PathBuf;

use deskbridge_core::Config;
use deskbridge_core::bluetooth::BluetoothType;
use deskbridge_core::bluetooth::pairing::{PinRules, PinValue};
use deskbridge_core::session::actions::{BackendFacts, Capabilities, PromptStatus};
use deskbridge_core::session::{MenuModel, Profile, Sections};

fn project_root() -> PathBuf {
    // crates/deskbridge-core/ -> project root
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

#[test]
fn test_load_real_config() {
    let config_path = project_root().join("config.toml");

    let config = Config::load(&config_path).expect("Failed to load config.toml");

    assert!(config.session.max_users > 0);
    assert!(!config.bluetooth.pin_rules.is_empty(), "Expected PIN rules");
    assert!(
        ["DisplayYesNo", "KeyboardDisplay", "DisplayOnly"]
            .contains(&config.bluetooth.agent_capability.as_str()),
        "Agent capability should be able to show a PIN"
    );
}

#[test]
fn test_real_config_validates() {
    let config_path = project_root().join("config.toml");
    let config = Config::load(&config_path).unwrap();

    config.validate().expect("Real config.toml should be valid");
}

#[test]
fn test_real_config_pin_rules() {
    let config_path = project_root().join("config.toml");
    let config = Config::load(&config_path).unwrap();
    let rules = PinRules::from_config(&config.bluetooth.pin_rules);
    assert_eq!(rules.len(), config.bluetooth.pin_rules.len());

    let keyboard = rules
        .lookup(BluetoothType::Keyboard, "00:11:22:33:44:55", "Keys")
        .expect("keyboards have a rule");
    assert_eq!(keyboard.pin, PinValue::Keyboard);

    let mouse = rules
        .lookup(BluetoothType::Mouse, "00:11:22:33:44:55", "Mouse")
        .expect("mice have a rule");
    assert_eq!(mouse.pin, PinValue::Literal("0000".to_string()));

    assert!(
        rules
            .lookup(BluetoothType::Phone, "00:11:22:33:44:55", "Phone")
            .is_none()
    );
}

#[test]
fn test_config_summary() {
    let config_path = project_root().join("config.toml");
    let config = Config::load(&config_path).unwrap();

    let summary = config.summary();

    assert!(summary.contains("Services:"));
    assert!(summary.contains("Session:"));
    assert!(summary.contains("Bluetooth:"));
    assert!(summary.contains("OBEX:"));
    assert!(summary.contains("max_users:"), "Summary should show max_users");
}

#[test]
fn test_find_and_load_with_explicit_path() {
    let config_path = project_root().join("config.toml");

    let result = Config::find_and_load(Some(&config_path)).unwrap();

    assert!(!result.used_defaults);
    assert_eq!(result.source, Some(config_path));
    result
        .config
        .validate()
        .expect("Loaded config should be valid");
}

#[test]
fn test_find_and_load_explicit_missing_fails() {
    let missing_path = PathBuf::from("/nonexistent/config.toml");

    let result = Config::find_and_load(Some(&missing_path));
    assert!(result.is_err());
}

#[test]
fn test_find_and_load_no_explicit_uses_search_chain() {
    // may find a user config or fall back to defaults
    let result = Config::find_and_load(None).unwrap();
    result.config.validate().expect("Config should be valid");
}

#[test]
fn test_broken_config_returns_error_not_defaults() {
    use std::io::Write;

    let temp_dir = std::env::temp_dir().join("deskbridge_test_broken_config");
    let _ = std::fs::remove_dir_all(&temp_dir);
    std::fs::create_dir_all(&temp_dir).unwrap();

    let broken_config_path = temp_dir.join("config.toml");
    let mut file = std::fs::File::create(&broken_config_path).unwrap();
    writeln!(file, "this is not valid toml {{{{").unwrap();
    drop(file);

    let result = Config::load(&broken_config_path);
    assert!(result.is_err(), "Broken config should fail to load");

    std::fs::remove_dir_all(&temp_dir).unwrap();
}

#[test]
fn test_partial_user_config_keeps_defaults() {
    let temp_dir = std::env::temp_dir().join("deskbridge_test_partial_config");
    let _ = std::fs::remove_dir_all(&temp_dir);
    std::fs::create_dir_all(&temp_dir).unwrap();

    let path = temp_dir.join("config.toml");
    std::fs::write(&path, "[session]\nmax_users = 3\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.session.max_users, 3);
    assert!(config.session.user_show_menu);
    assert_eq!(config.keybindings.screensaver, "<Control><Alt>l");
    assert_eq!(
        config.bluetooth.pin_rules,
        Config::default().bluetooth.pin_rules
    );

    std::fs::remove_dir_all(&temp_dir).unwrap();
}

#[test]
fn test_default_config_toml_parses_without_error() {
    let config =
        Config::from_default_toml().expect("DEFAULT_CONFIG_TOML should parse without error");
    config
        .validate()
        .expect("DEFAULT_CONFIG_TOML should pass validation");
}

#[test]
fn test_validation_rejects_invalid_agent_capability() {
    let toml = r#"
        [bluetooth]
        agent_capability = "TelepathyOnly"
    "#;

    let config: Config = toml::from_str(toml).unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(
        err.contains("bluetooth.agent_capability"),
        "Error should mention bluetooth.agent_capability"
    );
}

#[test]
fn test_validation_rejects_bad_pin_rule() {
    let toml = r#"
        [bluetooth]
        pin_rules = [
            { type = "toaster", pin = "0000" },
            { type = "mouse", pin = "12ab" },
            { type = "keyboard", pin = "KEYBOARD", max_digits = 40 },
        ]
    "#;

    let config: Config = toml::from_str(toml).unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("bluetooth.pin_rules[0].type"));
    assert!(err.contains("bluetooth.pin_rules[1].pin"));
    assert!(err.contains("bluetooth.pin_rules[2].max_digits"));
}

#[test]
fn test_unknown_field_is_rejected() {
    let toml = r#"
        [session]
        max_user = 4
    "#;

    let result: Result<Config, _> = toml::from_str(toml);
    assert!(result.is_err(), "Misspelled keys should not be ignored");
}

#[test]
fn test_validation_collects_multiple_errors() {
    let toml = r#"
        [session]
        max_users = 0

        [bluetooth]
        agent_capability = "Nope"
    "#;

    let config: Config = toml::from_str(toml).unwrap();
    let err = config.validate().unwrap_err().to_string();

    assert!(err.contains("session.max_users"));
    assert!(err.contains("bluetooth.agent_capability"));
}

#[test]
fn test_default_config_builds_desktop_menu() {
    let config = Config::from_default_toml().unwrap();
    let facts = BackendFacts {
        seat_can_multi_session: true,
        can_suspend: false,
        can_hibernate: false,
        has_online_account_error: false,
    };
    let caps = Capabilities::compute(
        &config.session,
        &config.lockdown,
        PromptStatus::None,
        &facts,
    );
    let mut model = MenuModel::new(config, caps);

    let sections = model.build(Profile::Desktop);
    assert_eq!(sections.len(), Profile::Desktop.sections().len());

    let logout = &sections[Profile::Desktop.position(Sections::LOGOUT).unwrap()];
    assert_eq!(logout[0].label, "Log Out");

    let session = &sections[Profile::Desktop.position(Sections::SESSION).unwrap()];
    let labels: Vec<&str> = session.iter().map(|i| i.label.as_str()).collect();
    assert_eq!(labels, ["Restart", "Shut Down"]);
}
