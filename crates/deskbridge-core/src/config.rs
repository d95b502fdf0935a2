//! Configuration types and parsing.
//!
//! One TOML file replaces the desktop settings schemas the services used to
//! read (`[session]`, `[lockdown]`, `[keybindings]`) and carries the options
//! for the Bluetooth agents. The embedded `config.toml` is the base layer;
//! user files are deep-merged on top of it.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use toml::Table;

use crate::bluetooth::types::BluetoothType;
use crate::error::{Error, Result};

/// Agent capabilities understood by `org.bluez.AgentManager1.RegisterAgent`.
pub const VALID_AGENT_CAPABILITIES: &[&str] = &[
    "DisplayOnly",
    "DisplayYesNo",
    "KeyboardOnly",
    "NoInputNoOutput",
    "KeyboardDisplay",
];

/// Special PIN values with a meaning other than "send these digits".
pub const SPECIAL_PINS: &[&str] = &["KEYBOARD", "ICADE", "NULL"];

/// Embedded default configuration TOML, compiled into the binary.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../../config.toml");

/// Result of loading a configuration file.
#[derive(Debug)]
pub struct ConfigLoadResult {
    /// The loaded configuration.
    pub config: Config,
    /// Path where config was found, if any.
    pub source: Option<PathBuf>,
    /// Whether defaults were used (no config file found).
    pub used_defaults: bool,
}

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Which long-running services the daemon starts.
    pub services: ServicesConfig,

    /// Session indicator behaviour.
    pub session: SessionConfig,

    /// Administrative lockdown switches.
    pub lockdown: LockdownConfig,

    /// Keybindings shown next to menu items.
    pub keybindings: KeybindingsConfig,

    /// Bluetooth pairing agent options.
    pub bluetooth: BluetoothConfig,

    /// OBEX push receiver options.
    pub obex: ObexConfig,
}

impl Config {
    /// Load configuration from the embedded default TOML string.
    pub fn from_default_toml() -> Result<Self> {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TOML)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, merging with embedded defaults.
    ///
    /// Returns an error if the file doesn't exist or can't be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::load_with_defaults(&content)
    }

    /// Load configuration from a TOML string, merging with embedded defaults.
    ///
    /// Both documents are parsed as tables and deep-merged (user values win)
    /// before deserializing, so unknown keys in the user file are still
    /// rejected.
    pub fn load_with_defaults(user_toml: &str) -> Result<Self> {
        let mut base: Table = toml::from_str(DEFAULT_CONFIG_TOML)?;
        let user: Table = toml::from_str(user_toml)?;

        deep_merge_toml(&mut base, user);

        let config: Config = base.try_into()?;
        Ok(config)
    }

    /// Find and load configuration using the XDG lookup chain.
    ///
    /// If `explicit_path` is `Some`, that path is used directly and an error
    /// is returned if it doesn't exist or can't be parsed (no fallback).
    ///
    /// If `explicit_path` is `None`, searches in order:
    /// 1. `$XDG_CONFIG_HOME/deskbridge/config.toml`
    /// 2. `~/.config/deskbridge/config.toml`
    /// 3. `./config.toml` (current working directory)
    ///
    /// If no config file is found in the search chain, the embedded defaults
    /// are used.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<ConfigLoadResult> {
        if let Some(path) = explicit_path {
            let config = Self::load(path)?;
            return Ok(ConfigLoadResult {
                config,
                source: Some(path.to_path_buf()),
                used_defaults: false,
            });
        }

        // A config file that exists but fails to load is an error, never a
        // silent fallback to defaults.
        let search_paths = Self::config_search_paths();
        let mut first_error: Option<(PathBuf, Error)> = None;

        for path in &search_paths {
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(config) => {
                    return Ok(ConfigLoadResult {
                        config,
                        source: Some(path.clone()),
                        used_defaults: false,
                    });
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some((path.clone(), e));
                    }
                }
            }
        }

        if let Some((path, error)) = first_error {
            tracing::error!("Config file {:?} exists but failed to load: {}", path, error);
            return Err(error);
        }

        tracing::info!("No config file found, using built-in default config");
        tracing::debug!(
            "Searched: {}",
            search_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(ConfigLoadResult {
            config: Self::from_default_toml()?,
            source: None,
            used_defaults: true,
        })
    }

    /// Get the list of paths to search for config files.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(xdg_config) = env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg_config).join("deskbridge/config.toml"));
        }

        if let Ok(home) = env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/deskbridge/config.toml"));
        }

        paths.push(PathBuf::from("config.toml"));

        paths
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.session.max_users == 0 {
            errors.push("session.max_users: must be greater than 0".to_string());
        }

        if !VALID_AGENT_CAPABILITIES.contains(&self.bluetooth.agent_capability.as_str()) {
            errors.push(format!(
                "bluetooth.agent_capability: invalid value '{}', expected one of: {}",
                self.bluetooth.agent_capability,
                VALID_AGENT_CAPABILITIES.join(", ")
            ));
        }

        for (i, rule) in self.bluetooth.pin_rules.iter().enumerate() {
            if let Some(ref name) = rule.device_type
                && BluetoothType::from_name(name).is_none()
            {
                errors.push(format!(
                    "bluetooth.pin_rules[{}].type: unknown device type '{}'",
                    i, name
                ));
            }

            let pin = rule.pin.as_str();
            let is_digits = !pin.is_empty() && pin.chars().all(|c| c.is_ascii_digit());
            if !is_digits && !SPECIAL_PINS.contains(&pin) {
                errors.push(format!(
                    "bluetooth.pin_rules[{}].pin: '{}' must be digits or one of: {}",
                    i,
                    pin,
                    SPECIAL_PINS.join(", ")
                ));
            }

            if let Some(digits) = rule.max_digits
                && !(1..=16).contains(&digits)
            {
                errors.push(format!(
                    "bluetooth.pin_rules[{}].max_digits: {} is out of range 1-16",
                    i, digits
                ));
            }
        }

        if let Some(ref dir) = self.obex.download_dir
            && dir.as_os_str().is_empty()
        {
            errors.push("obex.download_dir: must not be empty when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigValidation(errors))
        }
    }

    /// Non-fatal issues worth logging.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.services.indicator && !self.services.pairing_agent && !self.services.obex_agent {
            warnings.push(
                "services: every service is disabled; the daemon will idle until killed"
                    .to_string(),
            );
        }

        if self.keybindings.screensaver.trim().is_empty() {
            warnings.push(
                "keybindings.screensaver: empty, lock items will show no accelerator".to_string(),
            );
        }

        warnings
    }

    /// Human-readable summary of the configuration.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        let on_off = |b: bool| if b { "enabled" } else { "disabled" };

        lines.push("Services:".to_string());
        lines.push(format!("  indicator: {}", on_off(self.services.indicator)));
        lines.push(format!(
            "  pairing_agent: {}",
            on_off(self.services.pairing_agent)
        ));
        lines.push(format!("  obex_agent: {}", on_off(self.services.obex_agent)));

        lines.push("\nSession:".to_string());
        lines.push(format!("  user_show_menu: {}", self.session.user_show_menu));
        lines.push(format!("  max_users: {}", self.session.max_users));
        lines.push(format!(
            "  show_real_name_on_panel: {}",
            self.session.show_real_name_on_panel
        ));

        lines.push("\nBluetooth:".to_string());
        lines.push(format!(
            "  agent_capability: {}",
            self.bluetooth.agent_capability
        ));
        lines.push(format!("  pin rules: {}", self.bluetooth.pin_rules.len()));

        lines.push("\nOBEX:".to_string());
        lines.push(format!("  accept_paired: {}", self.obex.accept_paired));
        match self.obex.download_dir {
            Some(ref dir) => lines.push(format!("  download_dir: {}", dir.display())),
            None => lines.push("  download_dir: (XDG download dir)".to_string()),
        }

        lines.join("\n")
    }
}

/// Deep merge two TOML tables, with `overlay` values taking precedence.
///
/// Nested tables merge recursively; arrays and scalars are replaced.
fn deep_merge_toml(base: &mut Table, overlay: Table) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(&key), overlay_value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                deep_merge_toml(base_table, overlay_table);
            }
            (_, overlay_value) => {
                base.insert(key, overlay_value);
            }
        }
    }
}

/// Services started by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServicesConfig {
    /// Export the session indicator menus and actions.
    pub indicator: bool,
    /// Register a BlueZ pairing agent.
    pub pairing_agent: bool,
    /// Register an OBEX push agent for incoming files.
    pub obex_agent: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            indicator: true,
            pairing_agent: true,
            obex_agent: true,
        }
    }
}

/// Session indicator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub suppress_logout_menuitem: bool,
    pub suppress_restart_menuitem: bool,
    pub suppress_shutdown_menuitem: bool,
    /// Skip confirmation prompts for log out, restart and shut down.
    pub suppress_logout_restart_shutdown: bool,
    /// Show the current user's real name next to the panel icon.
    pub show_real_name_on_panel: bool,
    /// List users in the switch section.
    pub user_show_menu: bool,
    /// Upper bound on listed users; the least useful are dropped first.
    pub max_users: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            suppress_logout_menuitem: false,
            suppress_restart_menuitem: false,
            suppress_shutdown_menuitem: false,
            suppress_logout_restart_shutdown: false,
            show_real_name_on_panel: false,
            user_show_menu: true,
            max_users: 12,
        }
    }
}

/// Lockdown switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LockdownConfig {
    pub disable_lock_screen: bool,
    pub disable_log_out: bool,
    pub disable_user_switching: bool,
}

/// Keybindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeybindingsConfig {
    /// Accelerator that locks the screen, in GTK accelerator syntax.
    pub screensaver: String,
}

impl Default for KeybindingsConfig {
    fn default() -> Self {
        Self {
            screensaver: "<Control><Alt>l".to_string(),
        }
    }
}

/// Bluetooth pairing agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BluetoothConfig {
    /// Capability passed to `RegisterAgent`.
    pub agent_capability: String,
    /// PIN rules, first match wins.
    pub pin_rules: Vec<PinRuleConfig>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            agent_capability: "DisplayYesNo".to_string(),
            pin_rules: default_pin_rules(),
        }
    }
}

/// One PIN rule. Every filter that is set must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinRuleConfig {
    /// Device type name (e.g. "keyboard", "headset").
    #[serde(default, rename = "type")]
    pub device_type: Option<String>,
    /// Address prefix such as "00:02:5B".
    #[serde(default)]
    pub address_prefix: Option<String>,
    /// Exact device name.
    #[serde(default)]
    pub name: Option<String>,
    /// Digits to send, or KEYBOARD, ICADE or NULL.
    pub pin: String,
    /// Length of generated PINs for KEYBOARD rules.
    #[serde(default)]
    pub max_digits: Option<u32>,
}

impl PinRuleConfig {
    fn for_type(device_type: &str, pin: &str) -> Self {
        Self {
            device_type: Some(device_type.to_string()),
            address_prefix: None,
            name: None,
            pin: pin.to_string(),
            max_digits: None,
        }
    }
}

fn default_pin_rules() -> Vec<PinRuleConfig> {
    let mut icade = PinRuleConfig::for_type("joypad", "ICADE");
    icade.name = Some("iCade".to_string());

    let mut keyboard = PinRuleConfig::for_type("keyboard", "KEYBOARD");
    keyboard.max_digits = Some(6);

    vec![
        icade,
        keyboard,
        PinRuleConfig::for_type("mouse", "0000"),
        PinRuleConfig::for_type("tablet", "0000"),
        PinRuleConfig::for_type("headset", "0000"),
        PinRuleConfig::for_type("headphones", "0000"),
        PinRuleConfig::for_type("audio", "0000"),
        PinRuleConfig::for_type("printer", "0000"),
    ]
}

/// OBEX push receiver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObexConfig {
    /// Accept pushes from paired devices without asking.
    pub accept_paired: bool,
    /// Where received files go. Defaults to the XDG download directory.
    pub download_dir: Option<PathBuf>,
}

impl Default for ObexConfig {
    fn default() -> Self {
        Self {
            accept_paired: true,
            download_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.services.indicator);
        assert!(config.session.user_show_menu);
        assert_eq!(config.session.max_users, 12);
        assert_eq!(config.keybindings.screensaver, "<Control><Alt>l");
        assert_eq!(config.bluetooth.agent_capability, "DisplayYesNo");
        assert!(config.obex.accept_paired);
        assert!(config.obex.download_dir.is_none());
    }

    #[test]
    fn test_embedded_default_config_parses_and_validates() {
        let config = Config::from_default_toml().expect("embedded default config should parse");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_embedded_default_matches_struct_defaults() {
        let from_toml = Config::from_default_toml().expect("embedded default config should parse");
        assert_eq!(from_toml, Config::default());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            [session]
            max_users = 3
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.session.max_users, 3);
        assert!(config.session.user_show_menu);
        assert!(!config.bluetooth.pin_rules.is_empty());
    }

    #[test]
    fn test_load_with_defaults_empty_config() {
        let config = Config::load_with_defaults("").unwrap();
        assert_eq!(config, Config::from_default_toml().unwrap());
    }

    #[test]
    fn test_load_with_defaults_nested_override() {
        let user_toml = r#"
            [lockdown]
            disable_log_out = true
        "#;

        let config = Config::load_with_defaults(user_toml).unwrap();
        assert!(config.lockdown.disable_log_out);
        assert!(!config.lockdown.disable_lock_screen);
        assert!(config.services.obex_agent);
    }

    #[test]
    fn test_load_with_defaults_pin_rules_replace() {
        let user_toml = r#"
            [[bluetooth.pin_rules]]
            address_prefix = "00:0A:95"
            pin = "1234"
        "#;

        let config = Config::load_with_defaults(user_toml).unwrap();
        assert_eq!(config.bluetooth.pin_rules.len(), 1);
        assert_eq!(config.bluetooth.pin_rules[0].pin, "1234");
    }

    #[test]
    fn test_deep_merge_toml_tables() {
        let mut base: Table = toml::from_str(
            r#"
            [section]
            a = 1
            b = 2
        "#,
        )
        .unwrap();

        let overlay: Table = toml::from_str(
            r#"
            [section]
            b = 99
            c = 3
        "#,
        )
        .unwrap();

        deep_merge_toml(&mut base, overlay);

        let section = base.get("section").unwrap().as_table().unwrap();
        assert_eq!(section.get("a").unwrap().as_integer(), Some(1));
        assert_eq!(section.get("b").unwrap().as_integer(), Some(99));
        assert_eq!(section.get("c").unwrap().as_integer(), Some(3));
    }

    #[test]
    fn test_load_with_defaults_rejects_unknown_fields() {
        let user_toml = r#"
            [session]
            max_user = 4
        "#;

        let err = Config::load_with_defaults(user_toml).unwrap_err().to_string();
        assert!(err.contains("max_user"), "error should mention the unknown field");
    }

    #[test]
    fn test_load_with_defaults_rejects_unknown_section() {
        let user_toml = r#"
            [sesion]
            max_users = 4
        "#;

        let err = Config::load_with_defaults(user_toml).unwrap_err().to_string();
        assert!(err.contains("sesion"));
    }

    #[test]
    fn test_validate_invalid_capability() {
        let mut config = Config::default();
        config.bluetooth.agent_capability = "Telepathy".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("bluetooth.agent_capability"));
    }

    #[test]
    fn test_validate_zero_max_users() {
        let mut config = Config::default();
        config.session.max_users = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_pin_rules() {
        let mut config = Config::default();
        config.bluetooth.pin_rules = vec![
            PinRuleConfig::for_type("toaster", "0000"),
            PinRuleConfig::for_type("mouse", "12ab"),
            PinRuleConfig {
                max_digits: Some(40),
                ..PinRuleConfig::for_type("keyboard", "KEYBOARD")
            },
        ];

        match config.validate() {
            Err(Error::ConfigValidation(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].contains("toaster"));
                assert!(errors[1].contains("12ab"));
                assert!(errors[2].contains("max_digits"));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_accepts_special_pins() {
        let mut config = Config::default();
        config.bluetooth.pin_rules = SPECIAL_PINS
            .iter()
            .map(|pin| PinRuleConfig::for_type("any", pin))
            .collect();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_warnings_all_services_disabled() {
        let mut config = Config::default();
        assert!(config.warnings().is_empty());

        config.services = ServicesConfig {
            indicator: false,
            pairing_agent: false,
            obex_agent: false,
        };
        assert_eq!(config.warnings().len(), 1);
    }

    #[test]
    fn test_config_search_paths() {
        let paths = Config::config_search_paths();
        assert_eq!(paths.last(), Some(&PathBuf::from("config.toml")));
    }

    #[test]
    fn test_summary_mentions_sections() {
        let summary = Config::default().summary();
        assert!(summary.contains("Services:"));
        assert!(summary.contains("max_users: 12"));
        assert!(summary.contains("agent_capability: DisplayYesNo"));
    }
}
