//! Configuration manager with live reload support.
//!
//! A watcher thread monitors `config.toml`. Each change is parsed and
//! validated off the main thread, then handed over with
//! `glib::idle_add_once`. The main thread fans the new config out:
//!
//! - `[session]`, `[lockdown]`, `[keybindings]`: indicator menus and session
//!   action availability
//! - `[bluetooth]`: pairing agent capability and PIN rules
//! - `[obex]`: push receiver policy and download directory
//!
//! `[services]` only takes effect on restart.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use deskbridge_core::Config;
use gtk4::glib;
use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use tracing::{debug, error, info, warn};

use crate::services::bluetooth_agent::BluetoothAgent;
use crate::services::indicator::IndicatorService;
use crate::services::obex_agent::ObexAgent;

/// Editors often write a file several times per save.
const FILE_CHANGE_DEBOUNCE_MS: u64 = 300;

/// Messages sent from the file watcher thread to the main thread.
#[derive(Debug)]
pub enum ConfigMessage {
    Reloaded(Box<Config>),
    /// The file changed but failed to load or validate.
    Error(String),
}

fn send_config_message(msg: ConfigMessage) {
    glib::idle_add_once(move || match ConfigManager::global() {
        Some(manager) => manager.handle_config_message(msg),
        None => warn!("ConfigManager: message arrived before initialization"),
    });
}

/// Which parts of the config differ between two versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDelta {
    pub services: bool,
    pub session: bool,
    pub bluetooth: bool,
    pub obex: bool,
}

impl ConfigDelta {
    pub fn between(old: &Config, new: &Config) -> Self {
        Self {
            services: old.services != new.services,
            session: old.session != new.session
                || old.lockdown != new.lockdown
                || old.keybindings != new.keybindings,
            bluetooth: old.bluetooth != new.bluetooth,
            obex: old.obex != new.obex,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct ConfigManager {
    config: RefCell<Config>,
    config_path: RefCell<Option<PathBuf>>,
    indicator: RefCell<Option<Rc<IndicatorService>>>,
    shutdown_flag: Arc<AtomicBool>,
}

thread_local! {
    static CONFIG_MANAGER_INSTANCE: RefCell<Option<Rc<ConfigManager>>> = const { RefCell::new(None) };
}

impl ConfigManager {
    fn new(config: Config, config_path: Option<PathBuf>) -> Rc<Self> {
        Rc::new(Self {
            config: RefCell::new(config),
            config_path: RefCell::new(config_path),
            indicator: RefCell::new(None),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn global() -> Option<Rc<Self>> {
        CONFIG_MANAGER_INSTANCE.with(|cell| cell.borrow().clone())
    }

    /// Must be called once during startup, before `global()` is used.
    pub fn init_global(config: Config, config_path: Option<PathBuf>) -> Rc<Self> {
        CONFIG_MANAGER_INSTANCE.with(|cell| {
            let mut opt = cell.borrow_mut();
            if let Some(existing) = opt.as_ref() {
                warn!("ConfigManager already initialized, ignoring init_global call");
                return existing.clone();
            }
            let manager = ConfigManager::new(config, config_path);
            *opt = Some(manager.clone());
            manager
        })
    }

    /// Route session settings to this indicator from now on.
    pub fn set_indicator(&self, indicator: Rc<IndicatorService>) {
        self.indicator.replace(Some(indicator));
    }

    /// Spawn the watcher thread. Does nothing when running on defaults.
    pub fn start_watching(self: &Rc<Self>) {
        let config_path = self.config_path.borrow().clone();
        let Some(path) = config_path else {
            info!("No config file to watch (using defaults)");
            return;
        };

        if !path.exists() {
            warn!(
                "Config file does not exist, cannot watch: {}",
                path.display()
            );
            return;
        }

        info!("Starting config file watcher for: {}", path.display());

        let shutdown_flag = self.shutdown_flag.clone();
        let spawned = thread::Builder::new()
            .name("deskbridge-config".into())
            .spawn(move || Self::run_file_watcher(path, shutdown_flag));
        if let Err(e) = spawned {
            error!("Failed to spawn config watcher: {}", e);
        }
    }

    fn run_file_watcher(path: PathBuf, shutdown_flag: Arc<AtomicBool>) {
        let debounce_duration = Duration::from_millis(FILE_CHANGE_DEBOUNCE_MS);

        // notify reports absolute paths.
        let canonical_path = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to canonicalize config path: {}", e);
                return;
            }
        };

        let path_for_handler = canonical_path.clone();
        let mut debouncer =
            match new_debouncer(debounce_duration, move |res: DebounceEventResult| match res {
                Ok(events) => {
                    if events.iter().any(|e| e.path == path_for_handler) {
                        debug!("Config file change detected");
                        Self::reload_and_send(&path_for_handler);
                    }
                }
                Err(err) => error!("File watcher error: {}", err),
            }) {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to create file watcher: {}", e);
                    return;
                }
            };

        // Watch the directory; editors replace the file on save.
        let watch_dir = canonical_path.parent().unwrap_or(&canonical_path);
        if let Err(e) = debouncer
            .watcher()
            .watch(watch_dir, RecursiveMode::NonRecursive)
        {
            error!("Failed to watch config directory: {}", e);
            return;
        }

        info!("File watcher started, watching: {}", watch_dir.display());

        while !shutdown_flag.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(500));
        }

        debug!("Config file watcher thread shutting down");
    }

    fn reload_and_send(path: &Path) {
        let msg = match Config::load(path).and_then(|c| c.validate().map(|_| c)) {
            Ok(new_config) => {
                info!("Config reloaded from: {}", path.display());
                ConfigMessage::Reloaded(Box::new(new_config))
            }
            Err(e) => ConfigMessage::Error(format!("Failed to reload config: {}", e)),
        };
        send_config_message(msg);
    }

    pub(crate) fn handle_config_message(&self, msg: ConfigMessage) {
        match msg {
            ConfigMessage::Reloaded(new_config) => self.apply_config(*new_config),
            // Keep running with the previous config.
            ConfigMessage::Error(err) => error!("Config reload error: {}", err),
        }
    }

    /// Store `new_config` and push the changed parts to the running services.
    pub fn apply_config(&self, new_config: Config) {
        let old_config = self.config.replace(new_config.clone());
        let delta = ConfigDelta::between(&old_config, &new_config);
        if delta.is_empty() {
            debug!("Config unchanged");
            return;
        }
        info!("Applying new configuration: {:?}", delta);

        if delta.services {
            warn!("[services] changes take effect after a restart");
        }

        if delta.session
            && let Some(indicator) = self.indicator.borrow().as_ref()
        {
            indicator.apply_config(&new_config);
        }

        if delta.bluetooth
            && let Some(agent) = BluetoothAgent::global()
        {
            agent.apply_config(&new_config.bluetooth);
        }

        if delta.obex
            && let Some(agent) = ObexAgent::global()
        {
            agent.apply_config(&new_config.obex);
        }
    }

    pub fn stop_watching(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        debug!("Config watcher stopped");
    }
}
