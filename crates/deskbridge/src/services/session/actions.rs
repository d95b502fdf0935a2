//! D-Bus backed [`SessionActions`].
//!
//! Availability is recomputed whenever one of its inputs moves: the
//! indicator and lockdown settings, logind's seat and sleep answers, the
//! webcredentials error flag and whether Unity's EndSessionDialog is on the
//! bus. Callbacks fire only when the resulting [`Capabilities`] differ.

use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use deskbridge_core::config::{LockdownConfig, SessionConfig};
use deskbridge_core::session::actions::{
    self, BackendFacts, EndSessionType, PowerAction, PowerPlan, SettingsPanel, ZenityPrompt,
};
use deskbridge_core::session::{Capabilities, PromptStatus};
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{Variant, VariantTy};
use tracing::{debug, info, warn};

use super::{
    call_logged, is_owned, new_proxy, SessionActions, SessionEnv, DM_NAME, DM_SEAT_IFACE,
    LOGIN1_MANAGER_IFACE, LOGIN1_NAME, LOGIN1_PATH, LOGIN1_SEAT_IFACE,
};
use crate::services::callbacks::{CallbackId, Callbacks};

const SCREENSAVER_NAME: &str = "org.gnome.ScreenSaver";
const SCREENSAVER_PATH: &str = "/org/gnome/ScreenSaver";
const SCREENSAVER_IFACE: &str = "org.gnome.ScreenSaver";

const UNITY_NAME: &str = "com.canonical.Unity";
const UNITY_SESSION_PATH: &str = "/com/canonical/Unity/Session";
const UNITY_SESSION_IFACE: &str = "com.canonical.Unity.Session";
const END_SESSION_DIALOG_PATH: &str = "/org/gnome/SessionManager/EndSessionDialog";
const END_SESSION_DIALOG_IFACE: &str = "com.canonical.Unity.EndSessionDialog";

const SESSION_MANAGER_NAME: &str = "org.gnome.SessionManager";
const SESSION_MANAGER_PATH: &str = "/org/gnome/SessionManager";
const SESSION_MANAGER_IFACE: &str = "org.gnome.SessionManager";

const WEBCREDENTIALS_NAME: &str = "com.canonical.indicators.webcredentials";
const WEBCREDENTIALS_PATH: &str = "/com/canonical/indicators/webcredentials";
const WEBCREDENTIALS_IFACE: &str = "com.canonical.indicators.webcredentials";

/// `Logout` mode that skips gnome-session's own confirmation.
const LOGOUT_NO_CONFIRMATION: u32 = 1;

#[derive(Default)]
struct Proxies {
    login1_manager: Option<gio::DBusProxy>,
    login1_seat: Option<gio::DBusProxy>,
    dm_seat: Option<gio::DBusProxy>,
    screensaver: Option<gio::DBusProxy>,
    unity_session: Option<gio::DBusProxy>,
    session_manager: Option<gio::DBusProxy>,
    end_session_dialog: Option<gio::DBusProxy>,
    webcredentials: Option<gio::DBusProxy>,
}

/// What an EndSessionDialog signal means for a request we made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogOutcome {
    Confirmed(PowerAction),
    Dismissed,
}

fn dialog_outcome(signal: &str) -> Option<DialogOutcome> {
    match signal {
        "ConfirmedLogout" => Some(DialogOutcome::Confirmed(PowerAction::Logout)),
        "ConfirmedReboot" => Some(DialogOutcome::Confirmed(PowerAction::Reboot)),
        "ConfirmedShutdown" => Some(DialogOutcome::Confirmed(PowerAction::PowerOff)),
        "Canceled" | "Closed" => Some(DialogOutcome::Dismissed),
        _ => None,
    }
}

/// `Open(type, timestamp, seconds_to_stay_open, inhibitors)`.
fn open_dialog_args(kind: EndSessionType) -> Variant {
    Variant::tuple_from_iter([
        (kind as u32).to_variant(),
        0u32.to_variant(),
        0u32.to_variant(),
        Variant::array_from_iter_with_type(VariantTy::OBJECT_PATH, std::iter::empty::<Variant>()),
    ])
}

pub struct DbusActions {
    weak: Weak<DbusActions>,
    env: SessionEnv,
    session_config: RefCell<SessionConfig>,
    lockdown: RefCell<LockdownConfig>,
    zenity: Option<PathBuf>,
    facts: Cell<BackendFacts>,
    prompt: Cell<PromptStatus>,
    capabilities: Cell<Capabilities>,
    callbacks: Callbacks<Capabilities>,
    proxies: RefCell<Proxies>,
    /// Set between `Open` and the dialog's answer.
    dialog_pending: Cell<bool>,
}

impl DbusActions {
    pub fn new(env: SessionEnv, session: &SessionConfig, lockdown: &LockdownConfig) -> Rc<Self> {
        let zenity = which::which("zenity").ok();
        if zenity.is_none() {
            debug!("SessionActions: zenity not found, prompts need Unity");
        }

        let this = Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            env,
            session_config: RefCell::new(session.clone()),
            lockdown: RefCell::new(lockdown.clone()),
            zenity,
            facts: Cell::new(BackendFacts::default()),
            prompt: Cell::new(PromptStatus::None),
            capabilities: Cell::new(Capabilities::default()),
            callbacks: Callbacks::new(),
            proxies: RefCell::new(Proxies::default()),
            dialog_pending: Cell::new(false),
        });

        this.recompute();
        this.init_proxies();
        this
    }

    fn init_proxies(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        new_proxy(BusType::System, LOGIN1_NAME, LOGIN1_PATH, LOGIN1_MANAGER_IFACE, move |proxy| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.proxies.borrow_mut().login1_manager = Some(proxy.clone());
            this.query_can(&proxy, "CanSuspend", |facts, v| facts.can_suspend = v);
            this.query_can(&proxy, "CanHibernate", |facts, v| facts.can_hibernate = v);
        });

        if let Some(seat_path) = self.env.login1_seat_path() {
            let weak = Rc::downgrade(self);
            new_proxy(BusType::System, LOGIN1_NAME, &seat_path, LOGIN1_SEAT_IFACE, move |proxy| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.proxies.borrow_mut().login1_seat = Some(proxy.clone());
                this.update_multi_session(&proxy);

                let weak = Rc::downgrade(&this);
                proxy.connect_local("g-properties-changed", false, move |values| {
                    let this = weak.upgrade()?;
                    let proxy = values.first()?.get::<gio::DBusProxy>().ok()?;
                    this.update_multi_session(&proxy);
                    None
                });
            });
        } else {
            warn!("SessionActions: XDG_SEAT not set, user switching disabled");
        }

        if let Some(seat_path) = self.env.seat_path.clone() {
            let weak = Rc::downgrade(self);
            new_proxy(BusType::System, DM_NAME, &seat_path, DM_SEAT_IFACE, move |proxy| {
                if let Some(this) = weak.upgrade() {
                    this.proxies.borrow_mut().dm_seat = Some(proxy);
                }
            });
        }

        let weak = Rc::downgrade(self);
        new_proxy(BusType::Session, SCREENSAVER_NAME, SCREENSAVER_PATH, SCREENSAVER_IFACE, move |proxy| {
            if let Some(this) = weak.upgrade() {
                this.proxies.borrow_mut().screensaver = Some(proxy);
            }
        });

        let weak = Rc::downgrade(self);
        new_proxy(BusType::Session, UNITY_NAME, UNITY_SESSION_PATH, UNITY_SESSION_IFACE, move |proxy| {
            if let Some(this) = weak.upgrade() {
                this.proxies.borrow_mut().unity_session = Some(proxy);
            }
        });

        let weak = Rc::downgrade(self);
        new_proxy(
            BusType::Session,
            SESSION_MANAGER_NAME,
            SESSION_MANAGER_PATH,
            SESSION_MANAGER_IFACE,
            move |proxy| {
                if let Some(this) = weak.upgrade() {
                    this.proxies.borrow_mut().session_manager = Some(proxy);
                }
            },
        );

        let weak = Rc::downgrade(self);
        new_proxy(
            BusType::Session,
            UNITY_NAME,
            END_SESSION_DIALOG_PATH,
            END_SESSION_DIALOG_IFACE,
            move |proxy| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.proxies.borrow_mut().end_session_dialog = Some(proxy.clone());
                this.recompute();

                let weak = Rc::downgrade(&this);
                proxy.connect_local("notify::g-name-owner", false, move |_| {
                    let this = weak.upgrade()?;
                    this.recompute();
                    None
                });

                let weak = Rc::downgrade(&this);
                proxy.connect_local("g-signal", false, move |values| {
                    let this = weak.upgrade()?;
                    let signal = values.get(2)?.get::<String>().ok()?;
                    this.handle_dialog_signal(&signal);
                    None
                });
            },
        );

        let weak = Rc::downgrade(self);
        new_proxy(
            BusType::Session,
            WEBCREDENTIALS_NAME,
            WEBCREDENTIALS_PATH,
            WEBCREDENTIALS_IFACE,
            move |proxy| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.proxies.borrow_mut().webcredentials = Some(proxy.clone());
                this.update_online_account_error(&proxy);

                let weak = Rc::downgrade(&this);
                proxy.connect_local("g-properties-changed", false, move |values| {
                    let this = weak.upgrade()?;
                    let proxy = values.first()?.get::<gio::DBusProxy>().ok()?;
                    this.update_online_account_error(&proxy);
                    None
                });

                let weak = Rc::downgrade(&this);
                proxy.connect_local("notify::g-name-owner", false, move |values| {
                    let this = weak.upgrade()?;
                    let proxy = values.first()?.get::<gio::DBusProxy>().ok()?;
                    this.update_online_account_error(&proxy);
                    None
                });
            },
        );
    }

    fn query_can<F>(&self, manager: &gio::DBusProxy, method: &'static str, apply: F)
    where
        F: FnOnce(&mut BackendFacts, bool) + 'static,
    {
        let weak = self.weak.clone();
        manager.call(
            method,
            None,
            DBusCallFlags::NONE,
            -1,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let answer = match res {
                    Ok(reply) => reply
                        .child_value(0)
                        .str()
                        .map(actions::parse_can_answer)
                        .unwrap_or(false),
                    Err(e) => {
                        warn!("SessionActions: {} failed: {}", method, e);
                        false
                    }
                };
                this.update_facts(|facts| apply(facts, answer));
            },
        );
    }

    fn update_multi_session(&self, seat: &gio::DBusProxy) {
        let value = seat
            .cached_property("CanMultiSession")
            .and_then(|v| v.get::<bool>())
            .unwrap_or(false);
        self.update_facts(|facts| facts.seat_can_multi_session = value);
    }

    fn update_online_account_error(&self, webcredentials: &gio::DBusProxy) {
        let value = webcredentials.name_owner().is_some()
            && webcredentials
                .cached_property("ErrorStatus")
                .and_then(|v| v.get::<bool>())
                .unwrap_or(false);
        self.update_facts(|facts| facts.has_online_account_error = value);
    }

    fn update_facts<F: FnOnce(&mut BackendFacts)>(&self, f: F) {
        let mut facts = self.facts.get();
        f(&mut facts);
        self.facts.set(facts);
        self.recompute();
    }

    fn recompute(&self) {
        let dialog_owned = is_owned(self.proxies.borrow().end_session_dialog.as_ref());
        let capabilities = {
            let session = self.session_config.borrow();
            let prompt = PromptStatus::compute(
                session.suppress_logout_restart_shutdown,
                dialog_owned,
                self.zenity.is_some(),
            );
            self.prompt.set(prompt);
            Capabilities::compute(&session, &self.lockdown.borrow(), prompt, &self.facts.get())
        };

        if capabilities != self.capabilities.get() {
            debug!("SessionActions: capabilities now {:?}", capabilities);
            self.capabilities.set(capabilities);
            self.callbacks.notify(&capabilities);
        }
    }

    fn request_power(&self, action: PowerAction) {
        match actions::plan_power_action(action, self.prompt.get()) {
            PowerPlan::Now => self.power_now(action),
            PowerPlan::UnityDialog(kind) => self.open_end_session_dialog(action, kind),
            PowerPlan::Zenity(prompt) => self.run_zenity(action, &prompt),
        }
    }

    fn power_now(&self, action: PowerAction) {
        info!("SessionActions: {:?}", action);
        match action {
            PowerAction::Logout => self.logout_now(),
            PowerAction::Reboot => self.login1_call("Reboot"),
            PowerAction::PowerOff => self.login1_call("PowerOff"),
        }
    }

    /// Ask Unity to log out, falling back to gnome-session.
    fn logout_now(&self) {
        let unity = self.proxies.borrow().unity_session.clone();
        let Some(unity) = unity.filter(|p| p.name_owner().is_some()) else {
            self.session_manager_logout();
            return;
        };

        let weak = self.weak.clone();
        unity.call(
            "RequestLogout",
            None,
            DBusCallFlags::NONE,
            -1,
            None::<&gio::Cancellable>,
            move |res| {
                if let Err(e) = res {
                    if e.matches(gio::IOErrorEnum::Cancelled) {
                        return;
                    }
                    warn!("SessionActions: Unity RequestLogout failed: {}", e);
                    if let Some(this) = weak.upgrade() {
                        this.session_manager_logout();
                    }
                }
            },
        );
    }

    fn session_manager_logout(&self) {
        match self.proxies.borrow().session_manager.as_ref() {
            Some(proxy) => call_logged(
                proxy,
                "Logout",
                Some(&(LOGOUT_NO_CONFIRMATION,).to_variant()),
            ),
            None => warn!("SessionActions: no session manager to log out with"),
        }
    }

    /// Reboot, PowerOff, Suspend and Hibernate all take `interactive=false`.
    fn login1_call(&self, method: &str) {
        match self.proxies.borrow().login1_manager.as_ref() {
            Some(proxy) => call_logged(proxy, method, Some(&(false,).to_variant())),
            None => warn!("SessionActions: logind unavailable for {}", method),
        }
    }

    fn open_end_session_dialog(&self, action: PowerAction, kind: EndSessionType) {
        let Some(dialog) = self.proxies.borrow().end_session_dialog.clone() else {
            self.power_now(action);
            return;
        };

        self.dialog_pending.set(true);
        let weak = self.weak.clone();
        dialog.call(
            "Open",
            Some(&open_dialog_args(kind)),
            DBusCallFlags::NONE,
            -1,
            None::<&gio::Cancellable>,
            move |res| {
                let Err(e) = res else {
                    return;
                };
                warn!("SessionActions: EndSessionDialog.Open failed: {}", e);
                if let Some(this) = weak.upgrade() {
                    this.dialog_pending.set(false);
                    this.power_now(action);
                }
            },
        );
    }

    fn handle_dialog_signal(&self, signal: &str) {
        if !self.dialog_pending.get() {
            return;
        }
        match dialog_outcome(signal) {
            Some(DialogOutcome::Confirmed(action)) => {
                self.dialog_pending.set(false);
                self.power_now(action);
            }
            Some(DialogOutcome::Dismissed) => {
                debug!("SessionActions: end session dialog dismissed");
                self.dialog_pending.set(false);
            }
            None => {}
        }
    }

    /// Ask with zenity without blocking the main loop. A zenity that cannot
    /// be started counts as a yes.
    fn run_zenity(&self, action: PowerAction, prompt: &ZenityPrompt) {
        let Some(zenity) = self.zenity.as_ref() else {
            self.power_now(action);
            return;
        };

        let args = prompt.args();
        let mut argv: Vec<&OsStr> = vec![zenity.as_os_str()];
        argv.extend(args.iter().map(OsStr::new));

        let process = match gio::Subprocess::newv(&argv, gio::SubprocessFlags::NONE) {
            Ok(process) => process,
            Err(e) => {
                warn!("SessionActions: failed to run zenity: {}", e);
                self.power_now(action);
                return;
            }
        };

        let weak = self.weak.clone();
        process.wait_check_async(None::<&gio::Cancellable>, move |res| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            match res {
                Ok(()) => this.power_now(action),
                Err(e) => debug!("SessionActions: {:?} not confirmed: {}", action, e),
            }
        });
    }

    fn lock(&self, immediate: bool) {
        let proxies = self.proxies.borrow();
        if let Some(unity) = proxies.unity_session.as_ref().filter(|p| p.name_owner().is_some()) {
            call_logged(unity, if immediate { "PromptLock" } else { "Lock" }, None);
        } else if let Some(screensaver) = proxies.screensaver.as_ref() {
            call_logged(screensaver, "Lock", None);
        } else {
            warn!("SessionActions: nothing to lock the screen with");
        }
    }

    fn dm_seat_call(&self, method: &str, args: Option<&Variant>) {
        match self.proxies.borrow().dm_seat.as_ref() {
            Some(proxy) => call_logged(proxy, method, args),
            None => warn!("SessionActions: no display manager seat for {}", method),
        }
    }

    fn open_settings(&self, panel: SettingsPanel) {
        let desktop = std::env::var("XDG_CURRENT_DESKTOP").ok();
        let unity = actions::use_unity_control_center(
            desktop.as_deref(),
            which::which("unity-control-center").is_ok(),
        );
        let (program, args) = actions::settings_command(panel, unity);
        spawn_detached(program, &args);
    }
}

/// Launch a helper and reap it from the main loop once it exits.
fn spawn_detached(program: &str, args: &[&str]) {
    let mut argv: Vec<&OsStr> = vec![OsStr::new(program)];
    argv.extend(args.iter().map(OsStr::new));

    let process = match gio::Subprocess::newv(&argv, gio::SubprocessFlags::NONE) {
        Ok(process) => process,
        Err(e) => {
            warn!("SessionActions: failed to launch {}: {}", program, e);
            return;
        }
    };
    debug!("SessionActions: launched {} {:?}", program, args);

    let program = program.to_string();
    process.wait_async(None::<&gio::Cancellable>, move |res| {
        if let Err(e) = res {
            debug!("SessionActions: lost track of {}: {}", program, e);
        }
    });
}

impl SessionActions for DbusActions {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.get()
    }

    fn prompt_status(&self) -> PromptStatus {
        self.prompt.get()
    }

    fn connect_changed(&self, callback: Box<dyn Fn(&Capabilities)>) -> CallbackId {
        self.callbacks.register(callback)
    }

    fn apply_config(&self, session: &SessionConfig, lockdown: &LockdownConfig) {
        self.session_config.replace(session.clone());
        self.lockdown.replace(lockdown.clone());
        self.recompute();
    }

    fn suspend(&self) {
        self.login1_call("Suspend");
    }

    fn hibernate(&self) {
        self.login1_call("Hibernate");
    }

    fn logout(&self) {
        self.request_power(PowerAction::Logout);
    }

    fn reboot(&self) {
        self.request_power(PowerAction::Reboot);
    }

    fn power_off(&self) {
        self.request_power(PowerAction::PowerOff);
    }

    fn help(&self) {
        spawn_detached(actions::HELP_COMMAND, &[]);
    }

    fn about(&self) {
        self.open_settings(SettingsPanel::About);
    }

    fn settings(&self) {
        self.open_settings(SettingsPanel::Overview);
    }

    fn online_accounts(&self) {
        self.open_settings(SettingsPanel::OnlineAccounts);
    }

    fn switch_to_screensaver(&self) {
        self.lock(false);
    }

    fn switch_to_greeter(&self) {
        self.lock(true);
        self.dm_seat_call("SwitchToGreeter", None);
    }

    fn switch_to_guest(&self) {
        self.lock(true);
        self.dm_seat_call("SwitchToGuest", Some(&("",).to_variant()));
    }

    fn switch_to_username(&self, user_name: &str) {
        self.lock(true);
        self.dm_seat_call("SwitchToUser", Some(&(user_name, "").to_variant()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_detached_missing_program_is_logged() {
        spawn_detached("deskbridge-no-such-helper", &["--version"]);
    }

    #[test]
    fn test_dialog_outcome() {
        assert_eq!(
            dialog_outcome("ConfirmedShutdown"),
            Some(DialogOutcome::Confirmed(PowerAction::PowerOff))
        );
        assert_eq!(
            dialog_outcome("ConfirmedLogout"),
            Some(DialogOutcome::Confirmed(PowerAction::Logout))
        );
        assert_eq!(dialog_outcome("Closed"), Some(DialogOutcome::Dismissed));
        assert_eq!(dialog_outcome("Opened"), None);
    }

    #[test]
    fn test_open_dialog_args() {
        let args = open_dialog_args(EndSessionType::Reboot);
        assert_eq!(args.type_().as_str(), "(uuuao)");
        assert_eq!(args.child_value(0).get::<u32>(), Some(2));
        assert_eq!(args.child_value(3).n_children(), 0);
    }
}
