//! D-Bus backed [`SessionUsers`]: AccountsService for the accounts, logind
//! for who is logged in on our seat.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use deskbridge_core::session::logins::AccountRecord;
use deskbridge_core::session::{LoginState, SessionUser, UserEvent, UserTracker};
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{self, Variant};
use tracing::{debug, warn};

use super::{
    list_sessions, new_proxy, SessionEnv, SessionUsers, LOGIN1_MANAGER_IFACE, LOGIN1_NAME,
    LOGIN1_PATH, LOGIN1_SEAT_IFACE,
};
use crate::services::callbacks::{CallbackId, Callbacks};

const ACCOUNTS_NAME: &str = "org.freedesktop.Accounts";
const ACCOUNTS_PATH: &str = "/org/freedesktop/Accounts";
const ACCOUNTS_IFACE: &str = "org.freedesktop.Accounts";
const ACCOUNTS_USER_IFACE: &str = "org.freedesktop.Accounts.User";

/// Ended sessions linger in `ListSessions` for a moment after removal.
const SECOND_REFRESH_DELAY: Duration = Duration::from_secs(5);

pub struct DbusUsers {
    weak: Weak<DbusUsers>,
    env: SessionEnv,
    tracker: RefCell<UserTracker>,
    callbacks: Callbacks<UserEvent>,
    login1_manager: RefCell<Option<gio::DBusProxy>>,
    /// Accounts manager and seat proxies stay alive for their signals.
    _accounts: RefCell<Option<gio::DBusProxy>>,
    _login1_seat: RefCell<Option<gio::DBusProxy>>,
    /// Per-user proxies by object path, replaced on `Changed`.
    user_proxies: RefCell<HashMap<String, gio::DBusProxy>>,
    second_refresh: RefCell<Option<glib::SourceId>>,
}

impl DbusUsers {
    pub fn new(env: SessionEnv) -> Rc<Self> {
        let this = Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            env,
            tracker: RefCell::new(UserTracker::new()),
            callbacks: Callbacks::new(),
            login1_manager: RefCell::new(None),
            _accounts: RefCell::new(None),
            _login1_seat: RefCell::new(None),
            user_proxies: RefCell::new(HashMap::new()),
            second_refresh: RefCell::new(None),
        });
        this.init_proxies();
        this
    }

    fn init_proxies(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        new_proxy(BusType::System, ACCOUNTS_NAME, ACCOUNTS_PATH, ACCOUNTS_IFACE, move |proxy| {
            if let Some(this) = weak.upgrade() {
                this.set_accounts(proxy);
            }
        });

        let weak = Rc::downgrade(self);
        new_proxy(BusType::System, LOGIN1_NAME, LOGIN1_PATH, LOGIN1_MANAGER_IFACE, move |proxy| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let weak = Rc::downgrade(&this);
            proxy.connect_local("g-signal", false, move |values| {
                let this = weak.upgrade()?;
                let signal = values.get(2)?.get::<String>().ok()?;
                match signal.as_str() {
                    "SessionNew" | "UserNew" => this.refresh(),
                    "SessionRemoved" | "UserRemoved" => this.refresh_twice(),
                    _ => {}
                }
                None
            });
            this.login1_manager.replace(Some(proxy));
            this.refresh();
        });

        if let Some(seat_path) = self.env.login1_seat_path() {
            let weak = Rc::downgrade(self);
            new_proxy(BusType::System, LOGIN1_NAME, &seat_path, LOGIN1_SEAT_IFACE, move |proxy| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let weak = Rc::downgrade(&this);
                proxy.connect_local("g-properties-changed", false, move |values| {
                    let this = weak.upgrade()?;
                    let changed = values.get(1)?.get::<Variant>().ok()?;
                    if changed.lookup_value("ActiveSession", None).is_some() {
                        this.refresh();
                    }
                    None
                });
                this._login1_seat.replace(Some(proxy));
                this.refresh();
            });
        }
    }

    fn set_accounts(self: &Rc<Self>, accounts: gio::DBusProxy) {
        let weak = Rc::downgrade(self);
        accounts.connect_local("g-signal", false, move |values| {
            let this = weak.upgrade()?;
            let signal = values.get(2)?.get::<String>().ok()?;
            let params = values.get(3)?.get::<Variant>().ok()?;
            let path = params.child_value(0).str()?.to_string();
            match signal.as_str() {
                "UserAdded" => this.load_user(&path),
                "UserDeleted" => this.untrack(&path),
                _ => {}
            }
            None
        });

        let weak = Rc::downgrade(self);
        accounts.call(
            "ListCachedUsers",
            None,
            DBusCallFlags::NONE,
            -1,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match res {
                    Ok(reply) => {
                        let paths = reply.child_value(0);
                        for i in 0..paths.n_children() {
                            if let Some(path) = paths.child_value(i).str() {
                                this.load_user(path);
                            }
                        }
                    }
                    Err(e) => warn!("SessionUsers: ListCachedUsers failed: {}", e),
                }
            },
        );

        self._accounts.replace(Some(accounts));
    }

    /// Build a fresh proxy for the account at `path`. AccountsService
    /// announces edits with a bare `Changed` signal, so every change reloads
    /// the whole proxy.
    fn load_user(&self, path: &str) {
        let weak = self.weak.clone();
        let path_owned = path.to_string();
        new_proxy(BusType::System, ACCOUNTS_NAME, path, ACCOUNTS_USER_IFACE, move |proxy| {
            let Some(this) = weak.upgrade() else {
                return;
            };

            let props: HashMap<String, Variant> = proxy
                .cached_property_names()
                .into_iter()
                .filter_map(|name| {
                    let value = proxy.cached_property(&name)?;
                    Some((name.to_string(), value))
                })
                .collect();
            let Some(record) = account_from_props(&path_owned, &props) else {
                warn!("SessionUsers: incomplete account at {}", path_owned);
                return;
            };

            let weak = Rc::downgrade(&this);
            proxy.connect_local("g-signal", false, move |values| {
                let this = weak.upgrade()?;
                let signal = values.get(2)?.get::<String>().ok()?;
                if signal == "Changed" {
                    let proxy = values.first()?.get::<gio::DBusProxy>().ok()?;
                    this.load_user(proxy.object_path().as_str());
                }
                None
            });
            this.user_proxies
                .borrow_mut()
                .insert(path_owned.clone(), proxy);

            let event = this.tracker.borrow_mut().track(record);
            if let Some(event) = event {
                this.emit(event);
            }
        });
    }

    fn untrack(&self, path: &str) {
        self.user_proxies.borrow_mut().remove(path);
        let event = self.tracker.borrow_mut().untrack_path(path);
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn refresh(&self) {
        let Some(manager) = self.login1_manager.borrow().clone() else {
            return;
        };
        let weak = self.weak.clone();
        list_sessions(&manager, move |records| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let state = LoginState::reconcile(
                &records,
                this.env.seat.as_deref(),
                this.env.session_id.as_deref(),
            );
            let events = this.tracker.borrow_mut().apply(state);
            for event in events {
                this.emit(event);
            }
        });
    }

    fn refresh_twice(&self) {
        self.refresh();

        if self.second_refresh.borrow().is_some() {
            return;
        }
        let weak = self.weak.clone();
        let id = glib::timeout_add_local(SECOND_REFRESH_DELAY, move || {
            if let Some(this) = weak.upgrade() {
                this.second_refresh.replace(None);
                this.refresh();
            }
            glib::ControlFlow::Break
        });
        self.second_refresh.replace(Some(id));
    }

    fn emit(&self, event: UserEvent) {
        debug!("SessionUsers: {:?}", event);
        self.callbacks.notify(&event);
    }
}

impl Drop for DbusUsers {
    fn drop(&mut self) {
        if let Some(id) = self.second_refresh.borrow_mut().take() {
            id.remove();
        }
    }
}

/// Account fields from an `org.freedesktop.Accounts.User` property map.
/// `Uid` and `UserName` are required.
fn account_from_props(path: &str, props: &HashMap<String, Variant>) -> Option<AccountRecord> {
    let string = |key: &str| props.get(key).and_then(|v| v.get::<String>());
    Some(AccountRecord {
        path: path.to_string(),
        uid: u32::try_from(props.get("Uid")?.get::<u64>()?).ok()?,
        user_name: string("UserName")?,
        real_name: string("RealName").unwrap_or_default(),
        icon_file: string("IconFile").filter(|f| !f.is_empty()),
        login_frequency: props
            .get("LoginFrequency")
            .and_then(|v| v.get::<u64>())
            .unwrap_or(0),
        system_account: props
            .get("SystemAccount")
            .and_then(|v| v.get::<bool>())
            .unwrap_or(false),
    })
}

impl SessionUsers for DbusUsers {
    fn users(&self) -> Vec<SessionUser> {
        self.tracker.borrow().users()
    }

    fn user(&self, uid: u32) -> Option<SessionUser> {
        self.tracker.borrow().get_user(uid)
    }

    fn is_live_session(&self) -> bool {
        self.tracker.borrow().is_live_session()
    }

    fn connect_changed(&self, callback: Box<dyn Fn(&UserEvent)>) -> CallbackId {
        self.callbacks.register(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, Variant)]) -> HashMap<String, Variant> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_account_from_props() {
        let map = props(&[
            ("Uid", 1000u64.to_variant()),
            ("UserName", "ada".to_variant()),
            ("RealName", "Ada Lovelace".to_variant()),
            ("IconFile", "".to_variant()),
            ("LoginFrequency", 42u64.to_variant()),
            ("SystemAccount", false.to_variant()),
        ]);
        let record = account_from_props("/org/freedesktop/Accounts/User1000", &map).unwrap();
        assert_eq!(record.uid, 1000);
        assert_eq!(record.user_name, "ada");
        assert_eq!(record.real_name, "Ada Lovelace");
        assert_eq!(record.icon_file, None);
        assert_eq!(record.login_frequency, 42);
        assert!(!record.system_account);
    }

    #[test]
    fn test_account_requires_uid_and_name() {
        let map = props(&[("UserName", "ada".to_variant())]);
        assert!(account_from_props("/u", &map).is_none());

        let map = props(&[("Uid", 1000u64.to_variant())]);
        assert!(account_from_props("/u", &map).is_none());
    }
}
