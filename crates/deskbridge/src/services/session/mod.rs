//! Session backends feeding the indicator.
//!
//! - **actions**: power, lock, switch and settings actions plus their
//!   availability (login1, Unity, SessionManager, ScreenSaver, DisplayManager)
//! - **users**: AccountsService users and logind login state
//! - **guest**: the display manager's guest account
//!
//! The indicator only talks to the three traits below.

pub mod actions;
pub mod guest;
pub mod users;

use deskbridge_core::config::{LockdownConfig, SessionConfig};
use deskbridge_core::session::logins::{self, GuestChange};
use deskbridge_core::session::{Capabilities, GuestState, PromptStatus, SessionRecord, SessionUser, UserEvent};
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use tracing::{error, warn};

use super::callbacks::CallbackId;

pub const LOGIN1_NAME: &str = "org.freedesktop.login1";
pub const LOGIN1_PATH: &str = "/org/freedesktop/login1";
pub const LOGIN1_MANAGER_IFACE: &str = "org.freedesktop.login1.Manager";
pub const LOGIN1_SEAT_IFACE: &str = "org.freedesktop.login1.Seat";
pub const DM_NAME: &str = "org.freedesktop.DisplayManager";
pub const DM_SEAT_IFACE: &str = "org.freedesktop.DisplayManager.Seat";

pub trait SessionActions {
    fn capabilities(&self) -> Capabilities;
    fn prompt_status(&self) -> PromptStatus;
    fn connect_changed(&self, callback: Box<dyn Fn(&Capabilities)>) -> CallbackId;
    fn apply_config(&self, session: &SessionConfig, lockdown: &LockdownConfig);

    fn suspend(&self);
    fn hibernate(&self);
    fn logout(&self);
    fn reboot(&self);
    fn power_off(&self);

    fn help(&self);
    fn about(&self);
    fn settings(&self);
    fn online_accounts(&self);

    fn switch_to_screensaver(&self);
    fn switch_to_greeter(&self);
    fn switch_to_guest(&self);
    fn switch_to_username(&self, user_name: &str);
}

pub trait SessionUsers {
    fn users(&self) -> Vec<SessionUser>;
    fn user(&self, uid: u32) -> Option<SessionUser>;
    fn is_live_session(&self) -> bool;
    fn connect_changed(&self, callback: Box<dyn Fn(&UserEvent)>) -> CallbackId;
}

pub trait SessionGuest {
    fn state(&self) -> GuestState;
    fn connect_changed(&self, callback: Box<dyn Fn(&GuestChange)>) -> CallbackId;
}

/// Where this process runs, from the environment the session was started
/// with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnv {
    /// `XDG_SEAT`, e.g. "seat0".
    pub seat: Option<String>,
    /// `XDG_SESSION_ID`.
    pub session_id: Option<String>,
    /// `XDG_SEAT_PATH`, the display manager's seat object.
    pub seat_path: Option<String>,
}

impl SessionEnv {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            seat: var("XDG_SEAT"),
            session_id: var("XDG_SESSION_ID"),
            seat_path: var("XDG_SEAT_PATH"),
        }
    }

    /// logind object path of our seat.
    pub fn login1_seat_path(&self) -> Option<String> {
        self.seat
            .as_ref()
            .map(|seat| format!("{}/seat/{}", LOGIN1_PATH, seat))
    }
}

/// Call logind `ListSessions` and parse the `a(susso)` reply.
pub fn list_sessions<F>(manager: &gio::DBusProxy, done: F)
where
    F: FnOnce(Vec<SessionRecord>) + 'static,
{
    manager.call(
        "ListSessions",
        None,
        DBusCallFlags::NONE,
        -1,
        None::<&gio::Cancellable>,
        move |res| match res {
            Ok(reply) => {
                let sessions: Vec<(String, u32, String, String, String)> = (0..reply
                    .child_value(0)
                    .n_children())
                    .filter_map(|i| session_tuple(&reply.child_value(0).child_value(i)))
                    .collect();
                done(logins::parse_sessions(sessions));
            }
            Err(e) => warn!("Session: ListSessions failed: {}", e),
        },
    );
}

fn session_tuple(entry: &gtk4::glib::Variant) -> Option<(String, u32, String, String, String)> {
    Some((
        entry.child_value(0).str()?.to_string(),
        entry.child_value(1).get::<u32>()?,
        entry.child_value(2).str()?.to_string(),
        entry.child_value(3).str()?.to_string(),
        entry.child_value(4).str()?.to_string(),
    ))
}

/// Create a proxy and hand it to `ready`. A failure is logged and the service
/// is treated as absent.
pub fn new_proxy<F>(bus: BusType, name: &str, path: &str, iface: &str, ready: F)
where
    F: FnOnce(gio::DBusProxy) + 'static,
{
    let what = format!("{} {}", name, path);
    gio::DBusProxy::for_bus(
        bus,
        gio::DBusProxyFlags::NONE,
        None::<&gio::DBusInterfaceInfo>,
        name,
        path,
        iface,
        None::<&gio::Cancellable>,
        move |res| match res {
            Ok(proxy) => ready(proxy),
            Err(e) => error!("Session: failed to create proxy for {}: {}", what, e),
        },
    );
}

/// Whether a proxy's well-known name currently has an owner.
pub fn is_owned(proxy: Option<&gio::DBusProxy>) -> bool {
    proxy.is_some_and(|p| p.name_owner().is_some())
}

/// Fire-and-forget method call that logs failures.
pub fn call_logged(proxy: &gio::DBusProxy, method: &str, args: Option<&gtk4::glib::Variant>) {
    let what = format!("{}.{}", proxy.interface_name(), method);
    proxy.call(
        method,
        args,
        DBusCallFlags::NONE,
        -1,
        None::<&gio::Cancellable>,
        move |res| {
            if let Err(e) = res {
                warn!("Session: {} failed: {}", what, e);
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtk4::glib::{self, ToVariant};

    #[test]
    fn test_login1_seat_path() {
        let env = SessionEnv {
            seat: Some("seat0".into()),
            ..Default::default()
        };
        assert_eq!(
            env.login1_seat_path().as_deref(),
            Some("/org/freedesktop/login1/seat/seat0")
        );
        assert!(SessionEnv::default().login1_seat_path().is_none());
    }

    #[test]
    fn test_session_tuple() {
        let path = glib::variant::ObjectPath::try_from("/org/freedesktop/login1/session/_32").unwrap();
        let entry = ("2", 1000u32, "alice", "seat0", path).to_variant();
        assert_eq!(
            session_tuple(&entry),
            Some((
                "2".to_string(),
                1000,
                "alice".to_string(),
                "seat0".to_string(),
                "/org/freedesktop/login1/session/_32".to_string()
            ))
        );
    }
}
