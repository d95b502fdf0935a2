//! Notifications - client for org.freedesktop.Notifications.
//!
//! Posts notifications with actions and routes `ActionInvoked` and
//! `NotificationClosed` back to the caller. Each notification's handler runs
//! at most once, for whichever of the two signals arrives first.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use deskbridge_core::obex::Notice;
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{Variant, VariantDict};
use tracing::{debug, error, warn};

const NOTIFICATIONS_NAME: &str = "org.freedesktop.Notifications";
const NOTIFICATIONS_PATH: &str = "/org/freedesktop/Notifications";
const NOTIFICATIONS_IFACE: &str = "org.freedesktop.Notifications";

const APP_NAME: &str = "deskbridge";

pub const URGENCY_NORMAL: u8 = 1;
pub const URGENCY_CRITICAL: u8 = 2;

/// Never expire; the server keeps it until the user acts.
pub const EXPIRE_NEVER: i32 = 0;
pub const EXPIRE_DEFAULT: i32 = -1;

/// How a notification ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Action(String),
    Closed(u32),
    /// The server could not be reached or refused the notification.
    Failed,
}

type Handler = Box<dyn FnOnce(NotificationEvent)>;

/// Everything needed for one `Notify` call.
pub struct NotificationSpec<'a> {
    pub notice: &'a Notice,
    pub icon: &'a str,
    /// `(key, label)` pairs.
    pub actions: &'a [(&'a str, &'a str)],
    pub urgency: u8,
    pub expire_timeout: i32,
}

pub struct Notifications {
    connection: RefCell<Option<gio::DBusConnection>>,
    handlers: RefCell<HashMap<u32, Handler>>,
    _signal_subscriptions: RefCell<Vec<gio::SignalSubscription>>,
}

impl Notifications {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            connection: RefCell::new(None),
            handlers: RefCell::new(HashMap::new()),
            _signal_subscriptions: RefCell::new(Vec::new()),
        })
    }

    pub fn global() -> Rc<Self> {
        thread_local! {
            static INSTANCE: Rc<Notifications> = Notifications::new();
        }

        INSTANCE.with(|n| n.clone())
    }

    fn with_connection<F>(self: &Rc<Self>, f: F)
    where
        F: FnOnce(Option<gio::DBusConnection>) + 'static,
    {
        if let Some(connection) = self.connection.borrow().clone() {
            f(Some(connection));
            return;
        }

        let this_weak = Rc::downgrade(self);
        gio::bus_get(BusType::Session, None::<&gio::Cancellable>, move |res| {
            let Some(this) = this_weak.upgrade() else {
                return;
            };
            match res {
                Ok(connection) => {
                    if this.connection.borrow().is_none() {
                        this.subscribe_signals(&connection);
                        this.connection.replace(Some(connection.clone()));
                    }
                    f(Some(connection));
                }
                Err(e) => {
                    error!("Notifications: failed to get session bus: {}", e);
                    f(None);
                }
            }
        });
    }

    fn subscribe_signals(self: &Rc<Self>, connection: &gio::DBusConnection) {
        let action_weak = Rc::downgrade(self);
        let sub1 = connection.subscribe_to_signal(
            None,
            Some(NOTIFICATIONS_IFACE),
            Some("ActionInvoked"),
            Some(NOTIFICATIONS_PATH),
            None,
            gio::DBusSignalFlags::NONE,
            move |signal| {
                let Some(this) = action_weak.upgrade() else {
                    return;
                };
                let Some((id, key)) = signal.parameters.get::<(u32, String)>() else {
                    return;
                };
                this.dispatch(id, NotificationEvent::Action(key));
            },
        );

        let closed_weak = Rc::downgrade(self);
        let sub2 = connection.subscribe_to_signal(
            None,
            Some(NOTIFICATIONS_IFACE),
            Some("NotificationClosed"),
            Some(NOTIFICATIONS_PATH),
            None,
            gio::DBusSignalFlags::NONE,
            move |signal| {
                let Some(this) = closed_weak.upgrade() else {
                    return;
                };
                let Some((id, reason)) = signal.parameters.get::<(u32, u32)>() else {
                    return;
                };
                this.dispatch(id, NotificationEvent::Closed(reason));
            },
        );

        self._signal_subscriptions.borrow_mut().extend([sub1, sub2]);
    }

    fn dispatch(&self, id: u32, event: NotificationEvent) {
        let handler = self.handlers.borrow_mut().remove(&id);
        if let Some(handler) = handler {
            debug!("Notifications: {} -> {:?}", id, event);
            handler(event);
        }
    }

    /// Post a notification. `on_event` runs once with the first action or
    /// close for it, or with [`NotificationEvent::Failed`].
    pub fn notify<F>(self: &Rc<Self>, spec: NotificationSpec<'_>, on_event: F)
    where
        F: FnOnce(NotificationEvent) + 'static,
    {
        let args = notify_args(&spec);
        let this_weak = Rc::downgrade(self);

        self.with_connection(move |connection| {
            let Some(connection) = connection else {
                on_event(NotificationEvent::Failed);
                return;
            };
            connection.call(
                Some(NOTIFICATIONS_NAME),
                NOTIFICATIONS_PATH,
                NOTIFICATIONS_IFACE,
                "Notify",
                Some(&args),
                None,
                DBusCallFlags::NONE,
                5000,
                None::<&gio::Cancellable>,
                move |res| match res.map(|v| v.child_value(0).get::<u32>()) {
                    Ok(Some(id)) => {
                        if let Some(this) = this_weak.upgrade() {
                            this.handlers.borrow_mut().insert(id, Box::new(on_event));
                        }
                    }
                    Ok(None) => {
                        warn!("Notifications: Notify returned no id");
                        on_event(NotificationEvent::Failed);
                    }
                    Err(e) => {
                        warn!("Notifications: Notify failed: {}", e);
                        on_event(NotificationEvent::Failed);
                    }
                },
            );
        });
    }
}

fn notify_args(spec: &NotificationSpec<'_>) -> Variant {
    let actions: Vec<String> = spec
        .actions
        .iter()
        .flat_map(|(key, label)| [key.to_string(), label.to_string()])
        .collect();

    let hints = VariantDict::new(None);
    hints.insert_value("urgency", &spec.urgency.to_variant());
    hints.insert_value("desktop-entry", &APP_NAME.to_variant());

    (
        APP_NAME,
        0u32,
        spec.icon,
        spec.notice.summary.as_str(),
        spec.notice.body.as_str(),
        actions,
        hints.end(),
        spec.expire_timeout,
    )
        .to_variant()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_args_layout() {
        let notice = Notice {
            summary: "Bluetooth file transfer from Phone".into(),
            body: "photo.jpg".into(),
        };
        let args = notify_args(&NotificationSpec {
            notice: &notice,
            icon: "bluetooth",
            actions: &[("reject", "Decline"), ("accept", "Accept")],
            urgency: URGENCY_CRITICAL,
            expire_timeout: EXPIRE_NEVER,
        });

        assert_eq!(args.type_().as_str(), "(susssasa{sv}i)");
        assert_eq!(args.child_value(3).str(), Some("Bluetooth file transfer from Phone"));
        let actions: Vec<String> = args.child_value(5).get().unwrap();
        assert_eq!(actions, ["reject", "Decline", "accept", "Accept"]);
        let hints = VariantDict::new(Some(&args.child_value(6)));
        assert_eq!(
            hints.lookup_value("urgency", None).and_then(|v| v.get::<u8>()),
            Some(URGENCY_CRITICAL)
        );
        assert_eq!(args.child_value(7).get::<i32>(), Some(EXPIRE_NEVER));
    }
}
