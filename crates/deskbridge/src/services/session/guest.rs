//! D-Bus backed [`SessionGuest`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use deskbridge_core::session::logins::GuestChange;
use deskbridge_core::session::GuestState;
use gtk4::gio::{self, BusType, prelude::*};
use tracing::debug;

use super::{
    list_sessions, new_proxy, SessionEnv, SessionGuest, DM_NAME, DM_SEAT_IFACE,
    LOGIN1_MANAGER_IFACE, LOGIN1_NAME, LOGIN1_PATH,
};
use crate::services::callbacks::{CallbackId, Callbacks};

pub struct DbusGuest {
    weak: Weak<DbusGuest>,
    env: SessionEnv,
    state: Cell<GuestState>,
    callbacks: Callbacks<GuestChange>,
    login1_manager: RefCell<Option<gio::DBusProxy>>,
    _dm_seat: RefCell<Option<gio::DBusProxy>>,
}

impl DbusGuest {
    pub fn new(env: SessionEnv) -> Rc<Self> {
        let this = Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            env,
            state: Cell::new(GuestState::default()),
            callbacks: Callbacks::new(),
            login1_manager: RefCell::new(None),
            _dm_seat: RefCell::new(None),
        });
        this.init_proxies();
        this
    }

    fn init_proxies(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        new_proxy(BusType::System, LOGIN1_NAME, LOGIN1_PATH, LOGIN1_MANAGER_IFACE, move |proxy| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let weak = Rc::downgrade(&this);
            proxy.connect_local("g-signal", false, move |values| {
                let this = weak.upgrade()?;
                let signal = values.get(2)?.get::<String>().ok()?;
                if matches!(signal.as_str(), "SessionNew" | "SessionRemoved") {
                    this.refresh_sessions();
                }
                None
            });
            this.login1_manager.replace(Some(proxy));
            this.refresh_sessions();
        });

        let Some(seat_path) = self.env.seat_path.clone() else {
            debug!("SessionGuest: XDG_SEAT_PATH not set, guest sessions unavailable");
            return;
        };
        let weak = Rc::downgrade(self);
        new_proxy(BusType::System, DM_NAME, &seat_path, DM_SEAT_IFACE, move |proxy| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.update_allowed(&proxy);

            let weak = Rc::downgrade(&this);
            proxy.connect_local("g-properties-changed", false, move |values| {
                let this = weak.upgrade()?;
                let proxy = values.first()?.get::<gio::DBusProxy>().ok()?;
                this.update_allowed(&proxy);
                None
            });
            this._dm_seat.replace(Some(proxy));
        });
    }

    fn update_allowed(&self, dm_seat: &gio::DBusProxy) {
        let allowed = dm_seat
            .cached_property("HasGuestAccount")
            .and_then(|v| v.get::<bool>())
            .unwrap_or(false);
        let mut state = self.state.get();
        let change = state.set_allowed(allowed);
        self.commit(state, change);
    }

    fn refresh_sessions(&self) {
        let Some(manager) = self.login1_manager.borrow().clone() else {
            return;
        };
        let weak = self.weak.clone();
        list_sessions(&manager, move |records| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let mut state = this.state.get();
            let change = state.update_sessions(
                &records,
                this.env.seat.as_deref(),
                this.env.session_id.as_deref(),
            );
            this.commit(state, change);
        });
    }

    fn commit(&self, state: GuestState, change: GuestChange) {
        self.state.set(state);
        if change.any() {
            debug!("SessionGuest: {:?}", state);
            self.callbacks.notify(&change);
        }
    }
}

impl SessionGuest for DbusGuest {
    fn state(&self) -> GuestState {
        self.state.get()
    }

    fn connect_changed(&self, callback: Box<dyn Fn(&GuestChange)>) -> CallbackId {
        self.callbacks.register(callback)
    }
}
