//! IndicatorService - exports the session indicator over D-Bus.
//!
//! - Owns `com.canonical.indicator.session` on the session bus
//! - Exports a `gio::SimpleActionGroup` at `/com/canonical/indicator/session`
//! - Exports one root menu per [`Profile`] below that path
//! - Rebuilds only the sections a backend change invalidated, batched on a
//!   500 ms timer
//!
//! Losing the bus name unexports everything and fires the name-lost
//! callbacks; the daemon quits its main loop from there.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use deskbridge_core::config::Config;
use deskbridge_core::session::menu::{
    self, GuestSwitcherState, HeaderState, MenuItem, UserSwitcherState,
};
use deskbridge_core::session::{MenuModel, Profile, Sections, UserEvent};
use gtk4::gio::{self, BusType, prelude::*};
use gtk4::glib::{self, Variant, VariantDict, VariantTy};
use tracing::{debug, error, info, warn};

use super::callbacks::{CallbackId, Callbacks};
use super::session::{SessionActions, SessionGuest, SessionUsers};

pub const BUS_NAME: &str = "com.canonical.indicator.session";
pub const BUS_PATH: &str = "/com/canonical/indicator/session";

const REBUILD_DELAY: Duration = Duration::from_millis(500);

/// Root menu and the sections submenu under its header item.
struct ProfileMenu {
    profile: Profile,
    root: gio::Menu,
    submenu: gio::Menu,
}

struct Exports {
    connection: gio::DBusConnection,
    actions: gio::ActionGroupExportId,
    menus: Vec<gio::MenuModelExportId>,
}

pub struct IndicatorService {
    weak: Weak<IndicatorService>,
    actions: Rc<dyn SessionActions>,
    users: Rc<dyn SessionUsers>,
    guest: Rc<dyn SessionGuest>,
    model: RefCell<MenuModel>,
    action_group: gio::SimpleActionGroup,
    header_action: gio::SimpleAction,
    guest_action: gio::SimpleAction,
    user_action: gio::SimpleAction,
    menus: Vec<ProfileMenu>,
    owner_id: RefCell<Option<gio::OwnerId>>,
    exports: RefCell<Option<Exports>>,
    rebuild_source: RefCell<Option<glib::SourceId>>,
    name_lost: Callbacks<()>,
}

impl IndicatorService {
    pub fn new(
        config: Config,
        actions: Rc<dyn SessionActions>,
        users: Rc<dyn SessionUsers>,
        guest: Rc<dyn SessionGuest>,
    ) -> Rc<Self> {
        let mut model = MenuModel::new(config, actions.capabilities());
        model.set_guest(guest.state());
        model.set_live_session(users.is_live_session());
        for user in users.users() {
            model.upsert_user(user);
        }

        let menus = Profile::ALL
            .iter()
            .map(|profile| build_profile_menu(&mut model, *profile))
            .collect();

        let header_action =
            gio::SimpleAction::new_stateful("_header", None, &header_variant(&model.header_state()));
        let guest_action = gio::SimpleAction::new_stateful(
            "switch-to-guest",
            None,
            &guest_variant(&model.guest_switcher_state()),
        );
        let user_action = gio::SimpleAction::new_stateful(
            "switch-to-user",
            Some(VariantTy::STRING),
            &user_variant(&model.user_switcher_state()),
        );

        let this = Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            actions,
            users,
            guest,
            model: RefCell::new(model),
            action_group: gio::SimpleActionGroup::new(),
            header_action,
            guest_action,
            user_action,
            menus,
            owner_id: RefCell::new(None),
            exports: RefCell::new(None),
            rebuild_source: RefCell::new(None),
            name_lost: Callbacks::new(),
        });

        this.init_actions();
        this.connect_backends();
        this
    }

    fn init_actions(&self) {
        type Activate = fn(&dyn SessionActions);
        let stateless: [(&str, Activate); 11] = [
            ("about", |a| a.about()),
            ("help", |a| a.help()),
            ("hibernate", |a| a.hibernate()),
            ("logout", |a| a.logout()),
            ("online-accounts", |a| a.online_accounts()),
            ("reboot", |a| a.reboot()),
            ("settings", |a| a.settings()),
            ("switch-to-screensaver", |a| a.switch_to_screensaver()),
            ("switch-to-greeter", |a| a.switch_to_greeter()),
            ("suspend", |a| a.suspend()),
            ("power-off", |a| a.power_off()),
        ];

        for (name, activate) in stateless {
            let action = gio::SimpleAction::new(name, None);
            let backend = Rc::downgrade(&self.actions);
            action.connect_activate(move |action, _| {
                debug!("IndicatorService: activate {}", action.name());
                if let Some(backend) = backend.upgrade() {
                    activate(backend.as_ref());
                }
            });
            self.action_group.add_action(&action);
        }

        let backend = Rc::downgrade(&self.actions);
        self.guest_action.connect_activate(move |_, _| {
            if let Some(backend) = backend.upgrade() {
                backend.switch_to_guest();
            }
        });

        let backend = Rc::downgrade(&self.actions);
        self.user_action.connect_activate(move |_, param| {
            let Some(user_name) = param.and_then(|p| p.str()) else {
                warn!("IndicatorService: switch-to-user without a user name");
                return;
            };
            if let Some(backend) = backend.upgrade() {
                backend.switch_to_username(user_name);
            }
        });

        self.action_group.add_action(&self.header_action);
        self.action_group.add_action(&self.guest_action);
        self.action_group.add_action(&self.user_action);
    }

    fn connect_backends(&self) {
        let weak = self.weak.clone();
        self.actions.connect_changed(Box::new(move |capabilities| {
            if let Some(this) = weak.upgrade() {
                debug!(
                    "IndicatorService: capabilities changed, prompts via {:?}",
                    this.actions.prompt_status()
                );
                let flags = this.model.borrow_mut().set_capabilities(*capabilities);
                this.rebuild_soon(flags);
            }
        }));

        let weak = self.weak.clone();
        self.users.connect_changed(Box::new(move |event| {
            if let Some(this) = weak.upgrade() {
                this.handle_user_event(*event);
            }
        }));

        let weak = self.weak.clone();
        self.guest.connect_changed(Box::new(move |_| {
            if let Some(this) = weak.upgrade() {
                let state = this.guest.state();
                let flags = this.model.borrow_mut().set_guest(state);
                this.rebuild_soon(flags);
            }
        }));
    }

    fn handle_user_event(&self, event: UserEvent) {
        let flags = match event {
            UserEvent::Added(uid) | UserEvent::Changed(uid) => match self.users.user(uid) {
                Some(user) => self.model.borrow_mut().upsert_user(user),
                None => Sections::NONE,
            },
            UserEvent::Removed(uid) => self.model.borrow_mut().remove_user(uid),
            UserEvent::LiveSessionChanged(live) => self.model.borrow_mut().set_live_session(live),
        };
        self.rebuild_soon(flags);
    }

    /// Take the bus name and export actions and menus.
    pub fn start(&self) {
        let weak = self.weak.clone();
        gio::bus_get(BusType::Session, None::<&gio::Cancellable>, move |res| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let connection = match res {
                Ok(c) => c,
                Err(e) => {
                    error!("IndicatorService: failed to get session bus: {}", e);
                    this.name_lost.notify(&());
                    return;
                }
            };

            if let Err(e) = this.export(&connection) {
                error!("IndicatorService: failed to export: {}", e);
                this.unexport();
                this.name_lost.notify(&());
                return;
            }

            let lost = this.weak.clone();
            let owner_id = gio::bus_own_name_on_connection(
                &connection,
                BUS_NAME,
                gio::BusNameOwnerFlags::ALLOW_REPLACEMENT,
                |_conn, name| info!("IndicatorService: acquired {}", name),
                move |_conn, name| {
                    warn!("IndicatorService: lost {}", name);
                    if let Some(this) = lost.upgrade() {
                        this.unexport();
                        this.name_lost.notify(&());
                    }
                },
            );
            this.owner_id.replace(Some(owner_id));
        });
    }

    fn export(&self, connection: &gio::DBusConnection) -> Result<(), glib::Error> {
        let actions = connection.export_action_group(BUS_PATH, &self.action_group)?;
        self.exports.replace(Some(Exports {
            connection: connection.clone(),
            actions,
            menus: Vec::new(),
        }));

        for menu in &self.menus {
            let path = format!("{}/{}", BUS_PATH, menu.profile.menu_name());
            let id = connection.export_menu_model(&path, &menu.root)?;
            if let Some(exports) = self.exports.borrow_mut().as_mut() {
                exports.menus.push(id);
            }
            debug!("IndicatorService: exported {}", path);
        }
        Ok(())
    }

    fn unexport(&self) {
        let Some(exports) = self.exports.borrow_mut().take() else {
            return;
        };
        for id in exports.menus {
            if let Err(e) = exports.connection.unexport_menu_model(id) {
                warn!("IndicatorService: failed to unexport menu: {}", e);
            }
        }
        if let Err(e) = exports.connection.unexport_action_group(exports.actions) {
            warn!("IndicatorService: failed to unexport actions: {}", e);
        }
    }

    pub fn connect_name_lost<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + 'static,
    {
        self.name_lost.register(move |_| callback())
    }

    /// New settings from the config file.
    pub fn apply_config(&self, config: &Config) {
        self.actions.apply_config(&config.session, &config.lockdown);

        let change = self.model.borrow_mut().apply_config(config.clone());
        if change.reload_users {
            for user in self.users.users() {
                self.model.borrow_mut().upsert_user(user);
            }
        }
        self.rebuild_soon(change.sections);
    }

    fn rebuild_soon(&self, flags: Sections) {
        let idle = self.model.borrow_mut().queue(flags);
        if !idle || self.rebuild_source.borrow().is_some() {
            return;
        }

        let weak = self.weak.clone();
        let id = glib::timeout_add_local(REBUILD_DELAY, move || {
            if let Some(this) = weak.upgrade() {
                this.rebuild_source.replace(None);
                this.rebuild_now();
            }
            glib::ControlFlow::Break
        });
        self.rebuild_source.replace(Some(id));
    }

    fn rebuild_now(&self) {
        let mut model = self.model.borrow_mut();
        let flags = model.take_pending();
        if flags.is_empty() {
            return;
        }
        debug!("IndicatorService: rebuilding {}", flags);

        if flags.contains(Sections::HEADER) {
            self.header_action
                .set_state(&header_variant(&model.header_state()));
        }
        if flags.contains(Sections::SWITCH) {
            self.guest_action
                .set_state(&guest_variant(&model.guest_switcher_state()));
            self.user_action
                .set_state(&user_variant(&model.user_switcher_state()));
        }

        for (profile, pos, section) in menu::rebuild_targets(flags) {
            let Some(menu) = self.menus.iter().find(|m| m.profile == profile) else {
                continue;
            };
            let items = model.section(profile, section);
            let pos = pos as i32;
            menu.submenu.remove(pos);
            menu.submenu.insert_section(pos, None, &section_menu(&items));
        }
    }
}

impl Drop for IndicatorService {
    fn drop(&mut self) {
        if let Some(id) = self.rebuild_source.get_mut().take() {
            id.remove();
        }
        self.unexport();
        if let Some(id) = self.owner_id.get_mut().take() {
            gio::bus_unown_name(id);
        }
    }
}

fn build_profile_menu(model: &mut MenuModel, profile: Profile) -> ProfileMenu {
    let submenu = gio::Menu::new();
    for items in model.build(profile) {
        submenu.append_section(None, &section_menu(&items));
    }

    let root_item = gio_item(&menu::root_item());
    root_item.set_submenu(Some(&submenu));
    let root = gio::Menu::new();
    root.append_item(&root_item);

    ProfileMenu {
        profile,
        root,
        submenu,
    }
}

fn section_menu(items: &[MenuItem]) -> gio::Menu {
    let section = gio::Menu::new();
    for item in items {
        section.append_item(&gio_item(item));
    }
    section
}

fn gio_item(item: &MenuItem) -> gio::MenuItem {
    let label = (!item.label.is_empty()).then_some(item.label.as_str());
    let gitem = gio::MenuItem::new(label, None);
    match &item.target {
        Some(target) => gitem.set_action_and_target_value(Some(&item.action), Some(&target.to_variant())),
        None => gitem.set_detailed_action(&item.action),
    }
    if let Some(kind) = item.canonical_type {
        gitem.set_attribute_value("x-canonical-type", Some(&kind.to_variant()));
    }
    if let Some(accel) = &item.accel {
        gitem.set_attribute_value("accel", Some(&accel.to_variant()));
    }
    if let Some(icon_file) = &item.icon_file {
        let icon = gio::FileIcon::new(&gio::File::for_path(icon_file));
        if let Some(serialized) = icon.serialize() {
            gitem.set_attribute_value("icon", Some(&serialized));
        }
    }
    gitem
}

fn header_variant(state: &HeaderState) -> Variant {
    let dict = VariantDict::new(None);
    dict.insert_value("accessible-desc", &state.accessible_desc.to_variant());
    if let Some(icon) = gio::ThemedIcon::with_default_fallbacks(state.icon).serialize() {
        dict.insert_value("icon", &icon);
    }
    if let Some(label) = &state.label {
        dict.insert_value("label", &label.to_variant());
    }
    dict.insert_value("visible", &state.visible.to_variant());
    dict.end()
}

fn guest_variant(state: &GuestSwitcherState) -> Variant {
    let dict = VariantDict::new(None);
    dict.insert_value("is-active", &state.is_active.to_variant());
    dict.insert_value("is-logged-in", &state.is_logged_in.to_variant());
    dict.end()
}

fn user_variant(state: &UserSwitcherState) -> Variant {
    let dict = VariantDict::new(None);
    dict.insert_value("active-user", &state.active_user.to_variant());
    dict.insert_value("logged-in-users", &state.logged_in_users.to_variant());
    dict.end()
}
