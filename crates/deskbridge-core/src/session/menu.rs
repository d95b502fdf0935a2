//! The session indicator menu as plain data.
//!
//! [`MenuModel`] owns everything the menus are built from: the settings,
//! capabilities, known users and the guest state. Every mutation returns the
//! [`Sections`] it invalidates; the binary ORs those into a pending set with
//! [`MenuModel::queue`] and, once its timer fires, rebuilds the positions
//! [`rebuild_targets`] names.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::Serialize;
use tracing::warn;

use super::actions::Capabilities;
use super::logins::GuestState;
use super::user::{SessionUser, compare_by_label, compare_by_usefulness};
use crate::config::Config;

pub const ICON_DEFAULT: &str = "system-devices-panel";

const TYPE_ROOT: &str = "com.canonical.indicator.root";
const TYPE_GUEST_ITEM: &str = "indicator.guest-menu-item";
const TYPE_USER_ITEM: &str = "indicator.user-menu-item";

/// Set of menu sections, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Sections(u32);

impl Sections {
    pub const NONE: Self = Self(0);
    pub const HEADER: Self = Self(1 << 0);
    pub const ADMIN: Self = Self(1 << 1);
    pub const SETTINGS: Self = Self(1 << 2);
    pub const SWITCH: Self = Self(1 << 3);
    pub const LOGOUT: Self = Self(1 << 4);
    pub const SESSION: Self = Self(1 << 5);

    pub const ALL: Self = Self(0b11_1111);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }
}

impl BitOr for Sections {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Sections {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Sections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::HEADER, "header"),
            (Self::ADMIN, "admin"),
            (Self::SETTINGS, "settings"),
            (Self::SWITCH, "switch"),
            (Self::LOGOUT, "logout"),
            (Self::SESSION, "session"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(s, _)| self.contains(*s))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "[{}]", set.join("|"))
    }
}

/// Which screen a menu is shown on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Desktop,
    Greeter,
    Lockscreen,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Desktop, Profile::Greeter, Profile::Lockscreen];

    /// Last component of the exported menu path.
    pub fn menu_name(self) -> &'static str {
        match self {
            Profile::Desktop => "desktop",
            Profile::Greeter => "desktop_greeter",
            Profile::Lockscreen => "desktop_lockscreen",
        }
    }

    /// Sections of this profile's submenu, in order.
    pub fn sections(self) -> &'static [Sections] {
        match self {
            Profile::Desktop => &[
                Sections::ADMIN,
                Sections::SETTINGS,
                Sections::SWITCH,
                Sections::LOGOUT,
                Sections::SESSION,
            ],
            Profile::Greeter => &[Sections::SESSION],
            Profile::Lockscreen => &[Sections::SWITCH, Sections::SESSION],
        }
    }

    /// Position of `section` in this profile's submenu.
    pub fn position(self, section: Sections) -> Option<usize> {
        self.sections().iter().position(|s| *s == section)
    }
}

/// Every submenu position that has to be replaced for `flags`, as
/// `(profile, position, section)`. The header is an action state, not a
/// position, and never appears here.
pub fn rebuild_targets(flags: Sections) -> Vec<(Profile, usize, Sections)> {
    let mut targets = Vec::new();
    for section in [
        Sections::ADMIN,
        Sections::SETTINGS,
        Sections::SWITCH,
        Sections::LOGOUT,
        Sections::SESSION,
    ] {
        if !flags.contains(section) {
            continue;
        }
        for profile in Profile::ALL {
            if let Some(pos) = profile.position(section) {
                targets.push((profile, pos, section));
            }
        }
    }
    targets
}

/// One menu entry. `action` is the full detailed name, `indicator.*`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MenuItem {
    pub label: String,
    pub action: String,
    pub target: Option<String>,
    pub canonical_type: Option<&'static str>,
    pub accel: Option<String>,
    pub icon_file: Option<String>,
}

impl MenuItem {
    fn new(label: &str, action: &str) -> Self {
        Self {
            label: label.to_string(),
            action: format!("indicator.{}", action),
            ..Default::default()
        }
    }
}

/// The root item every profile menu consists of.
pub fn root_item() -> MenuItem {
    MenuItem {
        canonical_type: Some(TYPE_ROOT),
        ..MenuItem::new("", "_header")
    }
}

/// State of the `_header` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderState {
    pub accessible_desc: String,
    pub icon: &'static str,
    pub label: Option<String>,
    pub visible: bool,
}

/// State of the `switch-to-guest` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuestSwitcherState {
    pub is_active: bool,
    pub is_logged_in: bool,
}

/// State of the `switch-to-user` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSwitcherState {
    pub active_user: String,
    pub logged_in_users: Vec<String>,
}

/// What a configuration change requires of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigChange {
    pub sections: Sections,
    /// `user_show_menu` was switched on; known users must be fetched again.
    pub reload_users: bool,
}

/// Sections affected by going from `old` to `new` settings.
pub fn settings_changes(old: &Config, new: &Config) -> Sections {
    let (o, n) = (&old.session, &new.session);
    let mut flags = Sections::NONE;

    if o.suppress_logout_restart_shutdown != n.suppress_logout_restart_shutdown {
        flags |= Sections::SWITCH | Sections::LOGOUT | Sections::SESSION;
    }
    if o.suppress_shutdown_menuitem != n.suppress_shutdown_menuitem {
        flags |= Sections::SESSION;
    }
    if o.show_real_name_on_panel != n.show_real_name_on_panel {
        flags |= Sections::HEADER;
    }
    if o.user_show_menu != n.user_show_menu
        || o.max_users != n.max_users
        || old.keybindings.screensaver != new.keybindings.screensaver
    {
        flags |= Sections::SWITCH;
    }
    flags
}

pub struct MenuModel {
    config: Config,
    capabilities: Capabilities,
    users: BTreeMap<u32, SessionUser>,
    reported_users: BTreeSet<u32>,
    guest: GuestState,
    is_live_session: bool,
    pending: Sections,
}

impl MenuModel {
    pub fn new(config: Config, capabilities: Capabilities) -> Self {
        Self {
            config,
            capabilities,
            users: BTreeMap::new(),
            reported_users: BTreeSet::new(),
            guest: GuestState::default(),
            is_live_session: false,
            pending: Sections::NONE,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn show_user_list(&self) -> bool {
        self.config.session.user_show_menu
    }

    /// Add `flags` to the pending set. Returns true when the set was empty,
    /// meaning no rebuild timer is running yet.
    pub fn queue(&mut self, flags: Sections) -> bool {
        if flags.is_empty() {
            return false;
        }
        let was_idle = self.pending.is_empty();
        self.pending |= flags;
        was_idle
    }

    /// Take the pending set, leaving it empty.
    pub fn take_pending(&mut self) -> Sections {
        std::mem::take(&mut self.pending)
    }

    pub fn apply_config(&mut self, config: Config) -> ConfigChange {
        let sections = settings_changes(&self.config, &config);
        let show_toggled = self.config.session.user_show_menu != config.session.user_show_menu;
        self.config = config;

        let mut reload_users = false;
        if show_toggled {
            if self.show_user_list() {
                reload_users = true;
            } else {
                self.users.clear();
            }
        }
        ConfigChange {
            sections,
            reload_users,
        }
    }

    pub fn set_max_users(&mut self, max_users: u32) -> Sections {
        if self.config.session.max_users == max_users as usize {
            return Sections::NONE;
        }
        self.config.session.max_users = max_users as usize;
        Sections::SWITCH
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) -> Sections {
        let old = std::mem::replace(&mut self.capabilities, capabilities);
        let mut flags = Sections::NONE;
        if old != capabilities {
            flags |= Sections::SWITCH | Sections::LOGOUT | Sections::SESSION;
        }
        if old.has_online_account_error != capabilities.has_online_account_error {
            flags |= Sections::HEADER | Sections::SETTINGS;
        }
        flags
    }

    pub fn set_guest(&mut self, guest: GuestState) -> Sections {
        let old = std::mem::replace(&mut self.guest, guest);
        let mut flags = Sections::NONE;
        if old != guest {
            flags |= Sections::SWITCH;
        }
        if old.active != guest.active {
            flags |= Sections::HEADER;
        }
        flags
    }

    pub fn set_live_session(&mut self, live: bool) -> Sections {
        if self.is_live_session == live {
            return Sections::NONE;
        }
        self.is_live_session = live;
        Sections::SWITCH
    }

    /// Insert or replace a user after an added or changed event.
    pub fn upsert_user(&mut self, user: SessionUser) -> Sections {
        let mut flags = Sections::SWITCH;
        if user.is_current_user {
            flags |= Sections::HEADER;
        }
        self.users.insert(user.uid, user);
        flags
    }

    pub fn remove_user(&mut self, uid: u32) -> Sections {
        self.users.remove(&uid);
        Sections::SWITCH
    }

    pub fn users(&self) -> impl Iterator<Item = &SessionUser> {
        self.users.values()
    }

    /// Shown next to the indicator: "Guest" for the guest session, else the
    /// current user's label.
    pub fn current_real_name(&self) -> String {
        if self.guest.active {
            return "Guest".to_string();
        }
        self.users
            .values()
            .find(|u| u.is_current_user)
            .map(|u| u.label().to_string())
            .unwrap_or_default()
    }

    pub fn header_state(&self) -> HeaderState {
        let label = if self.config.session.show_real_name_on_panel {
            self.current_real_name()
        } else {
            String::new()
        };

        let accessible_desc = if label.is_empty() {
            "System".to_string()
        } else {
            format!("System, {}", label)
        };

        HeaderState {
            accessible_desc,
            icon: ICON_DEFAULT,
            label: (!label.is_empty()).then_some(label),
            visible: true,
        }
    }

    pub fn guest_switcher_state(&self) -> GuestSwitcherState {
        GuestSwitcherState {
            is_active: self.guest.active,
            is_logged_in: self.guest.logged_in,
        }
    }

    pub fn user_switcher_state(&self) -> UserSwitcherState {
        let active_user = self
            .users
            .values()
            .find(|u| u.is_current_user)
            .map(|u| u.user_name.clone())
            .unwrap_or_default();
        let logged_in_users = self
            .users
            .values()
            .filter(|u| u.is_logged_in)
            .map(|u| u.user_name.clone())
            .collect();
        UserSwitcherState {
            active_user,
            logged_in_users,
        }
    }

    fn use_ellipsis(&self) -> bool {
        self.capabilities.can_prompt && !self.config.session.suppress_logout_restart_shutdown
    }

    fn label<'a>(&self, plain: &'a str, with_ellipsis: &'a str) -> &'a str {
        if self.use_ellipsis() {
            with_ellipsis
        } else {
            plain
        }
    }

    /// Items of one section as shown in `profile`.
    pub fn section(&mut self, profile: Profile, section: Sections) -> Vec<MenuItem> {
        match section {
            Sections::ADMIN => self.admin_section(),
            Sections::SETTINGS => self.settings_section(),
            Sections::SWITCH => self.switch_section(profile),
            Sections::LOGOUT => self.logout_section(),
            Sections::SESSION => self.session_section(profile),
            _ => Vec::new(),
        }
    }

    /// All sections of `profile`, in submenu order.
    pub fn build(&mut self, profile: Profile) -> Vec<Vec<MenuItem>> {
        profile
            .sections()
            .iter()
            .map(|s| self.section(profile, *s))
            .collect()
    }

    fn admin_section(&self) -> Vec<MenuItem> {
        vec![
            MenuItem::new("About This Computer", "about"),
            MenuItem::new("Ubuntu Help", "help"),
        ]
    }

    fn settings_section(&self) -> Vec<MenuItem> {
        let mut items = vec![MenuItem::new("System Settings…", "settings")];
        if self.capabilities.has_online_account_error {
            items.push(MenuItem::new("Online Accounts…", "online-accounts"));
        }
        items
    }

    fn switch_section(&mut self, profile: Profile) -> Vec<MenuItem> {
        let mut items = Vec::new();
        let accel = Some(self.config.keybindings.screensaver.clone());

        let first = if self.is_live_session {
            MenuItem {
                accel,
                ..MenuItem::new("Start Screen Saver", "switch-to-screensaver")
            }
        } else if profile == Profile::Lockscreen || self.guest.active {
            MenuItem::new(
                self.label("Switch Account", "Switch Account…"),
                "switch-to-greeter",
            )
        } else {
            let label = if self.users.len() == 1 {
                "Lock"
            } else {
                self.label("Lock/Switch Account", "Lock/Switch Account…")
            };
            MenuItem {
                accel,
                ..MenuItem::new(label, "switch-to-screensaver")
            }
        };
        items.push(first);

        if self.guest.allowed {
            items.push(MenuItem {
                canonical_type: Some(TYPE_GUEST_ITEM),
                ..MenuItem::new("Guest Session", "switch-to-guest")
            });
        }

        if !self.show_user_list() {
            return items;
        }

        let mut users: Vec<&SessionUser> = self.users.values().collect();
        let max_users = self.config.session.max_users as usize;
        if users.len() > max_users {
            users.sort_by(|a, b| compare_by_usefulness(a, b));
            users.truncate(max_users);
        }
        users.sort_by(|a, b| compare_by_label(a, b));

        let mut unusable = Vec::new();
        for user in users {
            if profile == Profile::Lockscreen && user.is_current_user {
                continue;
            }
            let label = user.label();
            if label.is_empty() {
                unusable.push(user.uid);
                continue;
            }
            items.push(MenuItem {
                target: Some(user.user_name.clone()),
                canonical_type: Some(TYPE_USER_ITEM),
                icon_file: user.icon_file.clone(),
                ..MenuItem::new(label, "switch-to-user")
            });
        }

        for uid in unusable {
            if self.reported_users.insert(uid) {
                warn!("User {} has neither a real name nor a user name", uid);
            }
        }

        items
    }

    fn logout_section(&self) -> Vec<MenuItem> {
        let mut items = Vec::new();
        if self.capabilities.can_logout {
            items.push(MenuItem::new(self.label("Log Out", "Log Out…"), "logout"));
        }
        items
    }

    fn session_section(&self, profile: Profile) -> Vec<MenuItem> {
        let mut items = Vec::new();
        if self.capabilities.can_suspend {
            items.push(MenuItem::new("Suspend", "suspend"));
        }
        if self.capabilities.can_hibernate {
            items.push(MenuItem::new("Hibernate", "hibernate"));
        }
        if profile != Profile::Lockscreen {
            if self.capabilities.can_reboot {
                items.push(MenuItem::new(self.label("Restart", "Restart…"), "reboot"));
            }
            if !self.config.session.suppress_shutdown_menuitem {
                items.push(MenuItem::new(
                    self.label("Shut Down", "Shut Down…"),
                    "power-off",
                ));
            }
        }
        items
    }

    /// Uids already reported as unusable.
    pub fn reported_users(&self) -> &BTreeSet<u32> {
        &self.reported_users
    }
}
