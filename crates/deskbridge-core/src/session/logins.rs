//! Login tracking: logind session lists, AccountsService users, and the
//! guest account.
//!
//! The binary polls `ListSessions` and feeds every result through
//! [`LoginState::reconcile`]. [`UserTracker`] and [`GuestState`] turn the
//! snapshots into change events so the menu only rebuilds what changed.

use std::collections::{BTreeMap, BTreeSet};

use super::user::SessionUser;

/// uid and name of the live-CD session user.
const LIVE_SESSION_UID: u32 = 999;
const LIVE_SESSION_USER: &str = "ubuntu";

/// One entry of logind's `ListSessions` reply, `(susso)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub uid: u32,
    pub user: String,
    pub seat: String,
    pub path: String,
}

/// Build records from `ListSessions` tuples.
pub fn parse_sessions<I>(sessions: I) -> Vec<SessionRecord>
where
    I: IntoIterator<Item = (String, u32, String, String, String)>,
{
    sessions
        .into_iter()
        .map(|(id, uid, user, seat, path)| SessionRecord {
            id,
            uid,
            user,
            seat,
            path,
        })
        .collect()
}

/// Who is logged in on our seat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginState {
    /// uid owning our own session, if it was listed.
    pub active_uid: Option<u32>,
    pub logins: BTreeSet<u32>,
    pub is_live: bool,
}

impl LoginState {
    pub fn reconcile(
        records: &[SessionRecord],
        my_seat: Option<&str>,
        my_session_id: Option<&str>,
    ) -> Self {
        let mut state = Self::default();
        for record in records {
            if my_seat != Some(record.seat.as_str()) {
                continue;
            }
            if my_session_id == Some(record.id.as_str()) {
                state.active_uid = Some(record.uid);
                if record.uid == LIVE_SESSION_UID && record.user == LIVE_SESSION_USER {
                    state.is_live = true;
                }
            }
            state.logins.insert(record.uid);
        }
        state
    }
}

/// Account properties read from `org.freedesktop.Accounts.User`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccountRecord {
    pub path: String,
    pub uid: u32,
    pub user_name: String,
    pub real_name: String,
    pub icon_file: Option<String>,
    pub login_frequency: u64,
    pub system_account: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    Added(u32),
    Changed(u32),
    Removed(u32),
    LiveSessionChanged(bool),
}

/// Tracked accounts plus the login state they are rendered with.
#[derive(Debug, Clone, Default)]
pub struct UserTracker {
    accounts: BTreeMap<u32, AccountRecord>,
    logins: BTreeSet<u32>,
    active_uid: Option<u32>,
    is_live: bool,
}

impl UserTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, uid: u32) -> bool {
        self.accounts.contains_key(&uid)
    }

    pub fn is_live_session(&self) -> bool {
        self.is_live
    }

    pub fn uids(&self) -> Vec<u32> {
        self.accounts.keys().copied().collect()
    }

    /// Start or refresh tracking of an account. System accounts are ignored.
    pub fn track(&mut self, record: AccountRecord) -> Option<UserEvent> {
        if record.system_account {
            return None;
        }
        let uid = record.uid;
        let existed = self.accounts.insert(uid, record).is_some();
        Some(if existed {
            UserEvent::Changed(uid)
        } else {
            UserEvent::Added(uid)
        })
    }

    /// Stop tracking the account at `path`.
    pub fn untrack_path(&mut self, path: &str) -> Option<UserEvent> {
        let uid = self
            .accounts
            .iter()
            .find(|(_, rec)| rec.path == path)
            .map(|(uid, _)| *uid)?;
        self.accounts.remove(&uid);
        Some(UserEvent::Removed(uid))
    }

    /// Replace the logged-in set. Returns tracked uids whose state flipped.
    pub fn set_logins(&mut self, logins: BTreeSet<u32>) -> Vec<u32> {
        let changed = self
            .logins
            .symmetric_difference(&logins)
            .copied()
            .filter(|uid| self.is_tracked(*uid))
            .collect();
        self.logins = logins;
        changed
    }

    /// Record the uid owning our session. Returns tracked uids affected.
    pub fn set_active_uid(&mut self, uid: u32) -> Vec<u32> {
        if self.active_uid == Some(uid) {
            return Vec::new();
        }
        let old = self.active_uid.replace(uid);
        old.into_iter()
            .chain(std::iter::once(uid))
            .filter(|u| self.is_tracked(*u))
            .collect()
    }

    /// Apply a reconciled session snapshot and report what changed.
    pub fn apply(&mut self, state: LoginState) -> Vec<UserEvent> {
        let mut events = Vec::new();

        if let Some(uid) = state.active_uid {
            events.extend(self.set_active_uid(uid).into_iter().map(UserEvent::Changed));
        }

        if self.is_live != state.is_live {
            self.is_live = state.is_live;
            events.push(UserEvent::LiveSessionChanged(state.is_live));
        }

        events.extend(self.set_logins(state.logins).into_iter().map(UserEvent::Changed));
        events
    }

    pub fn user_name(&self, uid: u32) -> Option<&str> {
        self.accounts.get(&uid).map(|a| a.user_name.as_str())
    }

    pub fn get_user(&self, uid: u32) -> Option<SessionUser> {
        let account = self.accounts.get(&uid)?;
        Some(SessionUser {
            uid,
            user_name: account.user_name.clone(),
            real_name: account.real_name.clone(),
            icon_file: account.icon_file.clone(),
            login_frequency: account.login_frequency,
            is_logged_in: self.logins.contains(&uid),
            is_current_user: self.active_uid == Some(uid),
        })
    }

    pub fn users(&self) -> Vec<SessionUser> {
        self.accounts
            .keys()
            .filter_map(|uid| self.get_user(*uid))
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Guest accounts are created on demand by the display manager.
pub fn is_guest(user_name: &str, uid: u32) -> bool {
    user_name.starts_with("guest-") && uid < 1000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestState {
    pub allowed: bool,
    pub logged_in: bool,
    pub active: bool,
}

/// Which guest flags changed in an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestChange {
    pub allowed: bool,
    pub logged_in: bool,
    pub active: bool,
}

impl GuestChange {
    pub fn any(&self) -> bool {
        self.allowed || self.logged_in || self.active
    }
}

impl GuestState {
    /// Update `logged_in` and `active` from a session list.
    pub fn update_sessions(
        &mut self,
        records: &[SessionRecord],
        my_seat: Option<&str>,
        my_session_id: Option<&str>,
    ) -> GuestChange {
        let mut logged_in = false;
        let mut active = false;
        for record in records.iter().filter(|r| is_guest(&r.user, r.uid)) {
            if my_seat != Some(record.seat.as_str()) {
                continue;
            }
            logged_in = true;
            if my_session_id == Some(record.id.as_str()) {
                active = true;
            }
        }

        let change = GuestChange {
            allowed: false,
            logged_in: self.logged_in != logged_in,
            active: self.active != active,
        };
        self.logged_in = logged_in;
        self.active = active;
        change
    }

    /// Update `allowed` from the display manager's `HasGuestAccount`.
    pub fn set_allowed(&mut self, allowed: bool) -> GuestChange {
        let change = GuestChange {
            allowed: self.allowed != allowed,
            ..Default::default()
        };
        self.allowed = allowed;
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, uid: u32, user: &str, seat: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            uid,
            user: user.to_string(),
            seat: seat.to_string(),
            path: format!("/org/freedesktop/login1/session/_3{}", id),
        }
    }

    fn account(uid: u32, name: &str) -> AccountRecord {
        AccountRecord {
            path: format!("/org/freedesktop/Accounts/User{}", uid),
            uid,
            user_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_sessions() {
        let records = parse_sessions(vec![(
            "c2".to_string(),
            1000,
            "ada".to_string(),
            "seat0".to_string(),
            "/org/freedesktop/login1/session/c2".to_string(),
        )]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uid, 1000);
        assert_eq!(records[0].seat, "seat0");
    }

    #[test]
    fn test_reconcile_filters_seat() {
        let records = vec![
            rec("1", 1000, "ada", "seat0"),
            rec("2", 1001, "bob", "seat0"),
            rec("3", 1002, "eve", "seat1"),
        ];
        let state = LoginState::reconcile(&records, Some("seat0"), Some("2"));
        assert_eq!(state.active_uid, Some(1001));
        assert_eq!(state.logins, BTreeSet::from([1000, 1001]));
        assert!(!state.is_live);

        let none = LoginState::reconcile(&records, None, Some("2"));
        assert!(none.logins.is_empty());
        assert_eq!(none.active_uid, None);
    }

    #[test]
    fn test_reconcile_detects_live_session() {
        let records = vec![rec("1", 999, "ubuntu", "seat0")];
        assert!(LoginState::reconcile(&records, Some("seat0"), Some("1")).is_live);

        let records = vec![rec("1", 999, "ada", "seat0")];
        assert!(!LoginState::reconcile(&records, Some("seat0"), Some("1")).is_live);
    }

    #[test]
    fn test_track_ignores_system_accounts() {
        let mut tracker = UserTracker::new();
        assert_eq!(tracker.track(account(1000, "ada")), Some(UserEvent::Added(1000)));
        assert_eq!(tracker.track(account(1000, "ada")), Some(UserEvent::Changed(1000)));
        let system = AccountRecord {
            system_account: true,
            ..account(120, "gdm")
        };
        assert_eq!(tracker.track(system), None);
        assert_eq!(tracker.uids(), vec![1000]);
    }

    #[test]
    fn test_untrack_by_path() {
        let mut tracker = UserTracker::new();
        tracker.track(account(1000, "ada"));
        assert_eq!(
            tracker.untrack_path("/org/freedesktop/Accounts/User1000"),
            Some(UserEvent::Removed(1000))
        );
        assert_eq!(tracker.untrack_path("/org/freedesktop/Accounts/User1000"), None);
    }

    #[test]
    fn test_set_logins_reports_symmetric_difference() {
        let mut tracker = UserTracker::new();
        for (uid, name) in [(1000, "ada"), (1001, "bob"), (1002, "eve")] {
            tracker.track(account(uid, name));
        }
        tracker.set_logins(BTreeSet::from([1000, 1001]));

        // 1001 logs out, 1002 logs in, 4242 is untracked
        let changed = tracker.set_logins(BTreeSet::from([1000, 1002, 4242]));
        assert_eq!(changed, vec![1001, 1002]);
    }

    #[test]
    fn test_set_active_uid() {
        let mut tracker = UserTracker::new();
        tracker.track(account(1000, "ada"));
        tracker.track(account(1001, "bob"));

        assert_eq!(tracker.set_active_uid(1000), vec![1000]);
        assert!(tracker.set_active_uid(1000).is_empty());
        assert_eq!(tracker.set_active_uid(1001), vec![1000, 1001]);
        assert_eq!(tracker.set_active_uid(4242), vec![1001]);
    }

    #[test]
    fn test_apply_snapshot_and_get_user() {
        let mut tracker = UserTracker::new();
        tracker.track(AccountRecord {
            real_name: "Ada Lovelace".to_string(),
            login_frequency: 7,
            ..account(1000, "ada")
        });

        let records = vec![rec("1", 1000, "ada", "seat0")];
        let events = tracker.apply(LoginState::reconcile(&records, Some("seat0"), Some("1")));
        assert_eq!(events, vec![UserEvent::Changed(1000), UserEvent::Changed(1000)]);

        let user = tracker.get_user(1000).unwrap();
        assert!(user.is_logged_in && user.is_current_user);
        assert_eq!(user.label(), "Ada Lovelace");
        assert_eq!(user.login_frequency, 7);
        assert!(tracker.get_user(1).is_none());
    }

    #[test]
    fn test_apply_reports_live_session_change() {
        let mut tracker = UserTracker::new();
        let records = vec![rec("1", 999, "ubuntu", "seat0")];
        let events = tracker.apply(LoginState::reconcile(&records, Some("seat0"), Some("1")));
        assert_eq!(events, vec![UserEvent::LiveSessionChanged(true)]);
        assert!(tracker.is_live_session());
    }

    #[test]
    fn test_is_guest() {
        assert!(is_guest("guest-x1y2z3", 998));
        assert!(!is_guest("guest-x1y2z3", 1000));
        assert!(!is_guest("ada", 998));
    }

    #[test]
    fn test_guest_state_changes() {
        let mut guest = GuestState::default();
        assert!(guest.set_allowed(true).allowed);
        assert!(!guest.set_allowed(true).any());

        let records = vec![rec("1", 1000, "ada", "seat0"), rec("2", 998, "guest-abc", "seat0")];
        let change = guest.update_sessions(&records, Some("seat0"), Some("1"));
        assert!(change.logged_in && !change.active);
        assert!(guest.logged_in && !guest.active);

        let change = guest.update_sessions(&records, Some("seat0"), Some("2"));
        assert!(!change.logged_in && change.active);
        assert!(guest.active);

        assert!(!guest.update_sessions(&records, Some("seat0"), Some("2")).any());
    }
}
