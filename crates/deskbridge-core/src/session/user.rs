use std::cmp::Ordering;

use serde::Serialize;

/// A login account as shown in the switch section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SessionUser {
    pub uid: u32,
    pub user_name: String,
    pub real_name: String,
    pub icon_file: Option<String>,
    pub login_frequency: u64,
    pub is_logged_in: bool,
    pub is_current_user: bool,
}

impl SessionUser {
    /// The real name if it has anything printable in it, else the user name.
    pub fn label(&self) -> &str {
        if self
            .real_name
            .chars()
            .any(|c| !c.is_whitespace() && !c.is_control())
        {
            &self.real_name
        } else {
            &self.user_name
        }
    }
}

/// Current user first, then logged-in users, then the most frequent.
pub fn compare_by_usefulness(a: &SessionUser, b: &SessionUser) -> Ordering {
    b.is_current_user
        .cmp(&a.is_current_user)
        .then_with(|| b.is_logged_in.cmp(&a.is_logged_in))
        .then_with(|| b.login_frequency.cmp(&a.login_frequency))
}

pub fn compare_by_label(a: &SessionUser, b: &SessionUser) -> Ordering {
    a.label()
        .cmp(b.label())
        .then_with(|| a.user_name.cmp(&b.user_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, real: &str) -> SessionUser {
        SessionUser {
            user_name: name.to_string(),
            real_name: real.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_label_prefers_printable_real_name() {
        assert_eq!(user("ada", "Ada Lovelace").label(), "Ada Lovelace");
        assert_eq!(user("ada", "").label(), "ada");
        assert_eq!(user("ada", "  \t").label(), "ada");
        assert_eq!(user("ada", "\u{7}").label(), "ada");
    }

    #[test]
    fn test_compare_by_usefulness() {
        let current = SessionUser {
            is_current_user: true,
            ..user("a", "")
        };
        let logged_in = SessionUser {
            is_logged_in: true,
            ..user("b", "")
        };
        let frequent = SessionUser {
            login_frequency: 50,
            ..user("c", "")
        };
        let rare = SessionUser {
            login_frequency: 2,
            ..user("d", "")
        };

        let mut users = vec![rare.clone(), frequent.clone(), logged_in.clone(), current.clone()];
        users.sort_by(compare_by_usefulness);
        let names: Vec<_> = users.iter().map(|u| u.user_name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_compare_by_label_breaks_ties_by_user_name() {
        let mut users = vec![user("zed", "Sam"), user("amy", "Sam"), user("bob", "")];
        users.sort_by(compare_by_label);
        let names: Vec<_> = users.iter().map(|u| u.user_name.as_str()).collect();
        assert_eq!(names, ["amy", "zed", "bob"]);
    }
}
