//! Which session actions are available and how each one is confirmed.

use crate::config::{LockdownConfig, SessionConfig};

/// How log out, restart and shut down are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptStatus {
    /// Act immediately.
    #[default]
    None,
    /// Ask with a `zenity --question` dialog.
    Zenity,
    /// Ask through the Unity EndSessionDialog.
    Unity,
}

impl PromptStatus {
    pub fn compute(
        suppress_prompts: bool,
        end_session_dialog_owned: bool,
        zenity_available: bool,
    ) -> Self {
        if suppress_prompts {
            Self::None
        } else if end_session_dialog_owned {
            Self::Unity
        } else if zenity_available {
            Self::Zenity
        } else {
            Self::None
        }
    }
}

/// Live facts from logind, the seat and webcredentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendFacts {
    pub seat_can_multi_session: bool,
    pub can_suspend: bool,
    pub can_hibernate: bool,
    pub has_online_account_error: bool,
}

/// logind answers `CanSuspend` and friends with "yes", "no", "challenge"
/// or "na"; only a plain "yes" counts.
pub fn parse_can_answer(answer: &str) -> bool {
    answer == "yes"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub can_lock: bool,
    pub can_logout: bool,
    pub can_reboot: bool,
    pub can_switch: bool,
    pub can_suspend: bool,
    pub can_hibernate: bool,
    pub can_prompt: bool,
    pub has_online_account_error: bool,
}

impl Capabilities {
    pub fn compute(
        session: &SessionConfig,
        lockdown: &LockdownConfig,
        prompt: PromptStatus,
        facts: &BackendFacts,
    ) -> Self {
        // Unity shows restart inside its shut down dialog, so a separate
        // restart item would be redundant there.
        let restart_in_shutdown_dialog =
            !session.suppress_shutdown_menuitem && prompt == PromptStatus::Unity;

        Self {
            can_lock: !lockdown.disable_lock_screen,
            can_logout: !session.suppress_logout_menuitem && !lockdown.disable_log_out,
            can_reboot: !session.suppress_restart_menuitem && !restart_in_shutdown_dialog,
            can_switch: facts.seat_can_multi_session && !lockdown.disable_user_switching,
            can_suspend: facts.can_suspend,
            can_hibernate: facts.can_hibernate,
            can_prompt: prompt != PromptStatus::None,
            has_online_account_error: facts.has_online_account_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Logout,
    Reboot,
    PowerOff,
}

/// `type` argument of `com.canonical.Unity.EndSessionDialog.Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EndSessionType {
    Logout = 0,
    Shutdown = 1,
    Reboot = 2,
}

/// Arguments for a zenity confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZenityPrompt {
    pub icon_name: &'static str,
    pub title: &'static str,
    pub text: String,
    pub ok_label: &'static str,
    pub cancel_label: &'static str,
}

impl ZenityPrompt {
    pub fn for_action(action: PowerAction) -> Self {
        match action {
            PowerAction::Logout => Self {
                icon_name: "system-log-out",
                title: "Log Out",
                text: format!(
                    "<big><b>{}</b></big>\n \n{}",
                    "Are you sure you want to close all programs and log out?",
                    "Some software updates won't be applied until the computer next restarts."
                ),
                ok_label: "Log Out",
                cancel_label: "Cancel",
            },
            PowerAction::Reboot => Self {
                icon_name: "system-restart",
                title: "Restart",
                text: "Are you sure you want to close all programs and restart the computer?"
                    .to_string(),
                ok_label: "Restart",
                cancel_label: "Cancel",
            },
            PowerAction::PowerOff => Self {
                icon_name: "system-shutdown",
                title: "Shut Down",
                text: "Are you sure you want to close all programs and shut down the computer?"
                    .to_string(),
                ok_label: "Shut Down",
                cancel_label: "Cancel",
            },
        }
    }

    /// Arguments after the zenity binary.
    pub fn args(&self) -> Vec<String> {
        vec![
            "--question".to_string(),
            format!("--icon-name={}", self.icon_name),
            format!("--title={}", self.title),
            format!("--text={}", self.text),
            format!("--ok-label={}", self.ok_label),
            format!("--cancel-label={}", self.cancel_label),
            "--no-wrap".to_string(),
        ]
    }
}

/// How to carry out a power action under the current prompt status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerPlan {
    Now,
    UnityDialog(EndSessionType),
    Zenity(ZenityPrompt),
}

pub fn plan_power_action(action: PowerAction, prompt: PromptStatus) -> PowerPlan {
    match prompt {
        PromptStatus::None => PowerPlan::Now,
        PromptStatus::Zenity => PowerPlan::Zenity(ZenityPrompt::for_action(action)),
        PromptStatus::Unity => PowerPlan::UnityDialog(match action {
            PowerAction::Logout => EndSessionType::Logout,
            // The shutdown dialog type adds lock and logout choices, so the
            // reboot dialog (which also offers shut down) is used instead.
            PowerAction::Reboot | PowerAction::PowerOff => EndSessionType::Reboot,
        }),
    }
}

/// Control center pages the menu opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsPanel {
    Overview,
    About,
    OnlineAccounts,
}

/// Whether to launch unity-control-center rather than gnome-control-center.
pub fn use_unity_control_center(current_desktop: Option<&str>, ucc_installed: bool) -> bool {
    current_desktop == Some("Unity") && ucc_installed
}

/// Program and arguments that open `panel`.
pub fn settings_command(panel: SettingsPanel, unity: bool) -> (&'static str, Vec<&'static str>) {
    if unity {
        let args = match panel {
            SettingsPanel::Overview => vec![],
            SettingsPanel::About => vec!["info"],
            SettingsPanel::OnlineAccounts => vec!["credentials"],
        };
        ("unity-control-center", args)
    } else {
        let args = match panel {
            SettingsPanel::Overview => vec![],
            SettingsPanel::About => vec!["info"],
            SettingsPanel::OnlineAccounts => vec!["online-accounts"],
        };
        ("gnome-control-center", args)
    }
}

pub const HELP_COMMAND: &str = "yelp";

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> BackendFacts {
        BackendFacts {
            seat_can_multi_session: true,
            can_suspend: true,
            can_hibernate: false,
            has_online_account_error: false,
        }
    }

    #[test]
    fn test_prompt_status() {
        assert_eq!(PromptStatus::compute(true, true, true), PromptStatus::None);
        assert_eq!(PromptStatus::compute(false, true, true), PromptStatus::Unity);
        assert_eq!(PromptStatus::compute(false, false, true), PromptStatus::Zenity);
        assert_eq!(PromptStatus::compute(false, false, false), PromptStatus::None);
    }

    #[test]
    fn test_parse_can_answer() {
        assert!(parse_can_answer("yes"));
        assert!(!parse_can_answer("challenge"));
        assert!(!parse_can_answer("na"));
    }

    #[test]
    fn test_capabilities_defaults() {
        let caps = Capabilities::compute(
            &SessionConfig::default(),
            &LockdownConfig::default(),
            PromptStatus::Zenity,
            &facts(),
        );
        assert!(caps.can_lock && caps.can_logout && caps.can_reboot && caps.can_switch);
        assert!(caps.can_suspend && !caps.can_hibernate);
        assert!(caps.can_prompt);
    }

    #[test]
    fn test_capabilities_lockdown() {
        let lockdown = LockdownConfig {
            disable_lock_screen: true,
            disable_log_out: true,
            disable_user_switching: true,
        };
        let caps = Capabilities::compute(&SessionConfig::default(), &lockdown, PromptStatus::None, &facts());
        assert!(!caps.can_lock && !caps.can_logout && !caps.can_switch);
        assert!(!caps.can_prompt);
    }

    #[test]
    fn test_reboot_hidden_behind_unity_shutdown_dialog() {
        let session = SessionConfig::default();
        let lockdown = LockdownConfig::default();
        let caps = Capabilities::compute(&session, &lockdown, PromptStatus::Unity, &facts());
        assert!(!caps.can_reboot);

        let session = SessionConfig {
            suppress_shutdown_menuitem: true,
            ..SessionConfig::default()
        };
        let caps = Capabilities::compute(&session, &lockdown, PromptStatus::Unity, &facts());
        assert!(caps.can_reboot);

        let session = SessionConfig {
            suppress_restart_menuitem: true,
            ..SessionConfig::default()
        };
        let caps = Capabilities::compute(&session, &lockdown, PromptStatus::Zenity, &facts());
        assert!(!caps.can_reboot);
    }

    #[test]
    fn test_switch_needs_multi_session_seat() {
        let no_multi = BackendFacts {
            seat_can_multi_session: false,
            ..facts()
        };
        let caps = Capabilities::compute(
            &SessionConfig::default(),
            &LockdownConfig::default(),
            PromptStatus::None,
            &no_multi,
        );
        assert!(!caps.can_switch);
    }

    #[test]
    fn test_plan_power_action() {
        assert_eq!(plan_power_action(PowerAction::Reboot, PromptStatus::None), PowerPlan::Now);
        assert_eq!(
            plan_power_action(PowerAction::Logout, PromptStatus::Unity),
            PowerPlan::UnityDialog(EndSessionType::Logout)
        );
        assert_eq!(
            plan_power_action(PowerAction::PowerOff, PromptStatus::Unity),
            PowerPlan::UnityDialog(EndSessionType::Reboot)
        );
        match plan_power_action(PowerAction::PowerOff, PromptStatus::Zenity) {
            PowerPlan::Zenity(prompt) => assert_eq!(prompt.title, "Shut Down"),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_zenity_args() {
        let args = ZenityPrompt::for_action(PowerAction::Reboot).args();
        assert_eq!(args[0], "--question");
        assert!(args.contains(&"--icon-name=system-restart".to_string()));
        assert!(args.contains(&"--ok-label=Restart".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--no-wrap"));
    }

    #[test]
    fn test_settings_command() {
        assert!(use_unity_control_center(Some("Unity"), true));
        assert!(!use_unity_control_center(Some("GNOME"), true));
        assert!(!use_unity_control_center(Some("Unity"), false));

        assert_eq!(
            settings_command(SettingsPanel::About, true),
            ("unity-control-center", vec!["info"])
        );
        assert_eq!(
            settings_command(SettingsPanel::OnlineAccounts, false),
            ("gnome-control-center", vec!["online-accounts"])
        );
        assert_eq!(
            settings_command(SettingsPanel::Overview, false),
            ("gnome-control-center", vec![])
        );
    }
}
