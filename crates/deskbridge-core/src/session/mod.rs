//! Session indicator models: users, login tracking, the action policy and
//! the menu layout.

pub mod actions;
pub mod logins;
pub mod menu;
pub mod user;

pub use actions::{Capabilities, PromptStatus};
pub use logins::{GuestState, LoginState, SessionRecord, UserEvent, UserTracker};
pub use menu::{MenuModel, Profile, Sections};
pub use user::SessionUser;
