//! Long-lived services. Each one owns its D-Bus proxies and exports and is
//! driven from the GLib main loop.
//!
//! - [`bluetooth`]: BlueZ adapter/device mirror and control calls
//! - [`bluetooth_agent`]: `org.bluez.Agent1` pairing agent
//! - [`obex_agent`]: `org.bluez.obex.Agent1` push receiver
//! - [`session`]: logind, AccountsService and display manager backends
//! - [`indicator`]: the exported session indicator menus and actions
//! - [`config_manager`]: live config reload

pub mod bluetooth;
pub mod bluetooth_agent;
pub mod callbacks;
pub mod config_manager;
pub mod indicator;
pub mod notifications;
pub mod obex_agent;
pub mod prompt;
pub mod session;
