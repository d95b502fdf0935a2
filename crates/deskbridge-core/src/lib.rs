//! deskbridge-core - configuration, logging and the pure models behind the
//! deskbridge services.
//!
//! Nothing in this crate touches D-Bus or the GLib main loop. The binary
//! crate feeds D-Bus state into these types and renders what they produce.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod logging;
pub mod obex;
pub mod session;
pub mod transfer;

pub use config::{Config, ConfigLoadResult};
pub use error::{Error, Result};
