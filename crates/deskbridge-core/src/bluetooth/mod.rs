//! Bluetooth models: device types and address helpers, the adapter/device
//! tree, and the pairing presentation modes.

pub mod pairing;
pub mod tree;
pub mod types;

pub use pairing::{PairingMode, PairingState, PairingTemplate};
pub use tree::{DeviceTree, Row, RowId};
pub use types::BluetoothType;
