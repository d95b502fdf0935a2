//! Device types, class decoding and string helpers.

use serde::Serialize;

use crate::error::{Error, Result};

/// Kind of a remote device. Values are bit flags so a mask can select
/// several kinds at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum BluetoothType {
    Any = 1 << 0,
    Phone = 1 << 1,
    Modem = 1 << 2,
    Computer = 1 << 3,
    Network = 1 << 4,
    Headset = 1 << 5,
    Headphones = 1 << 6,
    OtherAudio = 1 << 7,
    Keyboard = 1 << 8,
    Mouse = 1 << 9,
    Camera = 1 << 10,
    Printer = 1 << 11,
    Joypad = 1 << 12,
    Tablet = 1 << 13,
    Video = 1 << 14,
}

/// Mask matching every device type.
pub const TYPE_MASK_ALL: u32 = (1 << 15) - 1;

/// Mask of input devices (keyboards, mice, joypads, tablets).
pub const TYPE_MASK_INPUT: u32 = BluetoothType::Keyboard as u32
    | BluetoothType::Mouse as u32
    | BluetoothType::Joypad as u32
    | BluetoothType::Tablet as u32;

impl BluetoothType {
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Whether this type is selected by `mask`.
    pub fn matches(self, mask: u32) -> bool {
        mask & self.bits() != 0
    }

    /// Parse the lower-case name used in config files.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "any" => Self::Any,
            "phone" => Self::Phone,
            "modem" => Self::Modem,
            "computer" => Self::Computer,
            "network" => Self::Network,
            "headset" => Self::Headset,
            "headphones" => Self::Headphones,
            "audio" => Self::OtherAudio,
            "keyboard" => Self::Keyboard,
            "mouse" => Self::Mouse,
            "camera" => Self::Camera,
            "printer" => Self::Printer,
            "joypad" => Self::Joypad,
            "tablet" => Self::Tablet,
            "video" => Self::Video,
            _ => return None,
        };
        Some(ty)
    }
}

/// Human-readable name of a device type. `None` reads as "Unknown".
pub fn type_to_string(ty: Option<BluetoothType>) -> &'static str {
    match ty {
        Some(BluetoothType::Any) => "All types",
        Some(BluetoothType::Phone) => "Phone",
        Some(BluetoothType::Modem) => "Modem",
        Some(BluetoothType::Computer) => "Computer",
        Some(BluetoothType::Network) => "Network",
        Some(BluetoothType::Headset) => "Headset",
        Some(BluetoothType::Headphones) => "Headphones",
        Some(BluetoothType::OtherAudio) => "Audio device",
        Some(BluetoothType::Keyboard) => "Keyboard",
        Some(BluetoothType::Mouse) => "Mouse",
        Some(BluetoothType::Camera) => "Camera",
        Some(BluetoothType::Printer) => "Printer",
        Some(BluetoothType::Joypad) => "Joypad",
        Some(BluetoothType::Tablet) => "Tablet",
        Some(BluetoothType::Video) => "Video device",
        None => "Unknown",
    }
}

/// Decode a Class of Device value.
pub fn class_to_type(class: u32) -> Option<BluetoothType> {
    match (class & 0x1f00) >> 8 {
        0x01 => Some(BluetoothType::Computer),
        0x02 => match (class & 0xfc) >> 2 {
            0x01 | 0x02 | 0x03 | 0x05 => Some(BluetoothType::Phone),
            0x04 => Some(BluetoothType::Modem),
            _ => None,
        },
        0x03 => Some(BluetoothType::Network),
        0x04 => match (class & 0xfc) >> 2 {
            0x01 | 0x02 => Some(BluetoothType::Headset),
            0x06 => Some(BluetoothType::Headphones),
            // VCR, video camera, camcorder
            0x0b..=0x0d => Some(BluetoothType::Video),
            _ => Some(BluetoothType::OtherAudio),
        },
        0x05 => match (class & 0xc0) >> 6 {
            0x00 => match (class & 0x1e) >> 2 {
                0x01 | 0x02 => Some(BluetoothType::Joypad),
                _ => None,
            },
            0x01 => Some(BluetoothType::Keyboard),
            0x02 => match (class & 0x1e) >> 2 {
                0x05 => Some(BluetoothType::Tablet),
                _ => Some(BluetoothType::Mouse),
            },
            _ => None,
        },
        0x06 => {
            if class & 0x80 != 0 {
                Some(BluetoothType::Printer)
            } else if class & 0x20 != 0 {
                Some(BluetoothType::Camera)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Decode a GAP Appearance value, for LE devices that carry no class.
pub fn appearance_to_type(appearance: u16) -> Option<BluetoothType> {
    match (appearance & 0xffc0) >> 6 {
        0x01 => Some(BluetoothType::Phone),
        0x02 => Some(BluetoothType::Computer),
        0x05 => Some(BluetoothType::Video),
        0x0a => Some(BluetoothType::OtherAudio),
        0x0f => match appearance & 0x3f {
            0x01 => Some(BluetoothType::Keyboard),
            0x02 => Some(BluetoothType::Mouse),
            0x03 | 0x04 => Some(BluetoothType::Joypad),
            0x05 => Some(BluetoothType::Tablet),
            _ => None,
        },
        _ => None,
    }
}

/// Check that `address` looks like `00:11:22:AA:BB:CC`.
pub fn verify_address(address: &str) -> bool {
    let bytes = address.as_bytes();
    if bytes.len() != 17 {
        return false;
    }

    bytes.iter().enumerate().all(|(i, &b)| {
        if (i + 1) % 3 == 0 {
            b == b':'
        } else {
            b.is_ascii_hexdigit()
        }
    })
}

/// Like [`verify_address`], but as a `Result` for CLI argument checks.
pub fn parse_address(address: &str) -> Result<String> {
    if verify_address(address) {
        Ok(address.to_ascii_uppercase())
    } else {
        Err(Error::InvalidAddress(address.to_string()))
    }
}

const CUSTOM_UUID_SUFFIX: &str = "-0000-1000-8000-0002ee000002";

fn custom_uuid_name(uuid: &str, uuid16: u32) -> Option<&'static str> {
    match uuid16 {
        0x2 => Some("SyncMLClient"),
        0x5601 => Some("Nokia SyncML Server"),
        _ => {
            tracing::debug!("Unhandled custom UUID {} (0x{:x})", uuid, uuid16);
            None
        }
    }
}

fn standard_uuid_name(uuid: &str, uuid16: u32) -> Option<&'static str> {
    let name = match uuid16 {
        0x1101 => "SerialPort",
        0x1103 => "DialupNetworking",
        0x1104 => "IrMCSync",
        0x1105 => "OBEXObjectPush",
        0x1106 => "OBEXFileTransfer",
        0x1108 => "HSP",
        0x110a => "AudioSource",
        0x110b => "AudioSink",
        0x110c => "A/V_RemoteControlTarget",
        0x110e => "A/V_RemoteControl",
        0x1112 => "Headset_-_AG",
        0x1115 => "PANU",
        0x1116 => "NAP",
        0x1117 => "GN",
        0x111e => "Handsfree",
        0x111f => "HandsfreeAudioGateway",
        0x1124 => "HumanInterfaceDeviceService",
        0x112d => "SIM_Access",
        0x112f => "Phonebook_Access_-_PSE",
        0x1201 => "GenericNetworking",
        0x1203 => "GenericAudio",
        0x1303 => "VideoSource",
        0x8e77_1301 | 0x8e77_1303 => "SEMC HLA",
        0x8e77_1401 => "SEMC Watch Phone",
        // service discovery server and PnP information
        0x1000 | 0x1200 => return None,
        _ => {
            tracing::debug!("Unhandled UUID {} (0x{:x})", uuid, uuid16);
            return None;
        }
    };
    Some(name)
}

/// Short service name for a UUID, or `None` for ignored and unknown ones.
pub fn uuid_to_string(uuid: &str) -> Option<&'static str> {
    let first = uuid.split('-').next().unwrap_or("");
    let uuid16 = u32::from_str_radix(first, 16).unwrap_or(0);
    if uuid16 == 0 {
        return None;
    }

    if uuid.ends_with(CUSTOM_UUID_SUFFIX) {
        custom_uuid_name(uuid, uuid16)
    } else {
        standard_uuid_name(uuid, uuid16)
    }
}

/// Map a list of UUIDs to their short names, dropping unknown ones.
pub fn uuids_to_strings<S: AsRef<str>>(uuids: &[S]) -> Vec<String> {
    uuids
        .iter()
        .filter_map(|u| uuid_to_string(u.as_ref()))
        .map(str::to_string)
        .collect()
}

/// Arguments for the `send` subcommand targeting a device.
pub fn send_to_args(address: Option<&str>, alias: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(address) = address {
        args.push(format!("--device={}", address));
        if let Some(alias) = alias {
            args.push(format!("--name={}", alias));
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_to_type_major_classes() {
        assert_eq!(class_to_type(0x000100), Some(BluetoothType::Computer));
        assert_eq!(class_to_type(0x5a020c), Some(BluetoothType::Phone));
        assert_eq!(class_to_type(0x000210), Some(BluetoothType::Modem));
        assert_eq!(class_to_type(0x000300), Some(BluetoothType::Network));
        assert_eq!(class_to_type(0x000000), None);
        assert_eq!(class_to_type(0x001f00), None);
    }

    #[test]
    fn test_class_to_type_audio() {
        assert_eq!(class_to_type(0x240404), Some(BluetoothType::Headset));
        assert_eq!(class_to_type(0x240418), Some(BluetoothType::Headphones));
        assert_eq!(class_to_type(0x000430), Some(BluetoothType::Video));
        assert_eq!(class_to_type(0x240414), Some(BluetoothType::OtherAudio));
    }

    #[test]
    fn test_class_to_type_peripherals() {
        assert_eq!(class_to_type(0x002540), Some(BluetoothType::Keyboard));
        assert_eq!(class_to_type(0x002580), Some(BluetoothType::Mouse));
        assert_eq!(class_to_type(0x002594), Some(BluetoothType::Tablet));
        assert_eq!(class_to_type(0x002508), Some(BluetoothType::Joypad));
        assert_eq!(class_to_type(0x002500), None);
    }

    #[test]
    fn test_class_to_type_imaging() {
        assert_eq!(class_to_type(0x000680), Some(BluetoothType::Printer));
        assert_eq!(class_to_type(0x000620), Some(BluetoothType::Camera));
        assert_eq!(class_to_type(0x000600), None);
    }

    #[test]
    fn test_appearance_to_type() {
        assert_eq!(appearance_to_type(0x0040), Some(BluetoothType::Phone));
        assert_eq!(appearance_to_type(0x03c1), Some(BluetoothType::Keyboard));
        assert_eq!(appearance_to_type(0x03c2), Some(BluetoothType::Mouse));
        assert_eq!(appearance_to_type(0x03c4), Some(BluetoothType::Joypad));
        assert_eq!(appearance_to_type(0x03c5), Some(BluetoothType::Tablet));
        assert_eq!(appearance_to_type(0x03c0), None);
        assert_eq!(appearance_to_type(0x0000), None);
    }

    #[test]
    fn test_type_to_string() {
        assert_eq!(type_to_string(Some(BluetoothType::Any)), "All types");
        assert_eq!(type_to_string(Some(BluetoothType::OtherAudio)), "Audio device");
        assert_eq!(type_to_string(Some(BluetoothType::Video)), "Video device");
        assert_eq!(type_to_string(None), "Unknown");
    }

    #[test]
    fn test_type_masks() {
        assert!(BluetoothType::Mouse.matches(TYPE_MASK_INPUT));
        assert!(!BluetoothType::Headset.matches(TYPE_MASK_INPUT));
        assert!(BluetoothType::Video.matches(TYPE_MASK_ALL));
        assert_eq!(BluetoothType::from_name("audio"), Some(BluetoothType::OtherAudio));
        assert_eq!(BluetoothType::from_name("toaster"), None);
    }

    #[test]
    fn test_verify_address() {
        assert!(verify_address("00:11:22:AA:bb:cc"));
        assert!(!verify_address("00:11:22:AA:BB"));
        assert!(!verify_address("00-11-22-AA-BB-CC"));
        assert!(!verify_address("00:11:22:AA:BB:CG"));
        assert!(!verify_address("00:11:22:AA:BB:CC:"));
    }

    #[test]
    fn test_parse_address_uppercases() {
        assert_eq!(parse_address("aa:bb:cc:dd:ee:ff").unwrap(), "AA:BB:CC:DD:EE:FF");
        assert!(matches!(parse_address("nope"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_uuid_to_string() {
        assert_eq!(
            uuid_to_string("00001105-0000-1000-8000-00805f9b34fb"),
            Some("OBEXObjectPush")
        );
        assert_eq!(
            uuid_to_string("0000110c-0000-1000-8000-00805f9b34fb"),
            Some("A/V_RemoteControlTarget")
        );
        assert_eq!(
            uuid_to_string("8e771401-0000-1000-8000-00805f9b34fb"),
            Some("SEMC Watch Phone")
        );
        assert_eq!(uuid_to_string("00001000-0000-1000-8000-00805f9b34fb"), None);
        assert_eq!(uuid_to_string("00001200-0000-1000-8000-00805f9b34fb"), None);
        assert_eq!(uuid_to_string("0000abcd-0000-1000-8000-00805f9b34fb"), None);
        assert_eq!(uuid_to_string("00000000-0000-1000-8000-00805f9b34fb"), None);
        assert_eq!(uuid_to_string("garbage"), None);
    }

    #[test]
    fn test_uuid_to_string_custom_suffix() {
        assert_eq!(
            uuid_to_string("00000002-0000-1000-8000-0002ee000002"),
            Some("SyncMLClient")
        );
        assert_eq!(
            uuid_to_string("00005601-0000-1000-8000-0002ee000002"),
            Some("Nokia SyncML Server")
        );
        // standard names are not looked up for custom UUIDs
        assert_eq!(uuid_to_string("00001105-0000-1000-8000-0002ee000002"), None);
    }

    #[test]
    fn test_uuids_to_strings_drops_unknown() {
        let uuids = [
            "00001000-0000-1000-8000-00805f9b34fb",
            "0000110b-0000-1000-8000-00805f9b34fb",
            "0000110e-0000-1000-8000-00805f9b34fb",
        ];
        assert_eq!(uuids_to_strings(&uuids), vec!["AudioSink", "A/V_RemoteControl"]);
    }

    #[test]
    fn test_send_to_args() {
        assert_eq!(
            send_to_args(Some("00:11:22:33:44:55"), Some("Phone")),
            vec!["--device=00:11:22:33:44:55", "--name=Phone"]
        );
        assert_eq!(send_to_args(Some("00:11:22:33:44:55"), None).len(), 1);
        assert!(send_to_args(None, Some("Phone")).is_empty());
    }
}
