//! Pairing presentation modes, PIN rules and the agent's decision logic.
//!
//! The agent service asks the planner what to do for each BlueZ request,
//! shows the resulting [`PairingTemplate`] through a presenter, and maps the
//! user's answer back to a D-Bus reply.

use rand::Rng;

use super::types::{self, BluetoothType};
use crate::config::PinRuleConfig;

/// Default length of generated numeric PINs.
pub const PIN_NUM_DIGITS: u32 = 6;

/// Minimum length of a PIN typed into an entry before it can be accepted.
const MIN_ENTERED_PIN_LEN: usize = 4;

const INVISIBLE_CHAR: char = '•';

pub const ERROR_REJECTED: &str = "org.bluez.Error.Rejected";
pub const ERROR_CANCELED: &str = "org.bluez.Error.Canceled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    PinQuery,
    PinConfirmation,
    PinDisplayNormal,
    PinDisplayKeyboard,
    PinDisplayIcade,
    PinMatch,
    YesNo,
    ConfirmAuth,
}

/// Everything a presenter needs to show one pairing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTemplate {
    pub title: String,
    pub help: String,
    /// The PIN label is shown (display and match modes).
    pub pin_visible: bool,
    /// An editable PIN entry is shown.
    pub entry_visible: bool,
    pub ok_label: &'static str,
    pub cancel_label: &'static str,
    /// The accept button is shown at all.
    pub done_visible: bool,
    pub destructive_cancel: bool,
}

impl PairingMode {
    /// Whether the mode asks for a typed PIN.
    pub fn has_entry(self) -> bool {
        matches!(self, Self::PinQuery | Self::PinConfirmation)
    }

    fn is_question(self) -> bool {
        matches!(self, Self::YesNo | Self::ConfirmAuth)
    }

    pub fn template(self, name: &str) -> PairingTemplate {
        let (title, help) = match self {
            Self::PinQuery => (
                "Confirm Bluetooth PIN".to_string(),
                format!("Please confirm the PIN that was entered on '{}'.", name),
            ),
            Self::PinConfirmation => (
                "Confirm Bluetooth PIN".to_string(),
                format!(
                    "Confirm the Bluetooth PIN for '{}'. This can usually be found in the device's manual.",
                    name
                ),
            ),
            Self::PinDisplayNormal => (
                format!("Pairing '{}'", name),
                format!("Please enter the following PIN on '{}'.", name),
            ),
            Self::PinDisplayKeyboard => (
                format!("Pairing '{}'", name),
                format!(
                    "Please enter the following PIN on '{}'. Then press “Return” on the keyboard.",
                    name
                ),
            ),
            Self::PinDisplayIcade => (
                format!("Pairing '{}'", name),
                "Please move the joystick of your iCade in the following directions. Then press any of the white buttons."
                    .to_string(),
            ),
            Self::PinMatch => (
                "Confirm Bluetooth PIN".to_string(),
                format!(
                    "Please confirm that the following PIN matches the one displayed on '{}'.",
                    name
                ),
            ),
            Self::YesNo => (
                "Bluetooth Pairing Request".to_string(),
                format!(
                    "'{}' wants to pair with this device. Do you want to allow pairing?",
                    name
                ),
            ),
            Self::ConfirmAuth => (
                "Confirm Bluetooth Connection".to_string(),
                format!(
                    "'{}' wants to connect with this device. Do you want to allow it?",
                    name
                ),
            ),
        };

        let question = self.is_question();
        PairingTemplate {
            title,
            help,
            pin_visible: !question && !self.has_entry(),
            entry_visible: self.has_entry(),
            ok_label: if question { "Allow" } else { "Confirm" },
            cancel_label: if question { "Dismiss" } else { "Cancel" },
            done_visible: !matches!(
                self,
                Self::PinDisplayNormal | Self::PinDisplayKeyboard | Self::PinDisplayIcade
            ),
            destructive_cancel: question,
        }
    }
}

/// State of the presentation currently on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingState {
    mode: PairingMode,
    pin: Option<String>,
    entered: u32,
}

impl PairingState {
    pub fn new(mode: PairingMode, pin: Option<String>) -> Self {
        Self {
            mode,
            pin,
            entered: 0,
        }
    }

    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    /// The PIN to reply with. Only entry modes have one.
    pub fn pin(&self) -> Option<&str> {
        if self.mode.has_entry() {
            self.pin.as_deref()
        } else {
            None
        }
    }

    /// Whether `text` typed in the entry may be accepted.
    pub fn done_sensitive(&self, text: &str) -> bool {
        if !self.mode.has_entry() {
            return true;
        }
        text.chars().count() >= MIN_ENTERED_PIN_LEN
    }

    /// Record how many characters the remote keyboard has typed so far.
    /// Ignored outside keyboard display mode.
    pub fn set_pin_entered(&mut self, entered: u32) {
        if self.mode == PairingMode::PinDisplayKeyboard {
            self.entered = entered;
        }
    }

    /// PIN text to show, with typed characters masked.
    pub fn display_pin(&self) -> String {
        let Some(ref pin) = self.pin else {
            return String::new();
        };
        if self.mode != PairingMode::PinDisplayKeyboard || self.entered == 0 {
            return pin.clone();
        }

        let entered = self.entered as usize;
        let mut out: String = std::iter::repeat_n(INVISIBLE_CHAR, entered).collect();
        out.extend(pin.chars().skip(entered));
        out
    }
}

/// What a PIN rule tells the agent to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinValue {
    Literal(String),
    /// Generate digits for the user to type on the device itself.
    Keyboard,
    /// Generate joystick directions for an iCade controller.
    Icade,
    /// The device cannot pair.
    Null,
}

impl PinValue {
    fn parse(pin: &str) -> Self {
        match pin {
            "KEYBOARD" => Self::Keyboard,
            "ICADE" => Self::Icade,
            "NULL" => Self::Null,
            other => Self::Literal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRule {
    pub device_type: Option<BluetoothType>,
    pub address_prefix: Option<String>,
    pub name: Option<String>,
    pub pin: PinValue,
    pub max_digits: Option<u32>,
}

impl PinRule {
    fn matches(&self, device_type: BluetoothType, address: &str, name: &str) -> bool {
        let type_ok = match self.device_type {
            None | Some(BluetoothType::Any) => true,
            Some(t) => t == device_type,
        };
        let address_ok = self.address_prefix.as_ref().is_none_or(|prefix| {
            address
                .to_ascii_uppercase()
                .starts_with(&prefix.to_ascii_uppercase())
        });
        let name_ok = self.name.as_ref().is_none_or(|n| n == name);
        type_ok && address_ok && name_ok
    }
}

/// Ordered PIN rules; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinRules {
    rules: Vec<PinRule>,
}

impl PinRules {
    /// Build from validated config entries. Unknown type names are dropped
    /// along with their rule.
    pub fn from_config(entries: &[PinRuleConfig]) -> Self {
        let rules = entries
            .iter()
            .filter_map(|entry| {
                let device_type = match entry.device_type {
                    Some(ref name) => Some(BluetoothType::from_name(name)?),
                    None => None,
                };
                Some(PinRule {
                    device_type,
                    address_prefix: entry.address_prefix.clone(),
                    name: entry.name.clone(),
                    pin: PinValue::parse(&entry.pin),
                    max_digits: entry.max_digits,
                })
            })
            .collect();
        Self { rules }
    }

    pub fn lookup(&self, device_type: BluetoothType, address: &str, name: &str) -> Option<&PinRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(device_type, address, name))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Random numeric PIN of `num_digits` digits (no leading zero).
pub fn random_pin<R: Rng>(rng: &mut R, num_digits: u32) -> String {
    let digits = if num_digits == 0 { PIN_NUM_DIGITS } else { num_digits.min(18) };
    let low = 10u64.pow(digits - 1);
    let high = 10u64.pow(digits);
    rng.gen_range(low..high).to_string()
}

/// Random iCade direction sequence. Returns `(pin, display)`.
pub fn icade_pin<R: Rng>(rng: &mut R) -> (String, String) {
    const ARROWS: [&str; 4] = ["⬆", "⬇", "⬅", "➡"];

    let mut pin = String::new();
    let mut display = String::new();
    for _ in 0..PIN_NUM_DIGITS {
        let direction: usize = rng.gen_range(1..5);
        pin.push_str(&direction.to_string());
        display.push_str(ARROWS[direction - 1]);
    }
    display.push('❍');
    (pin, display)
}

/// Properties of the device a request is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub address: String,
    pub device_type: BluetoothType,
    pub paired: bool,
    pub trusted: bool,
}

/// What to do for `RequestPinCode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinCodePlan {
    /// Let the user confirm or edit `pin`, reply with what they accept, then
    /// keep showing it in `follow_up` mode.
    Confirm {
        mode: PairingMode,
        pin: String,
        follow_up: PairingMode,
    },
    /// Show `display` and reply with `pin` right away.
    Display {
        mode: PairingMode,
        pin: String,
        display: String,
    },
    /// Ask whether the remote device may pair; on yes trust it and reply
    /// with `pin`.
    AskRemote { pin: String },
    Reject(String),
}

pub fn plan_pin_code<R: Rng>(
    rng: &mut R,
    rule: Option<&PinRule>,
    device: &DeviceInfo,
    remote_initiated: bool,
) -> PinCodePlan {
    let (mode, pin, display, confirm) = match rule.map(|r| (&r.pin, r.max_digits)) {
        Some((PinValue::Keyboard, max_digits)) => {
            let pin = random_pin(rng, max_digits.unwrap_or(0));
            let display = format!("{}⏎", pin);
            (PairingMode::PinDisplayKeyboard, pin, display, true)
        }
        Some((PinValue::Icade, _)) => {
            let (pin, display) = icade_pin(rng);
            (PairingMode::PinDisplayIcade, pin, display, false)
        }
        Some((PinValue::Null, _)) => {
            return PinCodePlan::Reject(no_pairing_message(&device.name));
        }
        Some((PinValue::Literal(pin), _)) => {
            (PairingMode::PinDisplayNormal, pin.clone(), pin.clone(), false)
        }
        None => {
            let pin = random_pin(rng, 0);
            (PairingMode::PinDisplayNormal, pin.clone(), pin, true)
        }
    };

    if confirm {
        let entry_mode = if remote_initiated {
            PairingMode::PinQuery
        } else {
            PairingMode::PinConfirmation
        };
        PinCodePlan::Confirm {
            mode: entry_mode,
            pin,
            follow_up: mode,
        }
    } else if !remote_initiated {
        PinCodePlan::Display { mode, pin, display }
    } else {
        PinCodePlan::AskRemote { pin }
    }
}

/// What to do for `DisplayPinCode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayPinCodePlan {
    /// Show the keyboard display with `display`, then reply.
    Show { display: String },
    /// Reply without showing anything; a fixed PIN request follows.
    Silent,
    Reject(String),
}

pub fn plan_display_pin_code(
    rule: Option<&PinRule>,
    device: &DeviceInfo,
    pincode: &str,
) -> DisplayPinCodePlan {
    match rule.map(|r| &r.pin) {
        Some(PinValue::Icade) => DisplayPinCodePlan::Reject(format!(
            "Generated pincode for {} when it shouldn't have",
            device.name
        )),
        Some(PinValue::Literal(pin)) if pin == "0000" => DisplayPinCodePlan::Silent,
        Some(PinValue::Null) => DisplayPinCodePlan::Reject(no_pairing_message(&device.name)),
        _ => DisplayPinCodePlan::Show {
            display: format!("{}⏎", pincode),
        },
    }
}

/// What to do for `AuthorizeService`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAuthPlan {
    /// Paired from the remote side without a chance to set the trusted bit.
    TrustAndAccept,
    Accept,
    /// Ask with [`PairingMode::ConfirmAuth`]; on yes trust and accept.
    Ask,
    Reject(String),
}

pub fn plan_authorize_service(device: &DeviceInfo, uuid: &str) -> ServiceAuthPlan {
    if device.paired && !device.trusted {
        return ServiceAuthPlan::TrustAndAccept;
    }

    if types::uuid_to_string(uuid) != Some("HumanInterfaceDeviceService") {
        return ServiceAuthPlan::Reject(format!(
            "Rejecting service auth ({}) for {}: not HID",
            uuid, device.path
        ));
    }

    if device.paired || device.trusted {
        ServiceAuthPlan::Accept
    } else {
        ServiceAuthPlan::Ask
    }
}

/// Passkey shown for `DisplayPasskey`, tied to the device and passkey it was
/// built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasskeyDisplay {
    device: String,
    passkey: u32,
    state: PairingState,
}

impl PasskeyDisplay {
    pub fn new(device: &str, passkey: u32, entered: u16) -> Self {
        let display = format!("{}⏎", format_passkey(passkey));
        let mut state = PairingState::new(PairingMode::PinDisplayKeyboard, Some(display));
        state.set_pin_entered(u32::from(entered));
        Self {
            device: device.to_string(),
            passkey,
            state,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn passkey(&self) -> u32 {
        self.passkey
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    fn matches(&self, device: &str, passkey: u32) -> bool {
        self.device == device && self.passkey == passkey
    }
}

/// How a `DisplayPasskey` call changes what is on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasskeyUpdate {
    /// A new display was built; show it.
    Show,
    /// Same device and passkey; only the typed count moved.
    Update,
}

/// Apply a `DisplayPasskey(device, passkey, entered)` call to the cached
/// display. Anything cached for another device or passkey is replaced.
pub fn update_passkey_display(
    current: &mut Option<PasskeyDisplay>,
    device: &str,
    passkey: u32,
    entered: u16,
) -> PasskeyUpdate {
    if let Some(display) = current.as_mut()
        && display.matches(device, passkey)
    {
        display.state.set_pin_entered(u32::from(entered));
        return PasskeyUpdate::Update;
    }
    *current = Some(PasskeyDisplay::new(device, passkey, entered));
    PasskeyUpdate::Show
}

/// One step of pairing with a device from this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateStep {
    /// `Adapter1.RemoveDevice`; a failure is logged and the steps go on.
    Remove { adapter: String, device: String },
    StartDiscovery { adapter: String },
    /// Wait for a device with `address` to appear under `adapter`. Later
    /// steps act on the path it appears at.
    AwaitDevice { adapter: String, address: String },
    StopDiscovery { adapter: String },
    Pair,
    Trust,
}

/// Steps for pairing with `device`. A paired device is removed first so the
/// link key is renegotiated; BlueZ drops the object on removal, so the device
/// has to be found again by address before pairing. Discovery is only
/// started (and stopped again) when the adapter is not already scanning.
pub fn plan_create_device(
    device: &DeviceInfo,
    adapter: Option<&str>,
    adapter_discovering: bool,
) -> Vec<CreateStep> {
    let mut steps = Vec::new();
    if let Some(adapter) = adapter
        && device.paired
    {
        steps.push(CreateStep::Remove {
            adapter: adapter.to_string(),
            device: device.path.clone(),
        });
        if !adapter_discovering {
            steps.push(CreateStep::StartDiscovery {
                adapter: adapter.to_string(),
            });
        }
        steps.push(CreateStep::AwaitDevice {
            adapter: adapter.to_string(),
            address: device.address.clone(),
        });
        if !adapter_discovering {
            steps.push(CreateStep::StopDiscovery {
                adapter: adapter.to_string(),
            });
        }
    }
    steps.push(CreateStep::Pair);
    steps.push(CreateStep::Trust);
    steps
}

/// Six-digit rendering used for passkeys.
pub fn format_passkey(passkey: u32) -> String {
    format!("{:06}", passkey)
}

fn no_pairing_message(name: &str) -> String {
    format!("Attempting pairing for {} that doesn't support pairing", name)
}

pub fn missing_info_message(path: &str) -> String {
    format!("Missing information for {}", path)
}

pub const MSG_USER_CANCELLED: &str = "User cancelled pairing";
pub const MSG_PAIRING_REFUSED: &str = "Pairing refused from settings panel";
pub const MSG_SERVICE_REFUSED: &str = "Rejecting service auth (HID): not paired or trusted";
pub const MSG_PASSKEY_UNSUPPORTED: &str = "RequestPasskey not implemented";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BluetoothConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn info(ty: BluetoothType, name: &str) -> DeviceInfo {
        DeviceInfo {
            path: "/org/bluez/hci0/dev_00_11_22_33_44_55".to_string(),
            name: name.to_string(),
            address: "00:11:22:33:44:55".to_string(),
            device_type: ty,
            paired: false,
            trusted: false,
        }
    }

    fn default_rules() -> PinRules {
        PinRules::from_config(&BluetoothConfig::default().pin_rules)
    }

    #[test]
    fn test_templates() {
        let t = PairingMode::PinQuery.template("Phone");
        assert_eq!(t.title, "Confirm Bluetooth PIN");
        assert_eq!(t.help, "Please confirm the PIN that was entered on 'Phone'.");
        assert!(t.entry_visible && !t.pin_visible && t.done_visible);
        assert_eq!((t.ok_label, t.cancel_label), ("Confirm", "Cancel"));

        let t = PairingMode::PinDisplayKeyboard.template("Kbd");
        assert_eq!(t.title, "Pairing 'Kbd'");
        assert!(t.help.ends_with("Then press “Return” on the keyboard."));
        assert!(t.pin_visible && !t.done_visible);

        let t = PairingMode::YesNo.template("Phone");
        assert_eq!(t.title, "Bluetooth Pairing Request");
        assert_eq!((t.ok_label, t.cancel_label), ("Allow", "Dismiss"));
        assert!(t.destructive_cancel && !t.pin_visible && !t.entry_visible);

        let t = PairingMode::ConfirmAuth.template("Mouse");
        assert_eq!(t.title, "Confirm Bluetooth Connection");
        assert!(t.destructive_cancel);

        let t = PairingMode::PinMatch.template("Phone");
        assert!(t.pin_visible && t.done_visible && !t.destructive_cancel);
    }

    #[test]
    fn test_pin_only_in_entry_modes() {
        let state = PairingState::new(PairingMode::PinConfirmation, Some("1234".into()));
        assert_eq!(state.pin(), Some("1234"));
        let state = PairingState::new(PairingMode::PinDisplayNormal, Some("1234".into()));
        assert_eq!(state.pin(), None);
    }

    #[test]
    fn test_done_sensitive() {
        let state = PairingState::new(PairingMode::PinQuery, Some("0000".into()));
        assert!(!state.done_sensitive("123"));
        assert!(state.done_sensitive("1234"));
        let state = PairingState::new(PairingMode::YesNo, None);
        assert!(state.done_sensitive(""));
    }

    #[test]
    fn test_set_pin_entered_masks_prefix() {
        let mut state = PairingState::new(PairingMode::PinDisplayKeyboard, Some("123456⏎".into()));
        assert_eq!(state.display_pin(), "123456⏎");
        state.set_pin_entered(3);
        assert_eq!(state.display_pin(), "•••456⏎");
        state.set_pin_entered(7);
        assert_eq!(state.display_pin(), "•••••••");

        let mut normal = PairingState::new(PairingMode::PinDisplayNormal, Some("0000".into()));
        normal.set_pin_entered(2);
        assert_eq!(normal.display_pin(), "0000");
    }

    #[test]
    fn test_random_pin_length() {
        let mut rng = rng();
        for digits in [0, 4, 6, 8] {
            let pin = random_pin(&mut rng, digits);
            let expected = if digits == 0 { 6 } else { digits as usize };
            assert_eq!(pin.len(), expected);
            assert!(!pin.starts_with('0'));
        }
    }

    #[test]
    fn test_icade_pin() {
        let (pin, display) = icade_pin(&mut rng());
        assert_eq!(pin.len(), PIN_NUM_DIGITS as usize);
        assert!(pin.chars().all(|c| ('1'..='4').contains(&c)));
        assert!(display.ends_with('❍'));
        assert_eq!(display.chars().count(), PIN_NUM_DIGITS as usize + 1);
    }

    #[test]
    fn test_default_rules_lookup() {
        let rules = default_rules();
        let kbd = rules.lookup(BluetoothType::Keyboard, "00:11:22:33:44:55", "Keys").unwrap();
        assert_eq!(kbd.pin, PinValue::Keyboard);
        assert_eq!(kbd.max_digits, Some(6));

        let icade = rules.lookup(BluetoothType::Joypad, "00:11:22:33:44:55", "iCade").unwrap();
        assert_eq!(icade.pin, PinValue::Icade);
        assert!(rules.lookup(BluetoothType::Joypad, "00:11:22:33:44:55", "Pad").is_none());

        let mouse = rules.lookup(BluetoothType::Mouse, "00:11:22:33:44:55", "M").unwrap();
        assert_eq!(mouse.pin, PinValue::Literal("0000".into()));

        assert!(rules.lookup(BluetoothType::Phone, "00:11:22:33:44:55", "P").is_none());
    }

    #[test]
    fn test_rule_address_prefix_is_case_insensitive() {
        let rules = PinRules::from_config(&[PinRuleConfig {
            device_type: None,
            address_prefix: Some("00:0a:95".into()),
            name: None,
            pin: "1234".into(),
            max_digits: None,
        }]);
        assert!(rules.lookup(BluetoothType::Phone, "00:0A:95:11:22:33", "x").is_some());
        assert!(rules.lookup(BluetoothType::Phone, "00:0B:95:11:22:33", "x").is_none());
    }

    #[test]
    fn test_plan_pin_code_keyboard_needs_confirmation() {
        let rules = default_rules();
        let device = info(BluetoothType::Keyboard, "Keys");
        let rule = rules.lookup(device.device_type, &device.address, &device.name);

        match plan_pin_code(&mut rng(), rule, &device, false) {
            PinCodePlan::Confirm { mode, pin, follow_up } => {
                assert_eq!(mode, PairingMode::PinConfirmation);
                assert_eq!(follow_up, PairingMode::PinDisplayKeyboard);
                assert_eq!(pin.len(), 6);
            }
            other => panic!("unexpected plan {:?}", other),
        }

        match plan_pin_code(&mut rng(), rule, &device, true) {
            PinCodePlan::Confirm { mode, .. } => assert_eq!(mode, PairingMode::PinQuery),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_plan_pin_code_fixed_pin() {
        let rules = default_rules();
        let device = info(BluetoothType::Headset, "Buds");
        let rule = rules.lookup(device.device_type, &device.address, &device.name);

        assert_eq!(
            plan_pin_code(&mut rng(), rule, &device, false),
            PinCodePlan::Display {
                mode: PairingMode::PinDisplayNormal,
                pin: "0000".into(),
                display: "0000".into(),
            }
        );
        assert_eq!(
            plan_pin_code(&mut rng(), rule, &device, true),
            PinCodePlan::AskRemote { pin: "0000".into() }
        );
    }

    #[test]
    fn test_plan_pin_code_icade_and_unknown() {
        let rules = default_rules();
        let device = info(BluetoothType::Joypad, "iCade");
        let rule = rules.lookup(device.device_type, &device.address, &device.name);
        match plan_pin_code(&mut rng(), rule, &device, false) {
            PinCodePlan::Display { mode, display, .. } => {
                assert_eq!(mode, PairingMode::PinDisplayIcade);
                assert!(display.ends_with('❍'));
            }
            other => panic!("unexpected plan {:?}", other),
        }

        let phone = info(BluetoothType::Phone, "Phone");
        match plan_pin_code(&mut rng(), None, &phone, false) {
            PinCodePlan::Confirm { follow_up, .. } => {
                assert_eq!(follow_up, PairingMode::PinDisplayNormal)
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_plan_pin_code_null_rejects() {
        let rule = PinRule {
            device_type: None,
            address_prefix: None,
            name: None,
            pin: PinValue::Null,
            max_digits: None,
        };
        let device = info(BluetoothType::Printer, "Printer");
        assert_eq!(
            plan_pin_code(&mut rng(), Some(&rule), &device, false),
            PinCodePlan::Reject("Attempting pairing for Printer that doesn't support pairing".into())
        );
    }

    #[test]
    fn test_plan_display_pin_code() {
        let rules = default_rules();
        let kbd = info(BluetoothType::Keyboard, "Keys");
        let rule = rules.lookup(kbd.device_type, &kbd.address, &kbd.name);
        assert_eq!(
            plan_display_pin_code(rule, &kbd, "123456"),
            DisplayPinCodePlan::Show {
                display: "123456⏎".into()
            }
        );

        let mouse = info(BluetoothType::Mouse, "Mouse");
        let rule = rules.lookup(mouse.device_type, &mouse.address, &mouse.name);
        assert_eq!(plan_display_pin_code(rule, &mouse, "123456"), DisplayPinCodePlan::Silent);

        let icade = info(BluetoothType::Joypad, "iCade");
        let rule = rules.lookup(icade.device_type, &icade.address, &icade.name);
        assert_eq!(
            plan_display_pin_code(rule, &icade, "1"),
            DisplayPinCodePlan::Reject("Generated pincode for iCade when it shouldn't have".into())
        );
    }

    #[test]
    fn test_plan_authorize_service() {
        let hid = "00001124-0000-1000-8000-00805f9b34fb";
        let audio = "0000110b-0000-1000-8000-00805f9b34fb";

        let mut device = info(BluetoothType::Keyboard, "Keys");
        device.paired = true;
        assert_eq!(plan_authorize_service(&device, audio), ServiceAuthPlan::TrustAndAccept);

        device.trusted = true;
        assert_eq!(plan_authorize_service(&device, hid), ServiceAuthPlan::Accept);
        match plan_authorize_service(&device, audio) {
            ServiceAuthPlan::Reject(msg) => {
                assert!(msg.starts_with("Rejecting service auth (0000110b"));
                assert!(msg.ends_with(": not HID"));
            }
            other => panic!("unexpected plan {:?}", other),
        }

        let stranger = info(BluetoothType::Keyboard, "Keys");
        assert_eq!(plan_authorize_service(&stranger, hid), ServiceAuthPlan::Ask);
    }

    #[test]
    fn test_format_passkey() {
        assert_eq!(format_passkey(42), "000042");
        assert_eq!(format_passkey(123456), "123456");
    }

    #[test]
    fn test_passkey_display_tracks_typed_digits() {
        let mut current = None;
        let dev = "/org/bluez/hci0/dev_A";

        assert_eq!(update_passkey_display(&mut current, dev, 42, 0), PasskeyUpdate::Show);
        let display = current.as_ref().unwrap();
        assert_eq!(display.state().mode(), PairingMode::PinDisplayKeyboard);
        assert_eq!(display.state().display_pin(), "000042⏎");

        assert_eq!(update_passkey_display(&mut current, dev, 42, 2), PasskeyUpdate::Update);
        let shown = current.as_ref().unwrap().state().display_pin();
        assert!(shown.starts_with(&INVISIBLE_CHAR.to_string().repeat(2)));
        assert!(shown.ends_with("0042⏎"));
    }

    #[test]
    fn test_passkey_display_rebuilt_for_next_pairing() {
        // A pairing that succeeded never clears the cache; the next request
        // must still show its own passkey.
        let mut current = None;
        update_passkey_display(&mut current, "/org/bluez/hci0/dev_A", 111111, 3);

        assert_eq!(
            update_passkey_display(&mut current, "/org/bluez/hci0/dev_B", 222222, 1),
            PasskeyUpdate::Show
        );
        let display = current.as_ref().unwrap();
        assert_eq!(display.device(), "/org/bluez/hci0/dev_B");
        assert_eq!(display.passkey(), 222222);
        assert!(display.state().display_pin().ends_with("22222⏎"));
        assert!(!display.state().display_pin().contains('1'));

        // Same device, new passkey.
        assert_eq!(
            update_passkey_display(&mut current, "/org/bluez/hci0/dev_B", 333333, 0),
            PasskeyUpdate::Show
        );
        assert_eq!(current.as_ref().unwrap().state().display_pin(), "333333⏎");
    }

    #[test]
    fn test_plan_create_device_unpaired() {
        let device = info(BluetoothType::Keyboard, "Keys");
        assert_eq!(
            plan_create_device(&device, Some("/org/bluez/hci0"), false),
            vec![CreateStep::Pair, CreateStep::Trust]
        );
    }

    #[test]
    fn test_plan_create_device_repairs_by_address() {
        let mut device = info(BluetoothType::Keyboard, "Keys");
        device.paired = true;
        let adapter = "/org/bluez/hci0".to_string();

        assert_eq!(
            plan_create_device(&device, Some(&adapter), false),
            vec![
                CreateStep::Remove {
                    adapter: adapter.clone(),
                    device: device.path.clone(),
                },
                CreateStep::StartDiscovery {
                    adapter: adapter.clone(),
                },
                CreateStep::AwaitDevice {
                    adapter: adapter.clone(),
                    address: "00:11:22:33:44:55".into(),
                },
                CreateStep::StopDiscovery {
                    adapter: adapter.clone(),
                },
                CreateStep::Pair,
                CreateStep::Trust,
            ]
        );

        // Discovery already running is left alone.
        let steps = plan_create_device(&device, Some(&adapter), true);
        assert_eq!(steps.len(), 4);
        assert!(matches!(steps[0], CreateStep::Remove { .. }));
        assert!(matches!(steps[1], CreateStep::AwaitDevice { .. }));
        assert_eq!(steps[2..], [CreateStep::Pair, CreateStep::Trust]);
    }

    #[test]
    fn test_plan_create_device_without_adapter_pairs_in_place() {
        let mut device = info(BluetoothType::Keyboard, "Keys");
        device.paired = true;
        assert_eq!(
            plan_create_device(&device, None, false),
            vec![CreateStep::Pair, CreateStep::Trust]
        );
    }
}
