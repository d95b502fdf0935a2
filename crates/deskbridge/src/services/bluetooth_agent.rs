//! BluetoothAgent - `org.bluez.Agent1` implementation.
//!
//! BlueZ calls the agent for PINs, passkeys and authorizations. Decisions
//! come from the planners in `deskbridge_core::bluetooth::pairing`; anything
//! the user has to see or answer goes through a [`PairingPresenter`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use deskbridge_core::bluetooth::pairing::{
    self, DeviceInfo, DisplayPinCodePlan, ERROR_CANCELED, ERROR_REJECTED, PairingMode,
    PairingState, PasskeyDisplay, PasskeyUpdate, PinCodePlan, PinRules, ServiceAuthPlan,
};
use deskbridge_core::config::BluetoothConfig;
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{self, Variant};
use tracing::{debug, error, info, warn};

use super::bluetooth::{BLUEZ_SERVICE, BluetoothClient};
use super::prompt::{PairingAnswer, PairingPresenter, PairingRequest};

const AGENT_IFACE: &str = "org.bluez.Agent1";
const AGENT_PATH: &str = "/org/bluez/agent/deskbridge";
const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
const AGENT_MANAGER_PATH: &str = "/org/bluez";
const ERROR_DOES_NOT_EXIST: &str = "org.bluez.Error.DoesNotExist";
const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

const AGENT_INTROSPECTION: &str = r#"
<node>
  <interface name="org.bluez.Agent1">
    <method name="Release"/>
    <method name="RequestPinCode">
      <arg type="o" name="device" direction="in"/>
      <arg type="s" name="pincode" direction="out"/>
    </method>
    <method name="RequestPasskey">
      <arg type="o" name="device" direction="in"/>
      <arg type="u" name="passkey" direction="out"/>
    </method>
    <method name="DisplayPasskey">
      <arg type="o" name="device" direction="in"/>
      <arg type="u" name="passkey" direction="in"/>
      <arg type="q" name="entered" direction="in"/>
    </method>
    <method name="DisplayPinCode">
      <arg type="o" name="device" direction="in"/>
      <arg type="s" name="pincode" direction="in"/>
    </method>
    <method name="RequestConfirmation">
      <arg type="o" name="device" direction="in"/>
      <arg type="u" name="passkey" direction="in"/>
    </method>
    <method name="RequestAuthorization">
      <arg type="o" name="device" direction="in"/>
    </method>
    <method name="AuthorizeService">
      <arg type="o" name="device" direction="in"/>
      <arg type="s" name="uuid" direction="in"/>
    </method>
    <method name="Cancel"/>
  </interface>
</node>
"#;

thread_local! {
    static AGENT_INSTANCE: RefCell<Option<Rc<BluetoothAgent>>> = const { RefCell::new(None) };
}

/// A request BlueZ is waiting on.
struct PendingCall {
    serial: u64,
    device: String,
    invocation: gio::DBusMethodInvocation,
}

pub struct BluetoothAgent {
    connection: RefCell<Option<gio::DBusConnection>>,
    presenter: Rc<dyn PairingPresenter>,
    capability: RefCell<String>,
    rules: RefCell<PinRules>,
    /// Unique name of the `org.bluez` owner we registered with.
    owner: RefCell<Option<String>>,
    registration_id: RefCell<Option<gio::RegistrationId>>,
    watcher_id: RefCell<Option<gio::WatcherId>>,
    registered_with_manager: Cell<bool>,
    pending: RefCell<Option<PendingCall>>,
    next_serial: Cell<u64>,
    /// Device we are pairing from this side; requests for other devices are
    /// remote-initiated.
    outgoing_device: RefCell<Option<String>>,
    /// Passkey display already on screen, for DisplayPasskey updates.
    passkey_state: RefCell<Option<PasskeyDisplay>>,
}

impl BluetoothAgent {
    fn new(presenter: Rc<dyn PairingPresenter>, config: &BluetoothConfig) -> Rc<Self> {
        Rc::new(Self {
            connection: RefCell::new(None),
            presenter,
            capability: RefCell::new(config.agent_capability.clone()),
            rules: RefCell::new(PinRules::from_config(&config.pin_rules)),
            owner: RefCell::new(None),
            registration_id: RefCell::new(None),
            watcher_id: RefCell::new(None),
            registered_with_manager: Cell::new(false),
            pending: RefCell::new(None),
            next_serial: Cell::new(1),
            outgoing_device: RefCell::new(None),
            passkey_state: RefCell::new(None),
        })
    }

    /// Create the agent and start exporting it.
    pub fn init_global(presenter: Rc<dyn PairingPresenter>, config: &BluetoothConfig) -> Rc<Self> {
        AGENT_INSTANCE.with(|cell| {
            let mut opt = cell.borrow_mut();
            if let Some(agent) = opt.as_ref() {
                warn!("BluetoothAgent already initialized, ignoring init_global call");
                return agent.clone();
            }
            let agent = BluetoothAgent::new(presenter, config);
            Self::init_dbus(&agent);
            *opt = Some(agent.clone());
            agent
        })
    }

    pub fn global() -> Option<Rc<Self>> {
        AGENT_INSTANCE.with(|cell| cell.borrow().clone())
    }

    /// Pick up new PIN rules. A new capability re-registers the agent.
    pub fn apply_config(self: &Rc<Self>, config: &BluetoothConfig) {
        self.rules.replace(PinRules::from_config(&config.pin_rules));

        if *self.capability.borrow() == config.agent_capability {
            return;
        }
        info!(
            "BluetoothAgent: capability changed to {}, re-registering",
            config.agent_capability
        );
        self.capability.replace(config.agent_capability.clone());
        if self.registered_with_manager.get() {
            let this_weak = Rc::downgrade(self);
            self.unregister_from_manager(move || {
                if let Some(this) = this_weak.upgrade() {
                    this.register_with_manager();
                }
            });
        }
    }

    /// Mark `path` as the device this process is pairing with.
    pub fn set_outgoing_device(&self, path: Option<&str>) {
        self.outgoing_device.replace(path.map(str::to_string));
    }

    /// Close any pairing display once pairing has finished.
    pub fn pairing_finished(&self) {
        self.passkey_state.replace(None);
        self.presenter.dismiss();
    }

    // D-Bus setup

    fn init_dbus(this: &Rc<Self>) {
        let this_weak = Rc::downgrade(this);
        gio::bus_get(BusType::System, None::<&gio::Cancellable>, move |res| {
            let Some(this) = this_weak.upgrade() else {
                return;
            };
            let connection = match res {
                Ok(c) => c,
                Err(e) => {
                    error!("BluetoothAgent: failed to get system bus: {}", e);
                    return;
                }
            };
            this.connection.replace(Some(connection.clone()));

            if !this.export(&connection) {
                return;
            }

            let appeared = Rc::downgrade(&this);
            let vanished = Rc::downgrade(&this);
            let watcher_id = gio::bus_watch_name_on_connection(
                &connection,
                BLUEZ_SERVICE,
                gio::BusNameWatcherFlags::NONE,
                move |_conn, _name, owner| {
                    if let Some(this) = appeared.upgrade() {
                        this.owner.replace(Some(owner.to_string()));
                        this.register_with_manager();
                    }
                },
                move |_conn, _name| {
                    if let Some(this) = vanished.upgrade() {
                        debug!("BluetoothAgent: {} vanished", BLUEZ_SERVICE);
                        this.owner.replace(None);
                        this.registered_with_manager.set(false);
                        this.cancel_pending("BlueZ went away");
                    }
                },
            );
            this.watcher_id.replace(Some(watcher_id));
        });
    }

    fn export(self: &Rc<Self>, connection: &gio::DBusConnection) -> bool {
        let node_info = match gio::DBusNodeInfo::for_xml(AGENT_INTROSPECTION) {
            Ok(info) => info,
            Err(e) => {
                error!("BluetoothAgent: failed to parse introspection: {}", e);
                return false;
            }
        };
        let Some(interface_info) = node_info.lookup_interface(AGENT_IFACE) else {
            error!("BluetoothAgent: {} missing from introspection", AGENT_IFACE);
            return false;
        };

        let this_weak = Rc::downgrade(self);
        let registration = connection
            .register_object(AGENT_PATH, &interface_info)
            .method_call(
                move |_conn, sender, _path, _iface, method, params, invocation| {
                    let Some(this) = this_weak.upgrade() else {
                        invocation.return_error(gio::IOErrorEnum::Failed, "Agent unavailable");
                        return;
                    };
                    this.handle_method(sender, method, params, invocation);
                },
            )
            .build();

        match registration {
            Ok(id) => {
                debug!("BluetoothAgent: exported at {}", AGENT_PATH);
                self.registration_id.replace(Some(id));
                true
            }
            Err(e) => {
                error!("BluetoothAgent: failed to export agent: {}", e);
                false
            }
        }
    }

    fn register_with_manager(self: &Rc<Self>) {
        let Some(connection) = self.connection.borrow().clone() else {
            return;
        };
        let Ok(path) = glib::variant::ObjectPath::try_from(AGENT_PATH) else {
            return;
        };
        let capability = self.capability.borrow().clone();
        let args = (path.clone(), capability.as_str()).to_variant();

        let this_weak = Rc::downgrade(self);
        connection.call(
            Some(BLUEZ_SERVICE),
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "RegisterAgent",
            Some(&args),
            None,
            DBusCallFlags::NONE,
            5000,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                if let Err(e) = res {
                    error!("BluetoothAgent: RegisterAgent failed: {}", e);
                    return;
                }
                info!("BluetoothAgent: registered with capability {}", capability);
                this.registered_with_manager.set(true);
                this.request_default(path);
            },
        );
    }

    fn request_default(&self, path: glib::variant::ObjectPath) {
        let Some(connection) = self.connection.borrow().clone() else {
            return;
        };
        connection.call(
            Some(BLUEZ_SERVICE),
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "RequestDefaultAgent",
            Some(&(path,).to_variant()),
            None,
            DBusCallFlags::NONE,
            5000,
            None::<&gio::Cancellable>,
            |res| {
                if let Err(e) = res {
                    warn!("BluetoothAgent: RequestDefaultAgent failed: {}", e);
                }
            },
        );
    }

    /// UnregisterAgent, tolerating an agent BlueZ has already forgotten.
    fn unregister_from_manager<F: FnOnce() + 'static>(&self, then: F) {
        self.registered_with_manager.set(false);
        let Some(connection) = self.connection.borrow().clone() else {
            then();
            return;
        };
        let Ok(path) = glib::variant::ObjectPath::try_from(AGENT_PATH) else {
            then();
            return;
        };
        connection.call(
            Some(BLUEZ_SERVICE),
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "UnregisterAgent",
            Some(&(path,).to_variant()),
            None,
            DBusCallFlags::NONE,
            5000,
            None::<&gio::Cancellable>,
            move |res| {
                if let Err(e) = res {
                    let remote = gio::DBusError::remote_error(&e);
                    let ignorable = remote
                        .as_deref()
                        .is_some_and(|n| n == ERROR_UNKNOWN_METHOD || n == ERROR_DOES_NOT_EXIST);
                    if !ignorable {
                        warn!("BluetoothAgent: UnregisterAgent failed: {}", e);
                    }
                }
                then();
            },
        );
    }

    /// Unregister from BlueZ and unexport. Used on shutdown.
    pub fn shutdown(&self) {
        self.cancel_pending("Agent shutting down");
        self.presenter.dismiss();
        if self.registered_with_manager.get() {
            self.unregister_from_manager(|| {});
        }
        if let Some(id) = self.watcher_id.take() {
            gio::bus_unwatch_name(id);
        }
        if let Some(id) = self.registration_id.take()
            && let Some(conn) = self.connection.borrow().as_ref()
            && let Err(e) = conn.unregister_object(id)
        {
            warn!("BluetoothAgent: failed to unexport agent: {}", e);
        }
    }

    // Method dispatch

    fn handle_method(
        self: &Rc<Self>,
        sender: Option<&str>,
        method: &str,
        params: Variant,
        invocation: gio::DBusMethodInvocation,
    ) {
        let owner = self.owner.borrow().clone();
        if owner.is_none() || sender != owner.as_deref() {
            warn!(
                "BluetoothAgent: rejecting {} from {:?}, not the BlueZ daemon",
                method, sender
            );
            invocation.return_dbus_error(ERROR_REJECTED, "Not called by BlueZ");
            return;
        }

        debug!("BluetoothAgent: {} called", method);

        match method {
            "Release" => {
                self.registered_with_manager.set(false);
                invocation.return_value(None);
            }
            "Cancel" => {
                self.cancel_pending("Canceled by BlueZ");
                self.pairing_finished();
                invocation.return_value(None);
            }
            "RequestPasskey" => {
                invocation.return_dbus_error(ERROR_REJECTED, pairing::MSG_PASSKEY_UNSUPPORTED);
            }
            _ => {
                let Some(device) = object_path_arg(&params, 0) else {
                    invocation.return_error(gio::IOErrorEnum::InvalidArgument, "Missing device");
                    return;
                };
                let Some(info) = BluetoothClient::global().device_info(&device) else {
                    invocation
                        .return_dbus_error(ERROR_REJECTED, &pairing::missing_info_message(&device));
                    return;
                };
                self.handle_device_method(method, &params, info, invocation);
            }
        }
    }

    fn handle_device_method(
        self: &Rc<Self>,
        method: &str,
        params: &Variant,
        device: DeviceInfo,
        invocation: gio::DBusMethodInvocation,
    ) {
        match method {
            "RequestPinCode" => self.request_pin_code(device, invocation),
            "DisplayPinCode" => {
                let pincode = params.child_value(1).str().unwrap_or_default().to_string();
                self.display_pin_code(device, &pincode, invocation);
            }
            "DisplayPasskey" => {
                let passkey = params.child_value(1).get::<u32>().unwrap_or_default();
                let entered = params.child_value(2).get::<u16>().unwrap_or_default();
                self.display_passkey(&device, passkey, entered);
                invocation.return_value(None);
            }
            "RequestConfirmation" => {
                let passkey = params.child_value(1).get::<u32>().unwrap_or_default();
                let state = PairingState::new(
                    PairingMode::PinMatch,
                    Some(pairing::format_passkey(passkey)),
                );
                self.ask(device, state, invocation, |this, device, answer, call| match answer {
                    PairingAnswer::Accept(_) => call.invocation.return_value(None),
                    PairingAnswer::Cancel => {
                        this.pairing_finished();
                        call.invocation
                            .return_dbus_error(ERROR_CANCELED, pairing::MSG_USER_CANCELLED);
                        debug!("BluetoothAgent: confirmation refused for {}", device.path);
                    }
                });
            }
            "RequestAuthorization" => {
                let state = PairingState::new(PairingMode::YesNo, None);
                self.ask(device, state, invocation, |_, _, answer, call| match answer {
                    PairingAnswer::Accept(_) => call.invocation.return_value(None),
                    PairingAnswer::Cancel => call
                        .invocation
                        .return_dbus_error(ERROR_REJECTED, pairing::MSG_PAIRING_REFUSED),
                });
            }
            "AuthorizeService" => {
                let uuid = params.child_value(1).str().unwrap_or_default().to_string();
                self.authorize_service(device, &uuid, invocation);
            }
            other => {
                warn!("BluetoothAgent: unknown method {}", other);
                invocation.return_error(
                    gio::IOErrorEnum::NotSupported,
                    &format!("Unknown method {}", other),
                );
            }
        }
    }

    fn request_pin_code(self: &Rc<Self>, device: DeviceInfo, invocation: gio::DBusMethodInvocation) {
        let remote_initiated =
            self.outgoing_device.borrow().as_deref() != Some(device.path.as_str());
        let plan = {
            let rules = self.rules.borrow();
            let rule = rules.lookup(device.device_type, &device.address, &device.name);
            pairing::plan_pin_code(&mut rand::thread_rng(), rule, &device, remote_initiated)
        };

        match plan {
            PinCodePlan::Confirm {
                mode,
                pin,
                follow_up,
            } => {
                let state = PairingState::new(mode, Some(pin));
                self.ask(device, state, invocation, move |this, device, answer, call| {
                    match answer {
                        PairingAnswer::Accept(pin) => {
                            let pin = pin.unwrap_or_default();
                            call.invocation.return_value(Some(&(pin.as_str(),).to_variant()));
                            // Keep the PIN on screen while it is typed on the device.
                            let state = PairingState::new(follow_up, Some(pin));
                            this.presenter
                                .show(PairingRequest::new(&device.name, state), Box::new(|_| {}));
                        }
                        PairingAnswer::Cancel => call
                            .invocation
                            .return_dbus_error(ERROR_CANCELED, pairing::MSG_USER_CANCELLED),
                    }
                });
            }
            PinCodePlan::Display { mode, pin, display } => {
                let state = PairingState::new(mode, Some(display));
                self.presenter
                    .show(PairingRequest::new(&device.name, state), Box::new(|_| {}));
                invocation.return_value(Some(&(pin.as_str(),).to_variant()));
            }
            PinCodePlan::AskRemote { pin } => {
                let state = PairingState::new(PairingMode::YesNo, None);
                self.ask(device, state, invocation, move |this, device, answer, call| {
                    match answer {
                        PairingAnswer::Accept(_) => {
                            BluetoothClient::global().set_trusted(
                                &device.path,
                                true,
                                Box::new(|_| {}),
                            );
                            call.invocation.return_value(Some(&(pin.as_str(),).to_variant()));
                        }
                        PairingAnswer::Cancel => {
                            this.pairing_finished();
                            call.invocation
                                .return_dbus_error(ERROR_REJECTED, pairing::MSG_PAIRING_REFUSED);
                        }
                    }
                });
            }
            PinCodePlan::Reject(message) => {
                warn!("BluetoothAgent: {}", message);
                invocation.return_dbus_error(ERROR_REJECTED, &message);
            }
        }
    }

    fn display_pin_code(&self, device: DeviceInfo, pincode: &str, invocation: gio::DBusMethodInvocation) {
        let plan = {
            let rules = self.rules.borrow();
            let rule = rules.lookup(device.device_type, &device.address, &device.name);
            pairing::plan_display_pin_code(rule, &device, pincode)
        };
        match plan {
            DisplayPinCodePlan::Show { display } => {
                let state = PairingState::new(PairingMode::PinDisplayKeyboard, Some(display));
                self.presenter
                    .show(PairingRequest::new(&device.name, state), Box::new(|_| {}));
                invocation.return_value(None);
            }
            DisplayPinCodePlan::Silent => invocation.return_value(None),
            DisplayPinCodePlan::Reject(message) => {
                warn!("BluetoothAgent: {}", message);
                invocation.return_dbus_error(ERROR_REJECTED, &message);
            }
        }
    }

    fn display_passkey(&self, device: &DeviceInfo, passkey: u32, entered: u16) {
        let mut current = self.passkey_state.borrow_mut();
        let update = pairing::update_passkey_display(&mut current, &device.path, passkey, entered);
        let Some(display) = current.as_ref() else {
            return;
        };
        match update {
            PasskeyUpdate::Update => self.presenter.update(display.state()),
            PasskeyUpdate::Show => self.presenter.show(
                PairingRequest::new(&device.name, display.state().clone()),
                Box::new(|_| {}),
            ),
        }
    }

    fn authorize_service(self: &Rc<Self>, device: DeviceInfo, uuid: &str, invocation: gio::DBusMethodInvocation) {
        match pairing::plan_authorize_service(&device, uuid) {
            ServiceAuthPlan::TrustAndAccept => {
                debug!("BluetoothAgent: trusting {} paired from the remote side", device.path);
                BluetoothClient::global().set_trusted(&device.path, true, Box::new(|_| {}));
                invocation.return_value(None);
            }
            ServiceAuthPlan::Accept => invocation.return_value(None),
            ServiceAuthPlan::Ask => {
                let state = PairingState::new(PairingMode::ConfirmAuth, None);
                self.ask(device, state, invocation, |_, device, answer, call| match answer {
                    PairingAnswer::Accept(_) => {
                        BluetoothClient::global().set_trusted(
                            &device.path,
                            true,
                            Box::new(|_| {}),
                        );
                        call.invocation.return_value(None);
                    }
                    PairingAnswer::Cancel => call
                        .invocation
                        .return_dbus_error(ERROR_REJECTED, pairing::MSG_SERVICE_REFUSED),
                });
            }
            ServiceAuthPlan::Reject(message) => {
                warn!("BluetoothAgent: {}", message);
                invocation.return_dbus_error(ERROR_REJECTED, &message);
            }
        }
    }

    /// Show `state` and hold `invocation` until the user answers. A request
    /// already waiting is canceled first.
    fn ask<F>(
        self: &Rc<Self>,
        device: DeviceInfo,
        state: PairingState,
        invocation: gio::DBusMethodInvocation,
        on_answer: F,
    ) where
        F: FnOnce(&Rc<Self>, &DeviceInfo, PairingAnswer, PendingCall) + 'static,
    {
        self.cancel_pending("Superseded by a new request");

        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        self.pending.replace(Some(PendingCall {
            serial,
            device: device.path.clone(),
            invocation,
        }));

        let request = PairingRequest::new(&device.name, state);
        let this_weak = Rc::downgrade(self);
        self.presenter.show(
            request,
            Box::new(move |answer| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                let call = {
                    let mut pending = this.pending.borrow_mut();
                    match pending.as_ref() {
                        Some(call) if call.serial == serial => pending.take(),
                        _ => None,
                    }
                };
                match call {
                    Some(call) => on_answer(&this, &device, answer, call),
                    None => debug!("BluetoothAgent: answer for a finished request ignored"),
                }
            }),
        );
    }

    fn cancel_pending(&self, reason: &str) {
        if let Some(call) = self.pending.borrow_mut().take() {
            debug!("BluetoothAgent: canceling request for {}: {}", call.device, reason);
            call.invocation.return_dbus_error(ERROR_CANCELED, reason);
        }
    }
}

/// Object path argument at `index` as a string.
fn object_path_arg(params: &Variant, index: usize) -> Option<String> {
    if params.n_children() <= index {
        return None;
    }
    params.child_value(index).str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_introspection_parses() {
        let node = gio::DBusNodeInfo::for_xml(AGENT_INTROSPECTION).unwrap();
        let iface = node.lookup_interface(AGENT_IFACE).unwrap();
        for method in [
            "Release",
            "RequestPinCode",
            "RequestPasskey",
            "DisplayPasskey",
            "DisplayPinCode",
            "RequestConfirmation",
            "RequestAuthorization",
            "AuthorizeService",
            "Cancel",
        ] {
            assert!(iface.lookup_method(method).is_some(), "missing {}", method);
        }
    }

    #[test]
    fn test_object_path_arg() {
        let path = glib::variant::ObjectPath::try_from("/org/bluez/hci0/dev_00").unwrap();
        let params = (path, 1234u32).to_variant();
        assert_eq!(
            object_path_arg(&params, 0).as_deref(),
            Some("/org/bluez/hci0/dev_00")
        );
        assert!(object_path_arg(&params, 2).is_none());
    }
}
