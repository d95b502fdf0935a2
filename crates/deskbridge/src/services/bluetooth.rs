//! BluetoothClient - mirror of BlueZ adapters and devices over D-Bus.
//!
//! This service provides:
//!   - A [`DeviceTree`] kept in sync with `org.bluez` through ObjectManager
//!   - One default adapter (first powered, else first)
//!   - Debounced snapshot notifications on property changes
//!   - Control API: power, discoverable, discovery, pair, trust, connect, remove

use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use deskbridge_core::bluetooth::pairing::{self, CreateStep, DeviceInfo};
use deskbridge_core::bluetooth::tree::{DeviceTree, Row, RowId, RowKind};
use deskbridge_core::bluetooth::types::{self, BluetoothType};
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{self, Variant};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::callbacks::{CallbackId, Callbacks};

pub const BLUEZ_SERVICE: &str = "org.bluez";
const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// BlueZ emits bursts of property changes; batch them into one notification.
const UPDATE_DEBOUNCE_MS: u64 = 100;

const CALL_TIMEOUT_MS: i32 = 5000;
/// Pairing waits on the remote user typing a PIN.
const PAIR_TIMEOUT_MS: i32 = 60_000;
const CONNECT_TIMEOUT_MS: i32 = 30_000;
/// How long a re-pair waits for a removed device to be seen again.
const DEVICE_RETURN_TIMEOUT_MS: u64 = 30_000;

/// Completion callback for control calls.
pub type Done = Box<dyn FnOnce(Result<(), glib::Error>)>;

type FoundFn = Box<dyn FnOnce(Option<String>)>;

/// A re-pair waiting for a removed device to be added again.
struct DeviceWaiter {
    serial: u64,
    adapter: String,
    address: String,
    timeout_id: Option<glib::SourceId>,
    found: FoundFn,
}

/// Canonical snapshot of Bluetooth state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BluetoothSnapshot {
    /// Whether `org.bluez` currently has an owner.
    pub available: bool,
    /// Whether the initial object list has been loaded.
    pub is_ready: bool,
    pub default_adapter: Option<Row>,
    /// Devices of the default adapter.
    pub devices: Vec<Row>,
}

/// Process-wide BlueZ client.
pub struct BluetoothClient {
    connection: RefCell<Option<gio::DBusConnection>>,
    /// Unique name of the current `org.bluez` owner.
    owner: RefCell<Option<String>>,
    tree: RefCell<DeviceTree>,
    is_ready: Cell<bool>,
    callbacks: Callbacks<BluetoothSnapshot>,
    debounce_id: RefCell<Option<glib::SourceId>>,
    watcher_id: RefCell<Option<gio::WatcherId>>,
    signal_subscriptions: RefCell<Vec<gio::SignalSubscription>>,
    device_waiters: RefCell<Vec<DeviceWaiter>>,
    next_waiter: Cell<u64>,
}

impl BluetoothClient {
    fn new() -> Rc<Self> {
        let client = Rc::new(Self {
            connection: RefCell::new(None),
            owner: RefCell::new(None),
            tree: RefCell::new(DeviceTree::new()),
            is_ready: Cell::new(false),
            callbacks: Callbacks::new(),
            debounce_id: RefCell::new(None),
            watcher_id: RefCell::new(None),
            signal_subscriptions: RefCell::new(Vec::new()),
            device_waiters: RefCell::new(Vec::new()),
            next_waiter: Cell::new(0),
        });

        Self::init_dbus(&client);
        client
    }

    /// Global singleton instance.
    pub fn global() -> Rc<Self> {
        thread_local! {
            static INSTANCE: Rc<BluetoothClient> = BluetoothClient::new();
        }

        INSTANCE.with(|c| c.clone())
    }

    /// Register a callback for snapshot changes. It is called once right away.
    pub fn connect<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&BluetoothSnapshot) + 'static,
    {
        let id = self.callbacks.register(callback);
        self.callbacks.notify_single(id, &self.snapshot());
        id
    }

    pub fn disconnect(&self, id: CallbackId) -> bool {
        self.callbacks.unregister(id)
    }

    pub fn snapshot(&self) -> BluetoothSnapshot {
        let tree = self.tree.borrow();
        BluetoothSnapshot {
            available: self.owner.borrow().is_some(),
            is_ready: self.is_ready.get(),
            default_adapter: tree
                .default_adapter()
                .and_then(|id| tree.get(id))
                .cloned(),
            devices: tree.device_model().map(|(_, row)| row.clone()).collect(),
        }
    }

    pub fn tree(&self) -> Ref<'_, DeviceTree> {
        self.tree.borrow()
    }

    /// Unique bus name of the running BlueZ daemon, if any.
    pub fn bluez_owner(&self) -> Option<String> {
        self.owner.borrow().clone()
    }

    // D-Bus initialisation

    fn init_dbus(this: &Rc<Self>) {
        let this_weak = Rc::downgrade(this);

        gio::bus_get(BusType::System, None::<&gio::Cancellable>, move |res| {
            let Some(this) = this_weak.upgrade() else {
                return;
            };

            let connection = match res {
                Ok(c) => c,
                Err(e) => {
                    error!("BluetoothClient: failed to get system bus: {}", e);
                    return;
                }
            };

            this.connection.replace(Some(connection.clone()));
            this.subscribe_signals(&connection);

            let appeared = Rc::downgrade(&this);
            let vanished = Rc::downgrade(&this);
            let watcher_id = gio::bus_watch_name_on_connection(
                &connection,
                BLUEZ_SERVICE,
                gio::BusNameWatcherFlags::NONE,
                move |_conn, _name, owner| {
                    if let Some(this) = appeared.upgrade() {
                        debug!("BluetoothClient: {} appeared as {}", BLUEZ_SERVICE, owner);
                        this.owner.replace(Some(owner.to_string()));
                        this.load_managed_objects();
                    }
                },
                move |_conn, _name| {
                    if let Some(this) = vanished.upgrade() {
                        debug!("BluetoothClient: {} vanished", BLUEZ_SERVICE);
                        this.set_unavailable();
                    }
                },
            );
            this.watcher_id.replace(Some(watcher_id));
        });
    }

    fn subscribe_signals(self: &Rc<Self>, connection: &gio::DBusConnection) {
        let added = Rc::downgrade(self);
        let sub1 = connection.subscribe_to_signal(
            Some(BLUEZ_SERVICE),
            Some(OBJECT_MANAGER_IFACE),
            Some("InterfacesAdded"),
            None,
            None,
            gio::DBusSignalFlags::NONE,
            move |signal| {
                if let Some(this) = added.upgrade() {
                    this.handle_interfaces_added(signal.parameters);
                }
            },
        );

        let removed = Rc::downgrade(self);
        let sub2 = connection.subscribe_to_signal(
            Some(BLUEZ_SERVICE),
            Some(OBJECT_MANAGER_IFACE),
            Some("InterfacesRemoved"),
            None,
            None,
            gio::DBusSignalFlags::NONE,
            move |signal| {
                if let Some(this) = removed.upgrade() {
                    this.handle_interfaces_removed(signal.parameters);
                }
            },
        );

        let changed = Rc::downgrade(self);
        let sub3 = connection.subscribe_to_signal(
            Some(BLUEZ_SERVICE),
            Some(PROPERTIES_IFACE),
            Some("PropertiesChanged"),
            None,
            None,
            gio::DBusSignalFlags::NONE,
            move |signal| {
                if let Some(this) = changed.upgrade() {
                    this.handle_properties_changed(signal.object_path, signal.parameters);
                }
            },
        );

        self.signal_subscriptions
            .borrow_mut()
            .extend([sub1, sub2, sub3]);
    }

    fn load_managed_objects(self: &Rc<Self>) {
        let Some(connection) = self.connection.borrow().clone() else {
            return;
        };

        let this_weak = Rc::downgrade(self);
        connection.call(
            Some(BLUEZ_SERVICE),
            "/",
            OBJECT_MANAGER_IFACE,
            "GetManagedObjects",
            None,
            None,
            DBusCallFlags::NONE,
            CALL_TIMEOUT_MS,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };

                match res {
                    Ok(result) => {
                        let objects = parse_managed_objects(&result.child_value(0));
                        this.tree.replace(build_tree(objects));
                    }
                    Err(e) => {
                        error!("BluetoothClient: GetManagedObjects failed: {}", e);
                        this.tree.borrow_mut().clear();
                    }
                }
                this.is_ready.set(true);
                this.notify_now();
            },
        );
    }

    fn set_unavailable(&self) {
        self.owner.replace(None);
        self.tree.borrow_mut().clear();
        self.fail_device_waiters();
        // A vanished daemon is still a definite answer for CLI waiters.
        self.is_ready.set(true);
        self.notify_now();
    }

    fn handle_interfaces_added(&self, params: &Variant) {
        let Some(path) = params.child_value(0).str().map(str::to_string) else {
            return;
        };
        let interfaces = parse_interfaces(&params.child_value(1));

        let mut added = None;
        let mut tree = self.tree.borrow_mut();
        if let Some(props) = interfaces.get(ADAPTER_IFACE) {
            if tree.get_iter_from_path(&path).is_none() {
                let mut row = Row::adapter(path.as_str());
                apply_properties(&mut row, props);
                tree.insert_adapter(row);
                tree.update_default_adapter();
            }
        } else if let Some(props) = interfaces.get(DEVICE_IFACE) {
            added = insert_device(&mut tree, &path, props)
                .and_then(|id| Some((tree.parent(id)?, tree.get(id)?.address.clone())))
                .and_then(|(adapter, address)| Some((tree.get(adapter)?.path.clone(), address)));
        } else {
            return;
        }
        drop(tree);
        if let Some((adapter, address)) = added {
            self.resolve_device_waiters(&adapter, &address, &path);
        }
        self.queue_notify();
    }

    fn handle_interfaces_removed(&self, params: &Variant) {
        let Some(path) = params.child_value(0).str().map(str::to_string) else {
            return;
        };
        let interfaces: Vec<String> = params.child_value(1).get().unwrap_or_default();
        if !interfaces
            .iter()
            .any(|i| i == ADAPTER_IFACE || i == DEVICE_IFACE)
        {
            return;
        }

        let mut tree = self.tree.borrow_mut();
        let Some(id) = tree.get_iter_from_path(&path) else {
            return;
        };
        let was_adapter = tree.get(id).is_some_and(|r| r.kind == RowKind::Adapter);
        tree.remove(id);
        if was_adapter {
            tree.update_default_adapter();
        }
        drop(tree);
        self.queue_notify();
    }

    fn handle_properties_changed(&self, object_path: &str, params: &Variant) {
        let Some(iface) = params.child_value(0).str().map(str::to_string) else {
            return;
        };
        if iface != ADAPTER_IFACE && iface != DEVICE_IFACE {
            return;
        }
        let changed: HashMap<String, Variant> = params.child_value(1).get().unwrap_or_default();

        let mut tree = self.tree.borrow_mut();
        let Some(id) = tree.get_iter_from_path(object_path) else {
            return;
        };
        if let Some(row) = tree.get_mut(id) {
            apply_properties(row, &changed);
        }
        // Power changes can move the default to another adapter.
        if iface == ADAPTER_IFACE && changed.contains_key("Powered") {
            tree.update_default_adapter();
        }
        drop(tree);
        self.queue_notify();
    }

    fn queue_notify(&self) {
        if self.debounce_id.borrow().is_some() {
            return;
        }

        let this_weak = Rc::downgrade(&BluetoothClient::global());
        let id = glib::timeout_add_local(Duration::from_millis(UPDATE_DEBOUNCE_MS), move || {
            if let Some(this) = this_weak.upgrade() {
                this.debounce_id.replace(None);
                this.notify_now();
            }
            glib::ControlFlow::Break
        });

        self.debounce_id.replace(Some(id));
    }

    fn notify_now(&self) {
        if let Some(id) = self.debounce_id.take() {
            id.remove();
        }
        let snapshot = self.snapshot();
        self.callbacks.notify(&snapshot);
    }

    // Queries

    /// Object path of the default adapter.
    pub fn default_adapter(&self) -> Option<String> {
        self.default_adapter_row().map(|row| row.path)
    }

    pub fn default_adapter_powered(&self) -> bool {
        self.default_adapter_row().is_some_and(|row| row.powered)
    }

    pub fn default_adapter_name(&self) -> Option<String> {
        self.default_adapter_row()
            .map(|row| row.display_name().to_string())
    }

    pub fn discoverable(&self) -> bool {
        self.default_adapter_row().is_some_and(|row| row.discoverable)
    }

    pub fn discovering(&self) -> bool {
        self.default_adapter_row().is_some_and(|row| row.discovering)
    }

    fn default_adapter_row(&self) -> Option<Row> {
        let tree = self.tree.borrow();
        tree.default_adapter().and_then(|id| tree.get(id)).cloned()
    }

    /// Path of the default adapter's device with `address`.
    pub fn device_path(&self, address: &str) -> Option<String> {
        let adapter = self.default_adapter()?;
        let tree = self.tree.borrow();
        tree.get_iter_from_address(address, &adapter)
            .and_then(|id| tree.get(id))
            .map(|row| row.path.clone())
    }

    /// Agent-facing view of the device at `path`.
    pub fn device_info(&self, path: &str) -> Option<DeviceInfo> {
        let tree = self.tree.borrow();
        let row = tree.get_iter_from_path(path).and_then(|id| tree.get(id))?;
        (row.kind == RowKind::Device).then(|| DeviceInfo {
            path: row.path.clone(),
            name: row.display_name().to_string(),
            address: row.address.clone(),
            device_type: row.device_type,
            paired: row.paired,
            trusted: row.trusted,
        })
    }

    pub fn is_paired(&self, adapter_address: &str, device_address: &str) -> bool {
        self.tree
            .borrow()
            .is_paired(adapter_address, device_address)
    }

    // Control API

    pub fn set_powered(&self, powered: bool, done: Done) {
        self.set_adapter_property("Powered", powered, done);
    }

    pub fn set_discoverable(&self, discoverable: bool, done: Done) {
        self.set_adapter_property("Discoverable", discoverable, done);
    }

    /// StartDiscovery or StopDiscovery on the default adapter.
    pub fn set_discovering(&self, discovering: bool, done: Done) {
        let Some(adapter) = self.default_adapter() else {
            done(Err(no_adapter_error()));
            return;
        };
        let method = if discovering {
            "StartDiscovery"
        } else {
            "StopDiscovery"
        };
        self.call(&adapter, ADAPTER_IFACE, method, None, CALL_TIMEOUT_MS, done);
    }

    fn set_adapter_property(&self, name: &str, value: bool, done: Done) {
        let Some(adapter) = self.default_adapter() else {
            done(Err(no_adapter_error()));
            return;
        };
        self.set_property(&adapter, ADAPTER_IFACE, name, value, done);
    }

    /// Pair with the device at `path` and trust it on success. An already
    /// paired device is removed first and paired again at the path it comes
    /// back at.
    pub fn create_device(self: &Rc<Self>, path: &str, done: Done) {
        let Some(device) = self.device_info(path) else {
            done(Err(missing_device_error(path)));
            return;
        };
        let adapter = {
            let tree = self.tree.borrow();
            tree.get_iter_from_path(path)
                .and_then(|id| tree.parent(id))
                .and_then(|p| tree.get(p))
                .map(|r| (r.path.clone(), r.discovering))
        };
        let steps = pairing::plan_create_device(
            &device,
            adapter.as_ref().map(|(p, _)| p.as_str()),
            adapter.as_ref().is_some_and(|(_, discovering)| *discovering),
        );
        self.run_create_steps(steps.into(), device.path, done);
    }

    fn run_create_steps(self: &Rc<Self>, mut steps: VecDeque<CreateStep>, path: String, done: Done) {
        let Some(step) = steps.pop_front() else {
            done(Ok(()));
            return;
        };

        let this_weak = Rc::downgrade(self);
        match step {
            CreateStep::Remove { adapter, device } => {
                debug!("BluetoothClient: removing paired {} before pairing", device);
                let target = device.clone();
                self.remove_device_on(
                    &adapter,
                    &target,
                    Box::new(move |res| {
                        if let Err(e) = res {
                            warn!(
                                "BluetoothClient: could not remove {}, pairing anyway: {}",
                                device, e
                            );
                        }
                        Self::resume_create(&this_weak, steps, path, Ok(()), done);
                    }),
                );
            }
            CreateStep::StartDiscovery { adapter } => {
                // A failure here only means the device may never show up;
                // the wait below times out in that case.
                self.call(
                    &adapter,
                    ADAPTER_IFACE,
                    "StartDiscovery",
                    None,
                    CALL_TIMEOUT_MS,
                    Box::new(move |_| Self::resume_create(&this_weak, steps, path, Ok(()), done)),
                );
            }
            CreateStep::AwaitDevice { adapter, address } => {
                let wanted = address.clone();
                self.await_device(
                    &adapter,
                    &wanted,
                    Box::new(move |found| {
                        let res = found.ok_or_else(|| {
                            glib::Error::new(
                                gio::IOErrorEnum::TimedOut,
                                &format!("{} did not come back after removal", address),
                            )
                        });
                        match res {
                            Ok(new_path) => {
                                Self::resume_create(&this_weak, steps, new_path, Ok(()), done)
                            }
                            Err(e) => Self::resume_create(&this_weak, steps, path, Err(e), done),
                        }
                    }),
                );
            }
            CreateStep::StopDiscovery { adapter } => {
                self.call(
                    &adapter,
                    ADAPTER_IFACE,
                    "StopDiscovery",
                    None,
                    CALL_TIMEOUT_MS,
                    Box::new(move |_| Self::resume_create(&this_weak, steps, path, Ok(()), done)),
                );
            }
            CreateStep::Pair => {
                let device = path.clone();
                self.call(
                    &device,
                    DEVICE_IFACE,
                    "Pair",
                    None,
                    PAIR_TIMEOUT_MS,
                    Box::new(move |res| Self::resume_create(&this_weak, steps, path, res, done)),
                );
            }
            CreateStep::Trust => {
                let device = path.clone();
                self.set_trusted(
                    &device,
                    true,
                    Box::new(move |res| Self::resume_create(&this_weak, steps, path, res, done)),
                );
            }
        }
    }

    fn resume_create(
        this_weak: &Weak<Self>,
        steps: VecDeque<CreateStep>,
        path: String,
        res: Result<(), glib::Error>,
        done: Done,
    ) {
        let Some(this) = this_weak.upgrade() else {
            return;
        };
        match res {
            Ok(()) => this.run_create_steps(steps, path, done),
            Err(e) => {
                // Leave the adapter scanning only if it already was.
                for step in steps {
                    if let CreateStep::StopDiscovery { adapter } = step {
                        this.call(
                            &adapter,
                            ADAPTER_IFACE,
                            "StopDiscovery",
                            None,
                            CALL_TIMEOUT_MS,
                            Box::new(|_| {}),
                        );
                    }
                }
                done(Err(e));
            }
        }
    }

    /// Call `found` with the path of the device `address` under `adapter`,
    /// waiting for it to be added if it is not there yet.
    fn await_device(self: &Rc<Self>, adapter: &str, address: &str, found: FoundFn) {
        let existing = {
            let tree = self.tree.borrow();
            tree.get_iter_from_address(address, adapter)
                .and_then(|id| tree.get(id))
                .map(|row| row.path.clone())
        };
        if let Some(path) = existing {
            found(Some(path));
            return;
        }

        let serial = self.next_waiter.get();
        self.next_waiter.set(serial + 1);
        debug!("BluetoothClient: waiting for {} to reappear", address);

        let this_weak = Rc::downgrade(self);
        let timeout_id = glib::timeout_add_local_once(
            Duration::from_millis(DEVICE_RETURN_TIMEOUT_MS),
            move || {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                let waiter = {
                    let mut waiters = this.device_waiters.borrow_mut();
                    waiters
                        .iter()
                        .position(|w| w.serial == serial)
                        .map(|i| waiters.remove(i))
                };
                if let Some(waiter) = waiter {
                    warn!("BluetoothClient: gave up waiting for {}", waiter.address);
                    (waiter.found)(None);
                }
            },
        );

        self.device_waiters.borrow_mut().push(DeviceWaiter {
            serial,
            adapter: adapter.to_string(),
            address: address.to_string(),
            timeout_id: Some(timeout_id),
            found,
        });
    }

    /// Hand `path` to everyone waiting for `address` under `adapter`.
    fn resolve_device_waiters(&self, adapter: &str, address: &str, path: &str) {
        let ready: Vec<DeviceWaiter> = {
            let mut waiters = self.device_waiters.borrow_mut();
            let (ready, rest): (Vec<_>, Vec<_>) = waiters
                .drain(..)
                .partition(|w| w.adapter == adapter && w.address.eq_ignore_ascii_case(address));
            *waiters = rest;
            ready
        };
        for mut waiter in ready {
            if let Some(id) = waiter.timeout_id.take() {
                id.remove();
            }
            (waiter.found)(Some(path.to_string()));
        }
    }

    fn fail_device_waiters(&self) {
        let waiters: Vec<DeviceWaiter> = self.device_waiters.borrow_mut().drain(..).collect();
        for mut waiter in waiters {
            if let Some(id) = waiter.timeout_id.take() {
                id.remove();
            }
            (waiter.found)(None);
        }
    }

    pub fn set_trusted(&self, path: &str, trusted: bool, done: Done) {
        if self.tree.borrow().get_iter_from_path(path).is_none() {
            done(Err(missing_device_error(path)));
            return;
        }
        self.set_property(path, DEVICE_IFACE, "Trusted", trusted, done);
    }

    /// Connect or disconnect every profile of the device at `path`.
    pub fn connect_service(&self, path: &str, connect: bool, done: Done) {
        if self.tree.borrow().get_iter_from_path(path).is_none() {
            done(Err(missing_device_error(path)));
            return;
        }
        let method = if connect { "Connect" } else { "Disconnect" };
        self.call(path, DEVICE_IFACE, method, None, CONNECT_TIMEOUT_MS, done);
    }

    /// Forget the device at `path`.
    pub fn remove_device(&self, path: &str, done: Done) {
        let adapter = {
            let tree = self.tree.borrow();
            tree.get_iter_from_path(path)
                .and_then(|id| tree.parent(id))
                .and_then(|p| tree.get(p))
                .map(|r| r.path.clone())
        };
        match adapter {
            Some(adapter) => self.remove_device_on(&adapter, path, done),
            None => done(Err(missing_device_error(path))),
        }
    }

    fn remove_device_on(&self, adapter: &str, device: &str, done: Done) {
        let object_path = match glib::variant::ObjectPath::try_from(device.to_string()) {
            Ok(p) => p,
            Err(e) => {
                done(Err(glib::Error::new(
                    gio::IOErrorEnum::InvalidArgument,
                    &e.to_string(),
                )));
                return;
            }
        };
        let args = (object_path,).to_variant();
        self.call(
            adapter,
            ADAPTER_IFACE,
            "RemoveDevice",
            Some(args),
            CALL_TIMEOUT_MS,
            done,
        );
    }

    fn set_property(&self, path: &str, iface: &str, name: &str, value: bool, done: Done) {
        let args = Variant::tuple_from_iter([
            iface.to_variant(),
            name.to_variant(),
            Variant::from_variant(&value.to_variant()),
        ]);
        self.call(path, PROPERTIES_IFACE, "Set", Some(args), CALL_TIMEOUT_MS, done);
    }

    fn call(
        &self,
        path: &str,
        iface: &str,
        method: &str,
        args: Option<Variant>,
        timeout_ms: i32,
        done: Done,
    ) {
        let Some(connection) = self.connection.borrow().clone() else {
            done(Err(glib::Error::new(
                gio::IOErrorEnum::NotConnected,
                "system bus is not connected",
            )));
            return;
        };

        let what = format!("{}.{} on {}", iface, method, path);
        connection.call(
            Some(BLUEZ_SERVICE),
            path,
            iface,
            method,
            args.as_ref(),
            None,
            DBusCallFlags::NONE,
            timeout_ms,
            None::<&gio::Cancellable>,
            move |res| {
                if let Err(e) = &res {
                    warn!("BluetoothClient: {} failed: {}", what, e);
                }
                done(res.map(|_| ()));
            },
        );
    }
}

impl Drop for BluetoothClient {
    fn drop(&mut self) {
        if let Some(id) = self.watcher_id.take() {
            gio::bus_unwatch_name(id);
        }
    }
}

fn no_adapter_error() -> glib::Error {
    glib::Error::new(gio::IOErrorEnum::NotFound, "no Bluetooth adapter")
}

fn missing_device_error(path: &str) -> glib::Error {
    glib::Error::new(
        gio::IOErrorEnum::NotFound,
        &format!("no device at {}", path),
    )
}

type Interfaces = HashMap<String, HashMap<String, Variant>>;

/// Parse an `a{sa{sv}}` interface map.
fn parse_interfaces(value: &Variant) -> Interfaces {
    let mut interfaces = HashMap::new();
    for i in 0..value.n_children() {
        let entry = value.child_value(i);
        let Some(name) = entry.child_value(0).str().map(str::to_string) else {
            continue;
        };
        let props: HashMap<String, Variant> = entry.child_value(1).get().unwrap_or_default();
        interfaces.insert(name, props);
    }
    interfaces
}

/// Parse the `a{oa{sa{sv}}}` reply of GetManagedObjects.
fn parse_managed_objects(value: &Variant) -> Vec<(String, Interfaces)> {
    (0..value.n_children())
        .filter_map(|i| {
            let entry = value.child_value(i);
            let path = entry.child_value(0).str()?.to_string();
            Some((path, parse_interfaces(&entry.child_value(1))))
        })
        .collect()
}

/// Build a tree from GetManagedObjects. Adapters go in first so devices
/// always find their parent regardless of dictionary order.
fn build_tree(objects: Vec<(String, Interfaces)>) -> DeviceTree {
    let mut tree = DeviceTree::new();
    for (path, interfaces) in &objects {
        if let Some(props) = interfaces.get(ADAPTER_IFACE) {
            let mut row = Row::adapter(path.as_str());
            apply_properties(&mut row, props);
            tree.insert_adapter(row);
        }
    }
    for (path, interfaces) in &objects {
        if let Some(props) = interfaces.get(DEVICE_IFACE) {
            insert_device(&mut tree, path, props);
        }
    }
    tree.update_default_adapter();
    tree
}

fn insert_device(tree: &mut DeviceTree, path: &str, props: &HashMap<String, Variant>) -> Option<RowId> {
    if tree.get_iter_from_path(path).is_some() {
        return None;
    }
    let adapter_path = props
        .get("Adapter")
        .and_then(|v| v.str().map(str::to_string))
        .unwrap_or_else(|| parent_path(path).to_string());
    let Some(adapter) = tree.get_iter_from_path(&adapter_path) else {
        warn!("BluetoothClient: device {} has no adapter {}", path, adapter_path);
        return None;
    };
    let mut row = Row::device(path);
    apply_properties(&mut row, props);
    tree.insert_device(adapter, row)
}

/// `/org/bluez/hci0/dev_00_11` -> `/org/bluez/hci0`
fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(path)
}

/// Copy known Adapter1/Device1 properties into `row`.
fn apply_properties(row: &mut Row, props: &HashMap<String, Variant>) {
    let mut class_type = None;
    let mut appearance_type = None;

    for (key, value) in props {
        match key.as_str() {
            "Address" => set_string(&mut row.address, value),
            "Alias" => set_string(&mut row.alias, value),
            "Name" => set_string(&mut row.name, value),
            "Icon" => set_string(&mut row.icon, value),
            "Powered" => set_bool(&mut row.powered, value),
            "Discoverable" => set_bool(&mut row.discoverable, value),
            "Discovering" => set_bool(&mut row.discovering, value),
            "Paired" => set_bool(&mut row.paired, value),
            "Trusted" => set_bool(&mut row.trusted, value),
            "Connected" => set_bool(&mut row.connected, value),
            "LegacyPairing" => set_bool(&mut row.legacy_pairing, value),
            "Class" => class_type = value.get::<u32>().and_then(types::class_to_type),
            "Appearance" => appearance_type = value.get::<u16>().and_then(types::appearance_to_type),
            "UUIDs" => {
                if let Some(uuids) = value.get::<Vec<String>>() {
                    row.uuids = types::uuids_to_strings(&uuids);
                }
            }
            _ => {}
        }
    }

    // Class wins over Appearance. A lone Appearance update only fills in a
    // type the class could not decode.
    if let Some(ty) = class_type {
        row.device_type = ty;
    } else if let Some(ty) = appearance_type
        && row.device_type == BluetoothType::Any
    {
        row.device_type = ty;
    }
}

fn set_string(field: &mut String, value: &Variant) {
    if let Some(s) = value.str() {
        *field = s.to_string();
    }
}

fn set_bool(field: &mut bool, value: &Variant) {
    if let Some(b) = value.get::<bool>() {
        *field = b;
    }
}
