//! ObexAgent - accepts incoming Bluetooth file pushes.
//!
//! Exports `org.bluez.obex.Agent1` on the session bus and registers it with
//! obexd whenever `org.bluez.obex` is running. Each push is written to a
//! temp file under the cache directory, then moved into the download
//! directory once its transfer completes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use deskbridge_core::config::ObexConfig;
use deskbridge_core::obex::{self, ERROR_REJECTED, MSG_NOT_AUTHORIZED, TransferStatus};
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{self, Variant};
use tracing::{debug, error, info, warn};

use super::bluetooth::BluetoothClient;
use super::notifications::{
    EXPIRE_DEFAULT, EXPIRE_NEVER, NotificationEvent, NotificationSpec, Notifications,
    URGENCY_CRITICAL, URGENCY_NORMAL,
};

const OBEX_SERVICE: &str = "org.bluez.obex";
const AGENT_NAME: &str = "org.bluez.obex.Agent1";
const AGENT_IFACE: &str = "org.bluez.obex.Agent1";
const AGENT_PATH: &str = "/org/gnome/share/agent";
const AGENT_MANAGER_IFACE: &str = "org.bluez.obex.AgentManager1";
const AGENT_MANAGER_PATH: &str = "/org/bluez/obex";
const TRANSFER_IFACE: &str = "org.bluez.obex.Transfer1";
const SESSION_IFACE: &str = "org.bluez.obex.Session1";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

const FILE_MANAGER_NAME: &str = "org.freedesktop.FileManager1";
const FILE_MANAGER_PATH: &str = "/org/freedesktop/FileManager1";

const ICON: &str = "bluetooth";

const AGENT_INTROSPECTION: &str = r#"
<node>
  <interface name="org.bluez.obex.Agent1">
    <method name="Release"/>
    <method name="AuthorizePush">
      <arg type="o" name="transfer" direction="in"/>
      <arg type="s" name="path" direction="out"/>
    </method>
    <method name="Cancel"/>
  </interface>
</node>
"#;

thread_local! {
    static OBEX_AGENT_INSTANCE: RefCell<Option<Rc<ObexAgent>>> = const { RefCell::new(None) };
}

/// An accepted push waiting for its transfer to finish.
#[derive(Debug, Clone)]
struct IncomingTransfer {
    temp_path: PathBuf,
    name: String,
}

/// A push waiting on the user.
struct PendingPush {
    transfer: String,
    temp_path: PathBuf,
    invocation: gio::DBusMethodInvocation,
}

pub struct ObexAgent {
    connection: RefCell<Option<gio::DBusConnection>>,
    config: RefCell<ObexConfig>,
    registration_id: RefCell<Option<gio::RegistrationId>>,
    owner_id: RefCell<Option<gio::OwnerId>>,
    watcher_id: RefCell<Option<gio::WatcherId>>,
    registered_with_manager: Cell<bool>,
    pending: RefCell<Option<PendingPush>>,
    transfers: RefCell<HashMap<String, IncomingTransfer>>,
    _signal_subscriptions: RefCell<Vec<gio::SignalSubscription>>,
}

impl ObexAgent {
    fn new(config: ObexConfig) -> Rc<Self> {
        Rc::new(Self {
            connection: RefCell::new(None),
            config: RefCell::new(config),
            registration_id: RefCell::new(None),
            owner_id: RefCell::new(None),
            watcher_id: RefCell::new(None),
            registered_with_manager: Cell::new(false),
            pending: RefCell::new(None),
            transfers: RefCell::new(HashMap::new()),
            _signal_subscriptions: RefCell::new(Vec::new()),
        })
    }

    pub fn init_global(config: ObexConfig) -> Rc<Self> {
        OBEX_AGENT_INSTANCE.with(|cell| {
            let mut opt = cell.borrow_mut();
            if let Some(agent) = opt.as_ref() {
                warn!("ObexAgent already initialized, ignoring init_global call");
                return agent.clone();
            }
            let agent = ObexAgent::new(config);
            Self::init_dbus(&agent);
            *opt = Some(agent.clone());
            agent
        })
    }

    pub fn global() -> Option<Rc<Self>> {
        OBEX_AGENT_INSTANCE.with(|cell| cell.borrow().clone())
    }

    pub fn apply_config(&self, config: &ObexConfig) {
        self.config.replace(config.clone());
    }

    fn init_dbus(this: &Rc<Self>) {
        let this_weak = Rc::downgrade(this);
        gio::bus_get(BusType::Session, None::<&gio::Cancellable>, move |res| {
            let Some(this) = this_weak.upgrade() else {
                return;
            };
            let connection = match res {
                Ok(c) => c,
                Err(e) => {
                    error!("ObexAgent: failed to get session bus: {}", e);
                    return;
                }
            };
            this.connection.replace(Some(connection.clone()));

            if !this.export(&connection) {
                return;
            }
            this.subscribe_transfers(&connection);

            let owner_id = gio::bus_own_name_on_connection(
                &connection,
                AGENT_NAME,
                gio::BusNameOwnerFlags::ALLOW_REPLACEMENT,
                |_conn, name| debug!("ObexAgent: acquired {}", name),
                |_conn, name| warn!("ObexAgent: lost {}", name),
            );
            this.owner_id.replace(Some(owner_id));

            let appeared = Rc::downgrade(&this);
            let vanished = Rc::downgrade(&this);
            let watcher_id = gio::bus_watch_name_on_connection(
                &connection,
                OBEX_SERVICE,
                gio::BusNameWatcherFlags::NONE,
                move |_conn, _name, _owner| {
                    if let Some(this) = appeared.upgrade() {
                        this.register_with_manager();
                    }
                },
                move |_conn, _name| {
                    if let Some(this) = vanished.upgrade() {
                        debug!("ObexAgent: {} vanished", OBEX_SERVICE);
                        this.registered_with_manager.set(false);
                        this.reject_pending();
                        this.discard_transfers();
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
                error!("ObexAgent: failed to parse introspection: {}", e);
                return false;
            }
        };
        let Some(interface_info) = node_info.lookup_interface(AGENT_IFACE) else {
            error!("ObexAgent: {} missing from introspection", AGENT_IFACE);
            return false;
        };

        let this_weak = Rc::downgrade(self);
        let registration = connection
            .register_object(AGENT_PATH, &interface_info)
            .method_call(
                move |_conn, _sender, _path, _iface, method, params, invocation| {
                    let Some(this) = this_weak.upgrade() else {
                        invocation.return_error(gio::IOErrorEnum::Failed, "Agent unavailable");
                        return;
                    };
                    this.handle_method(method, params, invocation);
                },
            )
            .build();

        match registration {
            Ok(id) => {
                self.registration_id.replace(Some(id));
                true
            }
            Err(e) => {
                error!("ObexAgent: failed to export agent: {}", e);
                false
            }
        }
    }

    fn subscribe_transfers(self: &Rc<Self>, connection: &gio::DBusConnection) {
        let this_weak = Rc::downgrade(self);
        let sub = connection.subscribe_to_signal(
            Some(OBEX_SERVICE),
            Some(PROPERTIES_IFACE),
            Some("PropertiesChanged"),
            None,
            Some(TRANSFER_IFACE),
            gio::DBusSignalFlags::NONE,
            move |signal| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                let changed: HashMap<String, Variant> =
                    signal.parameters.child_value(1).get().unwrap_or_default();
                let status = changed
                    .get("Status")
                    .and_then(|v| v.str().and_then(TransferStatus::parse));
                if let Some(status) = status {
                    this.transfer_status_changed(signal.object_path, status);
                }
            },
        );
        self._signal_subscriptions.borrow_mut().push(sub);
    }

    fn register_with_manager(self: &Rc<Self>) {
        let Some(connection) = self.connection.borrow().clone() else {
            return;
        };
        let Ok(path) = glib::variant::ObjectPath::try_from(AGENT_PATH) else {
            return;
        };
        let this_weak = Rc::downgrade(self);
        connection.call(
            Some(OBEX_SERVICE),
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "RegisterAgent",
            Some(&(path,).to_variant()),
            None,
            DBusCallFlags::NONE,
            5000,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                match res {
                    Ok(_) => {
                        info!("ObexAgent: registered with {}", OBEX_SERVICE);
                        this.registered_with_manager.set(true);
                    }
                    Err(e) => error!("ObexAgent: RegisterAgent failed: {}", e),
                }
            },
        );
    }

    pub fn shutdown(&self) {
        self.reject_pending();
        self.discard_transfers();
        if let Some(id) = self.watcher_id.take() {
            gio::bus_unwatch_name(id);
        }
        if let Some(id) = self.owner_id.take() {
            gio::bus_unown_name(id);
        }
        if let Some(id) = self.registration_id.take()
            && let Some(conn) = self.connection.borrow().as_ref()
            && let Err(e) = conn.unregister_object(id)
        {
            warn!("ObexAgent: failed to unexport agent: {}", e);
        }
    }

    fn handle_method(self: &Rc<Self>, method: &str, params: Variant, invocation: gio::DBusMethodInvocation) {
        debug!("ObexAgent: {} called", method);
        match method {
            "Release" => {
                self.registered_with_manager.set(false);
                invocation.return_value(None);
            }
            "Cancel" => {
                self.reject_pending();
                invocation.return_value(None);
            }
            "AuthorizePush" => {
                let Some(transfer) = params.child_value(0).str().map(str::to_string) else {
                    invocation.return_error(gio::IOErrorEnum::InvalidArgument, "Missing transfer");
                    return;
                };
                self.authorize_push(transfer, invocation);
            }
            other => invocation.return_error(
                gio::IOErrorEnum::NotSupported,
                &format!("Unknown method {}", other),
            ),
        }
    }

    fn authorize_push(self: &Rc<Self>, transfer: String, invocation: gio::DBusMethodInvocation) {
        let this_weak = Rc::downgrade(self);
        let transfer_path = transfer.clone();
        self.get_all(&transfer, TRANSFER_IFACE, move |props| {
            let Some(this) = this_weak.upgrade() else {
                return;
            };
            let name = props
                .get("Name")
                .and_then(|v| v.str().map(str::to_string))
                .unwrap_or_default();
            let session = props.get("Session").and_then(|v| v.str().map(str::to_string));
            let Some(session) = session else {
                warn!("ObexAgent: transfer {} has no session", transfer_path);
                invocation.return_dbus_error(ERROR_REJECTED, MSG_NOT_AUTHORIZED);
                return;
            };

            let temp_path = match obex::incoming_dir().and_then(|dir| make_temp_file(&dir)) {
                Ok(path) => path,
                Err(e) => {
                    error!("ObexAgent: cannot create incoming file: {}", e);
                    invocation.return_dbus_error(ERROR_REJECTED, MSG_NOT_AUTHORIZED);
                    return;
                }
            };

            let this_weak = Rc::downgrade(&this);
            this.get_all(&session, SESSION_IFACE, move |session_props| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                let read = |key: &str| {
                    session_props
                        .get(key)
                        .and_then(|v| v.str().map(str::to_string))
                        .unwrap_or_default()
                };
                let device_address = read("Destination");
                let adapter_address = read("Source");

                this.decide(
                    PendingPush {
                        transfer: transfer_path,
                        temp_path,
                        invocation,
                    },
                    name,
                    &adapter_address,
                    &device_address,
                );
            });
        });
    }

    fn decide(self: &Rc<Self>, push: PendingPush, name: String, adapter_address: &str, device_address: &str) {
        let client = BluetoothClient::global();
        let paired = client.is_paired(adapter_address, device_address);

        if obex::auto_accept(&self.config.borrow(), paired) {
            debug!("ObexAgent: accepting {} from paired {}", name, device_address);
            self.accept(push, name);
            return;
        }

        let device_name = client
            .device_path(device_address)
            .and_then(|path| {
                let tree = client.tree();
                tree.get_iter_from_path(&path)
                    .and_then(|id| tree.get(id))
                    .map(|row| row.display_name().to_string())
            })
            .unwrap_or_else(|| device_address.to_string());

        // A new request replaces one still waiting.
        self.reject_pending();
        let notice = obex::transfer_request_notice(&device_name, &name);
        let transfer = push.transfer.clone();
        self.pending.replace(Some(push));

        let this_weak = Rc::downgrade(self);
        Notifications::global().notify(
            NotificationSpec {
                notice: &notice,
                icon: ICON,
                actions: &[("reject", "Decline"), ("accept", "Accept")],
                urgency: URGENCY_CRITICAL,
                expire_timeout: EXPIRE_NEVER,
            },
            move |event| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                let push = {
                    let mut pending = this.pending.borrow_mut();
                    match pending.as_ref() {
                        Some(p) if p.transfer == transfer => pending.take(),
                        _ => None,
                    }
                };
                let Some(push) = push else {
                    return;
                };
                if event == NotificationEvent::Action("accept".to_string()) {
                    this.accept(push, name);
                } else {
                    debug!("ObexAgent: push {} declined ({:?})", push.transfer, event);
                    reject(push);
                }
            },
        );
    }

    fn accept(&self, push: PendingPush, name: String) {
        let reply = push.temp_path.to_string_lossy().into_owned();
        self.transfers.borrow_mut().insert(
            push.transfer.clone(),
            IncomingTransfer {
                temp_path: push.temp_path,
                name,
            },
        );
        push.invocation.return_value(Some(&(reply,).to_variant()));
    }

    fn reject_pending(&self) {
        if let Some(push) = self.pending.borrow_mut().take() {
            reject(push);
        }
    }

    /// Forget every accepted transfer; nothing will report on them anymore.
    fn discard_transfers(&self) {
        let dropped = discard_transfers(&mut self.transfers.borrow_mut());
        if dropped > 0 {
            debug!("ObexAgent: dropped {} unfinished transfers", dropped);
        }
    }

    fn transfer_status_changed(&self, transfer: &str, status: TransferStatus) {
        if !status.is_finished() {
            return;
        }
        let Some(incoming) = self.transfers.borrow_mut().remove(transfer) else {
            return;
        };

        match status {
            TransferStatus::Complete => match self.store(&incoming) {
                Ok(path) => {
                    info!("ObexAgent: received {}", path.display());
                    notify_received(path);
                }
                Err(e) => error!("ObexAgent: failed to store {}: {}", incoming.name, e),
            },
            _ => {
                debug!("ObexAgent: transfer {} failed", transfer);
                remove_temp(&incoming.temp_path);
            }
        }
    }

    /// Move a completed file into the download directory.
    fn store(&self, incoming: &IncomingTransfer) -> std::io::Result<PathBuf> {
        let dir = obex::download_dir(&self.config.borrow())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = obex::unique_download_path(&dir, &obex::sanitize_file_name(&incoming.name));
        move_file(&incoming.temp_path, &target)?;
        Ok(target)
    }

    fn get_all<F>(&self, path: &str, iface: &str, done: F)
    where
        F: FnOnce(HashMap<String, Variant>) + 'static,
    {
        let Some(connection) = self.connection.borrow().clone() else {
            done(HashMap::new());
            return;
        };
        let what = format!("{} on {}", iface, path);
        connection.call(
            Some(OBEX_SERVICE),
            path,
            PROPERTIES_IFACE,
            "GetAll",
            Some(&(iface,).to_variant()),
            None,
            DBusCallFlags::NONE,
            5000,
            None::<&gio::Cancellable>,
            move |res| {
                let props = match res {
                    Ok(v) => v.child_value(0).get().unwrap_or_default(),
                    Err(e) => {
                        warn!("ObexAgent: GetAll {} failed: {}", what, e);
                        HashMap::new()
                    }
                };
                done(props);
            },
        );
    }
}

fn reject(push: PendingPush) {
    remove_temp(&push.temp_path);
    push.invocation
        .return_dbus_error(ERROR_REJECTED, MSG_NOT_AUTHORIZED);
}

/// Empty `transfers`, deleting each temp file. Returns how many were dropped.
fn discard_transfers(transfers: &mut HashMap<String, IncomingTransfer>) -> usize {
    let mut count = 0;
    for (_, incoming) in transfers.drain() {
        remove_temp(&incoming.temp_path);
        count += 1;
    }
    count
}

fn remove_temp(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("ObexAgent: failed to remove {}: {}", path.display(), e);
    }
}

/// Create an empty unique file in `dir` with `mkstemp`.
fn make_temp_file(dir: &Path) -> deskbridge_core::Result<PathBuf> {
    let template = dir.join("XXXXXX");
    let template = CString::new(template.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut buf = template.into_bytes_with_nul();

    // SAFETY: buf is a NUL-terminated template that mkstemp rewrites in place.
    let fd = unsafe { libc::mkstemp(buf.as_mut_ptr().cast()) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd was just returned by mkstemp and is owned here.
    unsafe {
        libc::close(fd);
    }

    buf.pop();
    Ok(PathBuf::from(OsString::from_vec(buf)))
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

fn notify_received(path: PathBuf) {
    let notice = obex::received_notice(&path);
    Notifications::global().notify(
        NotificationSpec {
            notice: &notice,
            icon: ICON,
            actions: &[("reveal", "Reveal File"), ("open", "Open File")],
            urgency: URGENCY_NORMAL,
            expire_timeout: EXPIRE_DEFAULT,
        },
        move |event| match event {
            NotificationEvent::Action(action) if action == "open" => open_file(&path),
            NotificationEvent::Action(action) if action == "reveal" => reveal_file(&path),
            _ => {}
        },
    );
}

fn open_file(path: &Path) {
    let argv = [OsStr::new("xdg-open"), path.as_os_str()];
    let process = match gio::Subprocess::newv(&argv, gio::SubprocessFlags::NONE) {
        Ok(process) => process,
        Err(e) => {
            warn!("ObexAgent: failed to run xdg-open: {}", e);
            return;
        }
    };
    process.wait_check_async(None::<&gio::Cancellable>, |res| {
        if let Err(e) = res {
            debug!("ObexAgent: xdg-open failed: {}", e);
        }
    });
}

/// Ask the file manager to show `path` selected in its folder.
fn reveal_file(path: &Path) {
    let uri = gio::File::for_path(path).uri().to_string();
    gio::bus_get(BusType::Session, None::<&gio::Cancellable>, move |res| {
        let connection = match res {
            Ok(c) => c,
            Err(e) => {
                warn!("ObexAgent: failed to get session bus: {}", e);
                return;
            }
        };
        connection.call(
            Some(FILE_MANAGER_NAME),
            FILE_MANAGER_PATH,
            FILE_MANAGER_NAME,
            "ShowItems",
            Some(&(vec![uri], "").to_variant()),
            None,
            DBusCallFlags::NONE,
            5000,
            None::<&gio::Cancellable>,
            |res| {
                if let Err(e) = res {
                    warn!("ObexAgent: ShowItems failed: {}", e);
                }
            },
        );
    });
}
