//! `deskbridge send`: push files to a device with OBEX Object Push.
//!
//! Files go one after another through a single obexd session. Progress is
//! read from the Transfer1 `PropertiesChanged` signals and printed to stderr
//! at most once per second.

use std::cell::{Cell, RefCell};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use deskbridge_core::bluetooth::tree::{DeviceTree, Row};
use deskbridge_core::bluetooth::types;
use deskbridge_core::obex::TransferStatus;
use deskbridge_core::transfer::{self, ProgressTracker};
use gtk4::gio::{self, BusType, DBusCallFlags, prelude::*};
use gtk4::glib::{self, Variant, VariantDict};
use tracing::{debug, info, warn};

const OBEX_SERVICE: &str = "org.bluez.obex";
const OBEX_PATH: &str = "/org/bluez/obex";
const CLIENT_IFACE: &str = "org.bluez.obex.Client1";
const OBJECT_PUSH_IFACE: &str = "org.bluez.obex.ObjectPush1";
const TRANSFER_IFACE: &str = "org.bluez.obex.Transfer1";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

const OBJECT_PUSH_SERVICE: &str = "OBEXObjectPush";

/// Connecting can wait for the remote side to accept.
const SESSION_TIMEOUT_MS: i32 = 60_000;

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub device: Option<String>,
    pub name: Option<String>,
    pub files: Vec<PathBuf>,
}

/// A file ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Resolve `paths` to absolute regular files. Anything else is skipped with
/// a warning.
pub fn collect_files(paths: &[PathBuf]) -> Vec<OutgoingFile> {
    paths
        .iter()
        .filter_map(|path| {
            let absolute = match path.canonicalize() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    return None;
                }
            };
            match absolute.metadata() {
                Ok(meta) if meta.is_file() => Some(OutgoingFile {
                    path: absolute,
                    size: meta.len(),
                }),
                Ok(_) => {
                    warn!("Skipping {}: not a regular file", path.display());
                    None
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    None
                }
            }
        })
        .collect()
}

/// Paths typed one per line; blank lines are ignored.
pub fn read_paths<R: BufRead>(reader: R) -> Vec<PathBuf> {
    reader
        .lines()
        .map_while(|line| line.ok())
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Devices offered when no `--device` was given: paired devices of the
/// default adapter that take pushes, or every device if there are none.
pub fn push_candidates(tree: &DeviceTree) -> Vec<Row> {
    let devices: Vec<&Row> = tree.device_model().map(|(_, row)| row).collect();
    let preferred: Vec<Row> = devices
        .iter()
        .filter(|row| row.paired && row.has_uuid(OBJECT_PUSH_SERVICE))
        .map(|row| (*row).clone())
        .collect();
    if preferred.is_empty() {
        devices.into_iter().cloned().collect()
    } else {
        preferred
    }
}

/// List `candidates` and read a 1-based choice. Returns the chosen index,
/// or `None` on an empty or invalid answer.
pub fn pick_device<R: BufRead, W: Write>(
    candidates: &[Row],
    mut input: R,
    mut output: W,
) -> std::io::Result<Option<usize>> {
    for (i, row) in candidates.iter().enumerate() {
        writeln!(output, "{:>3}) {} ({})", i + 1, row.display_name(), row.address)?;
    }
    write!(output, "Send to which device? ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=candidates.len()).contains(n))
        .map(|n| n - 1))
}

/// Name shown for the target: `--name`, else the alias known for the
/// address, else the address itself.
pub fn device_name(tree: &DeviceTree, address: &str, name: Option<&str>) -> String {
    if let Some(name) = name {
        return name.to_string();
    }
    tree.device_model()
        .find(|(_, row)| row.address == address)
        .map(|(_, row)| row.display_name().to_string())
        .unwrap_or_else(|| address.to_string())
}

/// Resolve the target address and the list of files from `options`,
/// prompting on the terminal for whatever is missing.
pub fn prepare(options: &SendOptions, tree: &DeviceTree) -> Result<(String, String, Vec<OutgoingFile>)> {
    if options.name.is_some() && options.device.is_none() {
        bail!("--name requires --device");
    }

    let address = match &options.device {
        Some(device) => types::parse_address(device)?,
        None => {
            let candidates = push_candidates(tree);
            if candidates.is_empty() {
                bail!("no Bluetooth devices to send to");
            }
            let stdin = std::io::stdin();
            let choice = pick_device(&candidates, stdin.lock(), std::io::stderr())
                .context("failed to read device choice")?;
            let Some(index) = choice else {
                bail!("no device selected");
            };
            candidates[index].address.clone()
        }
    };

    let paths = if options.files.is_empty() {
        eprintln!("Files to send, one per line (end with Ctrl-D):");
        read_paths(std::io::stdin().lock())
    } else {
        options.files.clone()
    };
    let files = collect_files(&paths);
    if files.is_empty() {
        bail!("no files to send");
    }

    let name = device_name(tree, &address, options.name.as_deref());
    Ok((address, name, files))
}

/// Message of a D-Bus failure without the `GDBus.Error:<name>: ` prefix.
fn call_error_text(error: &glib::Error) -> String {
    transfer::error_text(Some(strip_remote_name(error.message())))
}

fn strip_remote_name(message: &str) -> &str {
    message
        .strip_prefix("GDBus.Error:")
        .and_then(|rest| rest.split_once(": "))
        .map(|(_, text)| text)
        .unwrap_or(message)
}

/// One run of the push protocol on the main loop.
struct Sender {
    connection: gio::DBusConnection,
    main_loop: glib::MainLoop,
    files: Vec<OutgoingFile>,
    next: Cell<usize>,
    session: RefCell<Option<String>>,
    transfer: RefCell<Option<String>>,
    tracker: RefCell<ProgressTracker>,
    result: RefCell<Option<Result<(), String>>>,
    _subscription: RefCell<Option<gio::SignalSubscription>>,
}

impl Sender {
    fn start(self: &Rc<Self>, address: &str) {
        let weak = Rc::downgrade(self);
        let subscription = self.connection.subscribe_to_signal(
            Some(OBEX_SERVICE),
            Some(PROPERTIES_IFACE),
            Some("PropertiesChanged"),
            None,
            Some(TRANSFER_IFACE),
            gio::DBusSignalFlags::NONE,
            move |signal| {
                if let Some(this) = weak.upgrade() {
                    this.transfer_changed(signal.object_path, signal.parameters);
                }
            },
        );
        self._subscription.replace(Some(subscription));

        let args = VariantDict::new(None);
        args.insert_value("Target", &"opp".to_variant());
        let weak = Rc::downgrade(self);
        self.connection.call(
            Some(OBEX_SERVICE),
            OBEX_PATH,
            CLIENT_IFACE,
            "CreateSession",
            Some(&Variant::tuple_from_iter([address.to_variant(), args.end()])),
            None,
            DBusCallFlags::NONE,
            SESSION_TIMEOUT_MS,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match res.map(|v| v.child_value(0).str().map(str::to_string)) {
                    Ok(Some(session)) => {
                        debug!("Send: session {}", session);
                        this.session.replace(Some(session));
                        this.send_next();
                    }
                    Ok(None) => this.finish(Err(transfer::error_text(None))),
                    Err(e) => this.finish(Err(call_error_text(&e))),
                }
            },
        );
    }

    fn send_next(self: &Rc<Self>) {
        let index = self.next.get();
        let Some(file) = self.files.get(index) else {
            self.finish(Ok(()));
            return;
        };
        self.next.set(index + 1);
        let Some(session) = self.session.borrow().clone() else {
            return;
        };

        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        eprintln!(
            "{} ({} of {})",
            transfer::sending_label(&file_name),
            index + 1,
            self.files.len()
        );
        self.tracker.borrow_mut().begin_file(file.size);

        let weak = Rc::downgrade(self);
        let path = file.path.to_string_lossy().into_owned();
        self.connection.call(
            Some(OBEX_SERVICE),
            &session,
            OBJECT_PUSH_IFACE,
            "SendFile",
            Some(&(path,).to_variant()),
            None,
            DBusCallFlags::NONE,
            -1,
            None::<&gio::Cancellable>,
            move |res| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match res.map(|v| v.child_value(0).str().map(str::to_string)) {
                    Ok(Some(transfer)) => {
                        this.transfer.replace(Some(transfer));
                    }
                    Ok(None) => this.finish(Err(transfer::error_text(None))),
                    Err(e) => this.finish(Err(call_error_text(&e))),
                }
            },
        );
    }

    fn transfer_changed(self: &Rc<Self>, path: &str, params: &Variant) {
        if self.transfer.borrow().as_deref() != Some(path) {
            return;
        }
        let changed = VariantDict::new(Some(&params.child_value(1)));

        if let Some(transferred) = changed
            .lookup_value("Transferred", None)
            .and_then(|v| v.get::<u64>())
            && let Some(text) = self.tracker.borrow_mut().update(transferred, Utc::now())
        {
            eprint!("\r{}", text);
        }

        let status = changed
            .lookup_value("Status", None)
            .and_then(|v| v.get::<String>())
            .and_then(|s| TransferStatus::parse(&s));
        match status {
            Some(TransferStatus::Complete) => {
                self.transfer.replace(None);
                self.tracker.borrow_mut().complete_file();
                self.send_next();
            }
            Some(TransferStatus::Error) => {
                self.transfer.replace(None);
                self.finish(Err(transfer::error_text(None)));
            }
            _ => {}
        }
    }

    fn finish(self: &Rc<Self>, result: Result<(), String>) {
        if self.result.borrow().is_some() {
            return;
        }
        eprintln!();
        self.result.replace(Some(result));

        let Some(session) = self.session.borrow_mut().take() else {
            self.main_loop.quit();
            return;
        };
        let Ok(session_path) = glib::variant::ObjectPath::try_from(session) else {
            self.main_loop.quit();
            return;
        };
        let main_loop = self.main_loop.clone();
        self.connection.call(
            Some(OBEX_SERVICE),
            OBEX_PATH,
            CLIENT_IFACE,
            "RemoveSession",
            Some(&(session_path,).to_variant()),
            None,
            DBusCallFlags::NONE,
            -1,
            None::<&gio::Cancellable>,
            move |res| {
                if let Err(e) = res {
                    debug!("Send: RemoveSession failed: {}", e);
                }
                main_loop.quit();
            },
        );
    }
}

/// Send `files` to `address`, blocking on a private main loop until the last
/// transfer finishes or one fails.
pub fn send_files(address: &str, name: &str, files: Vec<OutgoingFile>) -> Result<()> {
    let connection = gio::bus_get_sync(BusType::Session, None::<&gio::Cancellable>)
        .context("failed to connect to the session bus")?;

    let total: u64 = files.iter().map(|f| f.size).sum();
    info!("Sending {} file(s), {} bytes, to {}", files.len(), total, address);
    eprintln!("Sending to {}", name);

    let sender = Rc::new(Sender {
        connection,
        main_loop: glib::MainLoop::new(None, false),
        tracker: RefCell::new(ProgressTracker::new(total, files.len(), Utc::now())),
        files,
        next: Cell::new(0),
        session: RefCell::new(None),
        transfer: RefCell::new(None),
        result: RefCell::new(None),
        _subscription: RefCell::new(None),
    });

    sender.start(address);
    sender.main_loop.run();

    match sender.result.borrow_mut().take() {
        Some(Ok(())) => {
            eprintln!("Sent to {}", name);
            Ok(())
        }
        Some(Err(message)) => bail!("sending to {} failed: {}", name, message),
        None => bail!("sending to {} was interrupted", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn device(address: &str, alias: &str, paired: bool, uuids: &[&str]) -> Row {
        let mut row = Row::device(format!("/org/bluez/hci0/dev_{}", address.replace(':', "_")));
        row.address = address.to_string();
        row.alias = alias.to_string();
        row.paired = paired;
        row.uuids = uuids.iter().map(|u| u.to_string()).collect();
        row
    }

    fn tree_with(devices: Vec<Row>) -> DeviceTree {
        let mut tree = DeviceTree::new();
        let mut adapter = Row::adapter("/org/bluez/hci0");
        adapter.address = "00:11:22:33:44:55".into();
        adapter.powered = true;
        let id = tree.insert_adapter(adapter);
        for row in devices {
            tree.insert_device(id, row);
        }
        tree.update_default_adapter();
        tree
    }

    #[test]
    fn test_read_paths_skips_blank_lines() {
        let input = Cursor::new("/tmp/a.jpg\n\n  /tmp/b.txt  \n");
        assert_eq!(
            read_paths(input),
            vec![PathBuf::from("/tmp/a.jpg"), PathBuf::from("/tmp/b.txt")]
        );
    }

    #[test]
    fn test_collect_files_skips_directories() {
        let dir = std::env::temp_dir().join(format!("deskbridge-sendto-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("note.txt");
        std::fs::write(&file, b"hello").unwrap();

        let files = collect_files(&[file.clone(), dir.clone(), dir.join("missing")]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 5);
        assert!(files[0].path.is_absolute());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_push_candidates_prefers_paired_push_devices() {
        let tree = tree_with(vec![
            device("AA:AA:AA:AA:AA:01", "Phone", true, &["OBEXObjectPush"]),
            device("AA:AA:AA:AA:AA:02", "Mouse", true, &["HumanInterfaceDeviceService"]),
            device("AA:AA:AA:AA:AA:03", "Laptop", false, &["OBEXObjectPush"]),
        ]);
        let names: Vec<String> = push_candidates(&tree)
            .iter()
            .map(|r| r.display_name().to_string())
            .collect();
        assert_eq!(names, ["Phone"]);
    }

    #[test]
    fn test_push_candidates_falls_back_to_all() {
        let tree = tree_with(vec![
            device("AA:AA:AA:AA:AA:02", "Mouse", true, &[]),
            device("AA:AA:AA:AA:AA:03", "Laptop", false, &[]),
        ]);
        assert_eq!(push_candidates(&tree).len(), 2);
    }

    #[test]
    fn test_pick_device() {
        let candidates = vec![
            device("AA:AA:AA:AA:AA:01", "Phone", true, &[]),
            device("AA:AA:AA:AA:AA:02", "Tablet", true, &[]),
        ];
        let mut out = Vec::new();
        let choice = pick_device(&candidates, Cursor::new("2\n"), &mut out).unwrap();
        assert_eq!(choice, Some(1));
        let listing = String::from_utf8(out).unwrap();
        assert!(listing.contains("  1) Phone (AA:AA:AA:AA:AA:01)"));

        let choice = pick_device(&candidates, Cursor::new("7\n"), Vec::new()).unwrap();
        assert_eq!(choice, None);
    }

    #[test]
    fn test_device_name() {
        let tree = tree_with(vec![device("AA:AA:AA:AA:AA:01", "Phone", true, &[])]);
        assert_eq!(device_name(&tree, "AA:AA:AA:AA:AA:01", None), "Phone");
        assert_eq!(device_name(&tree, "AA:AA:AA:AA:AA:01", Some("Mine")), "Mine");
        assert_eq!(
            device_name(&tree, "AA:AA:AA:AA:AA:09", None),
            "AA:AA:AA:AA:AA:09"
        );
    }

    #[test]
    fn test_strip_remote_name() {
        assert_eq!(
            strip_remote_name("GDBus.Error:org.bluez.obex.Error.Failed: Unable to connect"),
            "Unable to connect"
        );
        assert_eq!(strip_remote_name("Timeout was reached"), "Timeout was reached");
    }

    #[test]
    fn test_prepare_rejects_name_without_device() {
        let options = SendOptions {
            name: Some("Phone".into()),
            ..Default::default()
        };
        assert!(prepare(&options, &DeviceTree::new()).is_err());
    }
}
