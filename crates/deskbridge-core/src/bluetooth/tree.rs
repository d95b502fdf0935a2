//! Adapter/device tree keyed by D-Bus object path.
//!
//! Adapters are top-level rows and their devices are children. Rows live in
//! an arena and are addressed by [`RowId`], which stays valid until the row
//! is removed.

use std::fmt::Write as _;

use serde::Serialize;

use super::types::{self, BluetoothType};

/// Handle to a row in a [`DeviceTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(usize);

/// Whether a row mirrors an adapter or a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Adapter,
    Device,
}

/// One row of the tree. Adapter-only and device-only columns keep their
/// default values on the other kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub kind: RowKind,
    pub path: String,
    pub address: String,
    pub alias: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: BluetoothType,
    pub icon: String,
    pub is_default: bool,
    pub paired: bool,
    pub trusted: bool,
    pub connected: bool,
    pub discoverable: bool,
    pub discovering: bool,
    pub powered: bool,
    pub uuids: Vec<String>,
    pub legacy_pairing: bool,
}

impl Row {
    pub fn adapter(path: impl Into<String>) -> Self {
        Self::new(RowKind::Adapter, path.into())
    }

    pub fn device(path: impl Into<String>) -> Self {
        Self::new(RowKind::Device, path.into())
    }

    fn new(kind: RowKind, path: String) -> Self {
        Self {
            kind,
            path,
            address: String::new(),
            alias: String::new(),
            name: String::new(),
            device_type: BluetoothType::Any,
            icon: String::new(),
            is_default: false,
            paired: false,
            trusted: false,
            connected: false,
            discoverable: false,
            discovering: false,
            powered: false,
            uuids: Vec::new(),
            legacy_pairing: false,
        }
    }

    /// Alias if set, else name, else address.
    pub fn display_name(&self) -> &str {
        if !self.alias.is_empty() {
            &self.alias
        } else if !self.name.is_empty() {
            &self.name
        } else {
            &self.address
        }
    }

    pub fn has_uuid(&self, service: &str) -> bool {
        self.uuids.iter().any(|u| u == service)
    }
}

#[derive(Debug, Clone)]
struct Node {
    row: Row,
    parent: Option<RowId>,
    children: Vec<RowId>,
}

/// Arena-backed two-level tree of adapters and devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceTree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    top_level: Vec<RowId>,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.top_level.is_empty()
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.top_level.clear();
    }

    fn alloc(&mut self, node: Node) -> RowId {
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                RowId(index)
            }
            None => {
                self.nodes.push(Some(node));
                RowId(self.nodes.len() - 1)
            }
        }
    }

    fn node(&self, id: RowId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Append an adapter row at the top level.
    pub fn insert_adapter(&mut self, mut row: Row) -> RowId {
        row.kind = RowKind::Adapter;
        let id = self.alloc(Node {
            row,
            parent: None,
            children: Vec::new(),
        });
        self.top_level.push(id);
        id
    }

    /// Append a device row under `adapter`. Returns `None` if `adapter` is
    /// not an adapter row.
    pub fn insert_device(&mut self, adapter: RowId, mut row: Row) -> Option<RowId> {
        if self.node(adapter)?.row.kind != RowKind::Adapter {
            return None;
        }
        row.kind = RowKind::Device;
        let id = self.alloc(Node {
            row,
            parent: Some(adapter),
            children: Vec::new(),
        });
        if let Some(Some(parent)) = self.nodes.get_mut(adapter.0) {
            parent.children.push(id);
        }
        Some(id)
    }

    /// Remove a row and everything below it.
    pub fn remove(&mut self, id: RowId) -> Option<Row> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        self.free.push(id.0);

        match node.parent {
            Some(parent) => {
                if let Some(Some(p)) = self.nodes.get_mut(parent.0) {
                    p.children.retain(|c| *c != id);
                }
            }
            None => self.top_level.retain(|c| *c != id),
        }

        for child in node.children {
            if self.nodes.get_mut(child.0).and_then(Option::take).is_some() {
                self.free.push(child.0);
            }
        }

        Some(node.row)
    }

    pub fn get(&self, id: RowId) -> Option<&Row> {
        self.node(id).map(|n| &n.row)
    }

    pub fn get_mut(&mut self, id: RowId) -> Option<&mut Row> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .map(|n| &mut n.row)
    }

    pub fn parent(&self, id: RowId) -> Option<RowId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: RowId) -> &[RowId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn top_level(&self) -> &[RowId] {
        &self.top_level
    }

    /// Depth-first pre-order search below `parent` (or over the whole tree
    /// when `parent` is `None`). Each row is tested before its children.
    pub fn iter_search<F>(&self, parent: Option<RowId>, predicate: F) -> Option<RowId>
    where
        F: Fn(&Row) -> bool,
    {
        let start = match parent {
            Some(id) => self.children(id),
            None => &self.top_level,
        };
        self.search_siblings(start, &predicate)
    }

    fn search_siblings<F>(&self, siblings: &[RowId], predicate: &F) -> Option<RowId>
    where
        F: Fn(&Row) -> bool,
    {
        for &id in siblings {
            let Some(node) = self.node(id) else { continue };
            if predicate(&node.row) {
                return Some(id);
            }
            if let Some(found) = self.search_siblings(&node.children, predicate) {
                return Some(found);
            }
        }
        None
    }

    /// Row whose object path equals `path`.
    pub fn get_iter_from_path(&self, path: &str) -> Option<RowId> {
        self.iter_search(None, |row| row.path == path)
    }

    /// Device with `address` under the adapter at `adapter_path`.
    pub fn get_iter_from_address(&self, address: &str, adapter_path: &str) -> Option<RowId> {
        let adapter = self.get_iter_from_path(adapter_path)?;
        self.iter_search(Some(adapter), |row| row.address == address)
    }

    /// Adapter row with the given controller address.
    pub fn adapter_by_address(&self, address: &str) -> Option<RowId> {
        self.top_level
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|r| r.address == address))
    }

    /// Whether the device `device_address` is paired with the adapter
    /// `adapter_address`.
    pub fn is_paired(&self, adapter_address: &str, device_address: &str) -> bool {
        let Some(adapter) = self.adapter_by_address(adapter_address) else {
            return false;
        };
        self.iter_search(Some(adapter), |row| row.address == device_address)
            .and_then(|id| self.get(id))
            .is_some_and(|row| row.paired)
    }

    pub fn default_adapter(&self) -> Option<RowId> {
        self.top_level
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|r| r.is_default))
    }

    /// Mark the adapter at `path` as the default and clear the flag on every
    /// other adapter. `None` clears it everywhere.
    pub fn set_default_adapter(&mut self, path: Option<&str>) {
        let ids = self.top_level.clone();
        for id in ids {
            if let Some(row) = self.get_mut(id) {
                row.is_default = path.is_some_and(|p| p == row.path);
            }
        }
    }

    /// Path of the adapter that should be the default: the first powered
    /// adapter, else the first adapter.
    pub fn preferred_default_adapter(&self) -> Option<String> {
        let adapters: Vec<&Row> = self.adapter_model().map(|(_, row)| row).collect();
        adapters
            .iter()
            .find(|row| row.powered)
            .or_else(|| adapters.first())
            .map(|row| row.path.clone())
    }

    /// Re-pick the default adapter. Returns true if it changed.
    pub fn update_default_adapter(&mut self) -> bool {
        let before = self.default_adapter().and_then(|id| self.get(id)).map(|r| r.path.clone());
        let preferred = self.preferred_default_adapter();
        if before == preferred {
            return false;
        }
        self.set_default_adapter(preferred.as_deref());
        true
    }

    /// Adapter rows only.
    pub fn adapter_model(&self) -> impl Iterator<Item = (RowId, &Row)> {
        self.top_level
            .iter()
            .filter_map(move |&id| self.get(id).map(|row| (id, row)))
    }

    /// Devices of the default adapter.
    pub fn device_model(&self) -> impl Iterator<Item = (RowId, &Row)> {
        let children = self
            .default_adapter()
            .map(|id| self.children(id))
            .unwrap_or(&[]);
        children
            .iter()
            .filter_map(move |&id| self.get(id).map(|row| (id, row)))
    }

    /// Devices of the default adapter whose type is in `type_mask`, optionally
    /// only paired ones.
    pub fn filter_devices(&self, type_mask: u32, paired_only: bool) -> Vec<RowId> {
        self.device_model()
            .filter(|(_, row)| row.device_type.matches(type_mask))
            .filter(|(_, row)| !paired_only || row.paired)
            .map(|(id, _)| id)
            .collect()
    }

    /// Every row in tree order, for serialization.
    pub fn rows(&self) -> Vec<&Row> {
        let mut rows = Vec::new();
        for &adapter in &self.top_level {
            if let Some(row) = self.get(adapter) {
                rows.push(row);
            }
            rows.extend(self.children(adapter).iter().filter_map(|&c| self.get(c)));
        }
        rows
    }

    /// Text dump of the whole tree.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for row in self.rows() {
            dump_row(&mut out, row);
        }
        out
    }
}

fn bool_str(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

fn dump_row(out: &mut String, row: &Row) {
    // Writing into a String cannot fail.
    match row.kind {
        RowKind::Adapter => {
            let _ = writeln!(out, "Adapter: {} ({})", row.name, row.address);
            if row.is_default {
                let _ = writeln!(out, "\tDefault adapter");
            }
            let _ = writeln!(out, "\tD-Bus Path: {}", row.path);
            let _ = writeln!(out, "\tDiscoverable: {}", bool_str(row.discoverable));
            if row.discovering {
                let _ = writeln!(out, "\tDiscovery in progress");
            }
            let _ = writeln!(
                out,
                "\t{}",
                if row.powered { "Is powered" } else { "Is not powered" }
            );
        }
        RowKind::Device => {
            let _ = writeln!(out, "Device: {} ({})", row.alias, row.address);
            let _ = writeln!(out, "\tD-Bus Path: {}", row.path);
            let _ = writeln!(
                out,
                "\tType: {} Icon: {}",
                types::type_to_string(Some(row.device_type)),
                row.icon
            );
            let _ = writeln!(
                out,
                "\tPaired: {} Trusted: {} Connected: {}",
                bool_str(row.paired),
                bool_str(row.trusted),
                bool_str(row.connected)
            );
            if !row.uuids.is_empty() {
                let _ = writeln!(out, "\tUUIDs: {}", row.uuids.join(" "));
            }
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(path: &str, address: &str, powered: bool) -> Row {
        Row {
            address: address.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            powered,
            ..Row::adapter(path)
        }
    }

    fn device(adapter_path: &str, address: &str, ty: BluetoothType, paired: bool) -> Row {
        let path = format!("{}/dev_{}", adapter_path, address.replace(':', "_"));
        Row {
            address: address.to_string(),
            alias: format!("dev {}", address),
            device_type: ty,
            paired,
            ..Row::device(path)
        }
    }

    fn sample() -> (DeviceTree, RowId, RowId) {
        let mut tree = DeviceTree::new();
        let hci0 = tree.insert_adapter(adapter("/org/bluez/hci0", "00:00:00:00:00:01", false));
        let hci1 = tree.insert_adapter(adapter("/org/bluez/hci1", "00:00:00:00:00:02", true));
        tree.insert_device(hci0, device("/org/bluez/hci0", "AA:00:00:00:00:01", BluetoothType::Mouse, true));
        tree.insert_device(hci1, device("/org/bluez/hci1", "BB:00:00:00:00:01", BluetoothType::Phone, true));
        tree.insert_device(hci1, device("/org/bluez/hci1", "BB:00:00:00:00:02", BluetoothType::Keyboard, false));
        tree.insert_device(hci1, device("/org/bluez/hci1", "BB:00:00:00:00:03", BluetoothType::Headset, true));
        (tree, hci0, hci1)
    }

    #[test]
    fn test_iter_search_is_depth_first_preorder() {
        let (tree, hci0, _) = sample();
        let visited = std::cell::RefCell::new(Vec::new());
        tree.iter_search(None, |row| {
            visited.borrow_mut().push(row.path.clone());
            false
        });
        let visited = visited.into_inner();
        assert_eq!(visited[0], "/org/bluez/hci0");
        assert_eq!(visited[1], "/org/bluez/hci0/dev_AA_00_00_00_00_01");
        assert_eq!(visited[2], "/org/bluez/hci1");
        assert_eq!(visited.len(), 6);

        let first_device = tree.iter_search(None, |row| row.kind == RowKind::Device);
        assert_eq!(tree.parent(first_device.unwrap()), Some(hci0));
    }

    #[test]
    fn test_get_iter_from_path_and_address() {
        let (tree, _, hci1) = sample();
        assert_eq!(tree.get_iter_from_path("/org/bluez/hci1"), Some(hci1));
        assert!(tree.get_iter_from_path("/org/bluez/hci9").is_none());

        let dev = tree
            .get_iter_from_address("BB:00:00:00:00:02", "/org/bluez/hci1")
            .unwrap();
        assert_eq!(tree.get(dev).unwrap().device_type, BluetoothType::Keyboard);

        // wrong adapter, and case matters
        assert!(tree.get_iter_from_address("BB:00:00:00:00:02", "/org/bluez/hci0").is_none());
        assert!(tree.get_iter_from_address("bb:00:00:00:00:02", "/org/bluez/hci1").is_none());
    }

    #[test]
    fn test_default_adapter_is_unique() {
        let (mut tree, hci0, hci1) = sample();
        assert!(tree.update_default_adapter());
        assert_eq!(tree.default_adapter(), Some(hci1));

        tree.set_default_adapter(Some("/org/bluez/hci0"));
        let defaults = tree.adapter_model().filter(|(_, r)| r.is_default).count();
        assert_eq!(defaults, 1);
        assert_eq!(tree.default_adapter(), Some(hci0));

        tree.set_default_adapter(None);
        assert!(tree.default_adapter().is_none());
    }

    #[test]
    fn test_preferred_default_falls_back_to_first() {
        let mut tree = DeviceTree::new();
        tree.insert_adapter(adapter("/org/bluez/hci0", "00:00:00:00:00:01", false));
        tree.insert_adapter(adapter("/org/bluez/hci1", "00:00:00:00:00:02", false));
        assert_eq!(tree.preferred_default_adapter().as_deref(), Some("/org/bluez/hci0"));
        assert!(tree.update_default_adapter());
        assert!(!tree.update_default_adapter());
    }

    #[test]
    fn test_device_model_and_filter() {
        let (mut tree, _, _) = sample();
        assert_eq!(tree.device_model().count(), 0);

        tree.update_default_adapter();
        assert_eq!(tree.device_model().count(), 3);

        let input = tree.filter_devices(types::TYPE_MASK_INPUT, false);
        assert_eq!(input.len(), 1);
        assert!(tree.filter_devices(types::TYPE_MASK_INPUT, true).is_empty());
        assert_eq!(tree.filter_devices(types::TYPE_MASK_ALL, true).len(), 2);
    }

    #[test]
    fn test_remove_adapter_removes_children() {
        let (mut tree, _, hci1) = sample();
        let removed = tree.remove(hci1).unwrap();
        assert_eq!(removed.path, "/org/bluez/hci1");
        assert_eq!(tree.rows().len(), 2);
        assert!(tree.get_iter_from_path("/org/bluez/hci1/dev_BB_00_00_00_00_01").is_none());

        // slots are reused
        let again = tree.insert_adapter(adapter("/org/bluez/hci2", "00:00:00:00:00:03", true));
        assert_eq!(tree.get(again).unwrap().path, "/org/bluez/hci2");
        assert_eq!(tree.top_level().len(), 2);
    }

    #[test]
    fn test_remove_device_detaches_from_parent() {
        let (mut tree, hci0, _) = sample();
        let dev = tree.children(hci0)[0];
        tree.remove(dev);
        assert!(tree.children(hci0).is_empty());
        assert!(tree.get(dev).is_none());
    }

    #[test]
    fn test_insert_device_requires_adapter() {
        let (mut tree, hci0, _) = sample();
        let dev = tree.children(hci0)[0];
        assert!(tree.insert_device(dev, Row::device("/x")).is_none());
    }

    #[test]
    fn test_is_paired_by_addresses() {
        let (tree, _, _) = sample();
        assert!(tree.is_paired("00:00:00:00:00:02", "BB:00:00:00:00:01"));
        assert!(!tree.is_paired("00:00:00:00:00:02", "BB:00:00:00:00:02"));
        assert!(!tree.is_paired("00:00:00:00:00:01", "BB:00:00:00:00:01"));
        assert!(!tree.is_paired("FF:FF:FF:FF:FF:FF", "BB:00:00:00:00:01"));
    }

    #[test]
    fn test_dump_format() {
        let mut tree = DeviceTree::new();
        let hci0 = tree.insert_adapter(Row {
            discoverable: true,
            discovering: true,
            ..adapter("/org/bluez/hci0", "00:11:22:33:44:55", true)
        });
        tree.set_default_adapter(Some("/org/bluez/hci0"));
        tree.insert_device(
            hci0,
            Row {
                icon: "input-mouse".to_string(),
                uuids: vec!["HumanInterfaceDeviceService".to_string(), "PANU".to_string()],
                ..device("/org/bluez/hci0", "AA:BB:CC:DD:EE:FF", BluetoothType::Mouse, true)
            },
        );

        let expected = "Adapter: hci0 (00:11:22:33:44:55)\n\
            \tDefault adapter\n\
            \tD-Bus Path: /org/bluez/hci0\n\
            \tDiscoverable: True\n\
            \tDiscovery in progress\n\
            \tIs powered\n\
            \n\
            Device: dev AA:BB:CC:DD:EE:FF (AA:BB:CC:DD:EE:FF)\n\
            \tD-Bus Path: /org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF\n\
            \tType: Mouse Icon: input-mouse\n\
            \tPaired: True Trusted: False Connected: False\n\
            \tUUIDs: HumanInterfaceDeviceService PANU\n\
            \n";
        assert_eq!(tree.dump(), expected);
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut row = Row::device("/d");
        row.address = "AA:BB:CC:DD:EE:FF".to_string();
        assert_eq!(row.display_name(), "AA:BB:CC:DD:EE:FF");
        row.name = "Name".to_string();
        assert_eq!(row.display_name(), "Name");
        row.alias = "Alias".to_string();
        assert_eq!(row.display_name(), "Alias");
    }
}
