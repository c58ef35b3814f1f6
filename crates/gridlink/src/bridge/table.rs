// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! XML-structured value tables shared with the external simulator.
//!
//! A table's layout comes from a per-table XML specification binding each
//! index to a `(device, signal)` pair, with an optional per-index access
//! list for multi-tenant simulations:
//!
//! ```xml
//! <root>
//!   <state>
//!     <entry index="0">
//!       <device>sst1</device>
//!       <signal>voltage</signal>
//!       <access>sst1 sst2</access>
//!     </entry>
//!   </state>
//!   <command> ... </command>
//! </root>
//! ```
//!
//! An empty or absent access list grants every requester access.

use std::collections::{BTreeSet, HashMap};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use roxmltree::{Document, Node};

use crate::device::{DeviceSignal, SignalValue, NO_VALUE};
use crate::error::{Error, Result};

/// Parsed structure of one table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    name: String,
    size: usize,
    index_of: HashMap<DeviceSignal, usize>,
    access: HashMap<usize, BTreeSet<String>>,
}

impl TableSpec {
    /// Extract the table tagged `tag` from a specification document.
    pub fn from_xml(xml: &str, tag: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|e| Error::MalformedXml(e.to_string()))?;
        let table = doc
            .root_element()
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == tag)
            .ok_or_else(|| Error::MalformedXml(format!("no <{}> table in spec", tag)))?;

        let mut index_of = HashMap::new();
        let mut access = HashMap::new();
        let mut size = 0usize;

        for entry in table.children().filter(Node::is_element) {
            if entry.tag_name().name() != "entry" {
                return Err(Error::MalformedXml(format!(
                    "unexpected tag <{}> in <{}>",
                    entry.tag_name().name(),
                    tag
                )));
            }
            let index: usize = entry
                .attribute("index")
                .ok_or_else(|| Error::MalformedXml("entry without index".to_string()))?
                .parse()
                .map_err(|_| Error::MalformedXml("entry index not numeric".to_string()))?;
            let device = text_of(&entry, "device")?;
            let signal = text_of(&entry, "signal")?;

            let key = DeviceSignal::new(device, signal);
            if index_of.values().any(|&used| used == index) {
                return Err(Error::DuplicateIndex(index));
            }
            if index_of.contains_key(&key) {
                return Err(Error::DuplicateEntry {
                    device_type: tag.to_string(),
                    entry: key.to_string(),
                });
            }

            if let Some(list) = entry
                .children()
                .find(|c| c.is_element() && c.tag_name().name() == "access")
            {
                let parents: BTreeSet<String> = list
                    .text()
                    .unwrap_or("")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                access.insert(index, parents);
            }

            index_of.insert(key, index);
            size = size.max(index + 1);
        }

        Ok(Self {
            name: tag.to_string(),
            size,
            index_of,
            access,
        })
    }

    /// An empty spec with the given size, every slot open to everyone.
    pub fn anonymous(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            index_of: HashMap::new(),
            access: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Index of a `(device, signal)` pair.
    pub fn index(&self, key: &DeviceSignal) -> Result<usize> {
        self.index_of
            .get(key)
            .copied()
            .ok_or_else(|| Error::UnregisteredSignal {
                device: key.device.clone(),
                signal: key.signal.clone(),
            })
    }

    /// True when `requester` may touch the slot. Absent or empty lists
    /// grant access to everyone.
    pub fn allowed(&self, index: usize, requester: &str) -> bool {
        match self.access.get(&index) {
            Some(list) if !list.is_empty() => list.contains(requester),
            _ => true,
        }
    }
}

fn text_of(node: &Node, name: &str) -> Result<String> {
    let child = node
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .ok_or_else(|| Error::MalformedXml(format!("entry missing <{}>", name)))?;
    let text = child.text().unwrap_or("").trim();
    if text.is_empty() {
        return Err(Error::MalformedXml(format!("empty <{}> element", name)));
    }
    Ok(text.to_string())
}

/// A value vector structured by a [`TableSpec`].
pub struct DeviceTable {
    spec: TableSpec,
    data: RwLock<Vec<SignalValue>>,
}

impl DeviceTable {
    pub fn new(spec: TableSpec) -> Self {
        let data = RwLock::new(vec![NO_VALUE; spec.size()]);
        Self { spec, data }
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn size(&self) -> usize {
        self.spec.size()
    }

    /// Keyed write with access control (unique lock).
    pub fn set_value(&self, key: &DeviceSignal, requester: &str, value: SignalValue) -> Result<()> {
        let index = self.spec.index(key)?;
        if !self.spec.allowed(index, requester) {
            return Err(Error::AccessDenied {
                device: key.device.clone(),
                signal: key.signal.clone(),
            });
        }
        let mut data = self.data.write();
        if index >= data.len() {
            return Err(Error::IndexOutOfRange(index));
        }
        data[index] = value;
        Ok(())
    }

    /// Keyed read with access control (shared lock).
    pub fn get_value(&self, key: &DeviceSignal, requester: &str) -> Result<SignalValue> {
        let index = self.spec.index(key)?;
        if !self.spec.allowed(index, requester) {
            return Err(Error::AccessDenied {
                device: key.device.clone(),
                signal: key.signal.clone(),
            });
        }
        let data = self.data.read();
        data.get(index)
            .copied()
            .ok_or(Error::IndexOutOfRange(index))
    }

    /// Snapshot of the whole vector (shared lock).
    pub fn read_all(&self) -> Vec<SignalValue> {
        self.data.read().clone()
    }

    /// Overwrite the vector from a full snapshot (unique lock). Short
    /// input leaves the tail untouched.
    pub fn write_all(&self, values: &[SignalValue]) {
        let mut data = self.data.write();
        let n = values.len().min(data.len());
        data[..n].copy_from_slice(&values[..n]);
    }

    /// Unique guard over the raw vector, for multi-table updates that must
    /// hold both locks at once.
    pub(crate) fn guard_write(&self) -> RwLockWriteGuard<'_, Vec<SignalValue>> {
        self.data.write()
    }

    /// Shared guard over the raw vector.
    pub(crate) fn guard_read(&self) -> RwLockReadGuard<'_, Vec<SignalValue>> {
        self.data.read()
    }
}

impl std::fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTable")
            .field("name", &self.spec.name)
            .field("size", &self.spec.size)
            .finish()
    }
}
