// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Device-class construction from the XML specification.
//!
//! The XML declares device types with inherited types (`extends`), `state`
//! names and `command` names:
//!
//! ```xml
//! <root>
//!   <deviceType>
//!     <id>sst</id>
//!     <extends>virtual</extends>
//!     <state>gateway</state>
//!     <command>gateway</command>
//!   </deviceType>
//! </root>
//! ```
//!
//! Types form a DAG through `extends`; states and commands inherit by
//! union. Rejected specifications: unknown tags, duplicate ids, duplicate
//! entries within one type, extends of an undefined type, cyclic extends,
//! and a signal name provided by two distinct types that meet in one
//! closure (the error names both types and the signal).

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use roxmltree::Document;

use crate::adapter::Adapter;
use crate::device::{Device, DeviceInfo};
use crate::error::{Error, Result};

/// Conflict record: (type a, type b) -> signal both define.
type ConflictMap = HashMap<(String, String), String>;

struct BuildVars {
    undefined: BTreeSet<String>,
    uninitialized: BTreeSet<String>,
    conflicts: ConflictMap,
}

/// Builds [`DeviceInfo`] structures and devices from the class XML.
#[derive(Debug)]
pub struct DeviceBuilder {
    type_to_info: HashMap<String, DeviceInfo>,
}

impl DeviceBuilder {
    /// Load and validate a device-class XML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let xml = fs::read_to_string(&path)
            .map_err(|_| Error::ConfigFileNotFound(path.as_ref().display().to_string()))?;
        Self::from_xml(&xml)
    }

    /// Parse and validate device-class XML text.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|e| Error::MalformedXml(e.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != "root" {
            return Err(Error::MalformedXml(format!(
                "expected <root>, found <{}>",
                root.tag_name().name()
            )));
        }

        let mut type_to_info: HashMap<String, DeviceInfo> = HashMap::new();
        let mut vars = BuildVars {
            undefined: BTreeSet::new(),
            uninitialized: BTreeSet::new(),
            conflicts: ConflictMap::new(),
        };

        let mut declared_any = false;
        for type_node in root.children().filter(roxmltree::Node::is_element) {
            declared_any = true;
            if type_node.tag_name().name() != "deviceType" {
                return Err(Error::MalformedXml(format!(
                    "unexpected tag <{}>",
                    type_node.tag_name().name()
                )));
            }
            let (id, info) = parse_type(&type_node, &type_to_info, &mut vars)?;
            if type_to_info.contains_key(&id) {
                return Err(Error::DuplicateDeviceType(id));
            }
            vars.undefined.remove(&id);
            vars.uninitialized.insert(id.clone());
            type_to_info.insert(id, info);
        }
        if !declared_any {
            return Err(Error::MalformedXml("device XML is empty".to_string()));
        }

        if let Some(missing) = vars.undefined.iter().next() {
            return Err(Error::UndefinedExtends(missing.clone()));
        }

        while let Some(target) = vars.uninitialized.iter().next().cloned() {
            expand_info(&target, &mut BTreeSet::new(), &mut type_to_info, &mut vars)?;
            vars.uninitialized.remove(&target);
        }

        Ok(Self { type_to_info })
    }

    /// The capability sets of one type.
    pub fn device_info(&self, device_type: &str) -> Result<&DeviceInfo> {
        self.type_to_info
            .get(device_type)
            .ok_or_else(|| Error::UnknownDeviceType(device_type.to_string()))
    }

    /// Every type the builder knows.
    pub fn known_types(&self) -> impl Iterator<Item = &str> {
        self.type_to_info.keys().map(String::as_str)
    }

    /// Create a device of the given type backed by `adapter`.
    pub fn create_device(
        &self,
        id: &str,
        device_type: &str,
        adapter: Arc<dyn Adapter>,
    ) -> Result<Device> {
        let info = self.device_info(device_type)?.clone();
        Ok(Device::new(id.to_string(), info, adapter))
    }
}

/// Parse one `<deviceType>` element into its immediate (pre-closure) info.
fn parse_type(
    node: &roxmltree::Node,
    known: &HashMap<String, DeviceInfo>,
    vars: &mut BuildVars,
) -> Result<(String, DeviceInfo)> {
    let mut id: Option<String> = None;
    let mut info = DeviceInfo::default();

    for property in node.children().filter(roxmltree::Node::is_element) {
        let header = property.tag_name().name();
        let value = property.text().unwrap_or("").trim().to_string();
        if property.children().any(|c| c.is_element()) {
            return Err(Error::MalformedXml(format!(
                "unexpected child elements under <{}>",
                header
            )));
        }
        if value.is_empty() {
            return Err(Error::MalformedXml(format!("empty <{}> element", header)));
        }

        match header {
            "id" => {
                if id.is_some() {
                    return Err(Error::MalformedXml(
                        "multiple <id> elements in one deviceType".to_string(),
                    ));
                }
                info.types.insert(value.clone());
                id = Some(value);
            }
            "extends" => {
                if !info.types.insert(value.clone()) {
                    return Err(Error::DuplicateEntry {
                        device_type: id.clone().unwrap_or_default(),
                        entry: value,
                    });
                }
                if !known.contains_key(&value) {
                    vars.undefined.insert(value);
                }
            }
            "state" => {
                register_signal(&mut info.states, &value, id.as_deref(), known, vars, true)?;
            }
            "command" => {
                register_signal(&mut info.commands, &value, id.as_deref(), known, vars, false)?;
            }
            other => {
                return Err(Error::MalformedXml(format!("unknown tag <{}>", other)));
            }
        }
    }

    let id = id.ok_or_else(|| Error::MalformedXml("deviceType without <id>".to_string()))?;
    Ok((id, info))
}

/// Insert a state or command name, recording cross-type conflicts.
fn register_signal(
    set: &mut BTreeSet<String>,
    value: &str,
    id: Option<&str>,
    known: &HashMap<String, DeviceInfo>,
    vars: &mut BuildVars,
    is_state: bool,
) -> Result<()> {
    if !set.insert(value.to_string()) {
        return Err(Error::DuplicateEntry {
            device_type: id.unwrap_or_default().to_string(),
            entry: value.to_string(),
        });
    }
    let me = id.unwrap_or_default().to_string();
    for (other, other_info) in known {
        let clash = if is_state {
            other_info.states.contains(value)
        } else {
            other_info.commands.contains(value)
        };
        if clash {
            // One recorded conflict per type pair is enough.
            vars.conflicts
                .insert((me.clone(), other.clone()), value.to_string());
        }
    }
    Ok(())
}

/// Compute the transitive closure for `target`, rejecting cycles and
/// conflicting closures.
fn expand_info(
    target: &str,
    path: &mut BTreeSet<String>,
    type_to_info: &mut HashMap<String, DeviceInfo>,
    vars: &mut BuildVars,
) -> Result<()> {
    let info = type_to_info
        .get(target)
        .cloned()
        .ok_or_else(|| Error::UndefinedExtends(target.to_string()))?;

    // Base types (no extends) need no work; revisits of an initialized type
    // are free.
    if info.types.len() > 1 && vars.uninitialized.contains(target) {
        if !path.insert(target.to_string()) {
            return Err(Error::CyclicExtends(target.to_string()));
        }

        let mut merged = info;
        let parents: Vec<String> = merged
            .types
            .iter()
            .filter(|t| t.as_str() != target)
            .cloned()
            .collect();
        for parent in parents {
            expand_info(&parent, path, type_to_info, vars)?;
            let parent_info = type_to_info
                .get(&parent)
                .cloned()
                .ok_or_else(|| Error::UndefinedExtends(parent.clone()))?;
            merged.types.extend(parent_info.types);
            merged.states.extend(parent_info.states);
            merged.commands.extend(parent_info.commands);
        }

        for ((first, second), signal) in &vars.conflicts {
            if merged.types.contains(first) && merged.types.contains(second) {
                return Err(Error::SignalConflict {
                    signal: signal.clone(),
                    first: first.clone(),
                    second: second.clone(),
                });
            }
        }

        type_to_info.insert(target.to_string(), merged);
        path.remove(target);
    }

    vars.uninitialized.remove(target);
    Ok(())
}
