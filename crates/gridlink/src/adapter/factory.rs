// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Adapter construction from the adapter XML specification.
//!
//! ```xml
//! <root>
//!   <adapter name="rig1" type="rtds">
//!     <info>
//!       <host>192.168.1.100</host>
//!       <port>4001</port>
//!     </info>
//!     <state>
//!       <entry index="0">
//!         <type>sst</type>
//!         <device>sst1</device>
//!         <signal>gateway</signal>
//!       </entry>
//!     </state>
//!     <command>
//!       <entry index="0">
//!         <type>sst</type>
//!         <device>sst1</device>
//!         <signal>gateway</signal>
//!       </entry>
//!     </command>
//!   </adapter>
//! </root>
//! ```
//!
//! The factory owns every adapter it builds, creates their devices through
//! the [`DeviceBuilder`], and removes both together. Adapter kinds: `rtds`
//! and `pscad` connect out; `buffer` is the in-process loopback flavor.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use roxmltree::{Document, Node};

use crate::adapter::{Adapter, BufferAdapter, PscadAdapter, RtdsAdapter};
use crate::device::{DeviceBuilder, DeviceManager, DeviceSignal};
use crate::error::{Error, Result};

struct AdapterEntry {
    adapter: Arc<dyn Adapter>,
    device_ids: Vec<String>,
}

/// Creates, stores and tears down adapters and their devices.
pub struct AdapterFactory {
    builder: Arc<DeviceBuilder>,
    devices: Arc<DeviceManager>,
    adapters: Mutex<HashMap<String, AdapterEntry>>,
}

impl AdapterFactory {
    pub fn new(builder: Arc<DeviceBuilder>, devices: Arc<DeviceManager>) -> Self {
        Self {
            builder,
            devices,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// The device builder in use.
    pub fn builder(&self) -> &DeviceBuilder {
        &self.builder
    }

    /// The device manager adapters feed.
    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    /// Load every adapter declared in an XML file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let xml = fs::read_to_string(&path)
            .map_err(|_| Error::ConfigFileNotFound(path.as_ref().display().to_string()))?;
        self.load_xml(&xml)
    }

    /// Load every adapter declared in XML text.
    pub fn load_xml(&self, xml: &str) -> Result<()> {
        let doc = Document::parse(xml).map_err(|e| Error::MalformedXml(e.to_string()))?;
        for node in doc.root_element().children().filter(Node::is_element) {
            if node.tag_name().name() != "adapter" {
                return Err(Error::MalformedXml(format!(
                    "unexpected tag <{}>",
                    node.tag_name().name()
                )));
            }
            self.create_adapter(&node)?;
        }
        Ok(())
    }

    /// Build one adapter from its XML node, create its devices, start it.
    fn create_adapter(&self, node: &Node) -> Result<()> {
        let name = node
            .attribute("name")
            .ok_or_else(|| Error::MalformedXml("adapter without name".to_string()))?
            .to_string();
        let kind = node
            .attribute("type")
            .ok_or_else(|| Error::MalformedXml("adapter without type".to_string()))?;
        if name.is_empty() {
            return Err(Error::MalformedXml("empty adapter name".to_string()));
        }
        if self.adapters.lock().contains_key(&name) {
            return Err(Error::DuplicateAdapter(name));
        }

        let adapter: Arc<dyn Adapter> = match kind {
            "rtds" => Arc::new(RtdsAdapter::new(name.clone(), endpoint_of(node)?)),
            "pscad" => Arc::new(PscadAdapter::new(name.clone(), endpoint_of(node)?)),
            "buffer" => Arc::new(BufferAdapter::new(name.clone())),
            other => return Err(Error::UnknownAdapterKind(other.to_string())),
        };

        // (device -> type) across both direction tables.
        let mut device_types: HashMap<String, String> = HashMap::new();
        for direction in ["state", "command"] {
            let Some(table) = child_element(node, direction) else {
                continue;
            };
            for entry in table.children().filter(Node::is_element) {
                if entry.tag_name().name() != "entry" {
                    return Err(Error::MalformedXml(format!(
                        "unexpected tag <{}> in <{}>",
                        entry.tag_name().name(),
                        direction
                    )));
                }
                let index: usize = entry
                    .attribute("index")
                    .ok_or_else(|| Error::MalformedXml("entry without index".to_string()))?
                    .parse()
                    .map_err(|_| Error::MalformedXml("entry index not numeric".to_string()))?;
                let device_type = text_of(&entry, "type")?;
                let device = text_of(&entry, "device")?;
                let signal = text_of(&entry, "signal")?;

                if let Some(previous) = device_types.get(&device) {
                    if *previous != device_type {
                        return Err(Error::MalformedXml(format!(
                            "device {} declared as both {} and {}",
                            device, previous, device_type
                        )));
                    }
                } else {
                    device_types.insert(device.clone(), device_type.clone());
                }

                let key = DeviceSignal::new(device, signal);
                if direction == "state" {
                    adapter.register_state(key, index)?;
                } else {
                    adapter.register_command(key, index)?;
                }
            }
        }

        // Every declared type must exist before any device is created.
        for device_type in device_types.values() {
            self.builder.device_info(device_type)?;
        }

        let mut created: Vec<String> = Vec::new();
        for (device, device_type) in &device_types {
            let built = self
                .builder
                .create_device(device, device_type, adapter.clone())?;
            if let Err(err) = self.devices.add_device(Arc::new(built)) {
                for id in &created {
                    self.devices.remove_device(id);
                }
                return Err(err);
            }
            created.push(device.clone());
        }

        adapter.start()?;
        log::info!(
            "[factory] created {} adapter {} with {} devices",
            kind,
            name,
            created.len()
        );
        self.adapters.lock().insert(
            name,
            AdapterEntry {
                adapter,
                device_ids: created,
            },
        );
        Ok(())
    }

    /// Build a plug-and-play session adapter for the enumerated devices.
    ///
    /// Signal indexes are assigned per device in enumeration order, states
    /// and commands independently, following each type's sorted signal
    /// sets.
    pub fn create_session_adapter(
        &self,
        serial: &str,
        enumeration: &[(String, String)],
    ) -> Result<Arc<BufferAdapter>> {
        let name = format!("session-{}", serial);
        if self.adapters.lock().contains_key(&name) {
            return Err(Error::DuplicateAdapter(name));
        }

        let adapter = Arc::new(BufferAdapter::new(name.clone()));
        let mut rx_index = 0usize;
        let mut tx_index = 0usize;
        let mut created: Vec<String> = Vec::new();

        let result = (|| -> Result<()> {
            for (device_type, device) in enumeration {
                let info = self.builder.device_info(device_type)?.clone();
                for state in &info.states {
                    adapter.register_state(DeviceSignal::new(device.clone(), state), rx_index)?;
                    rx_index += 1;
                }
                for command in &info.commands {
                    adapter
                        .register_command(DeviceSignal::new(device.clone(), command), tx_index)?;
                    tx_index += 1;
                }
                let built = self
                    .builder
                    .create_device(device, device_type, adapter.clone())?;
                self.devices.add_device(Arc::new(built))?;
                created.push(device.clone());
            }
            Ok(())
        })();

        if let Err(err) = result {
            for id in &created {
                self.devices.remove_device(id);
            }
            return Err(err);
        }

        adapter.finalize();
        log::info!(
            "[factory] session adapter {} with {} devices",
            name,
            created.len()
        );
        self.adapters.lock().insert(
            name,
            AdapterEntry {
                adapter: adapter.clone(),
                device_ids: created,
            },
        );
        Ok(adapter)
    }

    /// Stop an adapter and remove its devices.
    pub fn remove_adapter(&self, name: &str) {
        let Some(entry) = self.adapters.lock().remove(name) else {
            return;
        };
        entry.adapter.stop();
        for id in &entry.device_ids {
            self.devices.remove_device(id);
        }
        log::info!("[factory] removed adapter {}", name);
    }

    /// Names of every live adapter.
    pub fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Fetch a live adapter by name.
    pub fn adapter(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters
            .lock()
            .get(name)
            .map(|entry| entry.adapter.clone())
    }

    /// Stop everything.
    pub fn stop(&self) {
        let names = self.adapter_names();
        for name in names {
            self.remove_adapter(&name);
        }
    }
}

fn child_element<'a, 'input>(node: &Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn text_of(node: &Node, name: &str) -> Result<String> {
    let child = child_element(node, name)
        .ok_or_else(|| Error::MalformedXml(format!("entry missing <{}>", name)))?;
    let text = child.text().unwrap_or("").trim();
    if text.is_empty() {
        return Err(Error::MalformedXml(format!("empty <{}> element", name)));
    }
    Ok(text.to_string())
}

fn endpoint_of(node: &Node) -> Result<String> {
    let info = child_element(node, "info")
        .ok_or_else(|| Error::MalformedXml("connection adapter without <info>".to_string()))?;
    let host = text_of(&info, "host")?;
    let port = text_of(&info, "port")?;
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSES: &str = r"
<root>
  <deviceType>
    <id>sst</id>
    <state>gateway</state>
    <command>gateway</command>
  </deviceType>
  <deviceType>
    <id>load</id>
    <state>drain</state>
    <command>drain</command>
  </deviceType>
</root>";

    fn factory() -> AdapterFactory {
        AdapterFactory::new(
            Arc::new(DeviceBuilder::from_xml(CLASSES).expect("classes parse")),
            Arc::new(DeviceManager::new()),
        )
    }

    #[test]
    fn test_buffer_adapter_with_devices() {
        let factory = factory();
        factory
            .load_xml(
                r#"
<root>
  <adapter name="a1" type="buffer">
    <state>
      <entry index="0"><type>sst</type><device>sst1</device><signal>gateway</signal></entry>
      <entry index="1"><type>load</type><device>load1</device><signal>drain</signal></entry>
    </state>
    <command>
      <entry index="0"><type>sst</type><device>sst1</device><signal>gateway</signal></entry>
    </command>
  </adapter>
</root>"#,
            )
            .expect("loads");

        assert_eq!(factory.adapter_names(), vec!["a1"]);
        assert_eq!(factory.devices().count(), 2);
        let device = factory.devices().device("sst1").expect("sst1 exists");
        assert!(device.has_type("sst"));
        assert!(device.state("gateway").expect("readable").is_nan());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let factory = factory();
        let res = factory.load_xml(
            r#"<root><adapter name="x" type="quantum"></adapter></root>"#,
        );
        assert!(matches!(res, Err(Error::UnknownAdapterKind(_))));
    }

    #[test]
    fn test_duplicate_adapter_name_rejected() {
        let factory = factory();
        let xml = r#"<root><adapter name="a" type="buffer"></adapter></root>"#;
        factory.load_xml(xml).expect("first loads");
        assert!(matches!(
            factory.load_xml(xml),
            Err(Error::DuplicateAdapter(_))
        ));
    }

    #[test]
    fn test_unknown_device_type_rejected() {
        let factory = factory();
        let res = factory.load_xml(
            r#"
<root>
  <adapter name="a" type="buffer">
    <state>
      <entry index="0"><type>ghost</type><device>g1</device><signal>s</signal></entry>
    </state>
  </adapter>
</root>"#,
        );
        assert!(matches!(res, Err(Error::UnknownDeviceType(_))));
    }

    #[test]
    fn test_conflicting_device_type_rejected() {
        let factory = factory();
        let res = factory.load_xml(
            r#"
<root>
  <adapter name="a" type="buffer">
    <state>
      <entry index="0"><type>sst</type><device>d1</device><signal>gateway</signal></entry>
      <entry index="1"><type>load</type><device>d1</device><signal>drain</signal></entry>
    </state>
  </adapter>
</root>"#,
        );
        assert!(matches!(res, Err(Error::MalformedXml(_))));
    }

    #[test]
    fn test_remove_adapter_removes_devices() {
        let factory = factory();
        factory
            .load_xml(
                r#"
<root>
  <adapter name="a1" type="buffer">
    <state>
      <entry index="0"><type>sst</type><device>sst1</device><signal>gateway</signal></entry>
    </state>
  </adapter>
</root>"#,
            )
            .expect("loads");
        assert!(factory.devices().contains("sst1"));
        factory.remove_adapter("a1");
        assert!(!factory.devices().contains("sst1"));
        assert!(factory.adapter_names().is_empty());
    }

    #[test]
    fn test_session_adapter_assigns_sequential_indexes() {
        let factory = factory();
        let adapter = factory
            .create_session_adapter(
                "abc",
                &[
                    ("sst".to_string(), "sst9".to_string()),
                    ("load".to_string(), "load9".to_string()),
                ],
            )
            .expect("session builds");

        assert_eq!(adapter.rx_len(), 2);
        assert_eq!(adapter.tx_len(), 2);
        assert!(factory.devices().contains("sst9"));
        assert!(factory.devices().contains("load9"));

        // Loopback through the session adapter.
        let device = factory.devices().device("sst9").expect("device");
        device.set_command("gateway", 5.5).expect("command");
        adapter.tick_loopback();
        // sst9 gateway: rx index 0, tx index 0.
        assert_eq!(device.state("gateway").expect("state"), 5.5);
    }

    #[test]
    fn test_session_adapter_unknown_type_rolls_back() {
        let factory = factory();
        let res = factory.create_session_adapter(
            "bad",
            &[
                ("sst".to_string(), "sst9".to_string()),
                ("ghost".to_string(), "g1".to_string()),
            ],
        );
        assert!(matches!(res, Err(Error::UnknownDeviceType(_))));
        assert!(!factory.devices().contains("sst9"), "rollback removed sst9");
    }
}
