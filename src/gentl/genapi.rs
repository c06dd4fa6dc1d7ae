//! Register-level access to the remote device's GenApi description.
//!
//! Acquisition control needs three features: `AcquisitionStart`,
//! `AcquisitionStop` and (when present) `TLParamsLocked`. Each is followed
//! through its `pValue` chain down to a register, so the write can go straight
//! to the device port. Everything else in the node map is ignored.

use anyhow::{anyhow, bail, Context, Result};
use roxmltree::{Document, Node};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;

const MAX_CHAIN_DEPTH: usize = 16;

/// Where the producer says the device description lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DescriptionUrl {
    /// Stored in device memory, read through the port.
    Local {
        file_name: String,
        address: u64,
        length: usize,
    },
    /// A file on the host.
    File(PathBuf),
}

impl DescriptionUrl {
    /// Parses `Local:name.xml;addr;len` and `File:///path` URLs. Query
    /// strings such as `?SchemaVersion=1.1.0` are dropped.
    pub(crate) fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed device description url '{url}'"))?;
        let rest = rest.split_once('?').map_or(rest, |(head, _)| head);
        match scheme.to_ascii_lowercase().as_str() {
            "local" => {
                let mut parts = rest.trim_start_matches('/').split(';');
                let file_name = parts.next().unwrap_or_default().trim().to_string();
                let address = parts.next().map(parse_hex).transpose()?;
                let length = parts.next().map(parse_hex).transpose()?;
                match (address, length, parts.next()) {
                    (Some(address), Some(length), None) if !file_name.is_empty() => Ok(Self::Local {
                        file_name,
                        address,
                        length: usize::try_from(length)
                            .with_context(|| format!("description length in '{url}'"))?,
                    }),
                    _ => bail!("malformed local device description url '{url}'"),
                }
            }
            "file" => {
                let path = rest.strip_prefix("//").unwrap_or(rest);
                let path = if cfg!(windows) {
                    path.trim_start_matches('/')
                } else {
                    path
                };
                if path.is_empty() {
                    bail!("empty file url '{url}'");
                }
                Ok(Self::File(PathBuf::from(path)))
            }
            other => bail!("unsupported device description scheme '{other}'"),
        }
    }
}

/// Turns the raw description bytes into XML text, unpacking `.zip` files.
pub(crate) fn description_text(file_name: &str, bytes: Vec<u8>) -> Result<String> {
    if file_name.to_ascii_lowercase().ends_with(".zip") {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).context("open zipped device description")?;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.name().to_ascii_lowercase().ends_with(".xml") {
                let mut text = String::new();
                entry
                    .read_to_string(&mut text)
                    .context("read zipped device description")?;
                return Ok(text);
            }
        }
        bail!("zipped device description {file_name} holds no .xml file");
    }
    // Device memory is NUL padded past the document.
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec()).context("device description is not UTF-8")
}

/// Layout of one device register, with the bit field a feature occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Register {
    pub address: u64,
    pub length: usize,
    pub big_endian: bool,
    /// Field position, counted from the least significant bit.
    pub shift: u32,
    pub width: u32,
}

impl Register {
    /// True when the feature covers only part of the register, so writes
    /// must preserve the other bits.
    pub(crate) fn is_masked(&self) -> bool {
        self.shift != 0 || self.width != self.bits()
    }

    /// Encodes `value` for a port write. `current` is the register content
    /// and is only consulted for masked registers.
    pub(crate) fn encode(&self, value: u64, current: Option<&[u8]>) -> Result<Vec<u8>> {
        let old = match current {
            Some(bytes) if self.is_masked() => self.decode(bytes)?,
            _ => 0,
        };
        let mask = self.mask();
        let raw = (old & !mask) | ((value << self.shift) & mask);
        let mut out = raw.to_le_bytes()[..self.length].to_vec();
        if self.big_endian {
            out.reverse();
        }
        Ok(out)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<u64> {
        if bytes.len() != self.length {
            bail!(
                "register {:#x} read {} bytes, expected {}",
                self.address,
                bytes.len(),
                self.length
            );
        }
        let mut le = [0u8; 8];
        le[..self.length].copy_from_slice(bytes);
        if self.big_endian {
            le[..self.length].reverse();
        }
        Ok(u64::from_le_bytes(le))
    }

    fn bits(&self) -> u32 {
        self.length as u32 * 8
    }

    fn mask(&self) -> u64 {
        let field = if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        };
        field << self.shift
    }
}

/// A feature write resolved to its register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeatureWrite {
    pub register: Register,
    pub value: u64,
}

/// The remote-device writes that bracket one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AcquisitionCommands {
    pub start: FeatureWrite,
    pub stop: FeatureWrite,
    pub params_lock: Option<Register>,
}

impl AcquisitionCommands {
    pub(crate) fn from_description(xml: &str) -> Result<Self> {
        let document = Document::parse(xml.trim_start_matches('\u{feff}'))
            .context("parse device description")?;
        let nodes = NodeMap::new(&document);
        let params_lock = match nodes.register("TLParamsLocked", 0) {
            Ok(register) => Some(register),
            Err(err) => {
                log::debug!("TLParamsLocked not writable: {:#}", err);
                None
            }
        };
        Ok(Self {
            start: nodes.command("AcquisitionStart")?,
            stop: nodes.command("AcquisitionStop")?,
            params_lock,
        })
    }
}

struct NodeMap<'a, 'input> {
    by_name: HashMap<&'a str, Node<'a, 'input>>,
}

impl<'a, 'input> NodeMap<'a, 'input> {
    fn new(document: &'a Document<'input>) -> Self {
        let by_name = document
            .descendants()
            .filter(|node| node.is_element())
            .filter_map(|node| node.attribute("Name").map(|name| (name, node)))
            .collect();
        Self { by_name }
    }

    fn node(&self, name: &str) -> Result<Node<'a, 'input>> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("feature {name} not found in device description"))
    }

    fn command(&self, name: &str) -> Result<FeatureWrite> {
        let node = self.node(name)?;
        if node.tag_name().name() != "Command" {
            bail!("{name} is a {} node, not a Command", node.tag_name().name());
        }
        let value = match (child_text(node, "CommandValue"), child_text(node, "pCommandValue")) {
            (Some(text), _) => parse_int(text)?,
            (None, Some(target)) => self.constant(target, 1)?,
            (None, None) => 1,
        };
        let target =
            child_text(node, "pValue").ok_or_else(|| anyhow!("command {name} has no pValue"))?;
        Ok(FeatureWrite {
            register: self.register(target, 1).with_context(|| format!("resolve {name}"))?,
            value,
        })
    }

    fn register(&self, name: &str, depth: usize) -> Result<Register> {
        if depth > MAX_CHAIN_DEPTH {
            bail!("feature chain too deep at {name}");
        }
        let node = self.node(name)?;
        match node.tag_name().name() {
            "IntReg" => self.layout(node, None, depth),
            "MaskedIntReg" => self.layout(node, Some(node), depth),
            "StructEntry" => {
                let parent = node
                    .parent_element()
                    .ok_or_else(|| anyhow!("struct entry {name} has no register"))?;
                self.layout(parent, Some(node), depth)
            }
            "Integer" | "Boolean" => {
                let target = child_text(node, "pValue")
                    .ok_or_else(|| anyhow!("{name} is not backed by a register"))?;
                self.register(target, depth + 1)
            }
            other => bail!("{name}: {other} nodes are not writable through a register"),
        }
    }

    fn layout(&self, register: Node, field: Option<Node>, depth: usize) -> Result<Register> {
        let name = register.attribute("Name").unwrap_or("<unnamed>");
        let mut address = 0u64;
        for child in register.children().filter(|child| child.is_element()) {
            let text = child.text().map(str::trim).unwrap_or_default();
            match child.tag_name().name() {
                "Address" => address = address.wrapping_add(parse_int(text)?),
                "pAddress" => address = address.wrapping_add(self.constant(text, depth + 1)?),
                "pIndex" => bail!("{name}: indexed register addresses are not supported"),
                _ => {}
            }
        }
        let length = child_text(register, "Length")
            .ok_or_else(|| anyhow!("{name} has no Length"))
            .and_then(parse_int)?;
        if !(1..=8).contains(&length) {
            bail!("{name}: register length {length} is not supported");
        }
        let length = length as usize;
        let big_endian = child_text(register, "Endianess") == Some("BigEndian");
        let bits = length as u32 * 8;
        let (shift, width) = match field {
            Some(field) => bit_field(field, big_endian, bits)?,
            None => (0, bits),
        };
        Ok(Register {
            address,
            length,
            big_endian,
            shift,
            width,
        })
    }

    /// Value of an integer node that does not need a port read.
    fn constant(&self, name: &str, depth: usize) -> Result<u64> {
        if depth > MAX_CHAIN_DEPTH {
            bail!("feature chain too deep at {name}");
        }
        let node = self.node(name)?;
        match (node.tag_name().name(), child_text(node, "Value"), child_text(node, "pValue")) {
            ("IntConst" | "Integer", Some(value), _) => parse_int(value),
            ("Integer", None, Some(target)) => self.constant(target, depth + 1),
            (other, _, _) => bail!("{name}: {other} value cannot be resolved without the device"),
        }
    }
}

/// Converts `Bit` or `LSB`/`MSB` into a shift and width counted from the
/// least significant bit. Big-endian registers number bit 0 as the MSB.
fn bit_field(field: Node, big_endian: bool, bits: u32) -> Result<(u32, u32)> {
    let read = |tag: &str| child_text(field, tag).map(parse_int).transpose();
    let (lsb, msb) = match read("Bit")? {
        Some(bit) => (bit, bit),
        None if big_endian => (read("LSB")?.unwrap_or(u64::from(bits) - 1), read("MSB")?.unwrap_or(0)),
        None => (read("LSB")?.unwrap_or(0), read("MSB")?.unwrap_or(u64::from(bits) - 1)),
    };
    let top = u64::from(bits) - 1;
    if lsb > top || msb > top {
        bail!("bit field {lsb}..{msb} outside a {bits}-bit register");
    }
    let (low, high) = if big_endian {
        (top - lsb, top - msb)
    } else {
        (lsb, msb)
    };
    if low > high {
        bail!("bit field {lsb}..{msb} is reversed");
    }
    Ok((low as u32, (high - low + 1) as u32))
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == tag)
        .and_then(|child| child.text())
        .map(str::trim)
}

fn parse_int(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.with_context(|| format!("invalid integer '{text}'"))
}

fn parse_hex(text: &str) -> Result<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex value '{text}'"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const DESCRIPTION: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<RegisterDescription xmlns="http://www.genicam.org/GenApi/Version_1_1" ModelName="Bench" VendorName="Lab">
  <Category Name="Root"><pFeature>AcquisitionControl</pFeature></Category>
  <Command Name="AcquisitionStart" NameSpace="Standard">
    <pValue>AcquisitionStartReg</pValue>
    <CommandValue>1</CommandValue>
  </Command>
  <IntReg Name="AcquisitionStartReg">
    <Address>0x20000</Address>
    <Length>4</Length>
    <AccessMode>WO</AccessMode>
    <pPort>Device</pPort>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Command Name="AcquisitionStop" NameSpace="Standard">
    <pValue>AcquisitionStopReg</pValue>
    <pCommandValue>StopValue</pCommandValue>
  </Command>
  <IntConst Name="StopValue"><Value>1</Value></IntConst>
  <MaskedIntReg Name="AcquisitionStopReg">
    <Address>0x20000</Address>
    <pAddress>StopOffset</pAddress>
    <Length>4</Length>
    <pPort>Device</pPort>
    <Bit>0</Bit>
    <Endianess>LittleEndian</Endianess>
  </MaskedIntReg>
  <IntConst Name="StopOffset"><Value>4</Value></IntConst>
  <Integer Name="TLParamsLocked">
    <pValue>TLParamsLockedReg</pValue>
  </Integer>
  <StructReg Comment="Lock">
    <Address>0x20010</Address>
    <Length>4</Length>
    <pPort>Device</pPort>
    <Endianess>BigEndian</Endianess>
    <StructEntry Name="TLParamsLockedReg"><Bit>31</Bit></StructEntry>
  </StructReg>
</RegisterDescription>
"#;

    #[test]
    fn resolves_acquisition_commands() -> Result<()> {
        let commands = AcquisitionCommands::from_description(DESCRIPTION)?;

        assert_eq!(commands.start.value, 1);
        assert_eq!(commands.start.register.address, 0x20000);
        assert!(!commands.start.register.is_masked());
        assert_eq!(commands.start.register.encode(1, None)?, vec![0, 0, 0, 1]);

        assert_eq!(commands.stop.register.address, 0x20004);
        assert_eq!((commands.stop.register.shift, commands.stop.register.width), (0, 1));

        // Bit 31 of a big-endian register is its least significant bit.
        let lock = commands.params_lock.expect("lock register");
        assert_eq!((lock.address, lock.shift, lock.width), (0x20010, 0, 1));
        Ok(())
    }

    #[test]
    fn masked_writes_keep_other_bits() -> Result<()> {
        let register = Register {
            address: 0,
            length: 2,
            big_endian: true,
            shift: 4,
            width: 4,
        };
        assert!(register.is_masked());
        let bytes = register.encode(0xA, Some(&[0x12, 0x3F]))?;
        assert_eq!(bytes, vec![0x12, 0xAF]);
        assert_eq!(register.decode(&bytes)?, 0x12AF);
        Ok(())
    }

    #[test]
    fn missing_command_is_an_error() {
        let xml = r#"<RegisterDescription><Command Name="AcquisitionStart"><pValue>Nowhere</pValue></Command></RegisterDescription>"#;
        assert!(AcquisitionCommands::from_description(xml).is_err());
    }

    #[test]
    fn parses_description_urls() -> Result<()> {
        assert_eq!(
            DescriptionUrl::parse("Local:Bench_Cam.zip;8000;1A2?SchemaVersion=1.1.0")?,
            DescriptionUrl::Local {
                file_name: "Bench_Cam.zip".to_string(),
                address: 0x8000,
                length: 0x1A2,
            }
        );
        assert_eq!(
            DescriptionUrl::parse("local:///cam.xml;0x10;0x20")?,
            DescriptionUrl::Local {
                file_name: "cam.xml".to_string(),
                address: 0x10,
                length: 0x20,
            }
        );
        if !cfg!(windows) {
            assert_eq!(
                DescriptionUrl::parse("File:///opt/cams/bench.xml")?,
                DescriptionUrl::File(PathBuf::from("/opt/cams/bench.xml"))
            );
        }
        assert!(DescriptionUrl::parse("http://cams.local/bench.xml").is_err());
        assert!(DescriptionUrl::parse("Local:cam.xml;10").is_err());
        Ok(())
    }

    #[test]
    fn unpacks_zipped_descriptions() -> Result<()> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        writer.start_file("bench.xml", options)?;
        writer.write_all(DESCRIPTION.as_bytes())?;
        let bytes = writer.finish()?.into_inner();

        assert_eq!(description_text("Bench.ZIP", bytes)?, DESCRIPTION);
        Ok(())
    }

    #[test]
    fn plain_descriptions_stop_at_padding() -> Result<()> {
        let mut bytes = b"<RegisterDescription/>".to_vec();
        bytes.extend_from_slice(&[0, 0, 0]);
        assert_eq!(description_text("cam.xml", bytes)?, "<RegisterDescription/>");
        Ok(())
    }
}
