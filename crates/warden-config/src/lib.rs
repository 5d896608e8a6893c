//! Declarative address-map configuration.
//!
//! A policy author describes the SoC as a collection of named elements, each
//! binding an address range to a metadata identifier. This crate parses that
//! document into structured records and populates a [`TagBus`] from them;
//! the parsing mechanics stop at structured records, everything else is the
//! engine's business.
//!
//! Document shape (addresses are JSON integers or `"0x..."` strings):
//!
//! ```json
//! {
//!   "metadata": { "uart_meta": ["SOC.IO.UART"] },
//!   "SOC": {
//!     "UART0": { "name": "uart_meta", "start": "0x1000", "end": "0x1010" }
//!   }
//! }
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use warden_meta::{MetaError, MetaSetFactory, TagConverter};
use warden_tags::{
    AddressRange, TagBus, TagBusError, TagProvider, UniformTags, WordTags, DEFAULT_GRANULARITY,
};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Key of the root element collection.
pub const ROOT_KEY: &str = "SOC";
/// Key of the metadata definition section.
pub const METADATA_KEY: &str = "metadata";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] io::Error),
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("expected a root '{0}' collection")]
    MissingRoot(&'static str),
    #[error("element {element} is not a map")]
    MalformedElement { element: String },
    #[error("'{field}' field not present for element {element}")]
    MissingField {
        element: String,
        field: &'static str,
    },
    #[error("'{field}' field of element {element} is not {expected}")]
    InvalidField {
        element: String,
        field: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("element {element}: {source}")]
    Register {
        element: String,
        source: TagBusError,
    },
}

/// One parsed configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocElement {
    /// Document key naming the element (e.g. `UART0`).
    pub element: String,
    /// Metadata identifier the element's tag resolves from.
    pub name: String,
    pub range: AddressRange,
    pub heterogeneous: bool,
}

/// Identifiers for the initial PC/register/CSR tags.
///
/// Absent entries fall back to the empty label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDefaults {
    pub pc: Option<String>,
    pub register: Option<String>,
    pub csr: Option<String>,
}

/// Parsed declarative document: address map plus policy metadata.
///
/// The document is consumed once by [`SocTagConfiguration::apply`] (and the
/// section accessors) at engine configuration time and is inert afterwards.
#[derive(Debug, Default)]
pub struct SocTagConfiguration {
    elements: Vec<SocElement>,
    metadata: Vec<(String, Vec<String>)>,
    defaults: TagDefaults,
    entities: Vec<(u64, Vec<String>)>,
    symbols: Vec<(String, u64)>,
}

impl SocTagConfiguration {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let doc = fs::read_to_string(path)?;
        Self::from_json_str(&doc)
    }

    pub fn from_json_str(doc: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(doc)?;
        Self::from_value(&root)
    }

    fn from_value(root: &Value) -> Result<Self> {
        let obj = root
            .as_object()
            .ok_or(ConfigError::MissingRoot(ROOT_KEY))?;

        let soc = obj
            .get(ROOT_KEY)
            .and_then(Value::as_object)
            .ok_or(ConfigError::MissingRoot(ROOT_KEY))?;

        let mut elements = Vec::with_capacity(soc.len());
        for (element_name, node) in soc {
            elements.push(process_element(element_name, node)?);
        }

        let meta = obj
            .get(METADATA_KEY)
            .and_then(Value::as_object)
            .ok_or(ConfigError::MissingRoot(METADATA_KEY))?;

        let mut metadata = Vec::with_capacity(meta.len());
        for (identifier, labels) in meta {
            let list = labels
                .as_array()
                .ok_or_else(|| ConfigError::InvalidField {
                    element: identifier.clone(),
                    field: METADATA_KEY,
                    expected: "a list of labels",
                })?;
            let mut names = Vec::with_capacity(list.len());
            for label in list {
                let name = label.as_str().ok_or_else(|| ConfigError::InvalidField {
                    element: identifier.clone(),
                    field: METADATA_KEY,
                    expected: "a list of labels",
                })?;
                names.push(name.to_owned());
            }
            metadata.push((identifier.clone(), names));
        }

        let defaults = match obj.get("defaults") {
            Some(node) => process_defaults(node)?,
            None => TagDefaults::default(),
        };

        let mut entities = Vec::new();
        if let Some(node) = obj.get("entities") {
            let map = node.as_object().ok_or(ConfigError::MissingRoot("entities"))?;
            for (id, names) in map {
                let id_value = parse_scalar_addr(id).ok_or_else(|| ConfigError::InvalidField {
                    element: id.clone(),
                    field: "entities",
                    expected: "an unsigned entity id",
                })?;
                let list = names
                    .as_array()
                    .ok_or_else(|| ConfigError::InvalidField {
                        element: id.clone(),
                        field: "entities",
                        expected: "a list of metadata identifiers",
                    })?;
                let mut resolved = Vec::with_capacity(list.len());
                for name in list {
                    let name = name.as_str().ok_or_else(|| ConfigError::InvalidField {
                        element: id.clone(),
                        field: "entities",
                        expected: "a list of metadata identifiers",
                    })?;
                    resolved.push(name.to_owned());
                }
                entities.push((id_value, resolved));
            }
        }

        let mut symbols = Vec::new();
        if let Some(node) = obj.get("symbols") {
            let map = node.as_object().ok_or(ConfigError::MissingRoot("symbols"))?;
            for (name, addr) in map {
                let addr = parse_addr(name, "symbols", addr)?;
                symbols.push((name.clone(), addr));
            }
        }

        Ok(Self {
            elements,
            metadata,
            defaults,
            entities,
            symbols,
        })
    }

    /// Elements in document order.
    pub fn elements(&self) -> &[SocElement] {
        &self.elements
    }

    pub fn metadata(&self) -> &[(String, Vec<String>)] {
        &self.metadata
    }

    pub fn defaults(&self) -> &TagDefaults {
        &self.defaults
    }

    pub fn entities(&self) -> &[(u64, Vec<String>)] {
        &self.entities
    }

    pub fn symbols(&self) -> &[(String, u64)] {
        &self.symbols
    }

    /// Builds the meta-set factory from the document's metadata section.
    pub fn build_factory(&self) -> MetaSetFactory {
        let mut factory = MetaSetFactory::new();
        for (identifier, labels) in &self.metadata {
            factory.define(identifier, labels.iter());
        }
        factory
    }

    /// Registers one provider per element on `bus`, in document order.
    ///
    /// Each element's metadata identifier is resolved through `factory` and
    /// canonicalized to a tag by `converter`. The loader itself performs no
    /// overlap detection; the bus's registration error propagates.
    pub fn apply(
        &self,
        bus: &mut TagBus,
        factory: &MetaSetFactory,
        converter: &mut TagConverter,
    ) -> Result<()> {
        for e in &self.elements {
            let set = factory.get_meta_set(&e.name)?;
            let tag = converter.meta_set_to_tag(set);
            let provider = if e.heterogeneous {
                TagProvider::Heterogeneous(WordTags::new(
                    e.range.len(),
                    DEFAULT_GRANULARITY,
                    tag,
                ))
            } else {
                TagProvider::Uniform(UniformTags::new(e.range.len(), tag))
            };
            bus.add_provider(e.range, provider)
                .map_err(|source| ConfigError::Register {
                    element: e.element.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

fn process_element(element_name: &str, node: &Value) -> Result<SocElement> {
    let map = node.as_object().ok_or_else(|| ConfigError::MalformedElement {
        element: element_name.to_owned(),
    })?;

    let name = map
        .get("name")
        .ok_or_else(|| missing(element_name, "name"))?
        .as_str()
        .ok_or_else(|| invalid(element_name, "name", "a metadata identifier string"))?
        .to_owned();

    let start = parse_addr(
        element_name,
        "start",
        map.get("start").ok_or_else(|| missing(element_name, "start"))?,
    )?;
    let end = parse_addr(
        element_name,
        "end",
        map.get("end").ok_or_else(|| missing(element_name, "end"))?,
    )?;

    let heterogeneous = match map.get("heterogeneous") {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| invalid(element_name, "heterogeneous", "a boolean"))?,
        None => false,
    };

    Ok(SocElement {
        element: element_name.to_owned(),
        name,
        range: AddressRange::new(start, end),
        heterogeneous,
    })
}

fn process_defaults(node: &Value) -> Result<TagDefaults> {
    let map = node.as_object().ok_or(ConfigError::MissingRoot("defaults"))?;
    let mut defaults = TagDefaults::default();
    for (key, value) in map {
        let name = value
            .as_str()
            .ok_or_else(|| invalid(key, "defaults", "a metadata identifier string"))?
            .to_owned();
        match key.as_str() {
            "pc" => defaults.pc = Some(name),
            "register" => defaults.register = Some(name),
            "csr" => defaults.csr = Some(name),
            _ => {
                return Err(ConfigError::InvalidField {
                    element: key.clone(),
                    field: "defaults",
                    expected: "one of 'pc', 'register', 'csr'",
                })
            }
        }
    }
    Ok(defaults)
}

fn missing(element: &str, field: &'static str) -> ConfigError {
    ConfigError::MissingField {
        element: element.to_owned(),
        field,
    }
}

fn invalid(element: &str, field: &'static str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidField {
        element: element.to_owned(),
        field,
        expected,
    }
}

/// Addresses may be JSON integers or strings in decimal or `0x` hex.
fn parse_addr(element: &str, field: &'static str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| invalid(element, field, "an unsigned address")),
        Value::String(s) => {
            parse_scalar_addr(s).ok_or_else(|| invalid(element, field, "an unsigned address"))
        }
        _ => Err(invalid(element, field, "an unsigned address")),
    }
}

fn parse_scalar_addr(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
