//! Host preferences: diff options and extension settings
//!
//! Preferences live in JSON settings files under an `objdiff` section, one
//! for the user and one for the workspace. Nested groups (`"arm": {...}`)
//! are flattened into dotted keys (`arm.archVersion`). Only the entries that
//! differ from the schema defaults are forwarded to builds and diffs.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::constants::app::APP_DIR;
use crate::constants::settings::{BINARY_PATH, FILENAME, SECTION, WORKSPACE_DIR};
use crate::error::WorkspaceError;

/// Primitive setting value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Number(n) => write!(f, "{n}"),
            PropertyValue::String(s) => f.write_str(s),
        }
    }
}

impl PropertyValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            Value::Number(n) => Some(PropertyValue::Number(n.clone())),
            Value::String(s) => Some(PropertyValue::String(s.clone())),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Number(n) => Value::Number(n.clone()),
            PropertyValue::String(s) => Value::String(s.clone()),
        }
    }
}

/// Flattened `key → value` preference map
pub type ConfigProperties = BTreeMap<String, PropertyValue>;

// ==============================================================================
// Schema
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDefault {
    Bool(bool),
    Str(&'static str),
}

impl SchemaDefault {
    fn matches(&self, value: &PropertyValue) -> bool {
        match (self, value) {
            (SchemaDefault::Bool(a), PropertyValue::Bool(b)) => a == b,
            (SchemaDefault::Str(a), PropertyValue::String(b)) => *a == b.as_str(),
            _ => false,
        }
    }

    fn to_value(self) -> PropertyValue {
        match self {
            SchemaDefault::Bool(b) => PropertyValue::Bool(b),
            SchemaDefault::Str(s) => PropertyValue::String(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChoiceItem {
    pub value: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub enum PropertyKind {
    Boolean,
    String,
    Choice(&'static [ChoiceItem]),
}

#[derive(Debug, Clone, Copy)]
pub struct PropertySchema {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: PropertyKind,
    pub default: SchemaDefault,
}

#[derive(Debug, Clone, Copy)]
pub struct PropertyGroup {
    pub id: &'static str,
    pub name: &'static str,
    pub properties: &'static [&'static str],
}

const RELOC_DIFF_ITEMS: &[ChoiceItem] = &[
    ChoiceItem { value: "none", name: "None" },
    ChoiceItem { value: "name_address", name: "Name or address" },
    ChoiceItem { value: "data_value", name: "Data value" },
    ChoiceItem { value: "all", name: "Name or address, data value" },
];

const ARM_ARCH_ITEMS: &[ChoiceItem] = &[
    ChoiceItem { value: "auto", name: "Auto" },
    ChoiceItem { value: "v4t", name: "ARMv4T (GBA)" },
    ChoiceItem { value: "v5te", name: "ARMv5TE (DS)" },
    ChoiceItem { value: "v6k", name: "ARMv6K (3DS)" },
];

const ARM_R9_ITEMS: &[ChoiceItem] = &[
    ChoiceItem { value: "generalPurpose", name: "R9 or V6" },
    ChoiceItem { value: "sb", name: "Static base (SB)" },
    ChoiceItem { value: "tr", name: "TLS register (TR)" },
];

const MIPS_ABI_ITEMS: &[ChoiceItem] = &[
    ChoiceItem { value: "auto", name: "Auto" },
    ChoiceItem { value: "o32", name: "O32" },
    ChoiceItem { value: "n32", name: "N32" },
    ChoiceItem { value: "n64", name: "N64" },
];

const MIPS_INSTR_ITEMS: &[ChoiceItem] = &[
    ChoiceItem { value: "auto", name: "Auto" },
    ChoiceItem { value: "cpu", name: "CPU" },
    ChoiceItem { value: "rsp", name: "RSP (N64)" },
    ChoiceItem { value: "r3000gte", name: "R3000 GTE (PS1)" },
    ChoiceItem { value: "r4000allegrex", name: "R4000 ALLEGREX (PSP)" },
    ChoiceItem { value: "r5900", name: "R5900 EE (PS2)" },
];

const X86_FORMATTER_ITEMS: &[ChoiceItem] = &[
    ChoiceItem { value: "intel", name: "Intel" },
    ChoiceItem { value: "gas", name: "AT&T" },
    ChoiceItem { value: "nasm", name: "NASM" },
    ChoiceItem { value: "masm", name: "MASM" },
];

pub const PROPERTIES: &[PropertySchema] = &[
    PropertySchema {
        id: BINARY_PATH,
        name: "Binary path",
        description: "Path to the diff engine binary. When empty, views diff the raw objects.",
        kind: PropertyKind::String,
        default: SchemaDefault::Str(""),
    },
    PropertySchema {
        id: "functionRelocDiffs",
        name: "Function relocation diffs",
        description: "How relocation targets will be diffed in the function view.",
        kind: PropertyKind::Choice(RELOC_DIFF_ITEMS),
        default: SchemaDefault::Str("name_address"),
    },
    PropertySchema {
        id: "spaceBetweenArgs",
        name: "Space between args",
        description: "Adds a space between arguments in the diff output.",
        kind: PropertyKind::Boolean,
        default: SchemaDefault::Bool(true),
    },
    PropertySchema {
        id: "combineDataSections",
        name: "Combine data sections",
        description: "Combines data sections with equal names.",
        kind: PropertyKind::Boolean,
        default: SchemaDefault::Bool(false),
    },
    PropertySchema {
        id: "combineTextSections",
        name: "Combine text sections",
        description: "Combines all text sections into one.",
        kind: PropertyKind::Boolean,
        default: SchemaDefault::Bool(false),
    },
    PropertySchema {
        id: "arm.archVersion",
        name: "Architecture version",
        description: "ARM architecture version to use for disassembly.",
        kind: PropertyKind::Choice(ARM_ARCH_ITEMS),
        default: SchemaDefault::Str("auto"),
    },
    PropertySchema {
        id: "arm.unifiedSyntax",
        name: "Unified syntax",
        description: "Disassemble as unified assembly language (UAL).",
        kind: PropertyKind::Boolean,
        default: SchemaDefault::Bool(false),
    },
    PropertySchema {
        id: "arm.avRegisters",
        name: "Use A/V registers",
        description: "Display R0-R3 as A1-A4 and R4-R11 as V1-V8.",
        kind: PropertyKind::Boolean,
        default: SchemaDefault::Bool(false),
    },
    PropertySchema {
        id: "arm.r9Usage",
        name: "Display R9 as",
        description: "How R9 is displayed.",
        kind: PropertyKind::Choice(ARM_R9_ITEMS),
        default: SchemaDefault::Str("generalPurpose"),
    },
    PropertySchema {
        id: "mips.abi",
        name: "ABI",
        description: "MIPS ABI to use for disassembly.",
        kind: PropertyKind::Choice(MIPS_ABI_ITEMS),
        default: SchemaDefault::Str("auto"),
    },
    PropertySchema {
        id: "mips.instrCategory",
        name: "Instruction category",
        description: "MIPS instruction category to use for disassembly.",
        kind: PropertyKind::Choice(MIPS_INSTR_ITEMS),
        default: SchemaDefault::Str("auto"),
    },
    PropertySchema {
        id: "ppc.calculatePoolRelocations",
        name: "Calculate pool relocations",
        description: "Display pooled data references in functions as fake relocations.",
        kind: PropertyKind::Boolean,
        default: SchemaDefault::Bool(true),
    },
    PropertySchema {
        id: "x86.formatter",
        name: "Formatter",
        description: "x86 disassembly syntax.",
        kind: PropertyKind::Choice(X86_FORMATTER_ITEMS),
        default: SchemaDefault::Str("intel"),
    },
];

pub const GROUPS: &[PropertyGroup] = &[
    PropertyGroup {
        id: "general",
        name: "General",
        properties: &[
            "functionRelocDiffs",
            "spaceBetweenArgs",
            "combineDataSections",
            "combineTextSections",
        ],
    },
    PropertyGroup {
        id: "arm",
        name: "ARM",
        properties: &["arm.archVersion", "arm.unifiedSyntax", "arm.avRegisters", "arm.r9Usage"],
    },
    PropertyGroup {
        id: "mips",
        name: "MIPS",
        properties: &["mips.abi", "mips.instrCategory"],
    },
    PropertyGroup {
        id: "ppc",
        name: "PowerPC",
        properties: &["ppc.calculatePoolRelocations"],
    },
    PropertyGroup {
        id: "x86",
        name: "x86",
        properties: &["x86.formatter"],
    },
];

pub fn schema(id: &str) -> Option<&'static PropertySchema> {
    PROPERTIES.iter().find(|p| p.id == id)
}

/// Map of every schema property at its default value
pub fn default_properties() -> ConfigProperties {
    PROPERTIES
        .iter()
        .map(|p| (p.id.to_string(), p.default.to_value()))
        .collect()
}

/// Entries that differ from their schema default
///
/// Keys without a schema entry count as modified. Extension settings such as
/// the binary path are not diff options and are never forwarded.
pub fn get_modified(properties: &ConfigProperties) -> ConfigProperties {
    properties
        .iter()
        .filter(|(key, _)| key.as_str() != BINARY_PATH)
        .filter(|(key, value)| match schema(key) {
            Some(schema) => !schema.default.matches(value),
            None => true,
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Flatten one level of nested grouping into dotted keys
pub fn flatten(section: &Map<String, Value>) -> ConfigProperties {
    let mut properties = ConfigProperties::new();
    for (key, value) in section {
        match value {
            Value::Object(group) => {
                for (subkey, subvalue) in group {
                    if let Some(v) = PropertyValue::from_json(subvalue) {
                        properties.insert(format!("{key}.{subkey}"), v);
                    }
                }
            }
            other => {
                if let Some(v) = PropertyValue::from_json(other) {
                    properties.insert(key.clone(), v);
                }
            }
        }
    }
    properties
}

// ==============================================================================
// Store
// ==============================================================================

/// Reads, merges and writes back host preferences
#[derive(Debug)]
pub struct PreferenceStore {
    user_path: Option<PathBuf>,
    workspace_path: PathBuf,
    properties: ConfigProperties,
}

impl PreferenceStore {
    /// Store using the platform user settings file and the workspace one
    pub fn new(root: &Path) -> Self {
        let user_path = dirs::config_dir().map(|dir| dir.join(APP_DIR).join(FILENAME));
        Self::with_paths(user_path, root.join(WORKSPACE_DIR).join(FILENAME))
    }

    pub fn with_paths(user_path: Option<PathBuf>, workspace_path: PathBuf) -> Self {
        Self {
            user_path,
            workspace_path,
            properties: default_properties(),
        }
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    pub fn properties(&self) -> &ConfigProperties {
        &self.properties
    }

    pub fn modified(&self) -> ConfigProperties {
        get_modified(&self.properties)
    }

    pub fn binary_path(&self) -> Option<&str> {
        match self.properties.get(BINARY_PATH) {
            Some(PropertyValue::String(path)) if !path.is_empty() => Some(path),
            _ => None,
        }
    }

    /// Re-read every setting: schema defaults, then user, then workspace
    ///
    /// On failure the previous map is kept.
    pub fn load(&mut self) -> Result<&ConfigProperties, WorkspaceError> {
        let mut properties = default_properties();
        let paths = self.user_path.iter().chain(std::iter::once(&self.workspace_path));
        for path in paths {
            let layer = read_section(path).map_err(|source| WorkspaceError::Settings {
                path: path.clone(),
                source,
            })?;
            properties.extend(layer);
        }
        debug!(count = properties.len(), "Loaded config properties");
        self.properties = properties;
        Ok(&self.properties)
    }

    /// Write `id` into the workspace settings file (`None` removes it) and reload
    pub fn set_property(
        &mut self,
        id: &str,
        value: Option<PropertyValue>,
    ) -> Result<&ConfigProperties, WorkspaceError> {
        let path = self.workspace_path.clone();
        write_property(&path, id, value.as_ref())
            .map_err(|source| WorkspaceError::Settings { path, source })?;
        info!(id = %id, value = ?value, "Updated config property");
        self.load()
    }
}

fn read_document(path: &Path) -> Result<Option<Map<String, Value>>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?
    {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(anyhow!("Settings file {} is not a JSON object", path.display())),
    }
}

/// Properties from one settings file
///
/// Accepts both the nested `{"objdiff": {...}}` form and flat
/// `"objdiff.key"` entries at the top level.
fn read_section(path: &Path) -> Result<ConfigProperties> {
    let Some(document) = read_document(path)? else {
        return Ok(ConfigProperties::new());
    };
    let mut properties = match document.get(SECTION) {
        Some(Value::Object(section)) => flatten(section),
        _ => ConfigProperties::new(),
    };
    let prefix = format!("{SECTION}.");
    for (key, value) in &document {
        if let Some(id) = key.strip_prefix(&prefix) {
            if let Some(v) = PropertyValue::from_json(value) {
                properties.insert(id.to_string(), v);
            }
        }
    }
    Ok(properties)
}

fn write_property(path: &Path, id: &str, value: Option<&PropertyValue>) -> Result<()> {
    let mut document = read_document(path)?.unwrap_or_default();
    // A flat entry would shadow the nested one on the next read
    document.remove(&format!("{SECTION}.{id}"));

    let section = document
        .entry(SECTION)
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(section) = section else {
        return Err(anyhow!("`{SECTION}` in {} is not an object", path.display()));
    };

    let (target, key) = match id.split_once('.') {
        Some((group_id, key)) => {
            let group = section
                .entry(group_id)
                .or_insert_with(|| Value::Object(Map::new()));
            match group {
                Value::Object(group) => (group, key),
                _ => return Err(anyhow!("`{group_id}` in {} is not an object", path.display())),
            }
        }
        None => (section, id),
    };
    match value {
        Some(value) => {
            target.insert(key.to_string(), value.to_json());
        }
        None => {
            target.remove(key);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&Value::Object(document))
        .context("Failed to serialize settings")?;
    fs::write(path, format!("{json}\n"))
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}
