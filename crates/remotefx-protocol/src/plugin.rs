//! Plugin descriptions and parameter metadata exchanged with the client.

use serde::{Deserialize, Serialize};

/// Plugin description as listed to the client.
///
/// On the wire this is a single `name|vendor|identifier|format` line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescription {
    /// Human-readable name
    pub name: String,

    /// Vendor/author name
    pub vendor: String,

    /// Identifier used with `AddPlugin`
    pub identifier: String,

    /// Plugin format name (e.g. "VST3", "Builtin")
    pub format: String,
}

impl PluginDescription {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: String::new(),
            identifier: identifier.into(),
            format: String::new(),
        }
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.name, self.vendor, self.identifier, self.format
        )
    }

    /// Parse a description line. Missing trailing fields are left empty.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut parts = line.split('|');
        let name = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            name: name.to_string(),
            vendor: parts.next().unwrap_or_default().to_string(),
            identifier: parts.next().unwrap_or_default().to_string(),
            format: parts.next().unwrap_or_default().to_string(),
        })
    }
}

/// Join descriptions into the newline-separated list format.
pub fn descriptions_to_lines(list: &[PluginDescription]) -> String {
    let mut out = String::new();
    for desc in list {
        out.push_str(&desc.to_line());
        out.push('\n');
    }
    out
}

pub fn descriptions_from_lines(text: &str) -> Vec<PluginDescription> {
    text.lines()
        .filter(|l| !l.is_empty())
        .filter_map(PluginDescription::from_line)
        .collect()
}

/// Parameter metadata. Values are normalized 0..1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub index: u32,
    pub name: String,
    pub label: String,
    pub default_value: f32,
    pub num_steps: u32,
    pub automatable: bool,
}

impl ParameterInfo {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            label: String::new(),
            default_value: 0.0,
            num_steps: 0,
            automatable: true,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn default_value(mut self, value: f32) -> Self {
        self.default_value = value;
        self
    }
}
