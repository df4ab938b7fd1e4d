//! Control message catalog and frame codec.
//!
//! A frame is an 8-byte header (`type: u32 LE`, `size: u32 LE`) followed by
//! `size` payload bytes. Payload layout is specific to the message type and
//! serialized with bincode (fixed-width ints, little endian), except
//! `Parameters`, which carries a JSON array.

use crate::error::{ProtocolError, Result};
use crate::plugin::ParameterInfo;
use crate::screen::ScreenFrame;
use bincode::Options;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Largest accepted payload (20 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 20 * 1024 * 1024;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 8;

const KEY_STACK_CAPACITY: usize = 8;

pub type KeyCodes = SmallVec<[u16; KEY_STACK_CAPACITY]>;

fn payload_options() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .reject_trailing_bytes()
}

/// Type tags of the message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Quit = 1,
    Result = 2,
    PluginList = 3,
    AddPlugin = 4,
    DelPlugin = 5,
    EditPlugin = 6,
    HidePlugin = 7,
    ScreenCapture = 8,
    Mouse = 9,
    GetPluginSettings = 10,
    PluginSettings = 11,
    Key = 12,
    BypassPlugin = 13,
    UnbypassPlugin = 14,
    ExchangePlugins = 15,
    RecentsList = 16,
    Parameters = 17,
    ParameterValue = 18,
    GetParameterValue = 19,
    Presets = 20,
    Preset = 21,
    RenderFailed = 22,
}

impl MessageType {
    pub const ALL: [MessageType; 22] = [
        MessageType::Quit,
        MessageType::Result,
        MessageType::PluginList,
        MessageType::AddPlugin,
        MessageType::DelPlugin,
        MessageType::EditPlugin,
        MessageType::HidePlugin,
        MessageType::ScreenCapture,
        MessageType::Mouse,
        MessageType::GetPluginSettings,
        MessageType::PluginSettings,
        MessageType::Key,
        MessageType::BypassPlugin,
        MessageType::UnbypassPlugin,
        MessageType::ExchangePlugins,
        MessageType::RecentsList,
        MessageType::Parameters,
        MessageType::ParameterValue,
        MessageType::GetParameterValue,
        MessageType::Presets,
        MessageType::Preset,
        MessageType::RenderFailed,
    ];

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    #[inline]
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Quit => "Quit",
            MessageType::Result => "Result",
            MessageType::PluginList => "PluginList",
            MessageType::AddPlugin => "AddPlugin",
            MessageType::DelPlugin => "DelPlugin",
            MessageType::EditPlugin => "EditPlugin",
            MessageType::HidePlugin => "HidePlugin",
            MessageType::ScreenCapture => "ScreenCapture",
            MessageType::Mouse => "Mouse",
            MessageType::GetPluginSettings => "GetPluginSettings",
            MessageType::PluginSettings => "PluginSettings",
            MessageType::Key => "Key",
            MessageType::BypassPlugin => "BypassPlugin",
            MessageType::UnbypassPlugin => "UnbypassPlugin",
            MessageType::ExchangePlugins => "ExchangePlugins",
            MessageType::RecentsList => "RecentsList",
            MessageType::Parameters => "Parameters",
            MessageType::ParameterValue => "ParameterValue",
            MessageType::GetParameterValue => "GetParameterValue",
            MessageType::Presets => "Presets",
            MessageType::Preset => "Preset",
            MessageType::RenderFailed => "RenderFailed",
        }
    }

    /// Types a client may send to the server as a command.
    pub fn is_command(self) -> bool {
        matches!(
            self,
            MessageType::Quit
                | MessageType::AddPlugin
                | MessageType::DelPlugin
                | MessageType::EditPlugin
                | MessageType::HidePlugin
                | MessageType::Mouse
                | MessageType::Key
                | MessageType::GetPluginSettings
                | MessageType::BypassPlugin
                | MessageType::UnbypassPlugin
                | MessageType::ExchangePlugins
                | MessageType::RecentsList
                | MessageType::Preset
                | MessageType::ParameterValue
                | MessageType::GetParameterValue
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseEventKind {
    Move,
    LeftDown,
    LeftUp,
    LeftDrag,
    RightDown,
    RightUp,
    RightDrag,
    OtherDown,
    OtherUp,
    OtherDrag,
}

/// Pointer event in editor-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseEvent {
    pub kind: MouseEventKind,
    pub x: f32,
    pub y: f32,
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
}

impl MouseEvent {
    pub fn new(kind: MouseEventKind, x: f32, y: f32) -> Self {
        Self {
            kind,
            x,
            y,
            shift: false,
            ctrl: false,
            alt: false,
        }
    }
}

/// One control message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Quit,
    Result {
        rc: i32,
        text: String,
    },
    /// Newline-separated plugin description lines.
    PluginList(String),
    AddPlugin {
        identifier: String,
    },
    DelPlugin {
        index: u32,
    },
    EditPlugin {
        index: u32,
    },
    HidePlugin,
    ScreenCapture(ScreenFrame),
    Mouse(MouseEvent),
    GetPluginSettings {
        index: u32,
    },
    PluginSettings(Vec<u8>),
    Key(KeyCodes),
    BypassPlugin {
        index: u32,
    },
    UnbypassPlugin {
        index: u32,
    },
    ExchangePlugins {
        idx_a: u32,
        idx_b: u32,
    },
    /// Empty as a request, description lines as a response.
    RecentsList(String),
    Parameters(Vec<ParameterInfo>),
    ParameterValue {
        index: u32,
        param_index: u32,
        value: f32,
    },
    GetParameterValue {
        index: u32,
        param_index: u32,
    },
    Presets(Vec<String>),
    Preset {
        index: u32,
        preset: u32,
    },
    RenderFailed {
        index: u32,
        reason: String,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Quit => MessageType::Quit,
            Message::Result { .. } => MessageType::Result,
            Message::PluginList(_) => MessageType::PluginList,
            Message::AddPlugin { .. } => MessageType::AddPlugin,
            Message::DelPlugin { .. } => MessageType::DelPlugin,
            Message::EditPlugin { .. } => MessageType::EditPlugin,
            Message::HidePlugin => MessageType::HidePlugin,
            Message::ScreenCapture(_) => MessageType::ScreenCapture,
            Message::Mouse(_) => MessageType::Mouse,
            Message::GetPluginSettings { .. } => MessageType::GetPluginSettings,
            Message::PluginSettings(_) => MessageType::PluginSettings,
            Message::Key(_) => MessageType::Key,
            Message::BypassPlugin { .. } => MessageType::BypassPlugin,
            Message::UnbypassPlugin { .. } => MessageType::UnbypassPlugin,
            Message::ExchangePlugins { .. } => MessageType::ExchangePlugins,
            Message::RecentsList(_) => MessageType::RecentsList,
            Message::Parameters(_) => MessageType::Parameters,
            Message::ParameterValue { .. } => MessageType::ParameterValue,
            Message::GetParameterValue { .. } => MessageType::GetParameterValue,
            Message::Presets(_) => MessageType::Presets,
            Message::Preset { .. } => MessageType::Preset,
            Message::RenderFailed { .. } => MessageType::RenderFailed,
        }
    }

    pub fn name(&self) -> &'static str {
        self.message_type().name()
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let opts = payload_options();
        let payload = match self {
            Message::Quit | Message::HidePlugin => Vec::new(),
            Message::Result { rc, text } => opts.serialize(&(rc, text))?,
            Message::PluginList(lines) | Message::RecentsList(lines) => opts.serialize(lines)?,
            Message::AddPlugin { identifier } => opts.serialize(identifier)?,
            Message::DelPlugin { index }
            | Message::EditPlugin { index }
            | Message::GetPluginSettings { index }
            | Message::BypassPlugin { index }
            | Message::UnbypassPlugin { index } => opts.serialize(index)?,
            Message::ScreenCapture(frame) => opts.serialize(frame)?,
            Message::Mouse(ev) => opts.serialize(ev)?,
            Message::PluginSettings(data) => opts.serialize(data)?,
            Message::Key(codes) => opts.serialize(codes)?,
            Message::ExchangePlugins { idx_a, idx_b } => opts.serialize(&(idx_a, idx_b))?,
            Message::Parameters(params) => serde_json::to_vec(params)?,
            Message::ParameterValue {
                index,
                param_index,
                value,
            } => opts.serialize(&(index, param_index, value))?,
            Message::GetParameterValue { index, param_index } => {
                opts.serialize(&(index, param_index))?
            }
            Message::Presets(names) => opts.serialize(&join_names(names))?,
            Message::Preset { index, preset } => opts.serialize(&(index, preset))?,
            Message::RenderFailed { index, reason } => opts.serialize(&(index, reason))?,
        };
        Ok(payload)
    }

    /// Append one complete frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let payload = self.encode_payload()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        out.reserve(HEADER_SIZE + payload.len());
        out.extend_from_slice(&self.message_type().tag().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

/// Outcome of a single decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Complete { message: Message, consumed: usize },
    /// At least `needed` more bytes are required before a frame completes.
    Incomplete { needed: usize },
}

#[inline]
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Join preset names with `|`, escaping `|` and `\` inside a name with `\`.
/// Plain names produce the bare `a|b|c` form.
fn join_names(names: &[String]) -> String {
    let mut out = String::new();
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        for c in name.chars() {
            if c == '|' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Inverse of [`join_names`]. An empty string is an empty list, so a list
/// holding one empty name reads back as no presets. A stray trailing `\` is
/// kept literally.
fn split_names(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    let mut names = Vec::new();
    let mut current = String::new();
    let mut chars = joined.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next().unwrap_or('\\')),
            '|' => names.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    names.push(current);
    names
}

/// Decode one frame from the front of `buf`.
///
/// Never consumes a partial frame: a truncated buffer yields
/// [`Decoded::Incomplete`]. An unknown tag or oversized length is an error as
/// soon as the header is available.
pub fn decode(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::Incomplete {
            needed: HEADER_SIZE - buf.len(),
        });
    }

    let tag = le_u32(&buf[0..4]);
    let size = le_u32(&buf[4..8]) as usize;
    let kind = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownTag(tag))?;
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = HEADER_SIZE + size;
    if buf.len() < total {
        return Ok(Decoded::Incomplete {
            needed: total - buf.len(),
        });
    }

    let message = decode_payload(kind, &buf[HEADER_SIZE..total])?;
    Ok(Decoded::Complete {
        message,
        consumed: total,
    })
}

fn decode_payload(kind: MessageType, payload: &[u8]) -> Result<Message> {
    let opts = payload_options();
    let malformed = |reason: String| ProtocolError::Malformed {
        kind: kind.name(),
        reason,
    };
    let bin = |e: bincode::Error| malformed(e.to_string());

    let message = match kind {
        MessageType::Quit | MessageType::HidePlugin => {
            if !payload.is_empty() {
                return Err(malformed(format!(
                    "expected empty payload, got {} bytes",
                    payload.len()
                )));
            }
            if kind == MessageType::Quit {
                Message::Quit
            } else {
                Message::HidePlugin
            }
        }
        MessageType::Result => {
            let (rc, text): (i32, String) = opts.deserialize(payload).map_err(bin)?;
            Message::Result { rc, text }
        }
        MessageType::PluginList => Message::PluginList(opts.deserialize(payload).map_err(bin)?),
        MessageType::RecentsList => Message::RecentsList(opts.deserialize(payload).map_err(bin)?),
        MessageType::AddPlugin => Message::AddPlugin {
            identifier: opts.deserialize(payload).map_err(bin)?,
        },
        MessageType::DelPlugin => Message::DelPlugin {
            index: opts.deserialize(payload).map_err(bin)?,
        },
        MessageType::EditPlugin => Message::EditPlugin {
            index: opts.deserialize(payload).map_err(bin)?,
        },
        MessageType::GetPluginSettings => Message::GetPluginSettings {
            index: opts.deserialize(payload).map_err(bin)?,
        },
        MessageType::BypassPlugin => Message::BypassPlugin {
            index: opts.deserialize(payload).map_err(bin)?,
        },
        MessageType::UnbypassPlugin => Message::UnbypassPlugin {
            index: opts.deserialize(payload).map_err(bin)?,
        },
        MessageType::ScreenCapture => {
            Message::ScreenCapture(opts.deserialize(payload).map_err(bin)?)
        }
        MessageType::Mouse => Message::Mouse(opts.deserialize(payload).map_err(bin)?),
        MessageType::PluginSettings => {
            Message::PluginSettings(opts.deserialize(payload).map_err(bin)?)
        }
        MessageType::Key => Message::Key(opts.deserialize(payload).map_err(bin)?),
        MessageType::ExchangePlugins => {
            let (idx_a, idx_b): (u32, u32) = opts.deserialize(payload).map_err(bin)?;
            Message::ExchangePlugins { idx_a, idx_b }
        }
        MessageType::Parameters => Message::Parameters(
            serde_json::from_slice(payload).map_err(|e| malformed(e.to_string()))?,
        ),
        MessageType::ParameterValue => {
            let (index, param_index, value): (u32, u32, f32) =
                opts.deserialize(payload).map_err(bin)?;
            Message::ParameterValue {
                index,
                param_index,
                value,
            }
        }
        MessageType::GetParameterValue => {
            let (index, param_index): (u32, u32) = opts.deserialize(payload).map_err(bin)?;
            Message::GetParameterValue { index, param_index }
        }
        MessageType::Presets => {
            let joined: String = opts.deserialize(payload).map_err(bin)?;
            Message::Presets(split_names(&joined))
        }
        MessageType::Preset => {
            let (index, preset): (u32, u32) = opts.deserialize(payload).map_err(bin)?;
            Message::Preset { index, preset }
        }
        MessageType::RenderFailed => {
            let (index, reason): (u32, String) = opts.deserialize(payload).map_err(bin)?;
            Message::RenderFailed { index, reason }
        }
    };
    Ok(message)
}

/// Buffers partial reads and yields one complete message per call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed bytes, for streams that interleave raw data with frames.
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Pop the next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        match decode(&self.buf)? {
            Decoded::Complete { message, consumed } => {
                self.buf.drain(..consumed);
                Ok(Some(message))
            }
            Decoded::Incomplete { .. } => Ok(None),
        }
    }
}
