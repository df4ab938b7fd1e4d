//! Wire protocol for remote plugin hosting
//!
//! A session uses three TCP streams:
//!
//! - **Control**: the client's [`Handshake`], then control frames ([`Message`])
//!   in both directions.
//! - **Audio**: server-initiated connect-back carrying only audio chunks
//!   ([`AudioChunkHeader`] + planar samples + [`MidiEvent`]s +
//!   [`TransportPosition`], answered with [`AudioResponseHeader`] + processed
//!   samples + outgoing MIDI).
//! - **Screen**: a second connect-back carrying only `ScreenCapture` frames.
//!
//! ## Usage
//!
//! ```ignore
//! use remotefx_protocol::{Message, StreamReader, write_message};
//!
//! write_message(&mut stream, &Message::AddPlugin { identifier: "builtin:gain".into() }).await?;
//! let reply = reader.read_message(timeout).await?;
//! ```

pub mod error;
pub use error::{ProtocolError, Result};

pub mod audio;
pub use audio::{
    AudioChunkHeader, AudioResponseHeader, ChunkScan, MidiEvent, Sample, TransportPosition,
};

pub mod handshake;
pub use handshake::{AudioFormat, Handshake, SampleFormat, PROTOCOL_VERSION};

pub mod message;
pub use message::{
    decode, Decoded, FrameDecoder, KeyCodes, Message, MessageType, MouseEvent, MouseEventKind,
    MAX_PAYLOAD_SIZE,
};

mod plugin;
pub use plugin::{descriptions_from_lines, descriptions_to_lines, ParameterInfo, PluginDescription};

pub mod screen;
pub use screen::ScreenFrame;

mod transport;
pub use transport::{write_message, StreamReader};

/// Default control port (plus the server id).
pub const DEFAULT_SERVER_PORT: u16 = 55056;

/// Default client port the server connects back to.
pub const DEFAULT_CLIENT_PORT: u16 = 55055;
