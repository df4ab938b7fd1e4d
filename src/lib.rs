//! # RemoteFX - Remote Audio Plugin Hosting
//!
//! Runs audio plugins on a server on behalf of a remote client.
//!
//! ## Architecture
//!
//! RemoteFX is an umbrella crate that coordinates:
//! - **remotefx-protocol** - Wire format (handshake, control frames, audio chunks, screen frames)
//! - **remotefx-server** - Session engine (processor chain, audio and screen workers, TCP server)
//!
//! ## Quick Start
//!
//! ```ignore
//! use remotefx::prelude::*;
//! use std::sync::Arc;
//!
//! let server = Server::new(
//!     ServerConfig::default(),
//!     Arc::new(BuiltinHost::new()),
//!     Arc::new(HeadlessWindowSystem::new()),
//! )?;
//! server.run().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Protocol and server
//! - `server` - Session engine and TCP server

mod error;

pub use error::{Error, Result};

/// Re-export of remotefx-protocol for direct access
pub use remotefx_protocol as protocol;

/// Re-export of remotefx-server for direct access
#[cfg(feature = "server")]
pub use remotefx_server as server;

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{Error, Result};

    pub use remotefx_protocol::{
        write_message, AudioChunkHeader, AudioFormat, AudioResponseHeader, Handshake, Message,
        MessageType, MidiEvent, MouseEvent, MouseEventKind, ParameterInfo, PluginDescription,
        SampleFormat, ScreenFrame, StreamReader, TransportPosition,
    };

    #[cfg(feature = "server")]
    pub use remotefx_server::{
        BuiltinHost, EditorSurface, HeadlessWindowSystem, PluginHost, Processor, ProcessorChain,
        Server, ServerConfig, ServerHandle, Session, SessionContext, WindowSystem,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: Error = remotefx_protocol::ProtocolError::ConnectionClosed.into();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().starts_with("Protocol:"));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(Error::from(io), Error::Io(_)));
    }

    #[cfg(feature = "server")]
    #[test]
    fn test_server_error_conversion() {
        let err: Error = remotefx_server::ServerError::Config("bad".into()).into();
        assert!(matches!(err, Error::Server(_)));
    }
}
