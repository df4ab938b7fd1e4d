//! Session engine for remote plugin hosting
//!
//! A client connects, sends a [`Handshake`](remotefx_protocol::Handshake)
//! and gets a [`Session`] with:
//!
//! - a [`ProcessorChain`] edited through control commands,
//! - an [`AudioWorker`] streaming sample blocks through the chain,
//! - a [`ScreenWorker`] streaming editor captures back.
//!
//! Real plugin formats plug in through [`PluginHost`] and [`WindowSystem`];
//! the [`builtin`] module ships a small processor set and a headless window
//! system.

pub mod audio_worker;
pub mod builtin;
pub mod chain;
pub mod config;
pub mod delay;
pub mod error;
pub mod host;
pub mod recents;
pub mod screen_worker;
pub mod server;
pub mod session;

pub use audio_worker::{AudioWorker, AudioWorkerHandle};
pub use builtin::{BuiltinHost, HeadlessWindowSystem, InputEvent};
pub use chain::{ProcessorChain, RenderFailure};
pub use config::ServerConfig;
pub use error::{CaptureError, RenderError, Result, ServerError, StateError};
pub use host::{
    AudioBuffer, Bounds, EditorSurface, Frame, Modifiers, PluginHost, Processor, WindowSystem,
};
pub use recents::RecentsRegistry;
pub use screen_worker::{FrameDiffer, ScreenState, ScreenWorker};
pub use server::{Server, ServerHandle};
pub use session::{Session, SessionContext, SessionHandle};

pub use remotefx_protocol as protocol;
