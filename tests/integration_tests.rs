//! Integration tests for the RemoteFX server
//!
//! Each test starts a server on a loopback port and drives it through the
//! full three-stream protocol.
//!
//! Test categories:
//! - Session: handshake, command replies, quit and shutdown
//! - Audio: passthrough, latency compensation, precision
//! - Editor: screen capture and input relay
//!
//! Run with:
//! ```bash
//! cargo test -p remotefx --test integration_tests
//! ```

mod helpers;
mod integration;

pub use integration::*;
