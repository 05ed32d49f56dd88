//! Mesh relay protocol definitions
//!
//! This crate defines the frames exchanged between a CLI instance and the
//! relay, and the versioned codec that puts them on the wire. Every frame
//! carries an explicit kind discriminant, so a zero-length traffic payload
//! (half-close) can never be confused with a route-setup frame.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameCodec};
pub use frame::*;

/// Protocol version written in the first byte of every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
