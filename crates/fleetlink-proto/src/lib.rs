//! Fleetlink wire protocol.
//!
//! Devices and the relay exchange self-describing binary frames over a
//! single bidirectional stream. This crate defines the frame envelope,
//! the MessagePack codec, and the protocol/kind constants shared by
//! both sides so that wire strings stay in sync without duplicating
//! literals.

mod frame;
mod protocols;

pub use frame::{decode, encode, Frame, FrameStream, ProtoError};
pub use protocols::*;
