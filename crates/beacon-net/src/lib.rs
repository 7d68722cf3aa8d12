//! beacon-net - framed TCP transport for the beacon discovery mesh
//!
//! - [`framing`] - length-prefixed tagged frames
//! - [`endpoint`] - connect/accept/send/disconnect with fd-like socket ids,
//!   delivering all connection events on a single channel

pub mod endpoint;
pub mod framing;

pub use endpoint::{Endpoint, NetEvent, SocketId};
pub use framing::{Frame, FrameCodec, FrameError, MAX_FRAME_SIZE};
