//! Transports that carry envelope frames.
//!
//! The router and clients only ever see a `FrameChannel`: a pair of bounded
//! queues of complete frames, one per direction. Adapters turn concrete
//! transports into frame channels.
//!
//! # Architecture
//!
//! - **Channel**: in-process frame pairs, the common currency of all adapters
//! - **Protocol**: 4-byte length-prefixed framing for byte streams
//! - **Server**: TCP listener handing each accepted peer to a `FrameAcceptor`
//! - **Client**: TCP connector producing a frame channel for an `RpcClient`

pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;

pub use channel::{frame_pair, FrameChannel};
pub use client::connect_tcp;
pub use protocol::{read_frame, write_frame};
pub use server::{FrameAcceptor, IpcServer, IpcServerHandle};
