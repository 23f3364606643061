//! TCP transport used by subchannels.
//!
//! Frames are `[4-byte length prefix as u32 big-endian] + [JSON data]`, capped
//! at [`MAX_MESSAGE_SIZE`].

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::JsonCodec;
pub use tcp::{TcpTransport, MAX_MESSAGE_SIZE};
pub use tcp_server::TcpServer;

#[cfg(test)]
mod tests;
