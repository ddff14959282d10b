//! Transport module - local socket connection handling.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//! - any in-memory stream (`Transport::attach`)

mod connection;
mod socket;

use tokio::io::{AsyncRead, AsyncWrite};

pub use connection::{
    ConnectionState, Transport, TransportReader, CHUNK_SIZE, DEFAULT_READ_BUFFER_SIZE,
};
pub use socket::{connect, generate_socket_path, SocketListener};

/// Read half of a connection, independent of the platform stream type.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection, independent of the platform stream type.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
