//! Platform-specific local socket implementation.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use nodelink::transport::{generate_socket_path, SocketListener};
//!
//! let path = generate_socket_path(&std::env::temp_dir(), "nodelink");
//! let mut listener = SocketListener::bind(&path)?;
//! let (reader, writer) = listener.accept().await?;
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{BoxedReader, BoxedWriter};
use crate::error::Result;

/// Generate a unique socket path.
///
/// Format:
/// - Unix: `{dir}/{prefix}-{uuid}.sock`
/// - Windows: `\\.\pipe\{prefix}-{uuid}` (`dir` is not used)
pub fn generate_socket_path(dir: &Path, prefix: &str) -> PathBuf {
    let unique = Uuid::new_v4().simple();

    #[cfg(unix)]
    {
        dir.join(format!("{}-{}.sock", prefix, unique))
    }

    #[cfg(windows)]
    {
        let _ = dir;
        PathBuf::from(format!(r"\\.\pipe\{}-{}", prefix, unique))
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener.
    ///
    /// The socket file is removed when the listener is dropped.
    pub struct SocketListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl SocketListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes any stale socket file at the path before binding.
        pub fn bind(path: &Path) -> Result<Self> {
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        /// Accept a single connection, split into read and write halves.
        pub async fn accept(&mut self) -> Result<(BoxedReader, BoxedWriter)> {
            let (stream, _addr) = self.listener.accept().await?;
            let (read_half, write_half) = stream.into_split();
            Ok((Box::new(read_half), Box::new(write_half)))
        }

        /// Get the socket path.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for SocketListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Connect to a listening socket.
    pub async fn connect(path: &Path) -> Result<(BoxedReader, BoxedWriter)> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok((Box::new(read_half), Box::new(write_half)))
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::error::NodelinkError;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    /// Windows Named Pipe listener.
    ///
    /// The pipe instance is created at bind time so a peer can open it as
    /// soon as `bind` returns.
    pub struct SocketListener {
        server: Option<NamedPipeServer>,
        path: PathBuf,
    }

    impl SocketListener {
        /// Create the Named Pipe server instance.
        pub fn bind(path: &Path) -> Result<Self> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)
                .map_err(NodelinkError::Io)?;

            Ok(Self {
                server: Some(server),
                path: path.to_path_buf(),
            })
        }

        /// Accept a single connection, split into read and write halves.
        pub async fn accept(&mut self) -> Result<(BoxedReader, BoxedWriter)> {
            let server = self.server.take().ok_or(NodelinkError::NotConnected)?;
            server.connect().await?;
            let (read_half, write_half) = tokio::io::split(server);
            Ok((Box::new(read_half), Box::new(write_half)))
        }

        /// Get the pipe path.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    /// Connect to a listening pipe.
    pub async fn connect(path: &Path) -> Result<(BoxedReader, BoxedWriter)> {
        let client = ClientOptions::new().open(path).map_err(NodelinkError::Io)?;
        let (read_half, write_half) = tokio::io::split(client);
        Ok((Box::new(read_half), Box::new(write_half)))
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{connect, SocketListener};

#[cfg(windows)]
pub use windows_impl::{connect, SocketListener};
