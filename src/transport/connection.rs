//! One connection to one peer.
//!
//! A [`Transport`] owns the write half of the connection and, on the host
//! side, the listener. Each successful `accept`/`connect`/`attach` hands out
//! a [`TransportReader`] for the read half. Both publish the connection
//! state through a shared `watch` channel.
//!
//! ```text
//! Unattached ──listen──► Connecting ──accept──► Connected ──► Closed
//!      └──────────connect / attach──────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, trace};

use super::socket::{self, SocketListener};
use super::{BoxedReader, BoxedWriter};
use crate::error::{NodelinkError, Result};

/// Largest single write issued to the socket.
pub const CHUNK_SIZE: usize = 4096;

/// Default read buffer size (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unattached,
    Connecting,
    Connected,
    Closed,
}

type StateTx = Arc<watch::Sender<ConnectionState>>;

fn publish(state: &StateTx, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == ConnectionState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Write side of a connection plus its endpoint.
pub struct Transport {
    listener: Option<SocketListener>,
    writer: Option<BoxedWriter>,
    path: Option<PathBuf>,
    state: StateTx,
    read_buffer_size: usize,
    claimed: bool,
}

impl Transport {
    /// Create an unattached transport.
    pub fn new() -> Self {
        Self::with_read_buffer_size(DEFAULT_READ_BUFFER_SIZE)
    }

    /// Create an unattached transport whose readers use `size`-byte reads.
    pub fn with_read_buffer_size(size: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unattached);
        Self {
            listener: None,
            writer: None,
            path: None,
            state: Arc::new(state),
            read_buffer_size: size.max(1),
            claimed: false,
        }
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Socket path this transport listens on or connected to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn claim(&mut self) -> Result<()> {
        if self.claimed {
            return Err(NodelinkError::AlreadyAttached);
        }
        self.claimed = true;
        Ok(())
    }

    /// Bind a local socket at `path` and wait for a peer.
    pub fn listen(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.claim()?;
        let path = path.as_ref();
        let listener = SocketListener::bind(path)?;

        debug!(path = %path.display(), "Listening for peer");
        self.listener = Some(listener);
        self.path = Some(path.to_path_buf());
        publish(&self.state, ConnectionState::Connecting);
        Ok(())
    }

    /// Accept the one peer of a listening transport.
    pub async fn accept(&mut self) -> Result<TransportReader> {
        if self.writer.is_some() {
            return Err(NodelinkError::AlreadyAttached);
        }
        let listener = self.listener.as_mut().ok_or(NodelinkError::NotConnected)?;
        let (reader, writer) = listener.accept().await?;

        debug!("Peer connected");
        Ok(self.install(reader, writer))
    }

    /// Connect to a peer listening at `path`.
    pub async fn connect(&mut self, path: impl AsRef<Path>) -> Result<TransportReader> {
        self.claim()?;
        let path = path.as_ref();
        publish(&self.state, ConnectionState::Connecting);

        let (reader, writer) = match socket::connect(path).await {
            Ok(halves) => halves,
            Err(e) => {
                publish(&self.state, ConnectionState::Closed);
                return Err(e);
            }
        };

        debug!(path = %path.display(), "Connected to peer");
        self.path = Some(path.to_path_buf());
        Ok(self.install(reader, writer))
    }

    /// Adopt an already connected stream.
    pub fn attach<S>(&mut self, stream: S) -> Result<TransportReader>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.claim()?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(self.install(Box::new(reader), Box::new(writer)))
    }

    fn install(&mut self, reader: BoxedReader, writer: BoxedWriter) -> TransportReader {
        self.writer = Some(writer);
        publish(&self.state, ConnectionState::Connected);
        TransportReader {
            reader,
            buf: vec![0u8; self.read_buffer_size],
            state: self.state.clone(),
        }
    }

    /// Write `data` in chunks of at most [`CHUNK_SIZE`] bytes, then flush.
    ///
    /// # Errors
    ///
    /// - `NoData` if `data` is empty
    /// - `ClientNotConnected` if no peer is attached
    /// - `SendFailed` if a write fails
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(NodelinkError::NoData);
        }
        if self.state() == ConnectionState::Closed {
            return Err(NodelinkError::ClientNotConnected);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or(NodelinkError::ClientNotConnected)?;

        for chunk in data.chunks(CHUNK_SIZE) {
            writer
                .write_all(chunk)
                .await
                .map_err(NodelinkError::SendFailed)?;
        }
        writer.flush().await.map_err(NodelinkError::SendFailed)?;

        trace!(bytes = data.len(), "Sent");
        Ok(())
    }

    /// Shut down the connection and remove the socket this transport created.
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if self.listener.take().is_some() {
            debug!("Listener removed");
        }
        if self.state() != ConnectionState::Closed {
            debug!("Transport closed");
        }
        publish(&self.state, ConnectionState::Closed);
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

/// Read half of a connection.
pub struct TransportReader {
    reader: BoxedReader,
    buf: Vec<u8>,
    state: StateTx,
}

impl TransportReader {
    /// Read the next chunk of bytes.
    ///
    /// Returns `None` once the peer hangs up or the read fails. The
    /// connection is then published as `Closed`.
    pub async fn recv(&mut self) -> Option<&[u8]> {
        match self.reader.read(&mut self.buf).await {
            Ok(0) => {
                debug!("Peer closed the connection");
                publish(&self.state, ConnectionState::Closed);
                None
            }
            Ok(n) => {
                trace!(bytes = n, "Received");
                Some(&self.buf[..n])
            }
            Err(e) => {
                error!("Read error: {}", e);
                publish(&self.state, ConnectionState::Closed);
                None
            }
        }
    }
}
