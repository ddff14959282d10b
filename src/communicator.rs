//! Communicator builder and runtime loops.
//!
//! The [`CommunicatorBuilder`] provides a fluent API for configuring limits
//! and handlers. The [`Communicator`] is the running endpoint:
//!
//! 1. A writer task owns the transport and sends frames in order
//! 2. A read loop reassembles frames and dispatches them
//! 3. Requests are correlated with their responses through a pending table
//! 4. Incoming calls go through one ordered dispatcher, so handlers start
//!    in stream order and then run concurrently
//!
//! Both ends of a channel are `Communicator`s. The host usually calls
//! [`CommunicatorBuilder::listen`] or [`CommunicatorBuilder::launch`], the
//! peer calls [`CommunicatorBuilder::connect`].
//!
//! # Example
//!
//! ```ignore
//! use nodelink::{handler::BoxError, Communicator};
//!
//! let host = Communicator::builder()
//!     .method("log", |entry: serde_json::Value| async move {
//!         println!("{}", entry);
//!         Ok::<_, BoxError>(())
//!     })
//!     .listen()?;
//!
//! // Queued until the peer connects.
//! let sum: i64 = host.request("add", &serde_json::json!({"a": 1, "b": 2})).await?;
//! host.terminate().await;
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::Poll;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::error::{NodelinkError, Result};
use crate::handler::{BoxError, BoxFuture, HandlerRegistry, HandlerResult};
use crate::pending::{CloseReason, PendingCalls};
use crate::protocol::{
    encode_frame, FrameBuffer, Message, Params, Request, RequestId, Response, RpcError,
    DEFAULT_MAX_BUFFERED,
};
use crate::runtime::PeerProcess;
use crate::transport::{
    generate_socket_path, ConnectionState, Transport, TransportReader, DEFAULT_READ_BUFFER_SIZE,
};
use crate::writer::{writer_channel, writer_loop, AcceptHook, WriterConfig, WriterHandle};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default prefix for generated socket names.
pub const DEFAULT_SOCKET_PREFIX: &str = "nodelink";

/// Builder for configuring and creating a [`Communicator`].
pub struct CommunicatorBuilder {
    registry: HandlerRegistry,
    writer_config: WriterConfig,
    max_concurrent_handlers: usize,
    request_timeout: Option<Duration>,
    socket_dir: Option<PathBuf>,
    socket_prefix: String,
    read_buffer_size: usize,
    max_buffered_bytes: usize,
}

impl CommunicatorBuilder {
    /// Create a new communicator builder.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            writer_config: WriterConfig::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            request_timeout: None,
            socket_dir: None,
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED,
        }
    }

    /// Register a typed method handler.
    ///
    /// Params decode into `T`, the `Ok` value is sent back as the result.
    pub fn method<F, T, Fut, R, E>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.registry.register(name, handler);
        self
    }

    /// Register a method handler over raw params.
    pub fn raw_method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Option<Params>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register_raw(name, handler);
        self
    }

    /// Set the directory for generated socket paths.
    ///
    /// Default: the system temp directory. Ignored on Windows.
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// Set the prefix for generated socket names.
    ///
    /// Default: `"nodelink"`
    pub fn socket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.socket_prefix = prefix.into();
        self
    }

    /// Set a deadline applied to every `request` by default.
    ///
    /// Default: none (wait until the response or the connection ends)
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// At the limit, requests are answered with a capacity error and
    /// notifies wait for a free slot.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Set how long closing may spend writing queued frames.
    ///
    /// After that the writer is aborted, which matters when the peer has
    /// stopped reading.
    /// Default: 1 second
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.close_timeout = timeout;
        self
    }

    /// Set the size of each socket read.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the ceiling on bytes held for an unfinished frame.
    ///
    /// Default: 64 MiB
    pub fn max_buffered_bytes(mut self, limit: usize) -> Self {
        self.max_buffered_bytes = limit;
        self
    }

    /// Bind a fresh socket endpoint and return without waiting for the peer.
    ///
    /// Calls made before the peer connects are queued and sent in order
    /// once it does. The endpoint is available from
    /// [`Communicator::socket_path`].
    pub fn listen(self) -> Result<Communicator> {
        let dir = self.socket_dir.clone().unwrap_or_else(std::env::temp_dir);
        let path = generate_socket_path(&dir, &self.socket_prefix);

        let mut transport = Transport::with_read_buffer_size(self.read_buffer_size);
        transport.listen(&path)?;

        Ok(self.start(transport, Connection::Accept, Some(path)))
    }

    /// Connect to a communicator listening at `path`.
    pub async fn connect(self, path: impl AsRef<Path>) -> Result<Communicator> {
        let path = path.as_ref().to_path_buf();
        let mut transport = Transport::with_read_buffer_size(self.read_buffer_size);
        let reader = transport.connect(&path).await?;

        Ok(self.start(transport, Connection::Ready(reader), Some(path)))
    }

    /// Run over an already connected stream.
    pub fn attach<S>(self, stream: S) -> Result<Communicator>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut transport = Transport::with_read_buffer_size(self.read_buffer_size);
        let reader = transport.attach(stream)?;

        Ok(self.start(transport, Connection::Ready(reader), None))
    }

    /// Listen, then start the peer runtime with the socket path as its argument.
    ///
    /// The process is killed by [`Communicator::terminate`].
    pub async fn launch(self, command: Command) -> Result<Communicator> {
        let communicator = self.listen()?;

        let path = communicator
            .socket_path()
            .map(Path::to_path_buf)
            .ok_or(NodelinkError::NotConnected)?;

        match PeerProcess::spawn(command, &path) {
            Ok(process) => {
                *communicator.inner.peer.lock().await = Some(process);
                Ok(communicator)
            }
            Err(e) => {
                communicator.terminate().await;
                Err(e)
            }
        }
    }

    fn start(
        self,
        transport: Transport,
        connection: Connection,
        socket_path: Option<PathBuf>,
    ) -> Communicator {
        let state = transport.subscribe();
        let (writer, inbox) = writer_channel(&self.writer_config);

        let inner = Arc::new(Inner {
            registry: RwLock::new(self.registry),
            pending: PendingCalls::new(),
            state,
            handler_permits: Arc::new(Semaphore::new(self.max_concurrent_handlers.max(1))),
            peer: Mutex::new(None),
            socket_path,
            request_timeout: self.request_timeout,
        });

        let communicator = Communicator { inner, writer };
        let max_buffered = self.max_buffered_bytes;

        let on_accept = match connection {
            Connection::Accept => {
                let comm = communicator.clone();
                let hook: AcceptHook = Box::new(move |reader| {
                    tokio::spawn(comm.read_loop(reader, max_buffered));
                });
                Some(hook)
            }
            Connection::Ready(reader) => {
                tokio::spawn(communicator.clone().read_loop(reader, max_buffered));
                None
            }
        };

        tokio::spawn(writer_loop(transport, inbox, on_accept));
        tokio::spawn(monitor_close(communicator.inner.clone()));

        communicator
    }
}

impl Default for CommunicatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Connection {
    /// Listening; the writer accepts the peer.
    Accept,
    /// Already connected.
    Ready(TransportReader),
}

struct Inner {
    registry: RwLock<HandlerRegistry>,
    pending: PendingCalls,
    state: watch::Receiver<ConnectionState>,
    handler_permits: Arc<Semaphore>,
    peer: Mutex<Option<PeerProcess>>,
    socket_path: Option<PathBuf>,
    request_timeout: Option<Duration>,
}

impl Inner {
    fn registry(&self) -> RwLockReadGuard<'_, HandlerRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HandlerRegistry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fail outstanding calls once the connection is gone.
async fn monitor_close(inner: Arc<Inner>) {
    let mut state = inner.state.clone();
    // An error means the transport itself is gone, which is a close too.
    let _ = state
        .wait_for(|s| *s == ConnectionState::Closed)
        .await
        .map(|_| ());

    let failed = inner.pending.fail_all(CloseReason::ConnectionClosed);
    if failed > 0 {
        warn!(failed, "Connection closed with requests outstanding");
    }
    debug!("Connection closed");
}

/// One end of a JSON-RPC channel.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
    writer: WriterHandle,
}

impl Communicator {
    /// Create a new communicator builder.
    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::new()
    }

    /// Send a one-way call. Returns once the call is queued for sending.
    pub async fn notify<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        self.inner.pending.ensure_open()?;
        let params = JsonCodec::to_params(params)?;
        self.send_message(Request::notify(method, params).into())
            .await
            .map_err(|e| self.closed_or(e))
    }

    /// Call a method and decode its result into `R`.
    ///
    /// Uses the builder's default deadline, if any.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call(method, params, self.inner.request_timeout).await?;
        JsonCodec::decode(value)
    }

    /// Call a method and return its raw result.
    pub async fn request_value<P>(&self, method: &str, params: &P) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        self.call(method, params, self.inner.request_timeout).await
    }

    /// Call a method, giving up after `timeout`.
    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call(method, params, Some(timeout)).await?;
        JsonCodec::decode(value)
    }

    async fn call<P>(&self, method: &str, params: &P, timeout: Option<Duration>) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        let params = JsonCodec::to_params(params)?;

        // Registered before sending, so even an instant reply finds its entry.
        let (id, rx) = self.inner.pending.register()?;
        let request = Request::call(method, params, id.clone());

        if let Err(e) = self.send_message(request.into()).await {
            self.inner.pending.remove(&id);
            return Err(self.closed_or(e));
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.pending.remove(&id);
                    debug!(method, id = %id, "Request timed out");
                    return Err(NodelinkError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        // A dropped sender means the table went away with the connection.
        outcome.unwrap_or_else(|_| Err(self.closed_or(NodelinkError::ConnectionClosed)))
    }

    /// Register a typed method handler. Replaces any handler of that name.
    pub fn register<F, T, Fut, R, E>(&self, name: &str, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.inner.registry_mut().register(name, handler);
    }

    /// Register a method handler over raw params.
    pub fn register_raw<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Option<Params>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.registry_mut().register_raw(name, handler);
    }

    /// Remove a method handler. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.registry_mut().unregister(name)
    }

    /// Fail outstanding calls, kill the peer process and close the connection.
    ///
    /// The peer is killed before the connection is closed, so a runtime that
    /// stopped reading cannot hold this up. Closing gives queued frames up to
    /// the close timeout, then aborts the writer.
    ///
    /// Later calls fail with [`NodelinkError::Terminated`]. Safe to call more
    /// than once.
    pub async fn terminate(&self) {
        let failed = self.inner.pending.fail_all(CloseReason::Terminated);

        let peer = self.inner.peer.lock().await.take();
        if let Some(mut peer) = peer {
            if let Err(e) = peer.kill().await {
                warn!("Failed to kill peer runtime: {}", e);
            }
        }

        self.writer.close().await;

        debug!(failed, "Communicator terminated");
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the peer is connected.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the connection ends first.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state = self.inner.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);

        match reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(self.closed_or(NodelinkError::ConnectionClosed)),
        }
    }

    /// Wait until the connection is closed.
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.clone();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .map(|_| ());
    }

    /// Socket path this communicator listens on or connected to.
    pub fn socket_path(&self) -> Option<&Path> {
        self.inner.socket_path.as_deref()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Output the launched peer runtime has printed so far.
    pub async fn console_output(&self) -> Option<String> {
        self.inner
            .peer
            .lock()
            .await
            .as_ref()
            .map(PeerProcess::console_output)
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }

    /// Get the current pending frame count.
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    /// Prefer the close reason over whatever error the writer reported.
    fn closed_or(&self, error: NodelinkError) -> NodelinkError {
        match self.inner.pending.closed() {
            Some(reason) => reason.to_error(),
            None => error,
        }
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let payload = message.encode()?;
        self.writer.send(encode_frame(&payload)).await
    }

    async fn reply(&self, response: Response) {
        let id = response.id.clone();
        if let Err(e) = self.send_message(response.into()).await {
            warn!(id = %id, "Failed to send response: {}", e);
        }
    }

    /// Main read loop - reassembles frames and dispatches them in order.
    ///
    /// Responses are resolved here directly. Calls go to the dispatcher task
    /// in the order their frames completed, so a slow or waiting handler
    /// never holds up responses.
    async fn read_loop(self, mut reader: TransportReader, max_buffered: usize) {
        let mut frame_buffer = FrameBuffer::with_max_buffered(max_buffered);
        let mut state = self.inner.state.clone();

        let (calls, queue) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().dispatch_loop(queue));

        loop {
            let bytes = tokio::select! {
                bytes = reader.recv() => bytes,
                // Closed from our side, possibly while the peer is silent.
                _ = wait_until_closed(&mut state) => None,
            };
            let Some(bytes) = bytes else { break };

            for frame in frame_buffer.push(bytes) {
                self.dispatch(frame.payload(), &calls);
            }
        }

        debug!("Read loop finished");
        // Tear down the write side too, which also removes the socket file.
        self.writer.close().await;
    }

    /// Route one frame payload.
    fn dispatch(&self, payload: &[u8], calls: &mpsc::UnboundedSender<Request>) {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                return;
            }
        };

        match message {
            Message::Response(response) => {
                let outcome = response.outcome.map_err(NodelinkError::Rpc);
                if !self.inner.pending.resolve(&response.id, outcome) {
                    warn!(id = %response.id, "Dropping response with no pending request");
                }
            }
            Message::Request(request) => {
                if calls.send(request).is_err() {
                    debug!("Dispatcher gone, dropping call");
                }
            }
        }
    }

    /// Start incoming calls one at a time, in stream order.
    async fn dispatch_loop(self, mut calls: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = calls.recv().await {
            self.dispatch_request(request).await;
        }
    }

    async fn dispatch_request(&self, request: Request) {
        let Request { method, params, id } = request;

        let handler = self.inner.registry().get(&method);
        let Some(handler) = handler else {
            match id {
                Some(id) => {
                    warn!(method = %method, "Method not found");
                    self.reply(Response::failure(id, RpcError::method_not_found()))
                        .await;
                }
                None => warn!(method = %method, "Dropping notify for unknown method"),
            }
            return;
        };

        let permits = self.inner.handler_permits.clone();
        let permit = match &id {
            Some(id) => match permits.try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(method = %method, "Handler capacity reached, rejecting request");
                    self.reply(Response::failure(id.clone(), RpcError::handler_capacity()))
                        .await;
                    return;
                }
            },
            // A notify has no way to report rejection, so it waits its turn.
            None => match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let mut call = handler.call(params);

        // Run the handler up to its first suspension point right here, so
        // handlers begin in the order their calls arrived.
        match poll_once(&mut call).await {
            Poll::Ready(result) => {
                drop(permit);
                self.finish(&method, id, result).await;
            }
            Poll::Pending => {
                let communicator = self.clone();
                tokio::spawn(async move {
                    let result = call.await;
                    drop(permit);
                    communicator.finish(&method, id, result).await;
                });
            }
        }
    }

    /// Reply to a finished call. Notifies never get a reply.
    async fn finish(&self, method: &str, id: Option<RequestId>, result: HandlerResult) {
        let Some(id) = id else {
            if let Err(e) = result {
                warn!(method, "Notify handler failed: {}", e);
            }
            return;
        };

        let response = match result {
            Ok(value) => Response::success(id, value),
            Err(e) => {
                debug!(method, "Handler error: {}", e);
                Response::failure(id, RpcError::handler_error(e.to_string()))
            }
        };
        self.reply(response).await;
    }
}

/// Poll a handler future a single time.
async fn poll_once(call: &mut BoxFuture<'static, HandlerResult>) -> Poll<HandlerResult> {
    std::future::poll_fn(|cx| Poll::Ready(call.as_mut().poll(cx))).await
}

async fn wait_until_closed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|s| *s == ConnectionState::Closed)
        .await
        .map(|_| ());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = CommunicatorBuilder::default();

        assert_eq!(builder.max_concurrent_handlers, DEFAULT_MAX_CONCURRENT_HANDLERS);
        assert_eq!(builder.socket_prefix, DEFAULT_SOCKET_PREFIX);
        assert_eq!(builder.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(builder.max_buffered_bytes, DEFAULT_MAX_BUFFERED);
        assert!(builder.request_timeout.is_none());
        assert!(builder.socket_dir.is_none());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Communicator::builder()
            .max_concurrent_handlers(512)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10))
            .close_timeout(Duration::from_millis(250))
            .request_timeout(Duration::from_secs(3))
            .socket_dir("/var/run/app")
            .socket_prefix("app")
            .read_buffer_size(1024)
            .max_buffered_bytes(4096);

        assert_eq!(builder.max_concurrent_handlers, 512);
        assert_eq!(builder.writer_config.max_pending_frames, 2048);
        assert_eq!(builder.writer_config.channel_capacity, 512);
        assert_eq!(builder.writer_config.backpressure_timeout, Duration::from_secs(10));
        assert_eq!(builder.writer_config.close_timeout, Duration::from_millis(250));
        assert_eq!(builder.request_timeout, Some(Duration::from_secs(3)));
        assert_eq!(builder.socket_dir, Some(PathBuf::from("/var/run/app")));
        assert_eq!(builder.socket_prefix, "app");
        assert_eq!(builder.read_buffer_size, 1024);
        assert_eq!(builder.max_buffered_bytes, 4096);
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = Communicator::builder()
            .method("echo", |v: Value| async move { Ok::<_, BoxError>(v) })
            .raw_method("raw", |_| async { Ok::<_, BoxError>(Value::Null) });

        assert!(builder.registry.contains("echo"));
        assert!(builder.registry.contains("raw"));
    }
}
