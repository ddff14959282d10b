//! Dedicated writer task that owns the write side of the connection.
//!
//! Every outbound frame goes through one mpsc channel into one task. That
//! task is the only code that writes to the transport, so frames never
//! interleave and leave in enqueue order.
//!
//! # Flow
//!
//! ```text
//! notify ────┐
//! request ───┼─► mpsc::Sender<WriterCommand> ─► Writer Task ─► Transport
//! handler N ─┘                                      │
//!                                               SendQueue (until connected)
//! ```
//!
//! On the host side the task starts before a peer exists. It accepts the
//! connection itself and holds frames in a [`SendQueue`] meanwhile. Once the
//! peer is in, the queue is flushed in order and later frames follow it.
//!
//! Closing is graceful first: a `Close` command queues behind the frames
//! already sent. If the peer stops reading, that drain never finishes, so
//! after `close_timeout` the handle raises an abort signal. The task watches
//! it next to every await, including a blocked write, and closes at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{NodelinkError, Result};
use crate::transport::{Transport, TransportReader};

/// Frames in flight before `send` starts waiting.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Bound of the command channel into the writer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long `send` waits for the writer to catch up.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a close may spend draining before the writer is aborted.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames coalesced into one transport write.
const MAX_BATCH_SIZE: usize = 64;

/// Instructions for the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    /// An encoded frame to transmit.
    Frame(Bytes),
    /// Close the transport, then acknowledge.
    Close(Option<oneshot::Sender<()>>),
}

/// Called once with the read half when the writer accepts its peer.
pub type AcceptHook = Box<dyn FnOnce(TransportReader) + Send>;

/// Frames waiting for the connection to exist.
#[derive(Debug, Default)]
pub struct SendQueue {
    frames: VecDeque<Bytes>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Writer limits, set through the communicator builder.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames in flight before senders wait.
    pub max_pending_frames: usize,
    /// Command channel bound.
    pub channel_capacity: usize,
    /// Longest a sender waits for room.
    pub backpressure_timeout: Duration,
    /// Longest a close waits for queued frames to drain.
    pub close_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Sending side of the writer task. Every communicator clone holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
    /// Frames accepted but not yet written.
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
    abort: Arc<watch::Sender<bool>>,
    close_timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<WriterCommand>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> (Self, watch::Receiver<bool>) {
        let (abort, aborted) = watch::channel(false);
        let handle = Self {
            tx,
            pending,
            max_pending,
            timeout,
            abort: Arc::new(abort),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        };
        (handle, aborted)
    }

    /// Hand an encoded frame to the writer.
    ///
    /// Waits while too many frames are in flight and gives up with
    /// `BackpressureTimeout` after the configured limit.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Count before sending so the writer never decrements below zero.
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx
            .send(WriterCommand::Frame(frame))
            .await
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::Release);
                NodelinkError::ConnectionClosed
            })
    }

    /// Like [`send`](Self::send), but fails at once instead of waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            return Err(NodelinkError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(WriterCommand::Frame(frame)).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => NodelinkError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => NodelinkError::ConnectionClosed,
            }
        })
    }

    /// Ask the writer to close the transport and wait until it has.
    ///
    /// Frames enqueued before this call are written first, unless that takes
    /// longer than the close timeout; then the writer is aborted and the
    /// rest is discarded. Returns at once if the writer is already gone.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let drained = tokio::time::timeout(self.close_timeout, async {
            if self.tx.send(WriterCommand::Close(Some(ack_tx))).await.is_ok() {
                let _ = ack_rx.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                pending = self.pending_count(),
                "Peer is not reading, aborting writer"
            );
            self.abort().await;
        }
    }

    /// Stop the writer now, dropping whatever it has not written yet.
    ///
    /// Works even while a write is blocked on a peer that stopped reading.
    pub async fn abort(&self) {
        self.abort.send_replace(true);
        // The receiver goes away when the task ends.
        self.tx.closed().await;
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(NodelinkError::BackpressureTimeout);
            }

            if self.tx.is_closed() {
                return Err(NodelinkError::ConnectionClosed);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Whether senders would have to wait right now.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames accepted but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start a writer task for `transport`.
///
/// With `on_accept` set, the transport must be listening: the task accepts
/// the peer, passes the read half to the hook, then flushes queued frames.
/// Without it, the transport must already be connected.
pub fn spawn_writer_task(
    transport: Transport,
    config: WriterConfig,
    on_accept: Option<AcceptHook>,
) -> (WriterHandle, JoinHandle<()>) {
    let (handle, inbox) = writer_channel(&config);
    let task = tokio::spawn(writer_loop(transport, inbox, on_accept));
    (handle, task)
}

/// Receiving side of the writer, consumed by [`writer_loop`].
pub(crate) struct WriterInbox {
    commands: mpsc::Receiver<WriterCommand>,
    aborted: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
}

/// Create the handle and the receiving end separately.
///
/// Lets the caller build whatever the accept hook needs (which usually
/// includes the handle) before the task starts.
pub(crate) fn writer_channel(config: &WriterConfig) -> (WriterHandle, WriterInbox) {
    let (tx, commands) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let (mut handle, aborted) = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );
    handle.close_timeout = config.close_timeout;

    let inbox = WriterInbox {
        commands,
        aborted,
        pending,
    };
    (handle, inbox)
}

/// Main writer loop.
pub(crate) async fn writer_loop(
    mut transport: Transport,
    inbox: WriterInbox,
    on_accept: Option<AcceptHook>,
) {
    let WriterInbox {
        mut commands,
        mut aborted,
        pending,
    } = inbox;

    let ack = tokio::select! {
        biased;

        _ = abort_requested(&mut aborted) => {
            debug!("Writer aborted");
            None
        }
        ack = drive(&mut transport, &mut commands, &pending, on_accept) => ack,
    };

    transport.close().await;
    pending.store(0, Ordering::Release);
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
    debug!("Writer task finished");
}

/// Resolves once an abort is raised. Never resolves if every handle is gone
/// without one, so the channel can still be drained.
async fn abort_requested(aborted: &mut watch::Receiver<bool>) {
    if aborted.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Accept if needed, then write frames until closed. Returns the close ack.
async fn drive(
    transport: &mut Transport,
    rx: &mut mpsc::Receiver<WriterCommand>,
    pending: &AtomicUsize,
    on_accept: Option<AcceptHook>,
) -> Option<oneshot::Sender<()>> {
    if let Some(on_accept) = on_accept {
        match accept_phase(transport, rx).await {
            AcceptOutcome::Accepted(reader, mut queue) => {
                on_accept(reader);
                debug!(queued = queue.len(), "Flushing queued frames");
                if let Err(e) = flush_queue(transport, &mut queue, pending).await {
                    error!("Write failed: {}", e);
                    return None;
                }
            }
            AcceptOutcome::Stopped(ack) => return ack,
        }
    }

    loop {
        let first = match rx.recv().await {
            Some(command) => command,
            // All handles dropped.
            None => break None,
        };

        let mut batch = BytesMut::new();
        let mut frames = 0;
        let mut close = None;

        match first {
            WriterCommand::Frame(frame) => {
                batch.extend_from_slice(&frame);
                frames += 1;
            }
            WriterCommand::Close(ack) => close = Some(ack),
        }

        // Coalesce whatever else is already waiting.
        while close.is_none() && frames < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriterCommand::Frame(frame)) => {
                    batch.extend_from_slice(&frame);
                    frames += 1;
                }
                Ok(WriterCommand::Close(ack)) => close = Some(ack),
                Err(_) => break,
            }
        }

        if frames > 0 {
            let result = transport.send(&batch).await;
            pending.fetch_sub(frames, Ordering::Release);
            trace!(frames, bytes = batch.len(), "Batch written");
            if let Err(e) = result {
                error!("Write failed: {}", e);
                break None;
            }
        }

        if let Some(ack) = close {
            break ack;
        }
    }
}

enum AcceptOutcome {
    Accepted(TransportReader, SendQueue),
    Stopped(Option<oneshot::Sender<()>>),
}

/// Wait for the peer while queueing whatever is sent in the meantime.
async fn accept_phase(
    transport: &mut Transport,
    rx: &mut mpsc::Receiver<WriterCommand>,
) -> AcceptOutcome {
    let mut queue = SendQueue::new();
    let accept = transport.accept();
    tokio::pin!(accept);

    loop {
        tokio::select! {
            biased;

            accepted = &mut accept => {
                return match accepted {
                    Ok(reader) => AcceptOutcome::Accepted(reader, queue),
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        AcceptOutcome::Stopped(None)
                    }
                };
            }

            command = rx.recv() => match command {
                Some(WriterCommand::Frame(frame)) => {
                    trace!(queued = queue.len() + 1, "Queued frame before connect");
                    queue.push(frame);
                }
                Some(WriterCommand::Close(ack)) => return AcceptOutcome::Stopped(ack),
                None => return AcceptOutcome::Stopped(None),
            },
        }
    }
}

async fn flush_queue(
    transport: &mut Transport,
    queue: &mut SendQueue,
    pending: &AtomicUsize,
) -> Result<()> {
    while let Some(frame) = queue.pop() {
        let result = transport.send(&frame).await;
        pending.fetch_sub(1, Ordering::Release);
        if let Err(e) = result {
            // Nothing behind a failed write will ever be sent.
            pending.fetch_sub(queue.len(), Ordering::Release);
            return Err(e);
        }
    }
    Ok(())
}
