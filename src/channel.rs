//! Uniform handle over the three terminal channel variants.
//!
//! Every backend (SSH, native PTY, pipe emulation) is driven by its own
//! task or threads and talks to the rest of the server through the same pair
//! of bounded queues:
//!
//! - an ordered command queue (`ChannelCommand`) carrying input bytes and
//!   resize requests, so a resize can never overtake input sent before it;
//! - an output queue of raw chunks, which ends when the remote side or the
//!   child process goes away. Once every [`OutputSender`] clone is dropped
//!   the channel counts as ended, which [`ChannelCloser::ended`] reports even
//!   while nobody is reading.
//!
//! [`Channel::new`] hands the consumer side to the session and the producer
//! side ([`ChannelBackend`]) to the backend driver.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Capacity of the output queue. 256 slots x ~4 KiB chunks caps buffered
/// output at about 1 MiB before the producer blocks.
pub const OUTPUT_CAPACITY: usize = 256;

/// Capacity of the command queue (input + resize).
pub const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    SecureRemote,
    NativePty,
    PipeEmulated,
}

impl ChannelKind {
    /// Whether resize requests have any effect on this variant.
    ///
    /// The pipe emulation has no terminal to resize.
    pub fn supports_resize(&self) -> bool {
        !matches!(self, ChannelKind::PipeEmulated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::SecureRemote => "ssh",
            ChannelKind::NativePty => "pty",
            ChannelKind::PipeEmulated => "pipe",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request travelling from a client towards the channel backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("resize is not supported on {0} channels")]
    ResizeUnsupported(ChannelKind),

    #[error("failed to release channel resources: {0}")]
    Close(#[source] std::io::Error),
}

type CloseHook = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

struct CloserInner {
    token: CancellationToken,
    /// Cancelled when the last output sender is dropped.
    ended: CancellationToken,
    hook: Mutex<Option<CloseHook>>,
}

/// Cloneable handle that closes a channel from anywhere.
///
/// Closing cancels the channel's token (which every backend driver and both
/// channel halves watch) and runs the backend's close hook, e.g. killing the
/// child process so that blocked reads return. The hook runs at most once no
/// matter how many clones call [`ChannelCloser::close`].
#[derive(Clone)]
pub struct ChannelCloser {
    inner: Arc<CloserInner>,
}

impl ChannelCloser {
    fn new() -> Self {
        Self {
            inner: Arc::new(CloserInner {
                token: CancellationToken::new(),
                ended: CancellationToken::new(),
                hook: Mutex::new(None),
            }),
        }
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        self.inner.token.cancel();
        let hook = self.inner.hook.lock().take();
        match hook {
            Some(hook) => hook().map_err(ChannelError::Close),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the channel has been closed.
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Whether the backend has stopped producing output for good.
    pub fn has_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// Resolves once the backend has dropped its last output sender.
    pub async fn ended(&self) {
        self.inner.ended.cancelled().await
    }

    pub fn ended_token(&self) -> CancellationToken {
        self.inner.ended.clone()
    }

    fn set_hook(&self, hook: CloseHook) {
        let mut slot = self.inner.hook.lock();
        if self.inner.token.is_cancelled() {
            // Closed before the backend finished wiring up: release now.
            drop(slot);
            if let Err(e) = hook() {
                tracing::warn!(?e, "late channel close hook failed");
            }
            return;
        }
        *slot = Some(hook);
    }
}

impl fmt::Debug for ChannelCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCloser")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Output producer handed to backend drivers. Cloneable; the channel ends
/// when the last clone is dropped.
#[derive(Clone)]
pub struct OutputSender {
    tx: mpsc::Sender<Bytes>,
    _ended: Arc<DropGuard>,
}

impl OutputSender {
    pub async fn send(&self, chunk: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.tx.send(chunk).await
    }

    /// For backend threads outside the runtime.
    pub fn blocking_send(&self, chunk: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.tx.blocking_send(chunk)
    }
}

/// Producer side of a channel, owned by the backend driver.
pub struct ChannelBackend {
    pub commands: mpsc::Receiver<ChannelCommand>,
    pub output: OutputSender,
    closer: ChannelCloser,
}

impl ChannelBackend {
    /// Register the action that releases the backend's resources.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() -> std::io::Result<()> + Send + 'static,
    {
        self.closer.set_hook(Box::new(hook));
    }

    /// Token cancelled when the consumer closes the channel.
    pub fn cancelled(&self) -> CancellationToken {
        self.closer.token()
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }
}

/// Consumer side of a channel: the handle a session owns and lends to a
/// bridge.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub fn new(kind: ChannelKind) -> (Channel, ChannelBackend) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let closer = ChannelCloser::new();
        let channel = Channel {
            reader: ChannelReader {
                output: output_rx,
                closer: closer.clone(),
            },
            writer: ChannelWriter {
                kind,
                commands: command_tx,
                closer: closer.clone(),
            },
        };
        let output = OutputSender {
            tx: output_tx,
            _ended: Arc::new(closer.ended_token().drop_guard()),
        };
        let backend = ChannelBackend {
            commands: command_rx,
            output,
            closer,
        };
        (channel, backend)
    }

    pub fn kind(&self) -> ChannelKind {
        self.writer.kind
    }

    pub async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        self.writer.write(data).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ChannelError> {
        self.writer.resize(cols, rows).await
    }

    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.reader.next_chunk().await
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        self.writer.closer.close()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.closer.is_closed()
    }

    pub fn closer(&self) -> ChannelCloser {
        self.writer.closer.clone()
    }

    /// Split into independently owned halves for the two bridge pumps.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }

    /// Reassemble a channel from the halves returned by [`Channel::split`].
    pub fn join(reader: ChannelReader, writer: ChannelWriter) -> Channel {
        Channel { reader, writer }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.writer.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Output half: a lazy, finite, non-restartable sequence of chunks.
pub struct ChannelReader {
    output: mpsc::Receiver<Bytes>,
    closer: ChannelCloser,
}

impl ChannelReader {
    /// Next output chunk, or `None` once the backend finished or the channel
    /// was closed.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let token = self.closer.token();
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            chunk = self.output.recv() => chunk,
        }
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }
}

/// Input half: ordered writes and resizes.
pub struct ChannelWriter {
    kind: ChannelKind,
    commands: mpsc::Sender<ChannelCommand>,
    closer: ChannelCloser,
}

impl ChannelWriter {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Input(data)).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ChannelError> {
        if !self.kind.supports_resize() {
            return Err(ChannelError::ResizeUnsupported(self.kind));
        }
        self.send(ChannelCommand::Resize { cols, rows }).await
    }

    async fn send(&self, command: ChannelCommand) -> Result<(), ChannelError> {
        let token = self.closer.token();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ChannelError::Closed),
            sent = self.commands.send(command) => sent.map_err(|_| ChannelError::Closed),
        }
    }
}
