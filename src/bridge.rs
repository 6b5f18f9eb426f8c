//! I/O bridge between one attached client and one channel.
//!
//! Two pumps run as separate tasks:
//!
//! - outbound: channel output -> `data` events. It is the only task that
//!   writes to the client, so notices from the inbound side (e.g. a
//!   malformed-event error) are queued to it rather than sent directly;
//! - inbound: client frames -> channel commands (input, command, resize).
//!
//! Whichever pump finishes first cancels the other. The bridge then sends a
//! final event and a close frame describing why the stream ended, and hands
//! back the channel halves it could recover.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelCommand, ChannelError, ChannelReader, ChannelWriter};
use crate::protocol::{
    clamp_dimension, ClientEvent, ClientFrame, CloseReason, ServerEvent, ServerFrame, Utf8Decoder,
};
use crate::session::Target;

/// Queued notices from the inbound pump to the outbound pump.
const NOTICE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub max_cols: u16,
    pub max_rows: u16,
    /// Sent as a `data` event before any channel output.
    pub banner: Option<String>,
    /// How long to wait for the second pump (and the final frames) once the
    /// first pump has finished.
    pub shutdown_grace: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_cols: 500,
            max_rows: 200,
            banner: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("session already has an attached client")]
    AlreadyAttached,

    #[error("session not found")]
    SessionNotFound,

    #[error("channel closed")]
    ChannelClosed,

    #[error("malformed client event")]
    MalformedEvent,

    #[error("{0} pump panicked")]
    PumpPanicked(&'static str),
}

impl BridgeError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            BridgeError::AlreadyAttached => CloseReason::AlreadyAttached,
            BridgeError::SessionNotFound => CloseReason::SessionNotFound,
            BridgeError::ChannelClosed => CloseReason::ChannelFailed,
            BridgeError::MalformedEvent => CloseReason::MalformedEvent,
            BridgeError::PumpPanicked(_) => CloseReason::InternalError,
        }
    }
}

/// How a bridge run ended.
#[derive(Debug)]
pub struct BridgeOutcome {
    pub reason: CloseReason,
    /// The channel, if both halves came back. `None` after a pump panic or
    /// an aborted pump.
    pub channel: Option<Channel>,
    pub error: Option<BridgeError>,
}

impl BridgeOutcome {
    /// True when only the client went away and the channel is still usable.
    pub fn client_left(&self) -> bool {
        self.reason == CloseReason::ClientClosed
            && self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }
}

/// The connect banner shown when a client attaches.
pub fn banner_text(target: &Target) -> String {
    format!(
        "\r\n\x1b[1;32mConnected to {}\x1b[0m\r\n\x1b[1;34mType 'exit' to close connection\x1b[0m\r\n\r\n",
        target.label()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// Cancelled by the other pump or by the session.
    Stopped,
    ChannelClosed,
    ClientClosed,
    MalformedEvent,
    ChannelFailed,
    Panicked(&'static str),
}

/// Run both pumps for one attached client until either side ends.
///
/// `cancelled` is the attachment's token; cancelling it (the session was
/// disconnected) stops the bridge with [`CloseReason::SessionClosed`].
pub async fn run<Tx, Rx>(
    channel: Channel,
    cancelled: CancellationToken,
    tx: Tx,
    rx: Rx,
    options: BridgeOptions,
) -> BridgeOutcome
where
    Tx: Sink<ServerFrame> + Unpin + Send + 'static,
    Rx: Stream<Item = ClientFrame> + Unpin + Send + 'static,
{
    let stop = cancelled.child_token();
    let closer = channel.closer();
    let (reader, writer) = channel.split();
    let tx = Arc::new(Mutex::new(tx));

    if let Some(banner) = options.banner.as_deref() {
        let _ = tx
            .lock()
            .await
            .send(ServerFrame::Event(ServerEvent::data(banner)))
            .await;
    }

    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
    let mut outbound = tokio::spawn(outbound_pump(reader, tx.clone(), notice_rx, stop.clone()));
    let mut inbound = tokio::spawn(inbound_pump(
        writer,
        rx,
        notice_tx,
        stop.clone(),
        options.max_cols,
        options.max_rows,
    ));

    let mut reader = None;
    let mut writer = None;
    let (first, second) = tokio::select! {
        res = &mut outbound => {
            let first = settle(res, &mut reader, "outbound");
            stop.cancel();
            let second = join_with_grace(&mut inbound, &mut writer, "inbound", options.shutdown_grace).await;
            (first, second)
        }
        res = &mut inbound => {
            let first = settle(res, &mut writer, "inbound");
            stop.cancel();
            let second = join_with_grace(&mut outbound, &mut reader, "outbound", options.shutdown_grace).await;
            (first, second)
        }
    };

    let (reason, error) = decide(first, second, cancelled.is_cancelled());
    tracing::debug!(?first, ?second, ?reason, "bridge finished");

    let closing = async {
        let mut tx = tx.lock().await;
        let notice = match reason {
            CloseReason::ChannelClosed | CloseReason::SessionClosed => {
                Some(ServerEvent::closed(reason.reason()))
            }
            CloseReason::ChannelFailed | CloseReason::InternalError => {
                Some(ServerEvent::error(reason.reason()))
            }
            _ => None,
        };
        if let Some(notice) = notice {
            let _ = tx.send(ServerFrame::Event(notice)).await;
        }
        let _ = tx.send(ServerFrame::Close(reason)).await;
    };
    if tokio::time::timeout(options.shutdown_grace, closing).await.is_err() {
        tracing::debug!("client did not accept close frame in time");
    }

    let channel = match (reader, writer) {
        (Some(reader), Some(writer)) => Some(Channel::join(reader, writer)),
        _ => {
            // A half is gone; the channel can never be used again.
            if let Err(e) = closer.close() {
                tracing::warn!(?e, "failed to close channel after pump loss");
            }
            None
        }
    };

    BridgeOutcome {
        reason,
        channel,
        error,
    }
}

fn decide(
    first: PumpEnd,
    second: PumpEnd,
    session_cancelled: bool,
) -> (CloseReason, Option<BridgeError>) {
    for end in [first, second] {
        if let PumpEnd::Panicked(pump) = end {
            return (CloseReason::InternalError, Some(BridgeError::PumpPanicked(pump)));
        }
    }
    if session_cancelled {
        return (CloseReason::SessionClosed, None);
    }
    match first {
        PumpEnd::ChannelClosed => (CloseReason::ChannelClosed, None),
        PumpEnd::ClientClosed => (CloseReason::ClientClosed, None),
        PumpEnd::MalformedEvent => (CloseReason::MalformedEvent, Some(BridgeError::MalformedEvent)),
        PumpEnd::ChannelFailed => (CloseReason::ChannelFailed, Some(BridgeError::ChannelClosed)),
        PumpEnd::Stopped | PumpEnd::Panicked(_) => (CloseReason::SessionClosed, None),
    }
}

fn settle<T>(res: Result<(T, PumpEnd), JoinError>, slot: &mut Option<T>, pump: &'static str) -> PumpEnd {
    match res {
        Ok((half, end)) => {
            *slot = Some(half);
            end
        }
        Err(e) if e.is_panic() => {
            tracing::error!(pump, "bridge pump panicked: {:?}", e);
            PumpEnd::Panicked(pump)
        }
        Err(_) => PumpEnd::Stopped,
    }
}

async fn join_with_grace<T>(
    handle: &mut tokio::task::JoinHandle<(T, PumpEnd)>,
    slot: &mut Option<T>,
    pump: &'static str,
    grace: Duration,
) -> PumpEnd {
    match tokio::time::timeout(grace, &mut *handle).await {
        Ok(res) => settle(res, slot, pump),
        Err(_) => {
            tracing::warn!(pump, "bridge pump did not stop in time, aborting");
            handle.abort();
            PumpEnd::Stopped
        }
    }
}

async fn send_event<Tx>(tx: &Mutex<Tx>, event: ServerEvent) -> bool
where
    Tx: Sink<ServerFrame> + Unpin,
{
    tx.lock().await.send(ServerFrame::Event(event)).await.is_ok()
}

async fn outbound_pump<Tx>(
    mut reader: ChannelReader,
    tx: Arc<Mutex<Tx>>,
    mut notices: mpsc::Receiver<ServerEvent>,
    stop: CancellationToken,
) -> (ChannelReader, PumpEnd)
where
    Tx: Sink<ServerFrame> + Unpin + Send + 'static,
{
    let mut decoder = Utf8Decoder::new();
    let mut notices_open = true;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                // Deliver anything the inbound pump queued before it stopped.
                while let Ok(notice) = notices.try_recv() {
                    if !send_event(&tx, notice).await {
                        break;
                    }
                }
                return (reader, PumpEnd::Stopped);
            }
            notice = notices.recv(), if notices_open => match notice {
                Some(notice) => {
                    if !send_event(&tx, notice).await {
                        return (reader, PumpEnd::ClientClosed);
                    }
                }
                None => notices_open = false,
            },
            chunk = reader.next_chunk() => match chunk {
                Some(bytes) => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() && !send_event(&tx, ServerEvent::data(text)).await {
                        return (reader, PumpEnd::ClientClosed);
                    }
                }
                None => {
                    if let Some(tail) = decoder.finish() {
                        let _ = send_event(&tx, ServerEvent::data(tail)).await;
                    }
                    return (reader, PumpEnd::ChannelClosed);
                }
            },
        }
    }
}

async fn inbound_pump<Rx>(
    writer: ChannelWriter,
    mut rx: Rx,
    notices: mpsc::Sender<ServerEvent>,
    stop: CancellationToken,
    max_cols: u16,
    max_rows: u16,
) -> (ChannelWriter, PumpEnd)
where
    Rx: Stream<Item = ClientFrame> + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => return (writer, PumpEnd::Stopped),
            frame = rx.next() => frame,
        };
        let command = match frame {
            None | Some(ClientFrame::Close) => return (writer, PumpEnd::ClientClosed),
            Some(ClientFrame::Binary(data)) => ChannelCommand::Input(data),
            Some(ClientFrame::Text(text)) => match ClientEvent::parse(&text) {
                Ok(ClientEvent::Input { data }) => ChannelCommand::Input(Bytes::from(data)),
                Ok(ClientEvent::Command { mut data }) => {
                    data.push('\n');
                    ChannelCommand::Input(Bytes::from(data))
                }
                Ok(ClientEvent::Resize { cols, rows }) => {
                    if !writer.kind().supports_resize() {
                        tracing::debug!(kind = %writer.kind(), "resize ignored");
                        continue;
                    }
                    ChannelCommand::Resize {
                        cols: clamp_dimension(cols, max_cols),
                        rows: clamp_dimension(rows, max_rows),
                    }
                }
                Err(e) => {
                    tracing::debug!(?e, "malformed client event");
                    let _ = notices
                        .send(ServerEvent::error(format!("malformed event: {e}")))
                        .await;
                    return (writer, PumpEnd::MalformedEvent);
                }
            },
        };
        if let Some(end) = apply(&writer, &stop, command).await {
            return (writer, end);
        }
    }
}

/// Forward one command to the channel. Returns `Some` when the pump must
/// stop.
async fn apply(writer: &ChannelWriter, stop: &CancellationToken, command: ChannelCommand) -> Option<PumpEnd> {
    let result = tokio::select! {
        biased;
        _ = stop.cancelled() => return Some(PumpEnd::Stopped),
        result = async {
            match command {
                ChannelCommand::Input(data) => writer.write(data).await,
                ChannelCommand::Resize { cols, rows } => writer.resize(cols, rows).await,
            }
        } => result,
    };
    match result {
        Ok(()) => None,
        Err(ChannelError::ResizeUnsupported(_)) => None,
        Err(ChannelError::Closed) => Some(PumpEnd::ChannelClosed),
        Err(e) => {
            tracing::warn!(?e, "channel write failed");
            Some(PumpEnd::ChannelFailed)
        }
    }
}
