//! Channels: logical conversations multiplexed on one connection.
//!
//! Each channel runs as its own task fed by a bounded queue, so frames on one
//! channel are handled in arrival order without blocking the others. Every
//! such channel starts in [`ChannelState::AwaitingOpen`] and is created the
//! first time the reader sees its id. Channel 0 carries the connection
//! handshake and close and is a [`ControlChannel`] driven by the reader
//! itself, so a state change it makes is in force before the next frame is
//! routed. Closing a channel returns its task to
//! `AwaitingOpen` rather than ending it, so a reopen queued right behind the
//! `close-ok` reaches the same task.

mod assembly;
mod control;
mod dispatch;

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use assembly::{ContentAssembly, Published};
pub(crate) use control::send_start;

use crate::{
    codec::{FrameType, WireFrame},
    connection::ConnectionShared,
    error::AmqpError,
    metrics::{self, ErrorKind},
    protocol::{Method, ReplyCode},
};

/// Lifecycle of a non-zero channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingOpen,
    Open,
    /// `channel.close` sent; waiting for `close-ok`.
    Closing,
}

/// The connection's reference to a running channel task.
pub(crate) struct ChannelHandle {
    frames: mpsc::Sender<WireFrame>,
    token: CancellationToken,
    in_use: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub(crate) fn sender(&self) -> mpsc::Sender<WireFrame> { self.frames.clone() }

    pub(crate) fn cancel(&self) { self.token.cancel(); }

    /// Whether the peer has opened the channel and not yet finished closing it.
    pub(crate) fn in_use(&self) -> bool { self.in_use.load(Ordering::Relaxed) }
}

/// Start the task for channel `id` on `conn`'s tracker.
pub(crate) fn spawn(conn: &Arc<ConnectionShared>, id: u16) -> ChannelHandle {
    let (frames, inbound) = mpsc::channel(conn.config().channel_capacity);
    let token = conn.shutdown_token().child_token();
    let channel = Channel::new(conn, id);
    let in_use = Arc::clone(&channel.in_use);
    conn.tracker().spawn(channel.run(inbound, token.clone()));
    ChannelHandle {
        frames,
        token,
        in_use,
    }
}

/// Channel 0, handled inline on the reader task.
pub(crate) struct ControlChannel(Channel);

impl ControlChannel {
    pub(crate) fn new(conn: &Arc<ConnectionShared>) -> Self { Self(Channel::new(conn, 0)) }

    /// Process one channel-0 frame. `Break` means the reader should stop.
    pub(crate) async fn handle(&mut self, frame: WireFrame) -> ControlFlow<()> {
        self.0.handle_control(frame).await
    }
}

struct Channel {
    id: u16,
    conn: Arc<ConnectionShared>,
    state: ChannelState,
    assembly: ContentAssembly,
    /// Last flow state requested by the peer.
    active: bool,
    in_use: Arc<AtomicBool>,
}

impl Channel {
    fn new(conn: &Arc<ConnectionShared>, id: u16) -> Self {
        Self {
            id,
            conn: Arc::clone(conn),
            state: ChannelState::AwaitingOpen,
            assembly: ContentAssembly::new(conn.config().max_message_size),
            active: true,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(mut self, mut inbound: mpsc::Receiver<WireFrame>, token: CancellationToken) {
        trace!(
            "channel started: connection_id={}, channel={}",
            self.conn.id(),
            self.id
        );
        loop {
            let frame = tokio::select! {
                biased;
                () = token.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if self.handle_frame(frame).await.is_break() {
                break;
            }
        }
        trace!(
            "channel stopped: connection_id={}, channel={}",
            self.conn.id(),
            self.id
        );
    }

    async fn reply(&self, method: Method) -> bool { self.conn.send_method(self.id, method).await }

    fn set_state(&mut self, state: ChannelState) {
        self.state = state;
        self.in_use
            .store(state != ChannelState::AwaitingOpen, Ordering::Relaxed);
    }

    async fn handle_frame(&mut self, frame: WireFrame) -> ControlFlow<()> {
        if self.state == ChannelState::Closing && frame.kind != FrameType::Method {
            return ControlFlow::Continue(());
        }
        let outcome = match frame.kind {
            FrameType::Method => self.on_method_frame(&frame.payload).await,
            FrameType::Header => match self.assembly.header(&frame.payload) {
                Ok(Some(published)) => self.on_published(published).await,
                Ok(None) => Ok(ControlFlow::Continue(())),
                Err(e) => Err(e),
            },
            FrameType::Body => match self.assembly.body(&frame.payload) {
                Ok(Some(published)) => self.on_published(published).await,
                Ok(None) => Ok(ControlFlow::Continue(())),
                Err(e) => Err(e),
            },
            FrameType::Heartbeat => Ok(ControlFlow::Continue(())),
        };
        match outcome {
            Ok(flow) => flow,
            Err(err) => self.fail(err).await,
        }
    }

    async fn on_method_frame(&mut self, payload: &[u8]) -> Result<ControlFlow<()>, AmqpError> {
        let method = match Method::decode(payload) {
            Ok(method) => method,
            Err(_) if self.state == ChannelState::Closing => return Ok(ControlFlow::Continue(())),
            Err(e) => return Err(e.into()),
        };
        if self.assembly.in_progress() {
            return Err(
                AmqpError::unexpected_frame("method frame while content was expected")
                    .caused_by(&method),
            );
        }
        self.on_method(method).await
    }

    async fn on_method(&mut self, method: Method) -> Result<ControlFlow<()>, AmqpError> {
        match (self.state, method) {
            (_, Method::ChannelClose(close)) => {
                debug!(
                    "channel closed by peer: connection_id={}, channel={}, reply_code={}, \
                     reply_text={}",
                    self.conn.id(),
                    self.id,
                    close.reply_code,
                    close.reply_text
                );
                self.reply(Method::ChannelCloseOk).await;
                Ok(self.finish())
            }
            (ChannelState::Closing, Method::ChannelCloseOk) => Ok(self.finish()),
            (ChannelState::Closing, _) => Ok(ControlFlow::Continue(())),
            (ChannelState::AwaitingOpen, Method::ChannelOpen) => {
                self.set_state(ChannelState::Open);
                self.reply(Method::ChannelOpenOk).await;
                Ok(ControlFlow::Continue(()))
            }
            (ChannelState::AwaitingOpen, method) => Err(AmqpError::new(
                ReplyCode::ChannelError,
                format!("channel {} is not open", self.id),
            )
            .caused_by(&method)),
            (ChannelState::Open, method @ Method::ChannelOpen) => Err(AmqpError::new(
                ReplyCode::ChannelError,
                format!("channel {} is already open", self.id),
            )
            .caused_by(&method)),
            (ChannelState::Open, Method::ChannelFlow { active }) => {
                self.active = active;
                self.reply(Method::ChannelFlowOk { active }).await;
                Ok(ControlFlow::Continue(()))
            }
            (ChannelState::Open, Method::BasicPublish(publish)) => {
                self.assembly.start(publish);
                Ok(ControlFlow::Continue(()))
            }
            (ChannelState::Open, method) => {
                self.dispatch(&method)
                    .await
                    .map_err(|e| e.caused_by(&method))?;
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn on_published(&mut self, published: Published) -> Result<ControlFlow<()>, AmqpError> {
        match self.route(&published).await {
            Ok(()) => Ok(ControlFlow::Continue(())),
            Err(e) => Err(e.caused_by(&Method::BasicPublish(published.publish))),
        }
    }

    /// Report `err`: channel errors close this channel, anything else the
    /// whole connection.
    async fn fail(&mut self, err: AmqpError) -> ControlFlow<()> {
        self.assembly.reset();
        if err.is_connection_error() {
            self.conn.connection_error(err).await;
            return ControlFlow::Continue(());
        }
        warn!(
            "channel error: connection_id={}, channel={}, error={err}",
            self.conn.id(),
            self.id
        );
        metrics::inc_errors(ErrorKind::Channel);
        self.set_state(ChannelState::Closing);
        self.reply(Method::ChannelClose(err.to_close())).await;
        ControlFlow::Continue(())
    }

    /// Return to `AwaitingOpen` once a close handshake completes.
    fn finish(&mut self) -> ControlFlow<()> {
        self.assembly.reset();
        self.active = true;
        self.set_state(ChannelState::AwaitingOpen);
        ControlFlow::Continue(())
    }
}
