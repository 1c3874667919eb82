//! Reader and writer tasks.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::Instant,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use super::{ConnectionShared, Outbound};
use crate::{
    channel::ControlChannel,
    codec::{AmqpCodec, FrameType, WireFrame},
    error::AmqpError,
    metrics::{self, Direction},
    protocol::ReplyCode,
};

/// Decode inbound frames and hand each to its channel.
///
/// Channel 0 is processed before the next frame is read, so a
/// `connection.open` immediately followed by channel traffic is seen in
/// order.
pub(super) async fn read_frames<R>(conn: Arc<ConnectionShared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, AmqpCodec::new(conn.config().frame_max));
    let mut control = ControlChannel::new(&conn);
    loop {
        let next = tokio::select! {
            biased;
            () = conn.shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            None => {
                conn.hard_close("peer closed the connection");
                break;
            }
            Some(Err(e)) => {
                conn.protocol_violation(&format!("unreadable frame: {e}"));
                break;
            }
            Some(Ok(frame)) => {
                metrics::inc_frames(Direction::Inbound);
                conn.refresh_ttl();
                if !demux(&conn, &mut control, frame).await {
                    break;
                }
            }
        }
    }
    trace!("reader stopped: connection_id={}", conn.id);
}

/// Route one frame. Returns `false` when reading should stop.
async fn demux(conn: &Arc<ConnectionShared>, control: &mut ControlChannel, frame: WireFrame) -> bool {
    if frame.kind == FrameType::Heartbeat {
        if frame.channel != 0 {
            let err = AmqpError::new(
                ReplyCode::FrameError,
                format!("heartbeat on channel {}", frame.channel),
            );
            conn.connection_error(err).await;
        }
        return true;
    }

    if frame.channel == 0 {
        return control.handle(frame).await.is_continue();
    }

    let state = conn.state();
    if state.is_closing() {
        trace!(
            "frame discarded while closing: connection_id={}, channel={}",
            conn.id, frame.channel
        );
        return true;
    }
    if !state.is_open() {
        conn.protocol_violation(&format!(
            "frame on channel {} before connection.open",
            frame.channel
        ));
        return false;
    }
    let channel_max = conn.tuning().channel_max;
    if frame.channel > channel_max {
        let err = AmqpError::new(
            ReplyCode::ChannelError,
            format!("channel {} exceeds channel-max {channel_max}", frame.channel),
        );
        conn.connection_error(err).await;
        return true;
    }

    let Some(channel) = conn.channel(frame.channel) else {
        return false;
    };
    tokio::select! {
        biased;
        () = conn.shutdown.cancelled() => false,
        sent = channel.send(frame) => {
            if sent.is_err() {
                debug!("frame for finished channel dropped: connection_id={}", conn.id);
            }
            true
        }
    }
}

/// Drain the outbound queue onto the stream.
pub(super) async fn write_frames<W>(
    conn: Arc<ConnectionShared>,
    writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(writer, AmqpCodec::new(conn.config().frame_max));
    loop {
        let next = tokio::select! {
            biased;
            () = conn.shutdown.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(next) = next else {
            break;
        };
        match next {
            Outbound::Frame(frame) => {
                let started = Instant::now();
                let written = tokio::select! {
                    biased;
                    () = conn.shutdown.cancelled() => break,
                    written = frames.send(frame) => written,
                };
                if let Err(e) = written {
                    conn.hard_close(&format!("write failed: {e}"));
                    break;
                }
                metrics::record_write(started.elapsed());
                metrics::inc_frames(Direction::Outbound);
            }
            Outbound::Close => {
                let closed = tokio::select! {
                    biased;
                    () = conn.shutdown.cancelled() => break,
                    closed = frames.close() => closed,
                };
                if let Err(e) = closed {
                    debug!("closing stream failed: connection_id={}, error={e}", conn.id);
                }
                conn.hard_close("close handshake complete");
                break;
            }
        }
    }
    trace!("writer stopped: connection_id={}", conn.id);
}
