//! Connections: handshake, frame pump and teardown.
//!
//! A [`Connection`] owns one byte stream. After the protocol header is
//! accepted it splits the stream and runs a reader, a writer and one task per
//! non-zero channel on a [`TaskTracker`]; channel 0 is handled by the reader.
//! Heartbeat timers join them once tuning completes. Every task observes the connection's [`CancellationToken`].
//! Cancelling it is a hard close: the owner waits for all tasks to stop, then
//! performs teardown alone.
//!
//! Outbound frames from every channel pass through one bounded queue drained
//! by the writer, so a slow peer applies backpressure to the producers.

mod heartbeat;
mod io;
mod state;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::{Duration, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

pub use state::{ConnectionState, InvalidTransition};

use crate::{
    broker::Broker,
    channel::{self, ChannelHandle},
    codec::{FRAME_OVERHEAD, FrameType, WireFrame},
    config::BrokerConfig,
    error::AmqpError,
    metrics::{self, ConnectionGauge, ErrorKind},
    preamble::{PreambleError, read_protocol_header, reject_protocol_header},
    protocol::{ContentHeader, FieldTable, Method, Tune},
    session::ConnectionId,
};

/// Item on the outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(WireFrame),
    /// Flush everything queued before this marker, then hard-close.
    Close,
}

/// Serialisable view of a live connection.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub channel_count: usize,
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub client_properties: FieldTable,
}

struct ConnectionInner {
    state: ConnectionState,
    channels: HashMap<u16, ChannelHandle>,
    ttl: Instant,
    tuning: Tune,
    client_properties: FieldTable,
}

/// State shared by the tasks of one connection.
pub struct ConnectionShared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    config: Arc<BrokerConfig>,
    broker: Arc<Broker>,
    inner: Mutex<ConnectionInner>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionShared {
    fn inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer_addr }

    pub(crate) fn config(&self) -> &BrokerConfig { &self.config }

    pub(crate) fn broker(&self) -> &Arc<Broker> { &self.broker }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken { &self.shutdown }

    pub(crate) fn tracker(&self) -> &TaskTracker { &self.tracker }

    #[must_use]
    pub fn state(&self) -> ConnectionState { self.inner().state }

    pub(crate) fn advance(&self, to: ConnectionState) -> Result<(), InvalidTransition> {
        self.inner().state.advance(to)
    }

    /// Negotiated limits; the server's offer until `tune-ok` arrives.
    pub(crate) fn tuning(&self) -> Tune { self.inner().tuning }

    pub(crate) fn set_tuning(&self, tuning: Tune) { self.inner().tuning = tuning; }

    pub(crate) fn set_client_properties(&self, properties: FieldTable) {
        self.inner().client_properties = properties;
    }

    fn heartbeat_interval(tuning: Tune, config: &BrokerConfig) -> Duration {
        if tuning.heartbeat == 0 {
            config.heartbeat
        } else {
            Duration::from_secs(u64::from(tuning.heartbeat))
        }
    }

    /// Push the receive deadline to two heartbeat intervals from now.
    pub(crate) fn refresh_ttl(&self) {
        let mut inner = self.inner();
        let interval = Self::heartbeat_interval(inner.tuning, &self.config);
        inner.ttl = Instant::now() + interval * 2;
    }

    pub(crate) fn ttl_expired(&self, now: Instant) -> bool { now > self.inner().ttl }

    /// Largest body slice that fits in one frame.
    pub(crate) fn max_body_chunk(&self) -> usize {
        let frame_max = usize::try_from(self.tuning().frame_max).unwrap_or(usize::MAX);
        frame_max.saturating_sub(FRAME_OVERHEAD).max(1)
    }

    /// Queue a frame for the writer. Returns `false` once the connection is
    /// shutting down.
    pub(crate) async fn send(&self, frame: WireFrame) -> bool {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => false,
            sent = self.outbound.send(Outbound::Frame(frame)) => sent.is_ok(),
        }
    }

    pub(crate) async fn send_method(&self, channel: u16, method: Method) -> bool {
        self.send(method.into_frame(channel)).await
    }

    /// Send a content-bearing method followed by its header and body frames.
    pub(crate) async fn send_content(
        &self,
        channel: u16,
        method: Method,
        header: &ContentHeader,
        body: &Bytes,
    ) -> bool {
        if !self.send_method(channel, method).await {
            return false;
        }
        let header = WireFrame::new(FrameType::Header, channel, header.encode());
        if !self.send(header).await {
            return false;
        }
        let chunk = self.max_body_chunk();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk).min(body.len());
            let frame = WireFrame::new(FrameType::Body, channel, body.slice(offset..end));
            if !self.send(frame).await {
                return false;
            }
            offset = end;
        }
        true
    }

    /// Have the writer flush queued frames and then close the connection.
    pub(crate) async fn close_after_flush(&self) {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {}
            sent = self.outbound.send(Outbound::Close) => {
                if sent.is_err() {
                    self.hard_close("writer gone");
                }
            }
        }
    }

    /// Stop every task of this connection immediately.
    pub(crate) fn hard_close(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(
            "hard close: connection_id={}, peer_addr={:?}, reason={reason}",
            self.id, self.peer_addr
        );
        self.shutdown.cancel();
    }

    /// Hard close caused by the peer breaking the protocol.
    pub(crate) fn protocol_violation(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        warn!(
            "protocol violation: connection_id={}, peer_addr={:?}, reason={reason}",
            self.id, self.peer_addr
        );
        metrics::inc_errors(ErrorKind::Protocol);
        self.hard_close(reason);
    }

    /// Send `connection.close` for `err` and wait for the peer's `close-ok`.
    ///
    /// Only the first error is reported; later ones are dropped while the
    /// close is in flight. A peer that never answers is hard-closed after the
    /// configured close timeout.
    pub(crate) async fn connection_error(self: &Arc<Self>, err: AmqpError) {
        if self.advance(ConnectionState::Closing).is_err() {
            debug!(
                "connection error during close dropped: connection_id={}, error={err}",
                self.id
            );
            return;
        }
        warn!(
            "connection error: connection_id={}, peer_addr={:?}, error={err}",
            self.id, self.peer_addr
        );
        metrics::inc_errors(ErrorKind::Connection);
        self.send_method(0, Method::ConnectionClose(err.to_close()))
            .await;

        let conn = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = conn.shutdown.cancelled() => {}
                () = tokio::time::sleep(conn.config.close_timeout) => {
                    conn.hard_close("timed out waiting for connection.close-ok");
                }
            }
        });
    }

    /// Sender for channel `id`, creating the channel on first use.
    pub(crate) fn channel(self: &Arc<Self>, id: u16) -> Option<mpsc::Sender<WireFrame>> {
        let mut inner = self.inner();
        if inner.state == ConnectionState::Closed {
            return None;
        }
        let handle = inner
            .channels
            .entry(id)
            .or_insert_with(|| channel::spawn(self, id));
        Some(handle.sender())
    }

    /// Channels the peer currently has open, excluding channel 0.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner()
            .channels
            .values()
            .filter(|handle| handle.in_use())
            .count()
    }

    /// Start the heartbeat sender and the receive timeout for `interval`.
    pub(crate) fn start_heartbeats(self: &Arc<Self>, interval: Duration) {
        self.refresh_ttl();
        self.tracker
            .spawn(heartbeat::send_heartbeats(Arc::clone(self), interval));
        self.tracker
            .spawn(heartbeat::watch_receive_timeout(Arc::clone(self), interval));
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner();
        ConnectionSnapshot {
            id: self.id,
            peer_addr: self.peer_addr,
            state: inner.state,
            channel_count: inner.channels.values().filter(|h| h.in_use()).count(),
            channel_max: inner.tuning.channel_max,
            frame_max: inner.tuning.frame_max,
            heartbeat: inner.tuning.heartbeat,
            client_properties: inner.client_properties.clone(),
        }
    }

    fn teardown(&self) {
        let channels = {
            let mut inner = self.inner();
            if let Err(e) = inner.state.advance(ConnectionState::Closed) {
                debug!("teardown: connection_id={}, {e}", self.id);
            }
            std::mem::take(&mut inner.channels)
        };
        for handle in channels.values() {
            handle.cancel();
        }
        self.broker.connections().remove(&self.id);
        self.broker.delete_queues_for_connection(self.id);
        info!(
            "connection closed: connection_id={}, peer_addr={:?}",
            self.id, self.peer_addr
        );
    }
}

/// Owner of one client connection.
pub struct Connection {
    id: ConnectionId,
    broker: Arc<Broker>,
    config: Arc<BrokerConfig>,
    peer_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, broker: Arc<Broker>, config: Arc<BrokerConfig>) -> Self {
        Self {
            id,
            broker,
            config,
            peer_addr: None,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Close this connection when `parent` is cancelled.
    #[must_use]
    pub fn shutdown_with(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    /// Serve the connection until it closes, then tear it down.
    ///
    /// A client opening with an unsupported protocol header is sent the
    /// supported header and disconnected without being registered.
    pub async fn run<S>(self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            id,
            broker,
            config,
            peer_addr,
            shutdown,
        } = self;

        let header = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            header = read_protocol_header(&mut stream) => header,
        };
        match header {
            Ok(()) => {}
            Err(PreambleError::Mismatch(received)) => {
                warn!(
                    "unsupported protocol header: connection_id={id}, peer_addr={peer_addr:?}, \
                     header={received:02x?}"
                );
                metrics::inc_errors(ErrorKind::Protocol);
                if let Err(e) = reject_protocol_header(&mut stream).await {
                    debug!("protocol header reply failed: connection_id={id}, error={e}");
                }
                if let Err(e) = stream.shutdown().await {
                    debug!("stream shutdown failed: connection_id={id}, error={e}");
                }
                return;
            }
            Err(PreambleError::Io(e)) => {
                debug!(
                    "connection ended before protocol header: connection_id={id}, \
                     peer_addr={peer_addr:?}, error={e}"
                );
                return;
            }
        }

        let _gauge = ConnectionGauge::acquire();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let tuning = Tune {
            channel_max: config.channel_max,
            frame_max: config.frame_max,
            heartbeat: config.heartbeat_secs(),
        };
        let shared = Arc::new(ConnectionShared {
            id,
            peer_addr,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::AwaitingProtocolHeader,
                channels: HashMap::new(),
                ttl: Instant::now() + config.heartbeat * 2,
                tuning,
                client_properties: FieldTable::new(),
            }),
            config,
            broker,
            outbound,
            shutdown,
            tracker: TaskTracker::new(),
        });
        shared.broker.connections().insert(id, &shared);
        info!("connection opened: connection_id={id}, peer_addr={peer_addr:?}");

        let (reader, writer) = tokio::io::split(stream);
        shared
            .tracker
            .spawn(io::write_frames(Arc::clone(&shared), writer, outbound_rx));
        channel::send_start(&shared).await;
        shared
            .tracker
            .spawn(io::read_frames(Arc::clone(&shared), reader));

        shared.shutdown.cancelled().await;
        shared.tracker.close();
        shared.tracker.wait().await;
        shared.teardown();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::protocol::PROTOCOL_HEADER;

    fn connection(broker: &Arc<Broker>) -> Connection {
        Connection::new(
            ConnectionId::new(7),
            Arc::clone(broker),
            Arc::new(BrokerConfig::default()),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn rejected_header_is_answered_and_logged() {
        let (broker, _reaper) = Broker::new();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"HTTP/1.1").await.expect("write header");

        connection(&broker).run(server).await;

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.expect("read reply");
        assert_eq!(echoed, PROTOCOL_HEADER);
        assert!(logs_contain("unsupported protocol header"));
        assert!(broker.connections().is_empty());
    }

    #[tokio::test]
    async fn shutdown_before_header_skips_registration() {
        let (broker, _reaper) = Broker::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (_client, server) = tokio::io::duplex(64);

        connection(&broker).shutdown_with(&shutdown).run(server).await;

        assert!(broker.connections().is_empty());
    }
}
