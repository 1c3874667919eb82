//! Utilities for driving a [`Connection`] over in-memory streams in tests.
//!
//! [`connect`] runs a connection against one end of a `tokio::io::duplex`
//! pipe and returns a [`TestClient`] speaking AMQP frames on the other end.
//!
//! ```rust,no_run
//! use wirebroker::{BrokerConfig, protocol::Tune};
//! use wirebroker_testing::{broker, connect};
//!
//! # async fn example() -> std::io::Result<()> {
//! let broker = broker();
//! let mut conn = connect(&broker, BrokerConfig::default());
//! conn.client.handshake(Tune::default()).await?;
//! conn.client.open_channel(1).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rstest::fixture;
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use wirebroker::{
    AmqpCodec,
    Broker,
    BrokerConfig,
    Connection,
    ConnectionId,
    FrameType,
    Method,
    WireFrame,
    protocol::{
        BasicPublish,
        Close,
        ConnectionStartOk,
        ContentHeader,
        FieldTable,
        PROTOCOL_HEADER,
        Tune,
        class,
    },
};

/// SASL PLAIN response for `guest`/`guest`.
pub const PLAIN_RESPONSE: &[u8] = b"\0guest\0guest";

const DUPLEX_CAPACITY: usize = 64 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A broker with the default exchanges and no reaper running.
#[fixture]
#[must_use]
pub fn broker() -> Arc<Broker> {
    let (broker, _reaper) = Broker::new();
    broker
}

/// A connection task and the client end of its stream.
pub struct TestConnection {
    pub id: ConnectionId,
    pub client: TestClient,
    pub task: JoinHandle<()>,
}

/// Spawn a [`Connection`] for `broker` on an in-memory stream.
#[must_use]
pub fn connect(broker: &Arc<Broker>, config: BrokerConfig) -> TestConnection {
    let id = ConnectionId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    let frame_max = config.frame_max;
    let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
    let connection = Connection::new(id, Arc::clone(broker), Arc::new(config));
    let task = tokio::spawn(connection.run(server));
    TestConnection {
        id,
        client: TestClient::new(client, frame_max),
        task,
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Client side of an AMQP connection.
pub struct TestClient {
    framed: Framed<DuplexStream, AmqpCodec>,
}

impl TestClient {
    #[must_use]
    pub fn new(stream: DuplexStream, frame_max: u32) -> Self {
        Self {
            framed: Framed::new(stream, AmqpCodec::new(frame_max)),
        }
    }

    /// Raw access for tests that bypass framing.
    pub fn stream_mut(&mut self) -> &mut DuplexStream { self.framed.get_mut() }

    /// Send the AMQP 0-9-1 protocol header.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_protocol_header(&mut self) -> io::Result<()> {
        self.stream_mut().write_all(&PROTOCOL_HEADER).await
    }

    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_frame(&mut self, frame: WireFrame) -> io::Result<()> {
        self.framed.send(frame).await
    }

    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn send_method(&mut self, channel: u16, method: Method) -> io::Result<()> {
        self.send_frame(method.into_frame(channel)).await
    }

    /// Next frame from the broker, or `None` once it has closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker sends an undecodable frame.
    pub async fn recv_frame(&mut self) -> io::Result<Option<WireFrame>> {
        self.framed.next().await.transpose()
    }

    /// Next method frame, skipping heartbeats.
    ///
    /// # Errors
    ///
    /// Fails on end of stream, on a content frame, or if the method cannot
    /// be decoded.
    pub async fn recv_method(&mut self) -> io::Result<(u16, Method)> {
        loop {
            let frame = self
                .recv_frame()
                .await?
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "broker closed"))?;
            match frame.kind {
                FrameType::Heartbeat => {}
                FrameType::Method => {
                    let method = Method::decode(&frame.payload).map_err(|e| invalid(e.to_string()))?;
                    return Ok((frame.channel, method));
                }
                other => return Err(invalid(format!("expected a method frame, got {other}"))),
            }
        }
    }

    /// Receive a method that must match `expected` on `channel`.
    ///
    /// # Errors
    ///
    /// Fails if the next method differs.
    pub async fn expect_method(&mut self, channel: u16, expected: &Method) -> io::Result<()> {
        let (got_channel, got) = self.recv_method().await?;
        if got_channel != channel || &got != expected {
            return Err(invalid(format!(
                "expected {expected:?} on channel {channel}, got {got:?} on channel {got_channel}"
            )));
        }
        Ok(())
    }

    /// Run the handshake up to `open-ok`, answering `tune` with `requested`.
    /// Returns the broker's tuning offer.
    ///
    /// # Errors
    ///
    /// Fails if the broker deviates from the expected sequence.
    pub async fn handshake(&mut self, requested: Tune) -> io::Result<Tune> {
        self.send_protocol_header().await?;
        match self.recv_method().await? {
            (0, Method::ConnectionStart(_)) => {}
            other => return Err(invalid(format!("expected connection.start, got {other:?}"))),
        }
        self.send_method(
            0,
            Method::ConnectionStartOk(ConnectionStartOk {
                client_properties: FieldTable::new().with("product", "wirebroker_testing"),
                mechanism: "PLAIN".into(),
                response: Bytes::from_static(PLAIN_RESPONSE),
                locale: "en_US".into(),
            }),
        )
        .await?;
        let offer = match self.recv_method().await? {
            (0, Method::ConnectionTune(offer)) => offer,
            other => return Err(invalid(format!("expected connection.tune, got {other:?}"))),
        };
        self.send_method(0, Method::ConnectionTuneOk(requested)).await?;
        self.send_method(
            0,
            Method::ConnectionOpen {
                virtual_host: "/".into(),
            },
        )
        .await?;
        self.expect_method(0, &Method::ConnectionOpenOk).await?;
        Ok(offer)
    }

    /// # Errors
    ///
    /// Fails unless the broker answers with `channel.open-ok`.
    pub async fn open_channel(&mut self, channel: u16) -> io::Result<()> {
        self.send_method(channel, Method::ChannelOpen).await?;
        self.expect_method(channel, &Method::ChannelOpenOk).await
    }

    /// Publish `body` as a single body frame.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn publish(
        &mut self,
        channel: u16,
        publish: BasicPublish,
        body: &'static [u8],
    ) -> io::Result<()> {
        let header = ContentHeader::new(class::BASIC, body.len() as u64);
        self.send_method(channel, Method::BasicPublish(publish)).await?;
        self.send_frame(WireFrame::new(FrameType::Header, channel, header.encode()))
            .await?;
        if !body.is_empty() {
            self.send_frame(WireFrame::new(
                FrameType::Body,
                channel,
                Bytes::from_static(body),
            ))
            .await?;
        }
        Ok(())
    }

    /// Receive a content-bearing method with its header and full body.
    ///
    /// # Errors
    ///
    /// Fails if the frames do not form a complete content sequence.
    pub async fn recv_content(&mut self) -> io::Result<(u16, Method, ContentHeader, Bytes)> {
        let (channel, method) = self.recv_method().await?;
        if !method.has_content() {
            return Err(invalid(format!("{method:?} carries no content")));
        }
        let frame = self
            .recv_frame()
            .await?
            .ok_or_else(|| invalid("stream ended before content header"))?;
        if frame.kind != FrameType::Header {
            return Err(invalid(format!("expected a header frame, got {}", frame.kind)));
        }
        let header = ContentHeader::decode(&frame.payload).map_err(|e| invalid(e.to_string()))?;
        let mut body = BytesMut::new();
        while (body.len() as u64) < header.body_size {
            let frame = self
                .recv_frame()
                .await?
                .ok_or_else(|| invalid("stream ended inside content body"))?;
            if frame.kind != FrameType::Body {
                return Err(invalid(format!("expected a body frame, got {}", frame.kind)));
            }
            body.extend_from_slice(&frame.payload);
        }
        Ok((channel, method, header, body.freeze()))
    }

    /// Close the connection cleanly and wait for the broker to drop it.
    ///
    /// # Errors
    ///
    /// Fails unless the broker answers with `close-ok` and then closes.
    pub async fn close(&mut self) -> io::Result<()> {
        self.send_method(
            0,
            Method::ConnectionClose(Close {
                reply_code: 200,
                reply_text: "bye".into(),
                class_id: 0,
                method_id: 0,
            }),
        )
        .await?;
        self.expect_method(0, &Method::ConnectionCloseOk).await?;
        self.expect_disconnect().await
    }

    /// Drain frames until the broker closes the stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream yields an undecodable frame first.
    pub async fn expect_disconnect(&mut self) -> io::Result<()> {
        while self.recv_frame().await?.is_some() {}
        Ok(())
    }
}
