//! Connection handshake, close and protocol-violation behaviour over an
//! in-memory stream.

use std::{io, sync::Arc};

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wirebroker::{
    Broker,
    BrokerConfig,
    ConnectionState,
    FrameType,
    Method,
    WireFrame,
    protocol::{ConnectionStartOk, ExchangeDeclare, PROTOCOL_HEADER, QueueDeclare, Tune},
};
use wirebroker_testing::{PLAIN_RESPONSE, TestConnection, broker, connect};

#[rstest]
#[tokio::test]
async fn handshake_negotiates_and_opens(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection {
        id,
        mut client,
        task,
    } = connect(&broker, BrokerConfig::default().channel_max(64));

    let offer = client
        .handshake(Tune {
            channel_max: 0,
            frame_max: 8192,
            heartbeat: 0,
        })
        .await?;
    assert_eq!(offer.channel_max, 64);
    assert_eq!(offer.frame_max, 131_072);
    assert_eq!(offer.heartbeat, 60);

    let snapshot = broker.connections().snapshot(&id).expect("registered");
    assert_eq!(snapshot.state, ConnectionState::Open);
    assert_eq!(snapshot.channel_max, 64);
    assert_eq!(snapshot.frame_max, 8192);
    assert_eq!(snapshot.heartbeat, 0);

    client.close().await?;
    task.await.expect("connection task");
    assert!(!broker.connections().contains(&id));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn start_lists_mechanisms_and_server_properties(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection { mut client, .. } = connect(&broker, BrokerConfig::default());
    client.send_protocol_header().await?;
    let (channel, method) = client.recv_method().await?;
    assert_eq!(channel, 0);
    let Method::ConnectionStart(start) = method else {
        panic!("expected connection.start, got {method:?}");
    };
    assert_eq!((start.version_major, start.version_minor), (0, 9));
    assert!(start.mechanisms.split(' ').any(|m| m == "PLAIN"));
    assert!(start.server_properties.get("product").is_some());
    assert!(start.server_properties.get("capabilities").is_some());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn unsupported_header_is_answered_and_dropped(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection {
        mut client, task, ..
    } = connect(&broker, BrokerConfig::default());
    client.stream_mut().write_all(b"AMQP\x01\x01\x00\x0a").await?;

    let mut echoed = Vec::new();
    client.stream_mut().read_to_end(&mut echoed).await?;
    assert_eq!(echoed, PROTOCOL_HEADER);

    task.await.expect("connection task");
    assert!(broker.connections().is_empty());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn channel_frame_before_open_hard_closes(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection {
        id,
        mut client,
        task,
    } = connect(&broker, BrokerConfig::default());
    client.send_protocol_header().await?;
    assert!(matches!(
        client.recv_method().await?,
        (0, Method::ConnectionStart(_))
    ));

    client.send_method(5, Method::ChannelOpen).await?;

    // No connection.close: the stream simply ends.
    assert_eq!(client.recv_frame().await?, None);
    task.await.expect("connection task");
    assert!(!broker.connections().contains(&id));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn pipelined_handshake_and_channel_open_are_handled_in_order(
    broker: Arc<Broker>,
) -> io::Result<()> {
    for _ in 0..10 {
        let TestConnection { mut client, .. } = connect(&broker, BrokerConfig::default());
        client.send_protocol_header().await?;
        assert!(matches!(
            client.recv_method().await?,
            (0, Method::ConnectionStart(_))
        ));

        // Nothing below waits for a reply before sending the next method.
        client
            .send_method(
                0,
                Method::ConnectionStartOk(ConnectionStartOk {
                    mechanism: "PLAIN".into(),
                    response: bytes::Bytes::from_static(PLAIN_RESPONSE),
                    ..Default::default()
                }),
            )
            .await?;
        client
            .send_method(0, Method::ConnectionTuneOk(Tune::default()))
            .await?;
        client
            .send_method(
                0,
                Method::ConnectionOpen {
                    virtual_host: "/".into(),
                },
            )
            .await?;
        client.send_method(1, Method::ChannelOpen).await?;

        assert!(matches!(
            client.recv_method().await?,
            (0, Method::ConnectionTune(_))
        ));
        client.expect_method(0, &Method::ConnectionOpenOk).await?;
        client.expect_method(1, &Method::ChannelOpenOk).await?;
        client.close().await?;
    }
    Ok(())
}

#[rstest]
#[tokio::test]
async fn unknown_mechanism_is_refused(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection { mut client, .. } = connect(&broker, BrokerConfig::default());
    client.send_protocol_header().await?;
    client.recv_method().await?;
    client
        .send_method(
            0,
            Method::ConnectionStartOk(ConnectionStartOk {
                mechanism: "EXTERNAL".into(),
                response: bytes::Bytes::from_static(b"x"),
                ..Default::default()
            }),
        )
        .await?;

    let (_, method) = client.recv_method().await?;
    let Method::ConnectionClose(close) = method else {
        panic!("expected connection.close, got {method:?}");
    };
    assert_eq!(close.reply_code, 403);
    assert_eq!((close.class_id, close.method_id), (10, 11));

    client.send_method(0, Method::ConnectionCloseOk).await?;
    client.expect_disconnect().await
}

#[rstest]
#[tokio::test]
async fn heartbeat_on_a_channel_is_a_frame_error(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection { mut client, .. } = connect(&broker, BrokerConfig::default());
    client.handshake(Tune::default()).await?;
    client
        .send_frame(WireFrame::new(FrameType::Heartbeat, 3, bytes::Bytes::new()))
        .await?;

    let (_, method) = client.recv_method().await?;
    let Method::ConnectionClose(close) = method else {
        panic!("expected connection.close, got {method:?}");
    };
    assert_eq!(close.reply_code, 501);
    client.send_method(0, Method::ConnectionCloseOk).await?;
    client.expect_disconnect().await
}

#[rstest]
#[tokio::test]
async fn channel_beyond_channel_max_is_rejected(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection { mut client, .. } =
        connect(&broker, BrokerConfig::default().channel_max(8));
    client.handshake(Tune::default()).await?;
    client.send_method(9, Method::ChannelOpen).await?;

    let (_, method) = client.recv_method().await?;
    let Method::ConnectionClose(close) = method else {
        panic!("expected connection.close, got {method:?}");
    };
    assert_eq!(close.reply_code, 504);
    client.send_method(0, Method::ConnectionCloseOk).await?;
    client.expect_disconnect().await
}

#[rstest]
#[tokio::test]
async fn channel_error_closes_only_that_channel(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection { id, mut client, .. } = connect(&broker, BrokerConfig::default());
    client.handshake(Tune::default()).await?;
    client.open_channel(1).await?;
    client.open_channel(2).await?;

    client
        .send_method(
            1,
            Method::ExchangeDeclare(ExchangeDeclare {
                exchange: "missing".into(),
                passive: true,
                ..Default::default()
            }),
        )
        .await?;
    let (channel, method) = client.recv_method().await?;
    assert_eq!(channel, 1);
    let Method::ChannelClose(close) = method else {
        panic!("expected channel.close, got {method:?}");
    };
    assert_eq!(close.reply_code, 404);
    assert_eq!((close.class_id, close.method_id), (40, 10));

    // Channel 2 is unaffected.
    client
        .send_method(
            2,
            Method::QueueDeclare(QueueDeclare {
                queue: "still-works".into(),
                ..Default::default()
            }),
        )
        .await?;
    let (channel, method) = client.recv_method().await?;
    assert_eq!(channel, 2);
    assert!(matches!(method, Method::QueueDeclareOk(ok) if ok.queue == "still-works"));

    client.send_method(1, Method::ChannelCloseOk).await?;
    client.open_channel(1).await?;
    let snapshot = broker.connections().snapshot(&id).expect("registered");
    assert_eq!(snapshot.channel_count, 2);

    client.close().await
}

#[rstest]
#[tokio::test]
async fn exclusive_queues_go_with_their_connection(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection {
        mut client, task, ..
    } = connect(&broker, BrokerConfig::default());
    client.handshake(Tune::default()).await?;
    client.open_channel(1).await?;
    client
        .send_method(
            1,
            Method::QueueDeclare(QueueDeclare {
                queue: "private".into(),
                exclusive: true,
                ..Default::default()
            }),
        )
        .await?;
    client.recv_method().await?;
    assert!(broker.queue("private").is_some());

    client.close().await?;
    task.await.expect("connection task");
    assert!(broker.queue("private").is_none());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn snapshot_serialises_to_json(broker: Arc<Broker>) -> io::Result<()> {
    let TestConnection { id, mut client, .. } = connect(&broker, BrokerConfig::default());
    client.handshake(Tune::default()).await?;
    client.open_channel(1).await?;

    let snapshot = broker.connections().snapshot(&id).expect("registered");
    let json = serde_json::to_value(&snapshot).expect("serialise snapshot");
    assert_eq!(json["id"], id.as_u64());
    assert_eq!(json["state"], "open");
    assert_eq!(json["channel_count"], 1);
    assert_eq!(json["client_properties"]["product"], "wirebroker_testing");

    client.close().await
}
