//! End-to-end tests over a real TCP listener.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use futures::StreamExt;
use rstest::{fixture, rstest};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::oneshot, time::{Duration, timeout}};
use tokio_util::codec::FramedRead;
use wirebroker::{
    AmqpCodec,
    BrokerConfig,
    BrokerServer,
    Method,
    protocol::PROTOCOL_HEADER,
};

#[fixture]
fn free_listener() -> StdTcpListener {
    StdTcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))
        .expect("Failed to bind free port listener")
}

#[rstest]
#[tokio::test]
async fn server_greets_and_closes_clients_on_shutdown(free_listener: StdTcpListener) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = BrokerServer::new(BrokerConfig::default())
        .workers(1)
        .ready_signal(ready_tx)
        .bind_listener(free_listener)
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    let broker = std::sync::Arc::clone(server.broker());
    let handle = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));
    ready_rx.await.expect("server ready");

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&PROTOCOL_HEADER).await.expect("send header");
    let mut frames = FramedRead::new(stream, AmqpCodec::default());
    let frame = frames
        .next()
        .await
        .expect("frame")
        .expect("decodable frame");
    assert!(matches!(
        Method::decode(&frame.payload),
        Ok(Method::ConnectionStart(_))
    ));
    assert_eq!(broker.connections().len(), 1);

    let _ = stop_tx.send(());
    let closed = timeout(Duration::from_secs(1), frames.next())
        .await
        .expect("connection closed on shutdown");
    assert!(closed.is_none());
    handle.await.expect("join").expect("server run");
    assert!(broker.connections().is_empty());
}
