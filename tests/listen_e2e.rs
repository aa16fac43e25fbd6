use bson::doc;
use mongowire::config::Config;
use mongowire::protocol::{OP_MSG, OP_QUERY, OperationBody};
use mongowire::server::spawn_with_shutdown;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[path = "common/wire.rs"]
mod wire;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();
    cfg
}

#[tokio::test]
async fn e2e_observer_decodes_split_writes_and_never_replies() {
    let (addr, mut observed, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let hello = wire::encode_op_msg(&doc! {"hello": 1i32, "$db": "admin"}, 0, 11);
    let query = wire::frame(
        wire::OP_QUERY,
        12,
        0,
        &wire::op_query_body(0, "test.coll", 0, 0, &[5, 0, 0, 0, 0]),
    );

    // First message split across two writes, second right behind it.
    stream.write_all(&hello[..7]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&hello[7..]).await.unwrap();
    stream.write_all(&query).await.unwrap();

    let first = timeout(Duration::from_secs(5), observed.recv()).await.unwrap().unwrap();
    assert_eq!(first.message.header.request_id, 11);
    assert_eq!(first.message.header.op_code, OP_MSG);
    assert_eq!(first.message.offset, 0);

    let second = timeout(Duration::from_secs(5), observed.recv()).await.unwrap().unwrap();
    assert_eq!(second.message.effective_opcode, OP_QUERY);
    assert_eq!(second.message.offset, hello.len() as u64);
    assert!(matches!(second.message.body, Some(OperationBody::Query(_))));
    assert_eq!(first.peer, second.peer);

    // Nothing ever comes back.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
    assert!(read.is_err(), "observer must not write to clients");

    shutdown.send(true).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn e2e_connections_are_framed_independently() {
    let (addr, mut observed, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();

    let ping = wire::encode_op_msg(&doc! {"ping": 1i32, "$db": "admin"}, 0, 21);
    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();

    // Half a message on `a` must not disturb `b`.
    a.write_all(&ping[..ping.len() / 2]).await.unwrap();
    b.write_all(&ping).await.unwrap();

    let got = timeout(Duration::from_secs(5), observed.recv()).await.unwrap().unwrap();
    assert_eq!(got.peer, b.local_addr().unwrap());
    assert!(got.message.anomalies.is_empty(), "{:?}", got.message.anomalies);

    a.write_all(&ping[ping.len() / 2..]).await.unwrap();
    let got = timeout(Duration::from_secs(5), observed.recv()).await.unwrap().unwrap();
    assert_eq!(got.peer, a.local_addr().unwrap());

    shutdown.send(true).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}
