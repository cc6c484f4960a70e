/// Live transport tests over loopback TCP
use chatsync_core::config::ReconnectPolicy;
use chatsync_core::protocol::{InboundEvent, OutboundEvent};
use chatsync_core::transport::{ConnectionState, TcpTransport, Transport};
use chatsync_core::UserId;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(1),
    }
}

async fn accept(listener: &TcpListener) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    let (reader, writer) = stream.into_split();
    (BufReader::new(reader).lines(), writer)
}

async fn next_event(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> OutboundEvent {
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("no event from client")
        .unwrap()
        .expect("client closed the connection");
    OutboundEvent::from_bytes(line.as_bytes()).unwrap()
}

async fn recv(inbound: &mut mpsc::Receiver<InboundEvent>) -> InboundEvent {
    timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("no inbound event")
        .expect("transport stopped")
}

#[tokio::test]
async fn test_join_sent_on_every_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (transport, _inbound) = TcpTransport::connect(addr, UserId::new("alice"), fast_policy());

    let (mut lines, writer) = accept(&listener).await;
    assert_eq!(next_event(&mut lines).await, OutboundEvent::Join(UserId::new("alice")));

    // Server drops the connection; the client comes back and joins again
    drop(lines);
    drop(writer);
    let (mut lines, _writer) = accept(&listener).await;
    assert_eq!(next_event(&mut lines).await, OutboundEvent::Join(UserId::new("alice")));

    transport.emit(OutboundEvent::ChatClosed).await.unwrap();
    assert_eq!(next_event(&mut lines).await, OutboundEvent::ChatClosed);
}

#[tokio::test]
async fn test_inbound_events_delivered_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (_transport, mut inbound) = TcpTransport::connect(addr, UserId::new("alice"), fast_policy());

    let (mut lines, mut writer) = accept(&listener).await;
    next_event(&mut lines).await;

    let first = InboundEvent::OnlineUsers(vec![UserId::new("bob")]);
    let second = InboundEvent::RemovedFromGroup("g1".to_string());
    let mut payload = first.to_bytes().unwrap();
    payload.extend_from_slice(b"\nnot an event\n\n{\"event\":\"somethingNew\",\"data\":{}}\n");
    payload.extend_from_slice(&second.to_bytes().unwrap());
    payload.push(b'\n');
    writer.write_all(&payload).await.unwrap();

    assert_eq!(recv(&mut inbound).await, first);
    assert_eq!(recv(&mut inbound).await, second);
}

#[tokio::test]
async fn test_events_emitted_while_disconnected_are_flushed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (transport, _inbound) = TcpTransport::connect(addr, UserId::new("alice"), fast_policy());

    transport.emit(OutboundEvent::ChatClosed).await.unwrap();

    let (mut lines, _writer) = accept(&listener).await;
    assert!(matches!(next_event(&mut lines).await, OutboundEvent::Join(_)));
    assert_eq!(next_event(&mut lines).await, OutboundEvent::ChatClosed);
}

#[tokio::test]
async fn test_close_stops_reconnecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (transport, mut inbound) = TcpTransport::connect(addr, UserId::new("alice"), fast_policy());

    let (mut lines, _writer) = accept(&listener).await;
    next_event(&mut lines).await;

    let mut state = transport.subscribe_state();
    transport.close();
    timeout(Duration::from_secs(5), async {
        while *state.borrow_and_update() != ConnectionState::Closed {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("transport did not close");

    assert!(timeout(Duration::from_secs(5), inbound.recv()).await.unwrap().is_none());
    assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
}
