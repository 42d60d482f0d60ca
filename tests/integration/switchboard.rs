//! Outbound sends: dialing, connection reuse and pruning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use rains_core::codec;
use rains_core::framer::{Deframer, NewLineFramer};
use rains_core::wire::{NotificationSection, NotificationType, ObjectType, QuerySection};
use rains_core::{ConnInfo, Message, Section, Token};

use crate::*;

/// A TLS endpoint that counts handshakes and forwards every frame it reads.
struct Sink {
    addr: std::net::SocketAddr,
    accepted: Arc<AtomicUsize>,
    frames: mpsc::UnboundedReceiver<Bytes>,
}

impl Sink {
    async fn start(pki: &Pki) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(pki.server_config()?);
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, frames) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut deframer = Deframer::new(tls, Arc::new(NewLineFramer), 1 << 20);
                    while let Ok(Some(frame)) = deframer.next_frame().await {
                        let _ = tx.send(frame);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            accepted,
            frames,
        })
    }

    async fn next_message(&mut self) -> Result<Message> {
        let frame = tokio::time::timeout(WAIT, self.frames.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("sink closed"))?;
        Ok(codec::parse_message(&frame)?)
    }
}

fn heartbeat(label: &str) -> Vec<u8> {
    codec::notification_message(Token::from_label(label), NotificationType::Heartbeat, "")
        .expect("encode")
}

#[tokio::test]
async fn second_send_reuses_cached_connection() -> Result<()> {
    let pki = Pki::generate()?;
    let server = TestServer::start(&pki, |_| {}).await?;
    let mut sink = Sink::start(&pki).await?;
    let receiver = ConnInfo::from(sink.addr);
    let switchboard = server.server.switchboard();

    switchboard.send_to(&heartbeat("one"), receiver).await;
    switchboard.send_to(&heartbeat("two"), receiver).await;

    assert_eq!(sink.next_message().await?.token, Token::from_label("one"));
    assert_eq!(sink.next_message().await?.token, Token::from_label("two"));
    assert_eq!(sink.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(switchboard.dial_count(), 1);
    assert_eq!(switchboard.connection_count(), 1);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn untrusted_peer_is_not_cached() -> Result<()> {
    let pki = Pki::generate()?;
    let other = Pki::generate()?;
    let server = TestServer::start(&pki, |_| {}).await?;
    // Presents a certificate from a CA the server does not trust.
    let sink = Sink::start(&other).await?;

    server
        .server
        .switchboard()
        .send_to(&heartbeat("rejected"), ConnInfo::from(sink.addr))
        .await;

    assert_eq!(server.server.switchboard().dial_count(), 0);
    assert_eq!(server.server.switchboard().connection_count(), 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn closed_peer_is_pruned_from_cache() -> Result<()> {
    let pki = Pki::generate()?;
    let server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;
    let client_info = client.conn_info();

    // Any message makes the server aware of us; the accepted connection is cached.
    client.send_raw(b"not json").await?;
    client.recv().await?;
    assert_eq!(server.server.switchboard().connection_count(), 1);

    drop(client);
    eventually(|| server.server.switchboard().connection_count() == 0).await?;

    // Nothing listens on the client's port any more: the send just fails.
    server
        .server
        .switchboard()
        .send_to(&heartbeat("gone"), client_info)
        .await;
    assert_eq!(server.server.switchboard().dial_count(), 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn idle_connection_times_out() -> Result<()> {
    let pki = Pki::generate()?;
    let server = TestServer::start(&pki, |c| c.timeouts.tcp_timeout_secs = 1).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    client.send_raw(b"wake up").await?;
    client.recv().await?;
    assert_eq!(server.server.switchboard().connection_count(), 1);

    eventually(|| server.server.switchboard().connection_count() == 0).await?;
    // The server closed its side.
    let closed = tokio::time::timeout(Duration::from_secs(3), client.recv()).await;
    assert!(matches!(closed, Ok(Err(_))));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn reply_to_dialed_peer_flows_back_over_same_connection() -> Result<()> {
    let pki = Pki::generate()?;
    let mut a = TestServer::start(&pki, |_| {}).await?;
    let mut b = TestServer::start(&pki, |_| {}).await?;

    // b never issued this token, so the first copy is dropped. Once b knows
    // the token the second copy is handled, with a's dialing socket as sender.
    let token = Token::from_label("hello b");
    let notification = Message::new(
        token,
        vec![Section::Notification(NotificationSection {
            token,
            kind: NotificationType::Heartbeat,
            data: String::new(),
        })],
    );
    a.server
        .switchboard()
        .send_to(&codec::encode_message(&notification)?, b.conn_info())
        .await;
    assert!(b.nothing_handled_for(Duration::from_millis(100)).await);

    b.server.inbox().add_active_token(token);
    a.server
        .switchboard()
        .send_to(&codec::encode_message(&notification)?, b.conn_info())
        .await;
    let seen = b.next_handled().await?;
    assert_eq!(seen.via, "notify");
    assert_ne!(seen.item.sender, a.conn_info());

    // b answers the sender it saw; that lands on a's dialed connection.
    a.server.inbox().add_active_token(token);
    b.server
        .switchboard()
        .send_to(&codec::encode_message(&notification)?, seen.item.sender)
        .await;
    let back = a.next_handled().await?;
    assert_eq!(back.via, "notify");
    assert_eq!(back.item.sender, b.conn_info());
    assert_eq!(b.server.switchboard().dial_count(), 0);
    assert_eq!(a.server.switchboard().dial_count(), 1);

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn stalled_dial_does_not_delay_other_replies() -> Result<()> {
    let pki = Pki::generate()?;
    let server = TestServer::start(&pki, |c| c.timeouts.dial_timeout_secs = 3).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;
    client.send_raw(b"hello?").await?;
    client.recv().await?;

    // Accepts TCP and then never says a word, so the TLS handshake hangs.
    let tarpit = TcpListener::bind("127.0.0.1:0").await?;
    let tarpit_addr = tarpit.local_addr()?;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = tarpit.accept().await {
            held.push(tcp);
        }
    });

    let query = QuerySection {
        token: Token::default(),
        name: "slow.example.".into(),
        context: ".".into(),
        types: vec![ObjectType::Ip4],
        expires: 0,
        options: Vec::new(),
    };
    server
        .server
        .inbox()
        .issue_query(query, ConnInfo::from(tarpit_addr))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    client.send_raw(b"garbage").await?;
    let reply = tokio::time::timeout(Duration::from_secs(1), client.recv()).await??;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        &reply.content[..],
        [Section::Notification(n)] if n.kind == NotificationType::BadMessage
    ));

    server.stop().await;
    Ok(())
}
