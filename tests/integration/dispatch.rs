//! Inbound dispatch over real TLS connections.

use std::time::Duration;

use anyhow::Result;
use ed25519_dalek::SigningKey;

use rains_core::crypto::sign_message;
use rains_core::wire::{AssertionSection, NotificationSection, Object, ObjectType, QuerySection};
use rains_core::{Capability, Message, NotificationType, Section, Token};

use crate::*;

fn assertion() -> Section {
    Section::Assertion(AssertionSection {
        subject_name: "ns".into(),
        subject_zone: "example.".into(),
        context: ".".into(),
        content: vec![Object {
            kind: ObjectType::Ip4,
            value: "198.51.100.7".into(),
        }],
        signatures: Vec::new(),
    })
}

fn query(token: Token) -> Section {
    Section::Query(QuerySection {
        token,
        name: "ns.example.".into(),
        context: ".".into(),
        types: vec![ObjectType::Ip4],
        expires: 0,
        options: Vec::new(),
    })
}

fn only_notification(message: &Message) -> (Token, NotificationType) {
    match &message.content[..] {
        [Section::Notification(n)] => (n.token, n.kind),
        other => panic!("expected a single notification, got {other:?}"),
    }
}

#[tokio::test]
async fn unsolicited_assertion_lands_on_normal_queue() -> Result<()> {
    let pki = Pki::generate()?;
    // No combined workers: whatever reaches the normal queue stays there.
    let mut server = TestServer::start(&pki, |c| c.limits.normal_worker_count = 0).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let token = Token::from_label("T");
    client.send(&Message::new(token, vec![assertion()])).await?;

    eventually(|| server.server.stats().queues.normal == 1).await?;
    assert!(server.nothing_handled_for(Duration::from_millis(100)).await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn assertion_for_active_token_lands_on_priority_queue() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |c| c.limits.normal_worker_count = 0).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let token = Token::from_label("T");
    server.server.inbox().add_active_token(token);
    client.send(&Message::new(token, vec![assertion()])).await?;

    // Only the priority worker runs, so being handled proves the queue.
    let handled = server.next_handled().await?;
    assert_eq!(handled.via, "handle");
    assert_eq!(handled.item.token, token);
    assert_eq!(handled.item.sender, client.conn_info());
    assert_eq!(server.server.stats().queues.normal, 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn oversized_message_is_answered_with_msg_too_large() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |c| c.limits.max_msg_byte_length = 512).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let token = Token::from_label("huge");
    client.send(&Message::new(token, vec![assertion(); 20])).await?;

    let reply = client.recv().await?;
    assert_eq!(reply.token, token);
    assert_eq!(only_notification(&reply), (token, NotificationType::MsgTooLarge));
    assert!(server.nothing_handled_for(Duration::from_millis(100)).await);

    // The connection survives and keeps working.
    client.send(&Message::new(token, vec![assertion()])).await?;
    assert_eq!(server.next_handled().await?.item.token, token);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn garbage_is_answered_with_bad_message() -> Result<()> {
    let pki = Pki::generate()?;
    let server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    client.send_raw(b"{ this is not a message").await?;

    let reply = client.recv().await?;
    assert_eq!(
        only_notification(&reply),
        (Token::default(), NotificationType::BadMessage)
    );
    // Answered on the inbound connection, no dial.
    assert_eq!(server.server.stats().dials, 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn mismatched_query_gets_two_bad_messages() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let envelope = Token::from_label("envelope");
    let inner = Token::from_label("inner");
    client.send(&Message::new(envelope, vec![query(inner)])).await?;

    let first = only_notification(&client.recv().await?);
    let second = only_notification(&client.recv().await?);
    assert_eq!(first, (envelope, NotificationType::BadMessage));
    assert_eq!(second, (inner, NotificationType::BadMessage));
    assert!(server.nothing_handled_for(Duration::from_millis(100)).await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn matching_query_is_processed() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let token = Token::from_label("q");
    client.send(&Message::new(token, vec![query(token)])).await?;

    let handled = server.next_handled().await?;
    assert!(matches!(handled.item.section, Section::Query(_)));
    assert!(client.silent_for(Duration::from_millis(100)).await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn forged_signature_gets_no_answer() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let token = Token::from_label("forged");
    let mut message = Message::new(token, vec![query(Token::from_label("x"))]);
    sign_message(&mut message, &SigningKey::from_bytes(&[42; 32]))?;
    message.signatures[0].signature[0] ^= 0xff;
    client.send(&message).await?;

    // Not even the token mismatch is reported.
    assert!(client.silent_for(Duration::from_millis(200)).await);
    assert!(server.nothing_handled_for(Duration::from_millis(50)).await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn capability_negotiation_records_peer() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;
    let hash = server
        .server
        .inbox()
        .add_capabilities(&[Capability::TlsOverTcp]);

    let mut message = Message::new(Token::from_label("caps"), vec![assertion()]);
    message.capabilities = Some(hash);
    client.send(&message).await?;
    server.next_handled().await?;

    assert_eq!(
        server.server.inbox().peer_capabilities(&client.conn_info()),
        Some(vec![Capability::TlsOverTcp])
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_capability_is_logged_not_fatal() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let mut message = Message::new(Token::from_label("caps"), vec![assertion()]);
    message.capabilities = Some("urn:x-rains:telepathy".into());
    client.send(&message).await?;

    // The section still goes through.
    server.next_handled().await?;
    assert!(server
        .server
        .inbox()
        .peer_capabilities(&client.conn_info())
        .is_none());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn notification_for_unknown_token_is_dropped() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut client = Client::connect(&pki, server.addr()).await?;

    let token = Token::from_label("never issued");
    let message = Message::new(
        token,
        vec![Section::Notification(NotificationSection {
            token,
            kind: NotificationType::NoAssertionsExist,
            data: String::new(),
        })],
    );
    client.send(&message).await?;

    assert!(server.nothing_handled_for(Duration::from_millis(200)).await);
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn one_bad_connection_does_not_affect_others() -> Result<()> {
    let pki = Pki::generate()?;
    let mut server = TestServer::start(&pki, |_| {}).await?;
    let mut good = Client::connect(&pki, server.addr()).await?;
    let mut bad = Client::connect(&pki, server.addr()).await?;

    bad.send_raw(b"\xff\xfe garbage").await?;
    drop(bad);

    let token = Token::from_label("still fine");
    good.send(&Message::new(token, vec![assertion()])).await?;
    assert_eq!(server.next_handled().await?.item.token, token);

    server.stop().await;
    Ok(())
}
