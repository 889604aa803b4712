use std::time::Duration;

use armonite::bus::{BusClient, BusServer, ConnectOptions};
use serde_json::json;

fn fast_options() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(1),
        attempts: 1,
        backoff: Duration::from_millis(50),
        reconnect: false,
    }
}

#[tokio::test]
async fn publish_reaches_every_subscriber_of_the_subject() {
    let server = BusServer::start("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();

    let publisher = BusClient::connect(&addr, fast_options()).await.unwrap();
    let first = BusClient::connect(&addr, fast_options()).await.unwrap();
    let second = BusClient::connect(&addr, fast_options()).await.unwrap();

    let mut first_rx = first.subscribe("armonite.test.command").await.unwrap();
    let mut second_rx = second.subscribe("armonite.test.command").await.unwrap();

    publisher
        .publish("armonite.test.command", &json!({"command": "START"}))
        .unwrap();

    for rx in [&mut first_rx, &mut second_rx] {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message expected")
            .unwrap();
        assert_eq!(payload["command"], "START");
    }
}

#[tokio::test]
async fn subjects_are_exact_match() {
    let server = BusServer::start("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();

    let publisher = BusClient::connect(&addr, fast_options()).await.unwrap();
    let subscriber = BusClient::connect(&addr, fast_options()).await.unwrap();

    let mut own = subscriber
        .subscribe("armonite.agent.a.command")
        .await
        .unwrap();
    let mut other = subscriber
        .subscribe("armonite.agent.b.command")
        .await
        .unwrap();

    publisher
        .publish("armonite.agent.a.command", &json!({"command": "START_PHASE"}))
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), own.recv())
        .await
        .expect("agent a message expected")
        .unwrap();
    assert_eq!(payload["command"], "START_PHASE");

    // Nothing leaks onto the sibling subject.
    let leaked = tokio::time::timeout(Duration::from_millis(300), other.recv()).await;
    assert!(leaked.is_err(), "agent b unexpectedly received {:?}", leaked);
}

#[tokio::test]
async fn publishing_without_subscribers_is_harmless() {
    let server = BusServer::start("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();
    let client = BusClient::connect(&addr, fast_options()).await.unwrap();

    client.publish("armonite.ping", &json!("ping")).unwrap();
    // The session stays usable afterwards.
    let mut rx = client.subscribe("armonite.telemetry").await.unwrap();
    client
        .publish("armonite.telemetry", &json!({"agent_id": "a"}))
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message expected")
        .unwrap();
    assert_eq!(payload["agent_id"], "a");
}

#[tokio::test]
async fn connect_fails_after_exhausting_attempts() {
    // Grab a port and close it again so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = BusClient::connect(&addr, fast_options()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn wait_ready_resolves_for_a_live_broker() {
    let server = BusServer::start("127.0.0.1:0").await.unwrap();
    server.wait_ready(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn drain_flushes_and_closes_the_session() {
    let server = BusServer::start("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();

    let subscriber = BusClient::connect(&addr, fast_options()).await.unwrap();
    let mut rx = subscriber.subscribe("armonite.agent.status").await.unwrap();

    let publisher = BusClient::connect(&addr, fast_options()).await.unwrap();
    publisher
        .publish("armonite.agent.status", &json!({"status": "stopping"}))
        .unwrap();
    publisher.drain().await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("pre-drain publish should be delivered")
        .unwrap();
    assert_eq!(payload["status"], "stopping");

    // The drained session rejects further work.
    assert!(publisher.drain().await.is_err());
}
