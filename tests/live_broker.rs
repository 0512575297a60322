// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! These tests need a RabbitMQ broker listening on localhost.

use futures_util::future::join_all;
use lapin::{
    options::{BasicAckOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties,
};
use rabbitmq_connection::{ConnectionConfig, ConnectionManager, Signal};
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};
use tracing_subscriber::EnvFilter;

const QUEUE: &str = "rabbitmq-connection-test-queue";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
#[ignore = "needs a RabbitMQ broker on localhost"]
async fn delivers_channels_from_a_live_broker() {
    init_tracing();

    let manager = ConnectionManager::lapin(ConnectionConfig::new("amqp://localhost")).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registration = manager.acquire_channel(move |channel| {
        let _ = tx.send(channel);
    });

    let channel = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("channel delivered in time")
        .unwrap();
    assert!(channel.status().connected());
    assert_eq!(registration.deliveries(), 1);

    let channels = join_all([manager.open_channel(), manager.open_channel()]).await;
    let ids: Vec<u16> = channels
        .into_iter()
        .map(|channel| channel.unwrap().id())
        .collect();
    assert_ne!(ids[0], ids[1]);

    manager.shutdown();
    manager.join().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a RabbitMQ broker on localhost"]
async fn delivered_channel_can_send_and_ack_a_message() {
    init_tracing();

    let manager = ConnectionManager::lapin(ConnectionConfig::new("amqp://localhost")).unwrap();
    let channel = timeout(Duration::from_secs(5), manager.open_channel())
        .await
        .expect("channel opened in time")
        .unwrap();

    channel
        .queue_declare(QUEUE, QueueDeclareOptions::default(), FieldTable::default())
        .await
        .unwrap();

    channel
        .basic_publish(
            "",
            QUEUE,
            BasicPublishOptions::default(),
            br#"{"type":"test"}"#,
            BasicProperties::default(),
        )
        .await
        .unwrap()
        .await
        .unwrap();

    let mut message = None;
    for _ in 0..50 {
        message = channel
            .basic_get(QUEUE, BasicGetOptions::default())
            .await
            .unwrap();
        if message.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let message = message.expect("message received");
    let content: serde_json::Value = serde_json::from_slice(&message.delivery.data).unwrap();
    assert_eq!(content["type"], "test");
    message
        .delivery
        .ack(BasicAckOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs a RabbitMQ broker on localhost"]
async fn unknown_host_gives_up_after_the_budget() {
    init_tracing();

    let manager =
        ConnectionManager::lapin(ConnectionConfig::new("amqp://nohost").max_retries(1)).unwrap();
    let failed = manager.events().next(Signal::ConnectFailed);

    let result = timeout(Duration::from_secs(10), manager.join())
        .await
        .expect("gave up in time");

    assert!(failed.await.is_some());
    assert!(result.unwrap_err().is_fatal());
}
