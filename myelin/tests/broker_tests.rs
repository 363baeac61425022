/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![allow(dead_code, unused_doc_comments)]

use std::time::Duration;

use serde_json::json;
use tracing::*;

use myelin::prelude::*;

use crate::setup::initialize_tracing;

mod setup;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// Tests two consumers splitting one queue while EOF reaches them all.
///
/// **Scenario:**
/// 1. Bind a daemon; attach one producer and two consumers to a queue.
/// 2. Send four values, then sign off.
///
/// **Verification:**
/// - Each consumer takes exactly two values; together they hold all four.
/// - Both consumers see the end-of-stream marker.
/// - The daemon counted three attaches, four routed frames, and one EOF
///   broadcast.
#[tokio::test]
async fn test_two_consumers_split_a_queue_round_robin() -> anyhow::Result<()> {
    initialize_tracing();
    let daemon = BrokerDaemon::bind(None).await?;
    let stats = daemon.stats();
    let queue = format!("{}/harvest", daemon.address());

    let mut tx = Port::open(
        PortSpec::new("grower", Direction::Send)
            .with_transport(BROKER)
            .with_address(queue.clone())
            .with_multiple_comms(true),
    )
    .await?;
    let mut picker_a = Port::open(
        PortSpec::new("picker_a", Direction::Recv)
            .with_transport(BROKER)
            .with_address(queue.clone())
            .with_multiple_comms(true),
    )
    .await?;
    let mut picker_b = Port::open(
        PortSpec::new("picker_b", Direction::Recv)
            .with_transport(BROKER)
            .with_address(queue)
            .with_multiple_comms(true),
    )
    .await?;
    // Let the daemon register both consumers before anything routes.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for n in [10, 20, 30, 40] {
        tx.send(json!(n)).await?;
    }
    tx.send_eof().await?;

    let mut taken = Vec::new();
    for _ in 0..2 {
        taken.push(picker_a.recv(WAIT).await?.into_value()?);
    }
    for _ in 0..2 {
        taken.push(picker_b.recv(WAIT).await?.into_value()?);
    }
    let mut numbers: Vec<i64> = taken.iter().filter_map(serde_json::Value::as_i64).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![10, 20, 30, 40]);

    assert_eq!(picker_a.recv(WAIT).await?.status(), Status::Eof);
    assert_eq!(picker_b.recv(WAIT).await?.status(), Status::Eof);

    info!(
        attaches = stats.attaches(),
        routed = stats.routed(),
        "queue drained"
    );
    assert_eq!(stats.attaches(), 3);
    assert_eq!(stats.routed(), 4);
    assert_eq!(stats.eof_broadcasts(), 1);

    tx.close().await?;
    picker_a.close().await?;
    picker_b.close().await?;
    daemon.shutdown().await?;
    Ok(())
}

/// Tests that a queue holds frames for a consumer that is not there yet.
///
/// **Scenario:**
/// 1. A producer sends two values into a queue nobody consumes.
/// 2. A consumer attaches afterwards.
///
/// **Verification:**
/// - The late consumer receives both values in send order.
/// - The daemon counted both frames as routed.
#[tokio::test]
async fn test_frames_wait_for_a_late_consumer() -> anyhow::Result<()> {
    initialize_tracing();
    let daemon = BrokerDaemon::bind(None).await?;
    let stats = daemon.stats();
    let queue = format!("{}/patient", daemon.address());

    let mut tx = Port::open(
        PortSpec::new("early_tx", Direction::Send)
            .with_transport(BROKER)
            .with_address(queue.clone())
            .with_multiple_comms(true),
    )
    .await?;
    tx.send(json!("first")).await?;
    tx.send(json!("second")).await?;
    // Give the daemon time to take both frames in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut rx = Port::open(
        PortSpec::new("late_rx", Direction::Recv)
            .with_transport(BROKER)
            .with_address(queue)
            .with_multiple_comms(true),
    )
    .await?;
    assert_eq!(rx.recv(WAIT).await?.into_value()?, json!("first"));
    assert_eq!(rx.recv(WAIT).await?.into_value()?, json!("second"));
    assert_eq!(stats.routed(), 2);

    tx.close().await?;
    rx.close().await?;
    daemon.shutdown().await?;
    Ok(())
}

/// Tests piecewise iteration riding a queue derived on the same daemon.
///
/// **Scenario:**
/// 1. Open an iterating producer/consumer pair on one queue.
/// 2. Send an array; its elements travel a work queue the producer
///    derives on the daemon.
///
/// **Verification:**
/// - The consumer receives the rebuilt array.
/// - The daemon saw four attaches: the pair plus both ends of the work
///   queue.
/// - Routed frames cover the announcement and all three elements.
#[tokio::test]
async fn test_iteration_travels_a_derived_queue() -> anyhow::Result<()> {
    initialize_tracing();
    let daemon = BrokerDaemon::bind(None).await?;
    let stats = daemon.stats();
    let queue = format!("{}/batched", daemon.address());

    let mut tx = Port::open(
        PortSpec::new("batch_tx", Direction::Send)
            .with_transport(BROKER)
            .with_address(queue.clone())
            .with_multiple_comms(true)
            .with_transform(IterateTransform::new()),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("batch_rx", Direction::Recv)
            .with_transport(BROKER)
            .with_address(queue)
            .with_multiple_comms(true)
            .with_transform(IterateTransform::new()),
    )
    .await?;

    tx.send(json!([1, 2, 3])).await?;
    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.into_value()?, json!([1, 2, 3]));

    assert_eq!(stats.attaches(), 4);
    assert_eq!(stats.routed(), 4);
    assert_eq!(stats.eof_broadcasts(), 1);

    tx.close().await?;
    rx.close().await?;
    daemon.shutdown().await?;
    Ok(())
}
