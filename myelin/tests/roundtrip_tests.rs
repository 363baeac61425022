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

use crate::setup::{initialize_tracing, payloads::Reading};

mod setup;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// Tests a typed payload crossing the in-process queue transport.
///
/// **Scenario:**
/// 1. Open a send port that allocates a fresh mem queue.
/// 2. Attach a receive port to the same queue.
/// 3. Send one `Reading` through the typed helper.
/// 4. Receive it and decode it back into a `Reading`.
///
/// **Verification:**
/// - The receipt reports `Sent` with sequence number 1.
/// - The decoded payload carries the original field values.
/// - The header names the sending endpoint.
#[tokio::test]
async fn test_round_trip_over_mem() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(PortSpec::new("station_tx", Direction::Send)).await?;
    let mut rx = Port::open(
        PortSpec::new("station_rx", Direction::Recv).with_address(tx.address()),
    )
    .await?;

    let reading = Reading {
        station: "north-ridge".to_string(),
        celsius: 21.5,
    };
    let receipt = tx.send_typed(&reading).await?;
    assert_eq!(receipt.status, Status::Sent);
    assert_eq!(receipt.seq, 1);
    info!(seq = receipt.seq, "reading accepted");

    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.status(), Status::Received);
    assert_eq!(envelope.header.model, "station_tx");
    let decoded: Reading = envelope.decode_as()?;
    assert_eq!(decoded.station, "north-ridge");
    assert!((decoded.celsius - 21.5).abs() < f64::EPSILON);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests the same caller code running over a Unix domain socket.
///
/// **Scenario:**
/// 1. Open a send port with the `ipc` transport tag; it binds a socket.
/// 2. Attach a receive port to the socket path.
/// 3. Send three values and the end-of-stream marker.
///
/// **Verification:**
/// - All three values arrive in send order.
/// - The stream ends with an `Eof` envelope.
#[tokio::test]
async fn test_round_trip_over_ipc() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("ipc_tx", Direction::Send).with_transport(IPC),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("ipc_rx", Direction::Recv)
            .with_transport(IPC)
            .with_address(tx.address()),
    )
    .await?;

    for n in 1..=3 {
        tx.send(json!({ "n": n })).await?;
    }
    tx.send_eof().await?;

    for n in 1..=3 {
        let envelope = rx.recv(WAIT).await?;
        assert_eq!(envelope.into_value()?, json!({ "n": n }));
    }
    assert_eq!(rx.recv(WAIT).await?.status(), Status::Eof);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests the same caller code running over TCP pub/sub.
///
/// **Scenario:**
/// 1. Open a send port with the `tcp` tag; it binds an ephemeral port
///    and publishes to every attached connection.
/// 2. Attach a receive port to the bound address.
/// 3. Send three values and the end-of-stream marker.
///
/// **Verification:**
/// - All three values arrive in send order, then `Eof`.
#[tokio::test]
async fn test_round_trip_over_tcp() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("tcp_tx", Direction::Send).with_transport(TCP),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("tcp_rx", Direction::Recv)
            .with_transport(TCP)
            .with_address(tx.address()),
    )
    .await?;

    for n in 1..=3 {
        tx.send(json!(n)).await?;
    }
    tx.send_eof().await?;

    for n in 1..=3 {
        let envelope = rx.recv(WAIT).await?;
        assert_eq!(envelope.into_value()?, json!(n));
    }
    assert_eq!(rx.recv(WAIT).await?.status(), Status::Eof);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests the same caller code running through the broker daemon.
///
/// **Scenario:**
/// 1. Bind a broker daemon on an ephemeral port.
/// 2. Open a producer port and a consumer port on one named queue.
/// 3. Send three values and the end-of-stream marker.
/// 4. Shut the daemon down afterwards.
///
/// **Verification:**
/// - All three values arrive in send order, then `Eof`.
/// - Daemon shutdown reports no error.
#[tokio::test]
async fn test_round_trip_over_broker() -> anyhow::Result<()> {
    initialize_tracing();
    let daemon = BrokerDaemon::bind(None).await?;
    info!(address = %daemon.address(), "daemon up");
    let queue = format!("{}/readings", daemon.address());

    let mut tx = Port::open(
        PortSpec::new("broker_tx", Direction::Send)
            .with_transport(BROKER)
            .with_address(queue.clone())
            .with_multiple_comms(true),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("broker_rx", Direction::Recv)
            .with_transport(BROKER)
            .with_address(queue)
            .with_multiple_comms(true),
    )
    .await?;

    for n in 1..=3 {
        tx.send(json!(n)).await?;
    }
    tx.send_eof().await?;

    for n in 1..=3 {
        let envelope = rx.recv(WAIT).await?;
        assert_eq!(envelope.into_value()?, json!(n));
    }
    assert_eq!(rx.recv(WAIT).await?.status(), Status::Eof);

    tx.close().await?;
    rx.close().await?;
    daemon.shutdown().await?;
    Ok(())
}

/// Tests that sequence numbers count every accepted send exactly once.
///
/// **Scenario:**
/// 1. Send five values over a mem pair.
/// 2. Sign off.
///
/// **Verification:**
/// - Receipts carry sequence numbers 1 through 5.
/// - Received headers repeat the same numbers in order.
/// - The end-of-stream marker takes the next number.
#[tokio::test]
async fn test_sequence_is_monotone() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(PortSpec::new("seq_tx", Direction::Send)).await?;
    let mut rx = Port::open(
        PortSpec::new("seq_rx", Direction::Recv).with_address(tx.address()),
    )
    .await?;

    for n in 1..=5u64 {
        let receipt = tx.send(json!(n)).await?;
        assert_eq!(receipt.seq, n);
    }
    let eof = tx.send_eof().await?;
    assert_eq!(eof.seq, 6);

    for n in 1..=5u64 {
        let envelope = rx.recv(WAIT).await?;
        assert_eq!(envelope.header.seq, n);
        assert_eq!(envelope.into_value()?, json!(n));
    }
    assert_eq!(rx.recv(WAIT).await?.header.seq, 6);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests that close is idempotent and final on both directions.
///
/// **Scenario:**
/// 1. Open a mem pair and close both ports twice.
/// 2. Try to use them afterwards.
///
/// **Verification:**
/// - Every close returns `Ok`.
/// - Post-close send and receive fail with `Closed`.
/// - `is_open` flips and `n_pending` reports zero.
#[tokio::test]
async fn test_close_is_idempotent_and_final() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(PortSpec::new("closing_tx", Direction::Send)).await?;
    let mut rx = Port::open(
        PortSpec::new("closing_rx", Direction::Recv).with_address(tx.address()),
    )
    .await?;

    tx.close().await?;
    tx.close().await?;
    rx.close().await?;
    rx.close().await?;
    assert!(!tx.is_open());
    assert!(!rx.is_open());
    assert_eq!(rx.n_pending(), 0);

    let send_err = tx.send(json!(1)).await.unwrap_err();
    assert!(matches!(send_err, PortError::Closed));
    let recv_err = rx.recv(Some(Duration::ZERO)).await.unwrap_err();
    assert!(matches!(recv_err, PortError::Closed));
    Ok(())
}

/// Tests that the end-of-stream marker latches.
///
/// **Scenario:**
/// 1. Send one value, then sign off twice.
/// 2. Try to send another value.
/// 3. Drain the receive side past the marker.
///
/// **Verification:**
/// - The repeated sign-off returns the same receipt without a new frame.
/// - The late send fails with `Closed`.
/// - The receiver sees exactly one `Eof`, then `Closed`.
#[tokio::test]
async fn test_eof_latches_and_blocks_further_sends() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(PortSpec::new("eof_tx", Direction::Send)).await?;
    let mut rx = Port::open(
        PortSpec::new("eof_rx", Direction::Recv).with_address(tx.address()),
    )
    .await?;

    tx.send(json!("last words")).await?;
    let first = tx.send_eof().await?;
    let second = tx.send_eof().await?;
    assert_eq!(first.status, Status::Eof);
    assert_eq!(second.seq, first.seq);

    let err = tx.send(json!("too late")).await.unwrap_err();
    assert!(matches!(err, PortError::Closed));

    assert_eq!(rx.recv(WAIT).await?.into_value()?, json!("last words"));
    assert_eq!(rx.recv(WAIT).await?.status(), Status::Eof);
    let err = rx.recv(Some(Duration::ZERO)).await.unwrap_err();
    assert!(matches!(err, PortError::Closed));

    tx.close().await?;
    rx.close().await?;
    Ok(())
}
