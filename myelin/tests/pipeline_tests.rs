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

/// Tests that coercion runs on send and declares the new kind to both ends.
///
/// **Scenario:**
/// 1. Open a mem pair where both specs coerce to `String`.
/// 2. Send an integer.
///
/// **Verification:**
/// - The receiver sees the stringified value.
/// - Both ports declare `String` afterwards.
#[tokio::test]
async fn test_coercion_updates_declared_kind_on_both_ends() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("coerce_tx", Direction::Send)
            .with_transform(CoerceTransform::new(ValueKind::String)),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("coerce_rx", Direction::Recv)
            .with_address(tx.address())
            .with_transform(CoerceTransform::new(ValueKind::String)),
    )
    .await?;

    tx.send(json!(7)).await?;
    assert_eq!(tx.declared_kind(), ValueKind::String);

    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.header.kind, ValueKind::String);
    assert_eq!(envelope.into_value()?, json!("7"));
    assert_eq!(rx.declared_kind(), ValueKind::String);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests that field selection projects on the wire and on arrival.
///
/// **Scenario:**
/// 1. Open a mem pair where both specs keep only `id` and `name`.
/// 2. Send an object carrying an extra field.
///
/// **Verification:**
/// - The received object holds exactly the selected fields.
#[tokio::test]
async fn test_field_selection_drops_unlisted_fields() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("select_tx", Direction::Send)
            .with_transform(SelectTransform::new(["id", "name"])),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("select_rx", Direction::Recv)
            .with_address(tx.address())
            .with_transform(SelectTransform::new(["id", "name"])),
    )
    .await?;

    tx.send(json!({ "id": 4, "name": "alpha", "secret": "gone" }))
        .await?;
    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.into_value()?, json!({ "id": 4, "name": "alpha" }));

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests that a custom transform applies forward on send and inverse on
/// receive.
///
/// **Scenario:**
/// 1. Open a symmetric pair whose transform doubles outbound and halves
///    inbound.
/// 2. Open a second pair where only the sender transforms.
/// 3. Send the same value through both.
///
/// **Verification:**
/// - The symmetric pair yields the original value back.
/// - The bare receiver of the second pair sees the doubled wire value.
#[tokio::test]
async fn test_transform_inverse_restores_the_sent_value() -> anyhow::Result<()> {
    initialize_tracing();
    let doubled = || {
        TransformFn::with_inverse(
            "double",
            |v| Ok(json!(v.as_i64().unwrap_or(0) * 2)),
            |v| Ok(json!(v.as_i64().unwrap_or(0) / 2)),
        )
    };

    let mut tx = Port::open(
        PortSpec::new("double_tx", Direction::Send).with_transform(doubled()),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("double_rx", Direction::Recv)
            .with_address(tx.address())
            .with_transform(doubled()),
    )
    .await?;
    tx.send(json!(21)).await?;
    assert_eq!(rx.recv(WAIT).await?.into_value()?, json!(21));
    tx.close().await?;
    rx.close().await?;

    let mut tx = Port::open(
        PortSpec::new("wire_tx", Direction::Send).with_transform(doubled()),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("wire_rx", Direction::Recv).with_address(tx.address()),
    )
    .await?;
    tx.send(json!(21)).await?;
    assert_eq!(rx.recv(WAIT).await?.into_value()?, json!(42));
    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests that an outbound filter rejection is a successful no-op.
///
/// **Scenario:**
/// 1. Open a sender that only accepts non-negative numbers.
/// 2. Send a negative value, then a positive one, then sign off.
///
/// **Verification:**
/// - The rejected send reports `Filtered` and moves no sequence number.
/// - The accepted send takes sequence number 1.
/// - The receiver sees only the accepted value before end of stream.
#[tokio::test]
async fn test_outbound_filter_rejects_without_sending() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("guarded_tx", Direction::Send)
            .with_filter(FilterFn::new("non_negative", |v| v.as_i64().unwrap_or(0) >= 0)),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("guarded_rx", Direction::Recv).with_address(tx.address()),
    )
    .await?;

    let rejected = tx.send(json!(-4)).await?;
    assert_eq!(rejected.status, Status::Filtered);
    assert!(!rejected.delivered());
    assert_eq!(rejected.seq, 0);

    let accepted = tx.send(json!(4)).await?;
    assert_eq!(accepted.status, Status::Sent);
    assert_eq!(accepted.seq, 1);
    tx.send_eof().await?;

    assert_eq!(rx.recv(WAIT).await?.into_value()?, json!(4));
    assert_eq!(rx.recv(WAIT).await?.status(), Status::Eof);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests that a receive-side filter drops messages on arrival.
///
/// **Scenario:**
/// 1. Open a plain sender and a receiver that only accepts even numbers.
/// 2. Send an odd value, then an even one.
///
/// **Verification:**
/// - The first receive finalizes as `Filtered` with no value.
/// - The second receive delivers the even value.
#[tokio::test]
async fn test_inbound_filter_drops_on_arrival() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(PortSpec::new("plain_tx", Direction::Send)).await?;
    let mut rx = Port::open(
        PortSpec::new("even_rx", Direction::Recv)
            .with_address(tx.address())
            .with_filter(FilterFn::new("even", |v| v.as_i64().unwrap_or(1) % 2 == 0)),
    )
    .await?;

    tx.send(json!(3)).await?;
    tx.send(json!(8)).await?;

    let dropped = rx.recv(WAIT).await?;
    assert_eq!(dropped.status(), Status::Filtered);
    assert!(dropped.value().is_none());

    let kept = rx.recv(WAIT).await?;
    assert_eq!(kept.status(), Status::Received);
    assert_eq!(kept.into_value()?, json!(8));

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests piecewise delivery of an array over a work port.
///
/// **Scenario:**
/// 1. Open a mem pair where both specs iterate containers.
/// 2. Send a five-element array of mixed values.
///
/// **Verification:**
/// - The receiver rebuilds the array equal to the original, in order.
#[tokio::test]
async fn test_array_iterates_piecewise_and_rebuilds() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("iter_tx", Direction::Send).with_transform(IterateTransform::new()),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("iter_rx", Direction::Recv)
            .with_address(tx.address())
            .with_transform(IterateTransform::new()),
    )
    .await?;

    let source = json!([1, "two", 3.5, { "four": 4 }, [5]]);
    tx.send(source.clone()).await?;
    info!("array dispatched onto a work port");

    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.status(), Status::Received);
    assert_eq!(envelope.into_value()?, source);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests piecewise delivery of an object as key/value pairs.
///
/// **Scenario:**
/// 1. Open a mem pair where both specs iterate containers.
/// 2. Send an object with nested values.
///
/// **Verification:**
/// - The receiver rebuilds an object equal to the original.
#[tokio::test]
async fn test_object_iterates_as_pairs_and_rebuilds() -> anyhow::Result<()> {
    initialize_tracing();
    let mut tx = Port::open(
        PortSpec::new("pairs_tx", Direction::Send).with_transform(IterateTransform::new()),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("pairs_rx", Direction::Recv)
            .with_address(tx.address())
            .with_transform(IterateTransform::new()),
    )
    .await?;

    let source = json!({ "station": "north-ridge", "samples": [21.5, 20.9], "ok": true });
    tx.send(source.clone()).await?;

    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.into_value()?, source);

    tx.close().await?;
    rx.close().await?;
    Ok(())
}

/// Tests that element filters drop exactly the rejected elements.
///
/// **Scenario:**
/// 1. Open a mem pair whose iteration stage keeps odd numbers only.
/// 2. Send the array `[1, 2, 3, 4, 5]`.
///
/// **Verification:**
/// - The receiver gets `[1, 3, 5]`; the whole message is not rejected.
#[tokio::test]
async fn test_element_filter_drops_rejected_elements_only() -> anyhow::Result<()> {
    initialize_tracing();
    let odd_only = || {
        IterateTransform::new()
            .with_filter(FilterFn::new("odd", |v| v.as_i64().unwrap_or(0) % 2 == 1))
    };
    let mut tx = Port::open(
        PortSpec::new("sieve_tx", Direction::Send).with_transform(odd_only()),
    )
    .await?;
    let mut rx = Port::open(
        PortSpec::new("sieve_rx", Direction::Recv)
            .with_address(tx.address())
            .with_transform(odd_only()),
    )
    .await?;

    tx.send(json!([1, 2, 3, 4, 5])).await?;

    let envelope = rx.recv(WAIT).await?;
    assert_eq!(envelope.status(), Status::Received);
    assert_eq!(envelope.into_value()?, json!([1, 3, 5]));

    tx.close().await?;
    rx.close().await?;
    Ok(())
}
