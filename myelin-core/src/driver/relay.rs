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

//! Long-lived coupling of a receive port to a send port.

use anyhow::{bail, Context};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, instrument, trace, warn};

use crate::common::CONFIG;
use crate::message::{PortError, Status};
use crate::port::{Direction, Port};

/// Counters the relay loop keeps while it runs.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    filtered: AtomicU64,
}

impl RelayStats {
    /// Data messages pulled off the input port, filtered ones included.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages delivered to the output port.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Messages dropped by a filter on either side of the hop.
    #[must_use]
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }
}

/// Couples one receive port to one send port for the lifetime of the
/// connection.
///
/// The loop moves already-finalized values, so each side's pipeline runs
/// exactly once per hop and nothing is re-deserialized in between.
/// Filtered messages are skipped, EOF propagates to the output, and any
/// hop error stops the loop. Both ports close on every exit path; a
/// connection never half-dies.
#[derive(Debug)]
pub struct Relay {
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Relay {
    /// Validates directions and spawns the relay loop.
    #[instrument(skip(input, output), fields(input = %input.name(), output = %output.name()))]
    pub async fn start(mut input: Port, mut output: Port) -> anyhow::Result<Self> {
        if input.direction() != Direction::Recv || output.direction() != Direction::Send {
            let got = format!("{} and {}", input.direction(), output.direction());
            let _ = input.close().await;
            let _ = output.close().await;
            bail!("Relay needs a receive input and a send output, got {got}");
        }

        let stats = Arc::new(RelayStats::default());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(run(input, output, Arc::clone(&stats), cancel.clone()));

        debug!("relay started");
        Ok(Self {
            stats,
            cancel,
            tracker,
        })
    }

    /// A handle onto the relay's counters.
    #[must_use]
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Forces the loop down and waits for it, bounded by the shutdown
    /// window. Both ports are closed by the time this returns.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(CONFIG.timeouts.shutdown_timeout(), self.tracker.wait())
            .await
            .context("Relay loop did not stop inside the shutdown window")?;
        Ok(())
    }

    /// Waits for the loop to end on its own, which it does when the input
    /// stream reaches EOF or a hop fails.
    pub async fn join(self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run(mut input: Port, mut output: Port, stats: Arc<RelayStats>, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = input.recv(None) => received,
        };

        let envelope = match received {
            Ok(envelope) => envelope,
            Err(error) => {
                // A vanished peer is ordinary teardown; anything else is not.
                match error {
                    PortError::Closed => debug!(input = %input.name(), "input stream closed"),
                    error => error!(input = %input.name(), %error, "relay receive failed"),
                }
                break;
            }
        };

        match envelope.status() {
            Status::Eof => {
                if let Err(error) = output.send_eof().await {
                    error!(output = %output.name(), %error, "relay sign-off failed");
                }
                debug!("end of stream relayed");
                break;
            }
            Status::Filtered => {
                stats.received.fetch_add(1, Ordering::Relaxed);
                stats.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            _ => {}
        }
        stats.received.fetch_add(1, Ordering::Relaxed);

        let value = match envelope.into_value() {
            Ok(value) => value,
            Err(error) => {
                error!(%error, "relay envelope carried no value");
                break;
            }
        };
        match output.send(value).await {
            Ok(receipt) if receipt.status == Status::Filtered => {
                stats.filtered.fetch_add(1, Ordering::Relaxed);
                trace!("outbound filter dropped a relayed value");
            }
            Ok(_) => {
                stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                error!(output = %output.name(), %error, "relay send failed");
                break;
            }
        }
    }

    if let Err(error) = input.close().await {
        warn!(%error, "relay input close failed");
    }
    if let Err(error) = output.close().await {
        warn!(%error, "relay output close failed");
    }
    debug!("relay loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ValueKind;
    use crate::pipeline::{CoerceTransform, FilterFn};
    use crate::port::PortSpec;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_values_cross_the_hop_once_finalized() {
        let mut upstream = Port::open(PortSpec::new("hop_src", Direction::Send))
            .await
            .unwrap();
        let input = Port::open(
            PortSpec::new("hop_in", Direction::Recv).with_address(upstream.address()),
        )
        .await
        .unwrap();
        let output = Port::open(PortSpec::new("hop_out", Direction::Send))
            .await
            .unwrap();
        let mut downstream = Port::open(
            PortSpec::new("hop_dst", Direction::Recv).with_address(output.address()),
        )
        .await
        .unwrap();

        let relay = Relay::start(input, output).await.unwrap();
        let stats = relay.stats();

        for n in 1..=3 {
            upstream.send(json!({ "n": n })).await.unwrap();
        }
        upstream.send_eof().await.unwrap();

        for n in 1..=3 {
            let envelope = downstream.recv(Some(Duration::from_secs(2))).await.unwrap();
            assert_eq!(envelope.into_value().unwrap(), json!({ "n": n }));
        }
        let envelope = downstream.recv(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(envelope.status(), Status::Eof);

        relay.join().await;
        assert_eq!(stats.received(), 3);
        assert_eq!(stats.forwarded(), 3);
        assert_eq!(stats.filtered(), 0);

        upstream.close().await.unwrap();
        downstream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_input_side_filter_is_counted_not_forwarded() {
        let mut upstream = Port::open(PortSpec::new("sift_src", Direction::Send))
            .await
            .unwrap();
        let input = Port::open(
            PortSpec::new("sift_in", Direction::Recv)
                .with_address(upstream.address())
                .with_filter(FilterFn::new("positive", |v| {
                    v.as_i64().unwrap_or(-1) > 0
                })),
        )
        .await
        .unwrap();
        let output = Port::open(PortSpec::new("sift_out", Direction::Send))
            .await
            .unwrap();
        let mut downstream = Port::open(
            PortSpec::new("sift_dst", Direction::Recv).with_address(output.address()),
        )
        .await
        .unwrap();

        let relay = Relay::start(input, output).await.unwrap();
        let stats = relay.stats();

        upstream.send(json!(-1)).await.unwrap();
        upstream.send(json!(7)).await.unwrap();
        upstream.send_eof().await.unwrap();

        let envelope = downstream.recv(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(envelope.into_value().unwrap(), json!(7));

        relay.join().await;
        assert_eq!(stats.received(), 2);
        assert_eq!(stats.forwarded(), 1);
        assert_eq!(stats.filtered(), 1);

        upstream.close().await.unwrap();
        downstream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_direction_mismatch_refused() {
        let a = Port::open(PortSpec::new("mixed_a", Direction::Send))
            .await
            .unwrap();
        let b = Port::open(PortSpec::new("mixed_b", Direction::Recv)).await.unwrap();

        // Arguments swapped: send given as input, recv as output.
        let err = Relay::start(a, b).await.unwrap_err();
        assert!(err.to_string().contains("receive input"));
    }

    #[tokio::test]
    async fn test_stop_is_prompt_on_an_idle_relay() {
        let input = Port::open(PortSpec::new("idle_in", Direction::Recv))
            .await
            .unwrap();
        let output = Port::open(PortSpec::new("idle_out", Direction::Send))
            .await
            .unwrap();

        let relay = Relay::start(input, output).await.unwrap();
        let stats = relay.stats();
        relay.stop().await.unwrap();
        assert_eq!(stats.received(), 0);
    }

    #[tokio::test]
    async fn test_hop_failure_ends_the_loop_and_releases_both_ports() {
        let mut upstream = Port::open(PortSpec::new("torn_src", Direction::Send))
            .await
            .unwrap();
        let input = Port::open(
            PortSpec::new("torn_in", Direction::Recv).with_address(upstream.address()),
        )
        .await
        .unwrap();
        // Coercion on the output side fails the hop partway through.
        let output = Port::open(
            PortSpec::new("torn_out", Direction::Send)
                .with_transform(CoerceTransform::new(ValueKind::Integer)),
        )
        .await
        .unwrap();

        let relay = Relay::start(input, output).await.unwrap();
        upstream.send(json!("not a number")).await.unwrap();

        // The loop breaks on the failed hop and closes both ports.
        relay.join().await;

        // The input's attach claim was released, so a fresh exclusive
        // attach on the same address goes through.
        let mut probe = Port::open(
            PortSpec::new("torn_probe", Direction::Recv).with_address(upstream.address()),
        )
        .await
        .unwrap();
        probe.close().await.unwrap();
        upstream.close().await.unwrap();
    }
}
