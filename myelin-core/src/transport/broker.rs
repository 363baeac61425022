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

//! Broker transport: a client channel and the daemon it talks to.
//!
//! A broker address names a queue on a daemon as `host:port/queue`. The
//! channel dials the daemon, announces itself with an attach frame naming
//! the queue and its role, then relays data and EOF frames. The daemon
//! buffers each queue, hands data frames to one consumer at a time in
//! round-robin order, and broadcasts EOF frames to every consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use mti::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, trace, warn};

use super::sock::{self, FanMode, SocketCore, SocketShared};
use crate::common::CONFIG;
use crate::message::frame::{self, FrameKind};
use crate::message::{Header, PortError, ValueKind};

/// Which side of a queue a broker client sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BrokerRole {
    /// Sends frames into the queue.
    Producer,
    /// Takes frames out of the queue.
    Consumer,
}

/// Payload of an attach control frame.
#[derive(Debug, Serialize, Deserialize)]
struct AttachRequest {
    queue: String,
    role: BrokerRole,
}

fn split_address(address: &str) -> Result<(String, String), PortError> {
    match address.split_once('/') {
        Some((daemon, queue)) if !daemon.is_empty() && !queue.is_empty() => {
            Ok((daemon.to_string(), queue.to_string()))
        }
        _ => Err(PortError::Config(format!(
            "Broker address must be host:port/queue, got '{address}'"
        ))),
    }
}

/// A client channel on one broker queue.
///
/// The channel cannot allocate from nothing: a daemon must already exist,
/// so opening without an address is a configuration error. Work ports
/// instead derive fresh queue names on the same daemon.
#[derive(Debug)]
pub struct BrokerChannel {
    core: SocketCore,
    daemon: String,
}

impl BrokerChannel {
    pub(crate) async fn open(
        address: Option<String>,
        role: BrokerRole,
        model: &str,
    ) -> Result<Self, PortError> {
        let Some(address) = address else {
            return Err(PortError::Config(
                "Broker transport cannot allocate an address; give it host:port/queue".to_string(),
            ));
        };
        let (daemon, queue) = split_address(&address)?;

        let mut stream = sock::connect_with_retry(|| TcpStream::connect(daemon.clone())).await?;
        let attach = AttachRequest { queue, role };
        let header = Header::data(model, ValueKind::Any, 0);
        let payload = serde_json::to_vec(&attach)?;
        let bytes = frame::encode(FrameKind::Attach, &header, &payload)?;
        frame::write_bytes(&mut stream, &bytes).await?;
        debug!(%address, ?role, "attached broker queue");

        let shared = SocketShared::new(FanMode::Single);
        let (inbound_tx, inbound_rx) = mpsc::channel(CONFIG.limits.queue_capacity.max(1));
        sock::spawn_conn(&shared, stream, inbound_tx);

        Ok(Self {
            core: SocketCore::new(address, shared, inbound_rx, false, None),
            daemon,
        })
    }

    /// A fresh queue address on the same daemon, for work ports.
    pub(crate) fn derive_queue_address(&self) -> String {
        format!("{}/{}", self.daemon, "queue".create_type_id::<V7>())
    }

    pub(crate) async fn send_raw(&mut self, frame: Vec<u8>) -> Result<(), PortError> {
        self.core.send_raw(frame).await
    }

    pub(crate) async fn recv_raw(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, PortError> {
        self.core.recv_raw(timeout).await
    }

    pub(crate) fn n_pending(&self) -> usize {
        self.core.n_pending()
    }

    pub(crate) async fn close(&mut self) -> Result<(), PortError> {
        self.core.close().await
    }

    pub(crate) fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub(crate) fn address(&self) -> &str {
        self.core.address()
    }
}

/// Counters the daemon keeps while routing.
#[derive(Debug, Default)]
pub struct BrokerStats {
    attaches: AtomicUsize,
    routed: AtomicUsize,
    eof_broadcasts: AtomicUsize,
}

impl BrokerStats {
    /// Attach frames processed since the daemon started.
    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::Relaxed)
    }

    /// Data frames taken in for routing.
    pub fn routed(&self) -> usize {
        self.routed.load(Ordering::Relaxed)
    }

    /// EOF frames broadcast to consumers.
    pub fn eof_broadcasts(&self) -> usize {
        self.eof_broadcasts.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct BrokerQueue {
    consumers: DashMap<u64, mpsc::Sender<Vec<u8>>>,
    next_consumer: AtomicUsize,
    backlog: Mutex<VecDeque<Vec<u8>>>,
}

impl BrokerQueue {
    /// Hands a frame to consumers: data frames go to one (round robin),
    /// EOF frames go to all. Returns the frame when nobody took it.
    async fn route(&self, kind: FrameKind, bytes: Vec<u8>) -> Option<Vec<u8>> {
        match kind {
            FrameKind::Eof => {
                let mut ids: Vec<u64> = self.consumers.iter().map(|e| *e.key()).collect();
                ids.sort_unstable();
                let mut delivered = false;
                for id in &ids {
                    let Some(tx) = self.consumers.get(id).map(|e| e.value().clone()) else {
                        continue;
                    };
                    if tx.send(bytes.clone()).await.is_ok() {
                        delivered = true;
                    } else {
                        self.consumers.remove(id);
                    }
                }
                if delivered {
                    None
                } else {
                    Some(bytes)
                }
            }
            _ => {
                let mut pending = bytes;
                loop {
                    let mut ids: Vec<u64> = self.consumers.iter().map(|e| *e.key()).collect();
                    if ids.is_empty() {
                        return Some(pending);
                    }
                    ids.sort_unstable();
                    let start = self.next_consumer.fetch_add(1, Ordering::Relaxed);
                    for offset in 0..ids.len() {
                        let id = ids[(start + offset) % ids.len()];
                        let Some(tx) = self.consumers.get(&id).map(|e| e.value().clone()) else {
                            continue;
                        };
                        match tx.send(pending).await {
                            Ok(()) => return None,
                            Err(mpsc::error::SendError(returned)) => {
                                self.consumers.remove(&id);
                                pending = returned;
                            }
                        }
                    }
                    // Every candidate died mid-route; look again.
                }
            }
        }
    }

    /// Flushes buffered frames now that a consumer exists. Stops at the
    /// first frame that cannot be delivered, putting it back in front.
    async fn drain(&self) {
        loop {
            let bytes = self.backlog.lock().await.pop_front();
            let Some(bytes) = bytes else {
                return;
            };
            let kind = match frame::peek_kind(&bytes) {
                Ok(kind) => kind,
                Err(error) => {
                    warn!(%error, "dropping unreadable backlog frame");
                    continue;
                }
            };
            if let Some(returned) = self.route(kind, bytes).await {
                self.backlog.lock().await.push_front(returned);
                return;
            }
        }
    }
}

/// A standalone message broker for the `broker` transport.
///
/// One daemon serves any number of named queues; queues come into being
/// when the first client attaches and buffer frames until a consumer
/// shows up.
#[derive(Debug)]
pub struct BrokerDaemon {
    address: String,
    stats: Arc<BrokerStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BrokerDaemon {
    /// Binds the daemon and starts its accept loop.
    ///
    /// With no address the daemon binds `127.0.0.1:0`; read the allocated
    /// address back with [`address`](Self::address).
    pub async fn bind(address: Option<String>) -> anyhow::Result<Self> {
        let requested = address.unwrap_or_else(|| "127.0.0.1:0".to_string());
        let listener = TcpListener::bind(&requested)
            .await
            .with_context(|| format!("binding broker daemon on {requested}"))?;
        let address = listener
            .local_addr()
            .context("reading broker daemon address")?
            .to_string();
        debug!(%address, "broker daemon listening");

        let stats = Arc::new(BrokerStats::default());
        let queues: Arc<DashMap<String, Arc<BrokerQueue>>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept_cancel = cancel.clone();
        let accept_tracker = tracker.clone();
        let accept_stats = Arc::clone(&stats);
        let next_conn = Arc::new(AtomicU64::new(0));
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = next_conn.fetch_add(1, Ordering::Relaxed);
                            trace!(conn_id, %peer, "broker connection");
                            accept_tracker.spawn(serve_conn(
                                stream,
                                conn_id,
                                Arc::clone(&queues),
                                Arc::clone(&accept_stats),
                                accept_cancel.clone(),
                            ));
                        }
                        Err(error) => {
                            warn!(%error, "broker accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            address,
            stats,
            cancel,
            tracker,
        })
    }

    /// The bound `host:port` of this daemon.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// A handle on the routing counters.
    pub fn stats(&self) -> Arc<BrokerStats> {
        Arc::clone(&self.stats)
    }

    /// Stops the accept loop and every connection task.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(CONFIG.timeouts.shutdown_timeout(), self.tracker.wait())
            .await
            .context("broker tasks did not stop inside the shutdown window")?;
        debug!(address = %self.address, "broker daemon stopped");
        Ok(())
    }
}

/// Runs one broker connection from attach to hangup.
#[instrument(skip(stream, queues, stats, cancel))]
async fn serve_conn(
    stream: TcpStream,
    conn_id: u64,
    queues: Arc<DashMap<String, Arc<BrokerQueue>>>,
    stats: Arc<BrokerStats>,
    cancel: CancellationToken,
) {
    let max_frame = CONFIG.limits.max_frame_bytes;
    let (mut reader, writer) = tokio::io::split(stream);

    // The first frame announces the queue and role.
    let attach = async {
        let (kind, bytes) = frame::read_frame_bytes(&mut reader, max_frame).await?;
        if kind != FrameKind::Attach {
            return Err(PortError::Protocol(format!(
                "Expected attach frame, got {kind:?}"
            )));
        }
        let (_, _, payload) = frame::decode(&bytes)?;
        let request: AttachRequest = serde_json::from_slice(&payload)
            .map_err(|e| PortError::Protocol(format!("Bad attach payload: {e}")))?;
        Ok::<AttachRequest, PortError>(request)
    };
    let request = tokio::select! {
        _ = cancel.cancelled() => return,
        result = attach => match result {
            Ok(request) => request,
            Err(error) => {
                warn!(conn_id, %error, "broker connection rejected");
                return;
            }
        }
    };

    stats.attaches.fetch_add(1, Ordering::Relaxed);
    let queue = Arc::clone(
        queues
            .entry(request.queue.clone())
            .or_insert_with(|| Arc::new(BrokerQueue::default()))
            .value(),
    );
    debug!(conn_id, queue = %request.queue, role = ?request.role, "broker client attached");

    match request.role {
        BrokerRole::Producer => producer_loop(reader, queue, stats, cancel, conn_id).await,
        BrokerRole::Consumer => {
            consumer_loop(reader, writer, queue, cancel, conn_id).await;
        }
    }
}

async fn producer_loop<R>(
    mut reader: R,
    queue: Arc<BrokerQueue>,
    stats: Arc<BrokerStats>,
    cancel: CancellationToken,
    conn_id: u64,
) where
    R: AsyncRead + Unpin,
{
    let max_frame = CONFIG.limits.max_frame_bytes;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = frame::read_frame_bytes(&mut reader, max_frame) => {
                let (kind, bytes) = match next {
                    Ok(frame) => frame,
                    Err(PortError::Closed) => {
                        trace!(conn_id, "producer signed off");
                        break;
                    }
                    Err(error) => {
                        debug!(conn_id, %error, "producer connection failed");
                        break;
                    }
                };
                match kind {
                    FrameKind::Attach => {
                        warn!(conn_id, "ignoring repeated attach");
                        continue;
                    }
                    FrameKind::Data => {
                        stats.routed.fetch_add(1, Ordering::Relaxed);
                    }
                    FrameKind::Eof => {
                        stats.eof_broadcasts.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if let Some(returned) = queue.route(kind, bytes).await {
                    queue.backlog.lock().await.push_back(returned);
                }
            }
        }
    }
}

async fn consumer_loop<R, W>(
    mut reader: R,
    mut writer: W,
    queue: Arc<BrokerQueue>,
    cancel: CancellationToken,
    conn_id: u64,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_frame = CONFIG.limits.max_frame_bytes;
    let consumer_id = conn_id;
    let (tx, mut deliveries) = mpsc::channel::<Vec<u8>>(CONFIG.limits.queue_capacity.max(1));
    queue.consumers.insert(consumer_id, tx);
    queue.drain().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = deliveries.recv() => match maybe {
                Some(bytes) => {
                    if let Err(error) = frame::write_bytes(&mut writer, &bytes).await {
                        debug!(conn_id, %error, "consumer delivery failed");
                        break;
                    }
                }
                None => break,
            },
            // Consumers send nothing after attach; a read completing means
            // the peer hung up or broke protocol either way.
            hangup = frame::read_frame_bytes(&mut reader, max_frame) => {
                if let Ok((kind, _)) = hangup {
                    warn!(conn_id, ?kind, "ignoring frame from consumer");
                    continue;
                }
                trace!(conn_id, "consumer signed off");
                break;
            }
        }
    }
    queue.consumers.remove(&consumer_id);
}
