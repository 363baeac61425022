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

//! Connection plumbing shared by the socket transports.
//!
//! The bound side of a socket channel runs an accept loop and one
//! reader/writer task pair per connection. Readers fan every inbound frame
//! into a single queue; outbound delivery is mode-dependent: queue
//! semantics hand each frame to one live connection, pub/sub semantics
//! fan it out to all of them. Frames sent while no peer is connected wait
//! in a bounded backlog that flushes to the next connection; closing the
//! bound side lingers so a peer still dialing can collect that backlog.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::recv_with_timeout;
use crate::common::CONFIG;
use crate::message::{frame, PortError};

/// Outbound delivery personality of a bound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FanMode {
    /// Each frame goes to exactly one live connection.
    Single,
    /// Each frame goes to every live connection.
    Broadcast,
}

/// State shared between a channel and its connection tasks.
#[derive(Debug)]
pub(crate) struct SocketShared {
    mode: FanMode,
    conns: DashMap<u64, mpsc::Sender<Vec<u8>>>,
    next_conn: AtomicU64,
    depth: AtomicUsize,
    backlog: Mutex<VecDeque<Vec<u8>>>,
    backlog_space: Notify,
    backlog_capacity: usize,
    conn_capacity: usize,
    max_frame: usize,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl SocketShared {
    pub(crate) fn new(mode: FanMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            conns: DashMap::new(),
            next_conn: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            backlog: Mutex::new(VecDeque::new()),
            backlog_space: Notify::new(),
            backlog_capacity: CONFIG.limits.backlog.max(1),
            conn_capacity: CONFIG.limits.queue_capacity.max(1),
            max_frame: CONFIG.limits.max_frame_bytes,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub(crate) fn has_conns(&self) -> bool {
        !self.conns.is_empty()
    }
}

/// Starts the reader/writer task pair for one accepted or dialed stream.
///
/// The reader holds its clone of the inbound sender, so the fan-in queue
/// closes exactly when the accept loop and every reader are gone.
pub(crate) fn spawn_conn<S>(
    shared: &Arc<SocketShared>,
    stream: S,
    inbound: mpsc::Sender<Vec<u8>>,
) -> u64
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(shared.conn_capacity);
    shared.conns.insert(conn_id, out_tx);
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // Writer: drains queued frames until every sender handle is gone, so a
    // close still flushes whatever was already accepted for sending.
    let writer_shared = Arc::clone(shared);
    shared.tracker.spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if let Err(error) = frame::write_bytes(&mut write_half, &bytes).await {
                debug!(conn_id, %error, "connection writer stopped");
                break;
            }
        }
        writer_shared.conns.remove(&conn_id);
    });

    let reader_shared = Arc::clone(shared);
    let cancel = shared.cancel.clone();
    shared.tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = frame::read_frame_bytes(&mut read_half, reader_shared.max_frame) => {
                    match next {
                        Ok((_, bytes)) => {
                            reader_shared.depth.fetch_add(1, Ordering::Relaxed);
                            if inbound.send(bytes).await.is_err() {
                                reader_shared.depth.fetch_sub(1, Ordering::Relaxed);
                                break;
                            }
                        }
                        Err(PortError::Closed) => {
                            trace!(conn_id, "peer hung up");
                            break;
                        }
                        Err(error) => {
                            debug!(conn_id, %error, "connection reader stopped");
                            break;
                        }
                    }
                }
            }
        }
        reader_shared.conns.remove(&conn_id);
    });

    conn_id
}

/// Hands a frame to live connections per the fan mode.
///
/// Returns the frame when nobody took it so the caller can backlog it.
pub(crate) async fn deliver(shared: &SocketShared, frame: Vec<u8>) -> Option<Vec<u8>> {
    let mut ids: Vec<u64> = shared.conns.iter().map(|entry| *entry.key()).collect();
    ids.sort_unstable();

    match shared.mode {
        FanMode::Single => {
            let mut frame = frame;
            for id in ids {
                // Clone the sender out: holding a map guard across an await
                // point would block connection teardown.
                let Some(tx) = shared.conns.get(&id).map(|entry| entry.value().clone()) else {
                    continue;
                };
                match tx.send(frame).await {
                    Ok(()) => return None,
                    Err(mpsc::error::SendError(returned)) => {
                        shared.conns.remove(&id);
                        frame = returned;
                    }
                }
            }
            Some(frame)
        }
        FanMode::Broadcast => {
            let mut delivered = false;
            for id in &ids {
                let Some(tx) = shared.conns.get(id).map(|entry| entry.value().clone()) else {
                    continue;
                };
                if tx.send(frame.clone()).await.is_ok() {
                    delivered = true;
                } else {
                    shared.conns.remove(id);
                }
            }
            if delivered {
                None
            } else {
                Some(frame)
            }
        }
    }
}

/// Flushes backlogged frames to whatever connections exist now.
pub(crate) async fn drain_backlog(shared: &SocketShared) {
    loop {
        let frame = shared.backlog.lock().await.pop_front();
        let Some(frame) = frame else {
            return;
        };
        if let Some(undelivered) = deliver(shared, frame).await {
            shared.backlog.lock().await.push_front(undelivered);
            return;
        }
        shared.backlog_space.notify_one();
    }
}

/// Bounded wait for backlogged frames to reach a peer, so closing a bound
/// channel does not strand frames an attacher is still dialing for.
pub(crate) async fn linger_bound(shared: &SocketShared) {
    let deadline = tokio::time::Instant::now() + CONFIG.timeouts.drain_timeout();
    loop {
        if shared.has_conns() {
            drain_backlog(shared).await;
        }
        if shared.backlog.lock().await.is_empty() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("backlogged frames outlived the drain window");
            return;
        }
        tokio::time::sleep(CONFIG.timeouts.retry_interval()).await;
    }
}

/// Send path for the bound side: deliver now or backlog until a peer
/// appears. A full backlog blocks until space opens or the channel closes.
pub(crate) async fn send_bound(shared: &SocketShared, frame: Vec<u8>) -> Result<(), PortError> {
    let mut frame = frame;
    loop {
        if shared.has_conns() {
            match deliver(shared, frame).await {
                None => return Ok(()),
                Some(returned) => frame = returned,
            }
        }
        {
            let mut backlog = shared.backlog.lock().await;
            if backlog.len() < shared.backlog_capacity {
                backlog.push_back(frame);
                drop(backlog);
                // A peer may have connected between the emptiness check
                // and the push; make sure somebody drains it.
                if shared.has_conns() {
                    drain_backlog(shared).await;
                }
                return Ok(());
            }
        }
        tokio::select! {
            _ = shared.backlog_space.notified() => {}
            _ = shared.cancel.cancelled() => return Err(PortError::Closed),
        }
    }
}

/// Send path for the attached side: one stream, no backlog.
pub(crate) async fn send_attached(shared: &SocketShared, frame: Vec<u8>) -> Result<(), PortError> {
    match deliver(shared, frame).await {
        None => Ok(()),
        Some(_) => Err(PortError::Closed),
    }
}

/// Dials until the peer answers or the connect budget runs out, so an
/// attaching side may start before the binding side.
pub(crate) async fn connect_with_retry<F, Fut, S>(mut connect: F) -> Result<S, PortError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<S>>,
{
    let deadline = tokio::time::Instant::now() + CONFIG.timeouts.connect_timeout();
    loop {
        match connect().await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(PortError::from(error));
                }
                trace!(%error, "peer not ready, retrying");
                tokio::time::sleep(CONFIG.timeouts.retry_interval()).await;
            }
        }
    }
}

/// One endpoint of a socket transport: the shared connection state, the
/// fan-in queue, and the identity of this side (bound or attached).
#[derive(Debug)]
pub(crate) struct SocketCore {
    address: String,
    shared: Arc<SocketShared>,
    inbound: mpsc::Receiver<Vec<u8>>,
    bound: bool,
    unlink_on_close: Option<PathBuf>,
    open: bool,
}

impl SocketCore {
    pub(crate) fn new(
        address: String,
        shared: Arc<SocketShared>,
        inbound: mpsc::Receiver<Vec<u8>>,
        bound: bool,
        unlink_on_close: Option<PathBuf>,
    ) -> Self {
        Self {
            address,
            shared,
            inbound,
            bound,
            unlink_on_close,
            open: true,
        }
    }

    pub(crate) async fn send_raw(&mut self, frame: Vec<u8>) -> Result<(), PortError> {
        if !self.open {
            return Err(PortError::Closed);
        }
        if self.bound {
            send_bound(&self.shared, frame).await
        } else {
            send_attached(&self.shared, frame).await
        }
    }

    pub(crate) async fn recv_raw(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, PortError> {
        if !self.open {
            return Err(PortError::Closed);
        }
        recv_with_timeout(&mut self.inbound, &self.shared.depth, timeout).await
    }

    pub(crate) fn n_pending(&self) -> usize {
        if self.open {
            self.shared.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub(crate) async fn close(&mut self) -> Result<(), PortError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self.bound {
            linger_bound(&self.shared).await;
        }
        self.shared.cancel.cancel();
        // Dropping the connection senders lets each writer flush what was
        // already queued and then exit.
        self.shared.conns.clear();
        self.shared.tracker.close();
        let shutdown = CONFIG.timeouts.shutdown_timeout();
        if tokio::time::timeout(shutdown, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(address = %self.address, "connection tasks outlived the shutdown window");
        }
        if let Some(path) = self.unlink_on_close.take() {
            let _ = std::fs::remove_file(&path);
        }
        self.inbound.close();
        debug!(address = %self.address, bound = self.bound, "socket channel closed");
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }
}
