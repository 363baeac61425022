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

//! The closed set of transports a port can ride on.
//!
//! Every transport moves whole encoded frames and presents the same
//! capability surface: raw send, raw receive under the timeout contract,
//! approximate pending depth, and idempotent close. Ordering is FIFO per
//! sender/receiver pair and overflow blocks rather than dropping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::message::PortError;

pub use broker::{BrokerChannel, BrokerDaemon, BrokerStats};
pub(crate) use broker::BrokerRole;
pub use ipc::IpcChannel;
pub use mem::MemChannel;
pub use tcp::TcpChannel;

mod broker;
mod ipc;
mod mem;
mod sock;
mod tcp;

/// Registry tag of the in-process queue transport.
pub const MEM: &str = "mem";
/// Registry tag of the Unix domain socket transport.
pub const IPC: &str = "ipc";
/// Registry tag of the TCP pub/sub transport.
pub const TCP: &str = "tcp";
/// Registry tag of the broker-daemon client transport.
pub const BROKER: &str = "broker";

/// An open channel on one of the built-in transports.
///
/// The set is closed on purpose: every variant answers the same capability
/// calls through enum dispatch, and the registry decides which variant a
/// tag maps to.
#[derive(Debug)]
pub enum Transport {
    /// In-process bounded queue.
    Mem(MemChannel),
    /// Unix domain socket with deliver-once queue semantics.
    Ipc(IpcChannel),
    /// TCP socket with publish/subscribe fan-out.
    Tcp(TcpChannel),
    /// Client of a broker daemon, addressed as `host:port/queue`.
    Broker(BrokerChannel),
}

impl Transport {
    /// Sends one encoded frame, blocking while queues are full.
    pub(crate) async fn send_raw(&mut self, frame: Vec<u8>) -> Result<(), PortError> {
        match self {
            Self::Mem(ch) => ch.send_raw(frame).await,
            Self::Ipc(ch) => ch.send_raw(frame).await,
            Self::Tcp(ch) => ch.send_raw(frame).await,
            Self::Broker(ch) => ch.send_raw(frame).await,
        }
    }

    /// Receives one encoded frame under the timeout contract.
    ///
    /// `Some(ZERO)` polls and reports [`PortError::Empty`] when nothing is
    /// waiting, `Some(d)` waits at most `d` and reports
    /// [`PortError::Timeout`], `None` waits indefinitely.
    pub(crate) async fn recv_raw(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, PortError> {
        match self {
            Self::Mem(ch) => ch.recv_raw(timeout).await,
            Self::Ipc(ch) => ch.recv_raw(timeout).await,
            Self::Tcp(ch) => ch.recv_raw(timeout).await,
            Self::Broker(ch) => ch.recv_raw(timeout).await,
        }
    }

    /// Approximate number of frames waiting to be received.
    pub(crate) fn n_pending(&self) -> usize {
        match self {
            Self::Mem(ch) => ch.n_pending(),
            Self::Ipc(ch) => ch.n_pending(),
            Self::Tcp(ch) => ch.n_pending(),
            Self::Broker(ch) => ch.n_pending(),
        }
    }

    /// Tears the channel down. Repeat calls do nothing and succeed.
    pub(crate) async fn close(&mut self) -> Result<(), PortError> {
        match self {
            Self::Mem(ch) => ch.close().await,
            Self::Ipc(ch) => ch.close().await,
            Self::Tcp(ch) => ch.close().await,
            Self::Broker(ch) => ch.close().await,
        }
    }

    /// `false` once [`close`](Self::close) has run.
    pub(crate) fn is_open(&self) -> bool {
        match self {
            Self::Mem(ch) => ch.is_open(),
            Self::Ipc(ch) => ch.is_open(),
            Self::Tcp(ch) => ch.is_open(),
            Self::Broker(ch) => ch.is_open(),
        }
    }

    /// The concrete address of this channel, allocated or attached.
    pub(crate) fn address(&self) -> &str {
        match self {
            Self::Mem(ch) => ch.address(),
            Self::Ipc(ch) => ch.address(),
            Self::Tcp(ch) => ch.address(),
            Self::Broker(ch) => ch.address(),
        }
    }

    /// The registry tag this channel was created under.
    pub(crate) const fn tag(&self) -> &'static str {
        match self {
            Self::Mem(_) => MEM,
            Self::Ipc(_) => IPC,
            Self::Tcp(_) => TCP,
            Self::Broker(_) => BROKER,
        }
    }

    /// An address a work port should allocate under, when the transport
    /// cannot allocate from nothing.
    ///
    /// Broker channels derive a fresh queue on their own daemon; every
    /// other transport allocates by opening with no address at all.
    pub(crate) fn work_address(&self) -> Option<String> {
        match self {
            Self::Broker(ch) => Some(ch.derive_queue_address()),
            _ => None,
        }
    }
}

/// Pulls one item off a bounded queue under the timeout contract.
///
/// The depth counter is decremented only after an item actually comes out,
/// so it over-reports momentarily rather than ever going negative.
pub(crate) async fn recv_with_timeout<T>(
    rx: &mut mpsc::Receiver<T>,
    depth: &AtomicUsize,
    timeout: Option<Duration>,
) -> Result<T, PortError> {
    let item = match timeout {
        Some(bound) if bound.is_zero() => match rx.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Empty) => return Err(PortError::Empty),
            Err(TryRecvError::Disconnected) => return Err(PortError::Closed),
        },
        Some(bound) => match tokio::time::timeout(bound, rx.recv()).await {
            Ok(Some(item)) => item,
            Ok(None) => return Err(PortError::Closed),
            Err(_) => return Err(PortError::Timeout),
        },
        None => match rx.recv().await {
            Some(item) => item,
            None => return Err(PortError::Closed),
        },
    };
    depth.fetch_sub(1, Ordering::Relaxed);
    Ok(item)
}
