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

//! In-process transport backed by a global table of named byte queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lazy_static::lazy_static;
use mti::prelude::*;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use super::recv_with_timeout;
use crate::common::CONFIG;
use crate::message::PortError;

lazy_static! {
    /// Process-wide rendezvous table. A queue exists while at least one
    /// channel is attached to its name or it still holds undelivered
    /// frames for a late attacher.
    static ref MEM_QUEUES: DashMap<String, MemQueue> = DashMap::new();
}

struct MemQueue {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    depth: Arc<AtomicUsize>,
    attached: AtomicUsize,
}

impl MemQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            attached: AtomicUsize::new(0),
        }
    }
}

/// A channel attached to one named in-process queue.
///
/// Either side may open first: attaching to a name that does not exist yet
/// creates the queue, so rendezvous order never matters. Sends block while
/// the queue is full and receives follow the timeout contract.
#[derive(Debug)]
pub struct MemChannel {
    address: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    depth: Arc<AtomicUsize>,
    open: bool,
}

impl MemChannel {
    /// Attaches to `address`, or allocates a fresh uniquely named queue
    /// when no address is given.
    pub(crate) fn open(address: Option<String>) -> Self {
        let address = address.unwrap_or_else(|| "mem".create_type_id::<V7>().to_string());
        let entry = MEM_QUEUES
            .entry(address.clone())
            .or_insert_with(|| MemQueue::new(CONFIG.limits.queue_capacity));
        entry.attached.fetch_add(1, Ordering::AcqRel);
        let channel = Self {
            address,
            tx: entry.tx.clone(),
            rx: Arc::clone(&entry.rx),
            depth: Arc::clone(&entry.depth),
            open: true,
        };
        drop(entry);
        debug!(address = %channel.address, "attached mem queue");
        channel
    }

    pub(crate) async fn send_raw(&mut self, frame: Vec<u8>) -> Result<(), PortError> {
        if !self.open {
            return Err(PortError::Closed);
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(frame).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(PortError::Closed);
        }
        trace!(address = %self.address, "queued frame");
        Ok(())
    }

    pub(crate) async fn recv_raw(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, PortError> {
        if !self.open {
            return Err(PortError::Closed);
        }
        // A zero timeout must not wait behind another receiver camped on
        // the queue; if the lock is taken, any waiting frame is theirs.
        if timeout == Some(Duration::ZERO) {
            return match self.rx.try_lock() {
                Ok(mut rx) => recv_with_timeout(&mut rx, &self.depth, timeout).await,
                Err(_) => Err(PortError::Empty),
            };
        }
        let mut rx = self.rx.lock().await;
        recv_with_timeout(&mut rx, &self.depth, timeout).await
    }

    pub(crate) fn n_pending(&self) -> usize {
        if self.open {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub(crate) async fn close(&mut self) -> Result<(), PortError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        // The last channel to detach takes the queue with it, unless frames
        // are still waiting: those stay in the table for a late attacher,
        // whose own close then removes the entry.
        let removed = MEM_QUEUES
            .remove_if(&self.address, |_, queue| {
                queue.attached.fetch_sub(1, Ordering::AcqRel) == 1
                    && queue.depth.load(Ordering::Acquire) == 0
            })
            .is_some();
        debug!(address = %self.address, removed, "detached mem queue");
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_then_attach_by_name() {
        let mut a = MemChannel::open(None);
        let name = a.address().to_string();
        let mut b = MemChannel::open(Some(name.clone()));

        a.send_raw(vec![0xAA, 0xBB]).await.unwrap();
        let frame = b.recv_raw(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(frame, vec![0xAA, 0xBB]);

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert!(MEM_QUEUES.get(&name).is_none());
    }

    #[tokio::test]
    async fn test_attach_before_allocate_rendezvous() {
        // The receiver names the queue first; the sender attaches later.
        let mut receiver = MemChannel::open(Some("early-bird-queue".to_string()));
        let mut sender = MemChannel::open(Some("early-bird-queue".to_string()));

        sender.send_raw(vec![1]).await.unwrap();
        assert_eq!(receiver.n_pending(), 1);
        let frame = receiver.recv_raw(None).await.unwrap();
        assert_eq!(frame, vec![1]);

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_survives_first_close() {
        let mut a = MemChannel::open(None);
        let name = a.address().to_string();
        let mut b = MemChannel::open(Some(name.clone()));
        let mut c = MemChannel::open(Some(name.clone()));

        b.send_raw(vec![7]).await.unwrap();
        b.close().await.unwrap();
        assert!(MEM_QUEUES.get(&name).is_some());

        // The frame queued before the close is still deliverable.
        let frame = c.recv_raw(Some(Duration::ZERO)).await.unwrap();
        assert_eq!(frame, vec![7]);

        a.close().await.unwrap();
        c.close().await.unwrap();
        assert!(MEM_QUEUES.get(&name).is_none());
    }

    #[tokio::test]
    async fn test_undelivered_frames_wait_for_a_late_attacher() {
        let mut sender = MemChannel::open(None);
        let name = sender.address().to_string();
        sender.send_raw(vec![4]).await.unwrap();
        sender.send_raw(vec![2]).await.unwrap();
        sender.close().await.unwrap();

        // Nothing is attached, but the frames keep the queue alive.
        assert!(MEM_QUEUES.get(&name).is_some());

        let mut late = MemChannel::open(Some(name.clone()));
        assert_eq!(late.recv_raw(Some(Duration::ZERO)).await.unwrap(), vec![4]);
        assert_eq!(late.recv_raw(Some(Duration::ZERO)).await.unwrap(), vec![2]);
        late.close().await.unwrap();
        assert!(MEM_QUEUES.get(&name).is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_io() {
        let mut ch = MemChannel::open(None);
        ch.close().await.unwrap();
        ch.close().await.unwrap();

        let err = ch.send_raw(vec![1]).await.unwrap_err();
        assert!(matches!(err, PortError::Closed));
        let err = ch.recv_raw(Some(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, PortError::Closed));
        assert_eq!(ch.n_pending(), 0);
    }
}
