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

//! TCP transport with publish/subscribe fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::sock::{self, FanMode, SocketCore, SocketShared};
use crate::common::CONFIG;
use crate::message::PortError;

/// A channel over a TCP socket.
///
/// Opening with no address binds `127.0.0.1:0` and exposes the allocated
/// address; opening with an address dials it with retry. The bound side
/// publishes: every outbound frame fans out to all live subscribers, and
/// frames sent before the first subscriber wait in a backlog flushed to
/// it. Inbound frames from all connections merge into one queue.
#[derive(Debug)]
pub struct TcpChannel {
    core: SocketCore,
}

impl TcpChannel {
    pub(crate) async fn open(address: Option<String>) -> Result<Self, PortError> {
        match address {
            None => Self::bind().await,
            Some(address) => Self::attach(address).await,
        }
    }

    async fn bind() -> Result<Self, PortError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        debug!(%address, "bound tcp socket");

        let shared = SocketShared::new(FanMode::Broadcast);
        let (inbound_tx, inbound_rx) = mpsc::channel(CONFIG.limits.queue_capacity.max(1));

        let loop_shared = Arc::clone(&shared);
        let cancel = shared.cancel.clone();
        shared.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = sock::spawn_conn(&loop_shared, stream, inbound_tx.clone());
                            debug!(conn_id, %peer, "tcp subscriber attached");
                            sock::drain_backlog(&loop_shared).await;
                        }
                        Err(error) => {
                            warn!(%error, "tcp accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            core: SocketCore::new(address, shared, inbound_rx, true, None),
        })
    }

    async fn attach(address: String) -> Result<Self, PortError> {
        let stream = sock::connect_with_retry(|| TcpStream::connect(address.clone())).await?;
        debug!(%address, "attached tcp socket");

        let shared = SocketShared::new(FanMode::Single);
        let (inbound_tx, inbound_rx) = mpsc::channel(CONFIG.limits.queue_capacity.max(1));
        sock::spawn_conn(&shared, stream, inbound_tx);

        Ok(Self {
            core: SocketCore::new(address, shared, inbound_rx, false, None),
        })
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
