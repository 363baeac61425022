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

//! Unix domain socket transport with deliver-once queue semantics.

use std::sync::Arc;
use std::time::Duration;

use mti::prelude::*;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::sock::{self, FanMode, SocketCore, SocketShared};
use crate::common::CONFIG;
use crate::message::PortError;

/// A channel over a Unix domain socket.
///
/// Opening with no address binds a fresh socket under the configured
/// runtime directory and accepts any number of peers; opening with an
/// address dials it, retrying briefly so the attaching side may start
/// first. Each outbound frame from the bound side reaches exactly one
/// peer. The bound side unlinks its socket file on close.
#[derive(Debug)]
pub struct IpcChannel {
    core: SocketCore,
}

impl IpcChannel {
    pub(crate) async fn open(address: Option<String>) -> Result<Self, PortError> {
        match address {
            None => Self::bind().await,
            Some(path) => Self::attach(path).await,
        }
    }

    async fn bind() -> Result<Self, PortError> {
        let dir = CONFIG.paths.socket_directory();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.sock", "port".create_type_id::<V7>()));
        let listener = UnixListener::bind(&path)?;
        let address = path.to_string_lossy().into_owned();
        debug!(%address, "bound ipc socket");

        let shared = SocketShared::new(FanMode::Single);
        let (inbound_tx, inbound_rx) = mpsc::channel(CONFIG.limits.queue_capacity.max(1));

        let loop_shared = Arc::clone(&shared);
        let cancel = shared.cancel.clone();
        shared.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let conn_id = sock::spawn_conn(&loop_shared, stream, inbound_tx.clone());
                            debug!(conn_id, "ipc peer attached");
                            sock::drain_backlog(&loop_shared).await;
                        }
                        Err(error) => {
                            warn!(%error, "ipc accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            core: SocketCore::new(address, shared, inbound_rx, true, Some(path)),
        })
    }

    async fn attach(address: String) -> Result<Self, PortError> {
        let stream = sock::connect_with_retry(|| UnixStream::connect(&address)).await?;
        debug!(%address, "attached ipc socket");

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
