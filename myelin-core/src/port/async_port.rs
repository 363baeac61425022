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

//! A background-task wrapper that decouples callers from transport latency.

use serde::Serialize;
use serde_json::Value;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use super::base::Port;
use super::spec::Direction;
use crate::common::CONFIG;
use crate::message::{Envelope, PortError, SendReceipt, Status};
use crate::transport;

#[derive(Debug)]
enum Command {
    Send(Value),
    Eof,
}

/// A port serviced by a background task.
///
/// Sends queue into a bounded buffer and return immediately with a
/// `Pending` receipt; receives pull from a prefetch buffer the task keeps
/// topped up. An error inside the task parks as a fault and surfaces on
/// the next call. Only ports whose spec opts into threading can be
/// wrapped.
#[derive(Debug)]
pub struct AsyncPort {
    name: String,
    address: String,
    direction: Direction,
    commands: Option<mpsc::Sender<Command>>,
    buffer: Option<mpsc::Receiver<Envelope>>,
    fault: Arc<Mutex<Option<PortError>>>,
    depth: Arc<AtomicUsize>,
    accepted: u64,
    eof_sent: bool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    open: bool,
}

assert_impl_all!(AsyncPort: Send);

impl AsyncPort {
    /// Moves a port behind a background task.
    #[instrument(skip(port), fields(port = %port.name()))]
    pub fn wrap(port: Port) -> Result<Self, PortError> {
        if !port.spec().allow_threading() {
            return Err(PortError::Config(format!(
                "Port '{}' is not marked for threading",
                port.name()
            )));
        }
        if !port.is_open() {
            return Err(PortError::Closed);
        }

        let capacity = CONFIG.limits.async_buffer.max(1);
        let fault = Arc::new(Mutex::new(None));
        let depth = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let name = port.name().to_string();
        let address = port.address().to_string();
        let direction = port.direction();

        let (commands, buffer) = match direction {
            Direction::Send => {
                let (tx, rx) = mpsc::channel(capacity);
                tracker.spawn(run_sender(port, rx, Arc::clone(&depth), Arc::clone(&fault)));
                (Some(tx), None)
            }
            Direction::Recv => {
                let (tx, rx) = mpsc::channel(capacity);
                tracker.spawn(run_receiver(
                    port,
                    tx,
                    Arc::clone(&depth),
                    Arc::clone(&fault),
                    cancel.clone(),
                ));
                (None, Some(rx))
            }
        };

        debug!("port wrapped for background servicing");
        Ok(Self {
            name,
            address,
            direction,
            commands,
            buffer,
            fault,
            depth,
            accepted: 0,
            eof_sent: false,
            cancel,
            tracker,
            open: true,
        })
    }

    /// Queues one value for the background task.
    ///
    /// The receipt is `Pending` with the local acceptance count; actual
    /// delivery happens when the task works the queue down.
    pub async fn send(&mut self, value: Value) -> Result<SendReceipt, PortError> {
        self.ensure_direction(Direction::Send)?;
        if self.eof_sent {
            return Err(PortError::Closed);
        }
        self.surface_fault().await?;
        let Some(tx) = self.commands.as_ref() else {
            return Err(PortError::Closed);
        };

        self.depth.fetch_add(1, Ordering::Relaxed);
        if tx.send(Command::Send(value)).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(self.take_fault().await.unwrap_or(PortError::Closed));
        }
        self.accepted += 1;
        Ok(SendReceipt::new(Status::Pending, self.accepted))
    }

    /// Serializes a typed payload and queues it.
    pub async fn send_typed<T: Serialize>(&mut self, value: &T) -> Result<SendReceipt, PortError> {
        self.send(serde_json::to_value(value)?).await
    }

    /// Queues the end-of-stream marker. The background task sends it
    /// after everything queued ahead of it, then stands down.
    pub async fn send_eof(&mut self) -> Result<SendReceipt, PortError> {
        self.ensure_direction(Direction::Send)?;
        if self.eof_sent {
            return Ok(SendReceipt::new(Status::Eof, self.accepted));
        }
        self.surface_fault().await?;
        let Some(tx) = self.commands.as_ref() else {
            return Err(PortError::Closed);
        };

        self.depth.fetch_add(1, Ordering::Relaxed);
        if tx.send(Command::Eof).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(self.take_fault().await.unwrap_or(PortError::Closed));
        }
        self.accepted += 1;
        self.eof_sent = true;
        Ok(SendReceipt::new(Status::Eof, self.accepted))
    }

    /// Pulls the next finalized envelope out of the prefetch buffer under
    /// the usual timeout contract. Buffered messages drain before a parked
    /// fault surfaces.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<Envelope, PortError> {
        self.ensure_direction(Direction::Recv)?;
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(PortError::Closed);
        };

        match transport::recv_with_timeout(buffer, &self.depth, timeout).await {
            Ok(envelope) => Ok(envelope),
            Err(PortError::Closed) => Err(self.take_fault().await.unwrap_or(PortError::Closed)),
            Err(error) => Err(error),
        }
    }

    /// Stops the background task and closes the inner port.
    ///
    /// Queued sends drain first; the wait for the task is bounded by the
    /// shutdown window. Repeats do nothing and succeed.
    #[instrument(skip(self), fields(port = %self.name))]
    pub async fn close(&mut self) -> Result<(), PortError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        self.commands = None;
        self.cancel.cancel();
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.close();
        }

        self.tracker.close();
        let window = CONFIG.timeouts.shutdown_timeout();
        if tokio::time::timeout(window, self.tracker.wait()).await.is_err() {
            warn!("background task outlived the shutdown window");
        }
        debug!("async port closed");
        Ok(())
    }

    /// Messages currently queued in this wrapper. Zero once closed.
    #[must_use]
    pub fn n_pending(&self) -> usize {
        if self.open {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// `true` until [`close`](Self::close) runs.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// The inner port's transport address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The endpoint name stamped into headers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which way this port moves values.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    async fn surface_fault(&self) -> Result<(), PortError> {
        match self.take_fault().await {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn take_fault(&self) -> Option<PortError> {
        self.fault.lock().await.take()
    }

    fn ensure_direction(&self, required: Direction) -> Result<(), PortError> {
        if self.direction == required {
            Ok(())
        } else {
            Err(PortError::Config(format!(
                "Port '{}' is {} only",
                self.name, self.direction
            )))
        }
    }
}

/// Works the command queue down in arrival order.
///
/// The loop keeps running after the wrapper drops its sender, so close
/// drains everything already accepted before the inner port goes away.
async fn run_sender(
    mut port: Port,
    mut commands: mpsc::Receiver<Command>,
    depth: Arc<AtomicUsize>,
    fault: Arc<Mutex<Option<PortError>>>,
) {
    while let Some(command) = commands.recv().await {
        depth.fetch_sub(1, Ordering::Relaxed);
        match command {
            Command::Send(value) => {
                if let Err(error) = port.send(value).await {
                    warn!(port = %port.name(), %error, "background send failed");
                    *fault.lock().await = Some(error);
                    break;
                }
            }
            Command::Eof => {
                if let Err(error) = port.send_eof().await {
                    warn!(port = %port.name(), %error, "background sign-off failed");
                    *fault.lock().await = Some(error);
                }
                break;
            }
        }
    }

    commands.close();
    while commands.try_recv().is_ok() {
        depth.fetch_sub(1, Ordering::Relaxed);
    }
    if let Err(error) = port.close().await {
        debug!(port = %port.name(), %error, "inner port close failed");
    }
}

/// Keeps the prefetch buffer topped up until EOF, a fault, or cancellation.
async fn run_receiver(
    mut port: Port,
    buffer: mpsc::Sender<Envelope>,
    depth: Arc<AtomicUsize>,
    fault: Arc<Mutex<Option<PortError>>>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => break,
            received = port.recv(None) => match received {
                Ok(envelope) => envelope,
                Err(PortError::Closed) => break,
                Err(error) => {
                    warn!(port = %port.name(), %error, "background receive failed");
                    *fault.lock().await = Some(error);
                    break;
                }
            },
        };
        if envelope.status() == Status::Filtered {
            continue;
        }

        let eof = envelope.is_eof();
        depth.fetch_add(1, Ordering::Relaxed);
        if buffer.send(envelope).await.is_err() {
            depth.fetch_sub(1, Ordering::Relaxed);
            break;
        }
        if eof {
            break;
        }
    }

    if let Err(error) = port.close().await {
        debug!(port = %port.name(), %error, "inner port close failed");
    }
}
