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

//! Request/response exchange built from paired ports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use dashmap::DashMap;
use futures::future::BoxFuture;
use mti::prelude::*;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, instrument, trace, warn};

use crate::common::CONFIG;
use crate::message::{Envelope, PortError, SendReceipt, Status};
use crate::port::{Direction, Port, PortSpec};

/// Async handler invoked once per inbound request. The returned value
/// travels back to the caller that stamped a reply address; an `Err`
/// sends nothing and leaves the caller to its timeout.
pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// The calling side of a request/response exchange.
///
/// One send port carries every request and an async mutex gates access
/// to it. Each call opens a private receive port, stamps its address and
/// a fresh correlation ID into the request header, and waits there for
/// the answer. Specs with `allow_multiple_comms` release the mutex once
/// the request is on the wire, so calls from different tasks interleave;
/// without the flag the mutex spans the wait and calls fully serialize.
///
/// Clones share the request port. Signing off or closing through any
/// clone ends the exchange for all of them.
#[derive(Debug, Clone)]
pub struct RpcClient {
    name: String,
    transport: String,
    concurrent: bool,
    request: Arc<Mutex<Port>>,
}

impl RpcClient {
    /// Opens the request port for `spec` and wraps it for shared use.
    #[instrument(skip(spec), fields(name = %spec.name()))]
    pub async fn connect(spec: PortSpec) -> anyhow::Result<Self> {
        if spec.direction() != Direction::Send {
            bail!("RpcClient needs a send spec, got {}", spec.direction());
        }
        let name = spec.name().to_string();
        let transport = spec.transport().to_string();
        let concurrent = spec.multiple_comms();
        let request = Port::open(spec)
            .await
            .context("RPC request port failed to open")?;

        debug!(address = %request.address(), concurrent, "rpc client connected");
        Ok(Self {
            name,
            transport,
            concurrent,
            request: Arc::new(Mutex::new(request)),
        })
    }

    /// Sends `request` and waits for the matching reply.
    ///
    /// `timeout` bounds only the reply wait and follows the usual
    /// contract: `None` waits indefinitely, zero polls, a positive bound
    /// gives `PortError::Timeout` when it lapses. A request dropped by
    /// the outbound filters comes straight back as its `Filtered`
    /// envelope; nothing went out, so nothing is awaited.
    #[instrument(skip(self, request), fields(client = %self.name))]
    pub async fn call(
        &self,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, PortError> {
        let request_id = "request".create_type_id::<V7>().to_string();
        let mut guard = self.request.lock().await;

        let mut reply_spec = PortSpec::new(format!("{}_reply", self.name), Direction::Recv)
            .with_transport(self.transport.as_str())
            .with_multiple_comms(true);
        if let Some(address) = guard.work_address() {
            reply_spec = reply_spec.with_address(address);
        }
        let mut reply = Port::open(reply_spec).await?;

        let reply_to = reply.address().to_string();
        let tag = self.transport.clone();
        let id = request_id.clone();
        let envelope = guard
            .prepare_with(request, move |header| header.with_reply(reply_to, tag, id))
            .await?;
        if envelope.status() == Status::Filtered {
            trace!("request dropped by an outbound filter");
            let _ = reply.close().await;
            return Ok(envelope);
        }
        guard.dispatch(envelope).await?;

        if self.concurrent {
            drop(guard);
            Self::await_reply(reply, timeout, &request_id).await
        } else {
            let outcome = Self::await_reply(reply, timeout, &request_id).await;
            drop(guard);
            outcome
        }
    }

    /// Waits on the private reply port and checks the correlation ID.
    /// The port closes no matter how the wait ends.
    async fn await_reply(
        mut reply: Port,
        timeout: Option<Duration>,
        request_id: &str,
    ) -> Result<Envelope, PortError> {
        let outcome = reply.recv(timeout).await;
        if let Err(error) = reply.close().await {
            warn!(%error, "reply port close failed");
        }
        let envelope = outcome?;
        match envelope.header.request_id.as_deref() {
            Some(id) if id == request_id => Ok(envelope),
            _ => Err(PortError::Protocol(format!(
                "Reply does not answer request '{request_id}'"
            ))),
        }
    }

    /// Tells the server this client is done. The server drops the client
    /// from its live set and ends once every known client signed off.
    pub async fn sign_off(&self) -> Result<SendReceipt, PortError> {
        self.request.lock().await.send_eof().await
    }

    /// Closes the request port. Idempotent, like any port close.
    pub async fn close(&self) -> Result<(), PortError> {
        self.request.lock().await.close().await
    }
}

/// Counters the server keeps while it runs.
#[derive(Debug, Default)]
pub struct RpcStats {
    requests: AtomicU64,
    responses: AtomicU64,
    faults: AtomicU64,
}

impl RpcStats {
    /// Requests that cleared the inbound pipeline and reached a handler.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Responses delivered back to their callers.
    #[must_use]
    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    /// Handler failures plus responses that could not be delivered.
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

/// The answering side of a request/response exchange.
///
/// One loop pulls requests off a receive port and spawns a handler task
/// per request, so a slow handler never blocks the next caller. A
/// request carrying a reply address gets the handler's value sent back
/// on a short-lived port to that address, stamped with the request's
/// correlation ID; a request without one is fire-and-forget.
///
/// Callers register under the `model` name their headers carry. A
/// client's EOF removes it from the live set, and when the last known
/// client has signed off the loop ends on its own. Sign-offs bypass the
/// finalize stage on purpose; the port must keep serving the remaining
/// clients after one of them leaves.
#[derive(Debug)]
pub struct RpcServer {
    stats: Arc<RpcStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RpcServer {
    /// Starts serving requests arriving on `port`.
    #[instrument(skip(port, handler), fields(port = %port.name()))]
    pub async fn serve<F>(mut port: Port, handler: F) -> anyhow::Result<Self>
    where
        F: Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        if port.direction() != Direction::Recv {
            let got = port.direction();
            let _ = port.close().await;
            bail!("RpcServer needs a receive port, got {got}");
        }

        let stats = Arc::new(RpcStats::default());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handler: RpcHandler = Arc::new(handler);
        tracker.spawn(serve_loop(
            port,
            handler,
            Arc::clone(&stats),
            cancel.clone(),
            tracker.clone(),
        ));

        debug!("rpc server started");
        Ok(Self {
            stats,
            cancel,
            tracker,
        })
    }

    /// A handle onto the server's counters.
    #[must_use]
    pub fn stats(&self) -> Arc<RpcStats> {
        Arc::clone(&self.stats)
    }

    /// Forces the loop down and waits for it and any in-flight handlers,
    /// bounded by the shutdown window.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(CONFIG.timeouts.shutdown_timeout(), self.tracker.wait())
            .await
            .context("RPC server did not stop inside the shutdown window")?;
        Ok(())
    }

    /// Waits for the loop to end on its own, which it does when the last
    /// known client signs off.
    pub async fn join(self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn serve_loop(
    mut port: Port,
    handler: RpcHandler,
    stats: Arc<RpcStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let server = port.name().to_string();
    let fallback_tag = port.spec().transport().to_string();
    let clients: DashMap<String, u64> = DashMap::new();

    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = port.ingest(None) => received,
        };

        let envelope = match received {
            Ok(envelope) => envelope,
            Err(error) => {
                match error {
                    PortError::Closed => debug!(port = %port.name(), "request stream closed"),
                    error => error!(port = %port.name(), %error, "rpc ingest failed"),
                }
                break;
            }
        };

        // Sign-offs never reach finalize: finalizing an EOF would end the
        // port while other clients still hold requests in flight.
        if envelope.is_eof() {
            let client = envelope.header.model.clone();
            clients.remove(&client);
            debug!(%client, live = clients.len(), "client signed off");
            if clients.is_empty() {
                break;
            }
            continue;
        }
        *clients.entry(envelope.header.model.clone()).or_insert(0) += 1;

        let finalized = match port.finalize(envelope).await {
            Ok(envelope) => envelope,
            Err(error) => {
                error!(%error, "rpc request finalize failed");
                stats.faults.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        if finalized.status() == Status::Filtered {
            trace!("inbound filter dropped a request");
            continue;
        }
        stats.requests.fetch_add(1, Ordering::Relaxed);

        let header = finalized.header.clone();
        let value = match finalized.into_value() {
            Ok(value) => value,
            Err(error) => {
                error!(%error, "rpc request carried no value");
                stats.faults.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let stats = Arc::clone(&stats);
        let responder = format!("{server}_responder");
        let tag = header.work_transport.clone().unwrap_or_else(|| fallback_tag.clone());
        tracker.spawn(async move {
            let response = match handler(value).await {
                Ok(response) => response,
                Err(error) => {
                    // No fabricated error value goes back; the caller
                    // times out instead.
                    error!(%error, "rpc handler failed");
                    stats.faults.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let Some(reply_to) = header.reply_to else {
                trace!("request carried no reply address");
                return;
            };
            match respond(responder, tag, reply_to, header.request_id, response).await {
                Ok(()) => {
                    stats.responses.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    error!(%error, "rpc response delivery failed");
                    stats.faults.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    if let Err(error) = port.close().await {
        warn!(%error, "rpc server port close failed");
    }
    debug!(port = %server, "rpc server loop ended");
}

/// Sends one response on a short-lived port attached to the caller's
/// reply address, echoing the request's correlation ID.
async fn respond(
    name: String,
    tag: String,
    reply_to: String,
    request_id: Option<String>,
    response: Value,
) -> Result<(), PortError> {
    let spec = PortSpec::new(name, Direction::Send)
        .with_transport(tag)
        .with_address(reply_to)
        .with_multiple_comms(true);
    let mut out = Port::open(spec).await?;

    let envelope = out
        .prepare_with(response, move |mut header| {
            header.request_id = request_id;
            header
        })
        .await?;
    out.dispatch(envelope).await?;
    out.close().await
}
