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

//! The port: one directed message endpoint over one transport channel.

use acton_ern::Ern;
use serde::Serialize;
use serde_json::Value;
use static_assertions::assert_impl_all;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use super::registry::registry;
use super::spec::{Direction, PortSpec};
use crate::common::CONFIG;
use crate::message::frame::{self, FrameKind};
use crate::message::{Envelope, Header, PortError, SendReceipt, Status, ValueKind};
use crate::pipeline::{Outbound, Pipeline};
use crate::transport::Transport;

/// Lifecycle of a port. EOF only applies to the receive side; the send
/// side latches its own EOF separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Open,
    Eof,
    Closed,
}

/// The send-side continuation of an expanded message.
///
/// It exists exactly as long as the message that owns it: dispatch drains
/// the parts onto the port, closes it, and drops the whole thing.
#[derive(Debug)]
pub(crate) struct WorkSend {
    port: Port,
    parts: Vec<Value>,
}

/// A one-way message endpoint.
///
/// A port couples four stages over one transport channel: `prepare` runs
/// the outbound pipeline and encodes, `dispatch` moves bytes, `ingest`
/// receives and decodes, `finalize` runs the inbound pipeline. `send` and
/// `recv` are the common compositions; wrappers and drivers call the
/// stages directly when they need to reuse a half without re-serializing.
#[derive(Debug)]
pub struct Port {
    id: Ern,
    spec: PortSpec,
    transport: Transport,
    pipeline: Pipeline,
    kind: ValueKind,
    seq: u64,
    state: PortState,
    eof_sent: bool,
    claimed: bool,
}

assert_impl_all!(Port: Send);

impl Port {
    /// Opens a port from a spec.
    ///
    /// With no address the transport allocates one, readable afterwards
    /// through [`address`](Self::address) so peers can attach to it.
    /// Attaching to an address some other port in this process already
    /// attached to is a [`PortError::Config`] unless the spec allows
    /// sharing; allocation never conflicts because each allocating open
    /// gets a fresh address.
    #[instrument(skip(spec), fields(name = %spec.name(), transport = %spec.transport()))]
    pub async fn open(spec: PortSpec) -> Result<Self, PortError> {
        spec.validate()?;
        let id = Ern::with_root(spec.name())
            .map_err(|e| PortError::Config(format!("Invalid port name: {e}")))?;

        let attaching = spec.address().is_some();
        let mut transport = registry().create(spec.clone()).await?;
        if attaching {
            let address = transport.address().to_string();
            if let Err(error) =
                registry().acquire(transport.tag(), &address, spec.multiple_comms())
            {
                let _ = transport.close().await;
                return Err(error);
            }
        }

        debug!(address = %transport.address(), direction = %spec.direction(), "port open");
        Ok(Self {
            id,
            kind: spec.kind(),
            pipeline: spec.build_pipeline(),
            spec,
            transport,
            seq: 0,
            state: PortState::Open,
            eof_sent: false,
            claimed: attaching,
        })
    }

    /// Runs the outbound pipeline and encodes the frame.
    ///
    /// A filter rejection yields a `Filtered` envelope that `dispatch`
    /// treats as a successful no-op; the send counter does not move. An
    /// expansion opens a work port on the same transport and attaches the
    /// parts to the envelope.
    pub async fn prepare(&mut self, value: Value) -> Result<Envelope, PortError> {
        self.ensure_direction(Direction::Send)?;
        self.ensure_sendable()?;

        match self.pipeline.outbound(value, self.kind)? {
            Outbound::Rejected => {
                trace!(port = %self.spec.name(), "value filtered");
                Ok(Envelope::rejected(Header::data(
                    self.spec.name(),
                    self.kind,
                    self.seq,
                )))
            }
            Outbound::Value(value, kind) => {
                self.kind = kind;
                self.seq += 1;
                let header = Header::data(self.spec.name(), kind, self.seq);
                let payload = serde_json::to_vec(&value)?;
                let bytes = frame::encode(FrameKind::Data, &header, &payload)?;
                Ok(Envelope::outbound(header, value, bytes))
            }
            Outbound::Expanded { parts, kind } => {
                self.kind = kind;
                self.seq += 1;

                // The work address is shared with the receiving half, so
                // the exclusive-claim rule does not apply to it.
                let mut work_spec = PortSpec::new(
                    format!("{}_work", self.spec.name()),
                    Direction::Send,
                )
                .with_transport(self.spec.transport())
                .with_multiple_comms(true);
                if let Some(address) = self.transport.work_address() {
                    work_spec = work_spec.with_address(address);
                }
                let work_port = Port::open(work_spec).await?;

                let header = Header::data(self.spec.name(), kind, self.seq)
                    .with_work(work_port.address(), self.spec.transport());
                let bytes = frame::encode(FrameKind::Data, &header, b"null")?;
                debug!(
                    port = %self.spec.name(),
                    work = %work_port.address(),
                    parts = parts.len(),
                    "value expanded onto work port"
                );
                Ok(Envelope::expanded(
                    header,
                    bytes,
                    WorkSend {
                        port: work_port,
                        parts,
                    },
                ))
            }
        }
    }

    /// Moves a prepared envelope onto the wire.
    ///
    /// For expanded messages this also drains the attached work port: each
    /// part, then EOF, then the work port closes.
    pub async fn dispatch(&mut self, mut envelope: Envelope) -> Result<SendReceipt, PortError> {
        match envelope.status() {
            Status::Filtered => {
                return Ok(SendReceipt::new(Status::Filtered, envelope.header.seq));
            }
            Status::Pending => {}
            other => {
                return Err(PortError::Protocol(format!(
                    "Envelope already dispatched with status {other}"
                )));
            }
        }

        let bytes = envelope
            .take_frame()
            .ok_or_else(|| PortError::Protocol("Envelope has no encoded frame".to_string()))?;
        self.transport.send_raw(bytes).await?;

        if let Some(work) = envelope.work.take() {
            Self::drain_work(work).await?;
        }

        envelope.mark(Status::Sent);
        trace!(port = %self.spec.name(), seq = envelope.header.seq, "frame sent");
        Ok(SendReceipt::new(Status::Sent, envelope.header.seq))
    }

    /// Receives and decodes one frame under the timeout contract.
    ///
    /// The envelope comes back `Pending`; run it through
    /// [`finalize`](Self::finalize) before reading the value. Receiving
    /// past EOF or after close is [`PortError::Closed`].
    pub async fn ingest(&mut self, timeout: Option<Duration>) -> Result<Envelope, PortError> {
        self.ensure_direction(Direction::Recv)?;
        if self.state != PortState::Open {
            return Err(PortError::Closed);
        }

        let bytes = self.transport.recv_raw(timeout).await?;
        let (kind, header, payload) = frame::decode(&bytes)?;
        match kind {
            FrameKind::Eof => Ok(Envelope::inbound(header, None, true)),
            FrameKind::Data => {
                let value: Value = if header.has_work() {
                    Value::Null
                } else {
                    serde_json::from_slice(&payload)?
                };
                Ok(Envelope::inbound(header, Some(value), false))
            }
            FrameKind::Attach => Err(PortError::Protocol(
                "Attach frame outside a broker connection".to_string(),
            )),
        }
    }

    /// Completes an ingested envelope: collects any work-port parts, runs
    /// the inbound pipeline, and settles the status.
    pub async fn finalize(&mut self, mut envelope: Envelope) -> Result<Envelope, PortError> {
        if envelope.is_eof() {
            self.state = PortState::Eof;
            envelope.mark(Status::Eof);
            debug!(port = %self.spec.name(), "stream ended");
            return Ok(envelope);
        }

        let value = if let Some(address) = envelope.header.work_address.clone() {
            let tag = envelope
                .header
                .work_transport
                .clone()
                .unwrap_or_else(|| self.spec.transport().to_string());
            self.collect_work(address, tag).await?
        } else {
            envelope
                .take_value()
                .ok_or_else(|| PortError::Protocol("Data frame without payload".to_string()))?
        };

        match self.pipeline.inbound(value, envelope.header.kind)? {
            None => {
                trace!(port = %self.spec.name(), "inbound value filtered");
                envelope.mark(Status::Filtered);
                Ok(envelope)
            }
            Some((value, kind)) => {
                self.kind = kind;
                envelope.set_value(value);
                envelope.mark(Status::Received);
                Ok(envelope)
            }
        }
    }

    /// Sends one value: prepare, then dispatch.
    #[instrument(skip(self, value), fields(port = %self.spec.name()))]
    pub async fn send(&mut self, value: Value) -> Result<SendReceipt, PortError> {
        let envelope = self.prepare(value).await?;
        self.dispatch(envelope).await
    }

    /// Serializes a typed payload and sends it.
    pub async fn send_typed<T: Serialize>(&mut self, value: &T) -> Result<SendReceipt, PortError> {
        self.send(serde_json::to_value(value)?).await
    }

    /// Marks the end of this port's stream.
    ///
    /// Idempotent: repeating it returns the same receipt without sending
    /// another frame. Further sends fail with [`PortError::Closed`].
    #[instrument(skip(self), fields(port = %self.spec.name()))]
    pub async fn send_eof(&mut self) -> Result<SendReceipt, PortError> {
        self.ensure_direction(Direction::Send)?;
        if self.state == PortState::Closed {
            return Err(PortError::Closed);
        }
        if self.eof_sent {
            return Ok(SendReceipt::new(Status::Eof, self.seq));
        }

        self.seq += 1;
        let header = Header::end_of_stream(self.spec.name(), self.seq);
        let bytes = frame::encode(FrameKind::Eof, &header, &[])?;
        self.transport.send_raw(bytes).await?;
        self.eof_sent = true;
        debug!("end of stream sent");
        Ok(SendReceipt::new(Status::Eof, self.seq))
    }

    /// Receives one message: ingest, then finalize.
    ///
    /// `Some(ZERO)` polls ([`PortError::Empty`] when idle), `Some(d)`
    /// waits at most `d` ([`PortError::Timeout`]), `None` waits for as
    /// long as it takes.
    #[instrument(skip(self), fields(port = %self.spec.name()))]
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<Envelope, PortError> {
        let envelope = self.ingest(timeout).await?;
        self.finalize(envelope).await
    }

    /// Tears the port down. The first call closes the transport and
    /// releases the address claim; repeats do nothing and succeed.
    #[instrument(skip(self), fields(port = %self.spec.name()))]
    pub async fn close(&mut self) -> Result<(), PortError> {
        if self.state == PortState::Closed {
            return Ok(());
        }
        self.state = PortState::Closed;
        let result = self.transport.close().await;
        if self.claimed {
            registry().release(self.transport.tag(), self.transport.address());
        }
        debug!("port closed");
        result
    }

    /// Approximate number of undelivered inbound messages. Zero once the
    /// port is closed.
    #[must_use]
    pub fn n_pending(&self) -> usize {
        if self.state == PortState::Closed {
            0
        } else {
            self.transport.n_pending()
        }
    }

    /// `true` until [`close`](Self::close) runs. A port that has seen EOF
    /// is still open; it just has nothing further to receive.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state != PortState::Closed
    }

    /// The concrete transport address of this port.
    #[must_use]
    pub fn address(&self) -> &str {
        self.transport.address()
    }

    /// The endpoint name stamped into headers.
    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// The port's identifier.
    #[must_use]
    pub const fn id(&self) -> &Ern {
        &self.id
    }

    /// Which way this port moves values.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.spec.direction()
    }

    /// The kind the port currently declares for its payloads.
    #[must_use]
    pub const fn declared_kind(&self) -> ValueKind {
        self.kind
    }

    /// The spec this port was opened from.
    #[must_use]
    pub const fn spec(&self) -> &PortSpec {
        &self.spec
    }

    /// An address a companion work port for this port should use, when
    /// the transport cannot allocate one on its own.
    pub(crate) fn work_address(&self) -> Option<String> {
        self.transport.work_address()
    }

    /// Stamps extra routing fields onto the next prepared envelope.
    ///
    /// RPC drivers use this to carry `reply_to` and `request_id` without
    /// re-running the pipeline themselves.
    pub async fn prepare_with<F>(&mut self, value: Value, stamp: F) -> Result<Envelope, PortError>
    where
        F: FnOnce(Header) -> Header,
    {
        let mut envelope = self.prepare(value).await?;
        if envelope.status() == Status::Pending {
            let header = stamp(envelope.header.clone());
            let bytes = match envelope.take_frame() {
                Some(_) => {
                    let payload = match envelope.value() {
                        Some(value) => serde_json::to_vec(value)?,
                        None => b"null".to_vec(),
                    };
                    frame::encode(FrameKind::Data, &header, &payload)?
                }
                None => {
                    return Err(PortError::Protocol(
                        "Envelope has no encoded frame".to_string(),
                    ))
                }
            };
            envelope.header = header;
            envelope.restore_frame(bytes);
        }
        Ok(envelope)
    }

    /// Sends each expanded part on the work port, then EOF.
    ///
    /// The close runs on its own task: over socket transports it lingers
    /// until the collecting side has dialed in and taken the backlog, and
    /// the send should not wait for that rendezvous.
    async fn drain_work(work: WorkSend) -> Result<(), PortError> {
        let WorkSend { mut port, parts } = work;
        let count = parts.len();
        for part in &parts {
            port.send_plain(part).await?;
        }
        port.send_eof().await?;
        tokio::spawn(async move {
            if let Err(error) = port.close().await {
                warn!(%error, "work port close failed");
            }
        });
        trace!(parts = count, "work port drained");
        Ok(())
    }

    /// Attaches to a work address, collects parts until EOF, closes.
    async fn collect_work(&self, address: String, tag: String) -> Result<Value, PortError> {
        let work_spec = PortSpec::new(format!("{}_work", self.spec.name()), Direction::Recv)
            .with_transport(tag)
            .with_address(address)
            .with_multiple_comms(true);
        let mut work = Port::open(work_spec).await?;

        let bound = CONFIG.timeouts.drain_timeout();
        let mut parts = Vec::new();
        loop {
            let mut part = work.ingest(Some(bound)).await?;
            if part.is_eof() {
                break;
            }
            parts.push(
                part.take_value()
                    .ok_or_else(|| PortError::Protocol("Work frame without payload".to_string()))?,
            );
        }
        work.close().await?;
        trace!(parts = parts.len(), "work port collected");
        Ok(Value::Array(parts))
    }

    /// Sends a value with no pipeline involvement. Work ports only.
    async fn send_plain(&mut self, value: &Value) -> Result<(), PortError> {
        self.seq += 1;
        let header = Header::data(self.spec.name(), ValueKind::of(value), self.seq);
        let payload = serde_json::to_vec(value)?;
        let bytes = frame::encode(FrameKind::Data, &header, &payload)?;
        self.transport.send_raw(bytes).await
    }

    fn ensure_direction(&self, required: Direction) -> Result<(), PortError> {
        if self.spec.direction() == required {
            Ok(())
        } else {
            Err(PortError::Config(format!(
                "Port '{}' is {} only",
                self.spec.name(),
                self.spec.direction()
            )))
        }
    }

    fn ensure_sendable(&self) -> Result<(), PortError> {
        if self.state == PortState::Closed || self.eof_sent {
            return Err(PortError::Closed);
        }
        Ok(())
    }
}
