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

//! The message object moving through a port's pipeline.

use derive_new::new;
use serde::de::DeserializeOwned;
use serde_json::Value;
use static_assertions::assert_impl_all;
use std::fmt;

use crate::message::{Header, PortError};
use crate::port::WorkSend;

/// Lifecycle status of one message.
///
/// Statuses form a one-way lattice: every message starts `Pending` and moves
/// to exactly one terminal status. A terminal status is never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created but not yet dispatched or finalized.
    Pending,
    /// Handed to the transport (send side).
    Sent,
    /// Finalized with a value (receive side).
    Received,
    /// Rejected by a filter; a successful no-op, not an error.
    Filtered,
    /// End-of-stream marker observed.
    Eof,
    /// A stage failed while the message was still owned.
    Error,
}

impl Status {
    /// Returns `true` once the status can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Filtered => "filtered",
            Self::Eof => "eof",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a send call reports back.
///
/// `Filtered` receipts mean the outbound pipeline dropped the value before
/// it reached the transport; nothing was sent and nothing failed.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    /// Terminal status of the send: `Sent` or `Filtered`.
    pub status: Status,
    /// Sequence number the message carried (or would have carried).
    pub seq: u64,
}

impl SendReceipt {
    /// Returns `true` if the message actually reached the transport.
    #[must_use]
    pub const fn delivered(&self) -> bool {
        matches!(self.status, Status::Sent)
    }
}

/// One message in flight: header, payload, status, and (between `prepare`
/// and `dispatch`) the encoded wire bytes and any work-port continuation.
///
/// The continuation is owned by the envelope and lives exactly as long as
/// the message does: `dispatch` drains and closes it.
pub struct Envelope {
    /// Wire metadata.
    pub header: Header,
    value: Option<Value>,
    frame: Option<Vec<u8>>,
    status: Status,
    eof: bool,
    pub(crate) work: Option<WorkSend>,
}

impl Envelope {
    /// An outbound message ready for dispatch.
    #[must_use]
    pub(crate) fn outbound(header: Header, value: Value, frame: Vec<u8>) -> Self {
        Self {
            header,
            value: Some(value),
            frame: Some(frame),
            status: Status::Pending,
            eof: false,
            work: None,
        }
    }

    /// An outbound message whose value was rejected by a filter.
    #[must_use]
    pub(crate) fn rejected(header: Header) -> Self {
        Self {
            header,
            value: None,
            frame: None,
            status: Status::Filtered,
            eof: false,
            work: None,
        }
    }

    /// An outbound message whose value expanded onto a work port.
    ///
    /// The main frame announces the continuation; the parts travel in the
    /// attached [`WorkSend`], so the envelope itself carries no value.
    #[must_use]
    pub(crate) fn expanded(header: Header, frame: Vec<u8>, work: WorkSend) -> Self {
        Self {
            header,
            value: None,
            frame: Some(frame),
            status: Status::Pending,
            eof: false,
            work: Some(work),
        }
    }

    /// An outbound end-of-stream marker.
    #[must_use]
    pub(crate) fn end_of_stream(header: Header, frame: Vec<u8>) -> Self {
        Self {
            header,
            value: None,
            frame: Some(frame),
            status: Status::Pending,
            eof: true,
            work: None,
        }
    }

    /// An inbound message fresh off the transport, not yet finalized.
    #[must_use]
    pub(crate) fn inbound(header: Header, value: Option<Value>, eof: bool) -> Self {
        let eof = eof || header.eof;
        Self {
            header,
            value,
            frame: None,
            status: Status::Pending,
            eof,
            work: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Moves the message to a terminal status.
    ///
    /// Statuses are one-way: calling this on an already-terminal envelope is
    /// a bug in the calling stage.
    pub(crate) fn mark(&mut self, status: Status) {
        debug_assert!(
            !self.status.is_terminal() || self.status == status,
            "status {} may not move to {}",
            self.status,
            status
        );
        self.status = status;
    }

    /// Returns `true` for end-of-stream messages.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        self.eof
    }

    /// The finalized value, if one is present.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Consumes the envelope, yielding its value.
    ///
    /// Fails with [`PortError::Protocol`] when no value is present (EOF and
    /// filtered envelopes carry none).
    pub fn into_value(self) -> Result<Value, PortError> {
        self.value
            .ok_or_else(|| PortError::Protocol(format!("{} envelope carries no value", self.status)))
    }

    /// Deserializes the finalized value into a payload type.
    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T, PortError> {
        let value = self
            .value
            .as_ref()
            .ok_or_else(|| PortError::Protocol(format!("{} envelope carries no value", self.status)))?;
        serde_json::from_value(value.clone()).map_err(PortError::from)
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    pub(crate) fn take_value(&mut self) -> Option<Value> {
        self.value.take()
    }

    pub(crate) fn take_frame(&mut self) -> Option<Vec<u8>> {
        self.frame.take()
    }

    /// Swaps in a re-encoded frame after a header rewrite.
    pub(crate) fn restore_frame(&mut self, bytes: Vec<u8>) {
        self.frame = Some(bytes);
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("header", &self.header)
            .field("status", &self.status)
            .field("eof", &self.eof)
            .field("has_value", &self.value.is_some())
            .field("has_work", &self.work.is_some())
            .finish()
    }
}

assert_impl_all!(Envelope: Send);
assert_impl_all!(SendReceipt: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ValueKind;
    use serde_json::json;

    fn header() -> Header {
        Header::data("m", ValueKind::Integer, 0)
    }

    #[test]
    fn test_status_lattice() {
        assert!(!Status::Pending.is_terminal());
        assert!(Status::Sent.is_terminal());
        assert!(Status::Filtered.is_terminal());
        assert!(Status::Eof.is_terminal());
    }

    #[test]
    fn test_outbound_envelope_flow() {
        let mut env = Envelope::outbound(header(), json!(5), vec![1, 2, 3]);
        assert_eq!(env.status(), Status::Pending);
        assert_eq!(env.take_frame(), Some(vec![1, 2, 3]));
        env.mark(Status::Sent);
        assert_eq!(env.status(), Status::Sent);
    }

    #[test]
    #[should_panic(expected = "may not move")]
    fn test_terminal_status_cannot_regress() {
        let mut env = Envelope::outbound(header(), json!(5), vec![]);
        env.mark(Status::Sent);
        env.mark(Status::Received);
    }

    #[test]
    fn test_rejected_envelope_has_no_value() {
        let env = Envelope::rejected(header());
        assert_eq!(env.status(), Status::Filtered);
        assert!(env.value().is_none());
        assert!(env.into_value().is_err());
    }

    #[test]
    fn test_inbound_eof_detection() {
        let env = Envelope::inbound(Header::end_of_stream("m", 4), None, false);
        assert!(env.is_eof());

        let env = Envelope::inbound(header(), Some(json!(1)), false);
        assert!(!env.is_eof());
    }

    #[test]
    fn test_decode_as() {
        #[derive(serde::Deserialize)]
        struct P {
            v: i64,
        }
        let env = Envelope::inbound(header(), Some(json!({ "v": 9 })), false);
        let p: P = env.decode_as().unwrap();
        assert_eq!(p.v, 9);
    }

    #[test]
    fn test_receipt() {
        let receipt = SendReceipt::new(Status::Sent, 3);
        assert!(receipt.delivered());
        let receipt = SendReceipt::new(Status::Filtered, 3);
        assert!(!receipt.delivered());
    }
}
