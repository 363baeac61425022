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

//! The message header that travels ahead of every payload.

use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;

use crate::message::ValueKind;

/// Metadata describing one message on the wire.
///
/// The header is serialized as JSON inside the frame, between the binary
/// preamble and the payload. Optional fields are omitted entirely when unset
/// and unknown fields are ignored on decode, so headers stay forward
/// compatible across releases.
///
/// # Wire Format
///
/// ```json
/// {
///   "model": "ocean_model",
///   "kind": "object",
///   "seq": 42,
///   "eof": false,
///   "reply_to": "/run/myelin/myelin-0h9xz.sock",
///   "request_id": "req_01h9xz7n2e5p6q8r3t1u2v3w4x"
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Header {
    /// Name of the sending endpoint, as configured in its spec.
    pub model: String,

    /// Declared kind of the payload after the outbound pipeline ran.
    #[serde(default)]
    pub kind: ValueKind,

    /// Per-port monotone send counter; the first accepted send carries 1.
    pub seq: u64,

    /// End-of-stream marker. An EOF message carries no payload.
    #[serde(default)]
    pub eof: bool,

    /// Address of the work port carrying this message's expanded parts.
    ///
    /// Present only on messages whose payload was expanded by the iteration
    /// transform; the receiver drains the work port to reassemble the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_address: Option<String>,

    /// Transport tag for `work_address` and `reply_to`.
    ///
    /// Work ports always live on the same transport family as the port that
    /// created them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_transport: Option<String>,

    /// Address the receiver should deliver an RPC response to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Correlation ID pairing an RPC response with its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Header {
    /// Creates a header for an ordinary data message.
    #[must_use]
    pub fn data(model: impl Into<String>, kind: ValueKind, seq: u64) -> Self {
        Self {
            model: model.into(),
            kind,
            seq,
            eof: false,
            work_address: None,
            work_transport: None,
            reply_to: None,
            request_id: None,
        }
    }

    /// Creates an end-of-stream header.
    #[must_use]
    pub fn end_of_stream(model: impl Into<String>, seq: u64) -> Self {
        Self {
            model: model.into(),
            kind: ValueKind::Null,
            seq,
            eof: true,
            work_address: None,
            work_transport: None,
            reply_to: None,
            request_id: None,
        }
    }

    /// Attaches a work-port continuation address.
    #[must_use]
    pub fn with_work(mut self, address: impl Into<String>, transport: impl Into<String>) -> Self {
        self.work_address = Some(address.into());
        self.work_transport = Some(transport.into());
        self
    }

    /// Attaches an RPC reply address and correlation ID.
    #[must_use]
    pub fn with_reply(
        mut self,
        reply_to: impl Into<String>,
        transport: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        self.reply_to = Some(reply_to.into());
        self.work_transport = Some(transport.into());
        self.request_id = Some(request_id.into());
        self
    }

    /// Returns `true` when this message continues on a work port.
    #[must_use]
    pub const fn has_work(&self) -> bool {
        self.work_address.is_some()
    }
}

assert_impl_all!(Header: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_absent_from_wire() {
        let header = Header::data("ocean_model", ValueKind::Integer, 3);
        let json = serde_json::to_string(&header).unwrap();
        assert!(!json.contains("work_address"));
        assert!(!json.contains("reply_to"));
        assert!(json.contains("\"seq\":3"));
    }

    #[test]
    fn test_defaults_on_decode() {
        let json = r#"{ "model": "m", "seq": 0 }"#;
        let header: Header = serde_json::from_str(json).unwrap();
        assert_eq!(header.kind, ValueKind::Any);
        assert!(!header.eof);
        assert!(header.work_address.is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{ "model": "m", "seq": 1, "future_field": [1, 2, 3] }"#;
        let header: Header = serde_json::from_str(json).unwrap();
        assert_eq!(header.model, "m");
        assert_eq!(header.seq, 1);
    }

    #[test]
    fn test_reply_round_trip() {
        let header = Header::data("client", ValueKind::Object, 9).with_reply(
            "mem-reply-q",
            "mem",
            "req_test",
        );
        let wire = serde_json::to_vec(&header).unwrap();
        let back: Header = serde_json::from_slice(&wire).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.reply_to.as_deref(), Some("mem-reply-q"));
        assert_eq!(back.request_id.as_deref(), Some("req_test"));
    }

    #[test]
    fn test_eof_header() {
        let header = Header::end_of_stream("m", 12);
        assert!(header.eof);
        assert!(!header.has_work());
    }
}
