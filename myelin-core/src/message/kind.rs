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

//! The declared payload kind carried alongside every message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::message::PortError;

/// Coarse classification of a payload value.
///
/// Every port tracks the kind of the values flowing through it. The kind is
/// per-port state: it starts from the spec's declaration, is refined by
/// `prepare` after the outbound pipeline runs, and by `finalize` after the
/// inbound pipeline runs, then travels in the message header so the peer can
/// reconstruct containers without guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// No declaration; accepts anything and never coerces.
    #[default]
    Any,
    /// JSON null.
    Null,
    /// Boolean.
    Bool,
    /// Whole number.
    Integer,
    /// Any numeric value, including whole numbers.
    Number,
    /// UTF-8 string.
    String,
    /// Ordered sequence.
    Array,
    /// Keyed mapping.
    Object,
}

impl ValueKind {
    /// Classifies a value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Returns `true` if a value of this classification is acceptable here.
    ///
    /// `Any` accepts everything and `Number` accepts whole numbers.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        let actual = Self::of(value);
        match self {
            Self::Any => true,
            Self::Number => matches!(actual, Self::Number | Self::Integer),
            other => actual == *other,
        }
    }

    /// Coerces a value toward this kind.
    ///
    /// Supported conversions: whole numbers widen to `Number`, numeric
    /// strings parse to `Integer`/`Number`, any value wraps into a
    /// single-element `Array`, and everything converts to `String` via its
    /// JSON rendering. `Any` passes values through untouched. Anything else
    /// is a [`PortError::Serialization`].
    pub fn coerce(&self, value: Value) -> Result<Value, PortError> {
        if self.accepts(&value) {
            return Ok(value);
        }
        match (self, value) {
            (Self::Any, v) => Ok(v),
            (Self::Number, Value::String(s)) => {
                let parsed: f64 = s
                    .parse()
                    .map_err(|_| coerce_error(&Value::String(s.clone()), Self::Number))?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| coerce_error(&Value::String(s), Self::Number))
            }
            (Self::Integer, Value::String(s)) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| coerce_error(&Value::String(s), Self::Integer)),
            (Self::String, v) => match v {
                Value::String(s) => Ok(Value::String(s)),
                other => Ok(Value::String(other.to_string())),
            },
            (Self::Array, v) => Ok(Value::Array(vec![v])),
            (kind, v) => Err(coerce_error(&v, *kind)),
        }
    }

    /// The tag used in headers and log output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn coerce_error(value: &Value, target: ValueKind) -> PortError {
    PortError::Serialization(format!(
        "cannot coerce {} value to {target}",
        ValueKind::of(value)
    ))
}
