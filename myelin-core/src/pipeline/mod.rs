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

//! Filter and transform stages applied to every value a port moves.
//!
//! A pipeline is fixed at port construction. On send, filters run first
//! (left to right, first rejection wins), then transforms (left to right).
//! On receive, transforms apply their inverses in reverse order, then the
//! filters run. Filters therefore always evaluate against untransformed
//! values on both sides, which is what makes a symmetric pipeline's
//! round-trip yield the value that was sent.

use dyn_clone::DynClone;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::message::{PortError, ValueKind};

pub use coerce::CoerceTransform;
pub use iterate::IterateTransform;
pub use select::SelectTransform;

mod coerce;
mod iterate;
mod select;

/// A pure predicate over payload values.
///
/// Rejection is not failure: a rejected message becomes a successful no-op
/// reported as [`Status::Filtered`](crate::message::Status). Errors are for
/// predicates that cannot be evaluated at all.
pub trait Filter: DynClone + fmt::Debug + Send + Sync {
    /// Returns `true` when the value should continue through the pipeline.
    fn accepts(&self, value: &Value) -> Result<bool, PortError>;
}

dyn_clone::clone_trait_object!(Filter);

/// A value-to-value stage with an inverse for the receive path.
pub trait Transform: DynClone + fmt::Debug + Send + Sync {
    /// Applies the stage on the send path.
    fn outbound(&self, value: Value, kind: ValueKind) -> Result<Staged, PortError>;

    /// Applies the stage's inverse on the receive path.
    fn inbound(&self, value: Value, kind: ValueKind) -> Result<(Value, ValueKind), PortError>;
}

dyn_clone::clone_trait_object!(Transform);

/// Result of one outbound transform stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Staged {
    /// A single value continues through the pipeline.
    One(Value, ValueKind),
    /// The value expanded into parts that travel on a work port.
    ///
    /// Only the final transform of a pipeline may expand; the kind records
    /// the original container shape so the receiver can rebuild it.
    Many {
        /// The expanded elements, in order.
        parts: Vec<Value>,
        /// Container shape to rebuild on the receive side.
        kind: ValueKind,
    },
}

/// Result of running a full outbound pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// The value passed every stage.
    Value(Value, ValueKind),
    /// The final stage expanded the value into parts.
    Expanded {
        /// The expanded elements, in order.
        parts: Vec<Value>,
        /// Container shape to rebuild on the receive side.
        kind: ValueKind,
    },
    /// A filter rejected the value; nothing should be sent.
    Rejected,
}

/// An ordered filter chain and an ordered transform chain.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    filters: Vec<Box<dyn Filter>>,
    transforms: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    pub(crate) fn new(filters: Vec<Box<dyn Filter>>, transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { filters, transforms }
    }

    /// Returns `true` when no stages are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.transforms.is_empty()
    }

    /// Runs the send path: filters, then transforms.
    pub(crate) fn outbound(&self, value: Value, kind: ValueKind) -> Result<Outbound, PortError> {
        for filter in &self.filters {
            if !filter.accepts(&value)? {
                return Ok(Outbound::Rejected);
            }
        }

        let mut current = value;
        let mut current_kind = kind;
        let last = self.transforms.len().saturating_sub(1);
        for (index, transform) in self.transforms.iter().enumerate() {
            match transform.outbound(current, current_kind)? {
                Staged::One(v, k) => {
                    current = v;
                    current_kind = k;
                }
                Staged::Many { parts, kind } => {
                    if index != last {
                        return Err(PortError::Protocol(
                            "expansion must be the final transform stage".to_string(),
                        ));
                    }
                    return Ok(Outbound::Expanded { parts, kind });
                }
            }
        }
        Ok(Outbound::Value(current, current_kind))
    }

    /// Runs the receive path: inverse transforms in reverse order, then
    /// filters. `None` means a filter dropped the message.
    pub(crate) fn inbound(
        &self,
        value: Value,
        kind: ValueKind,
    ) -> Result<Option<(Value, ValueKind)>, PortError> {
        let mut current = value;
        let mut current_kind = kind;
        for transform in self.transforms.iter().rev() {
            let (v, k) = transform.inbound(current, current_kind)?;
            current = v;
            current_kind = k;
        }

        for filter in &self.filters {
            if !filter.accepts(&current)? {
                return Ok(None);
            }
        }
        Ok(Some((current, current_kind)))
    }
}

/// Adapts a named closure into a [`Filter`].
#[derive(Clone)]
pub struct FilterFn {
    name: &'static str,
    predicate: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl FilterFn {
    /// Wraps a predicate closure under a name used in logs and `Debug`.
    #[must_use]
    pub fn new(name: &'static str, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name,
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for FilterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterFn({})", self.name)
    }
}

impl Filter for FilterFn {
    fn accepts(&self, value: &Value) -> Result<bool, PortError> {
        Ok((self.predicate)(value))
    }
}

type MapFn = Arc<dyn Fn(Value) -> Result<Value, PortError> + Send + Sync>;

/// Adapts a named closure into a [`Transform`].
///
/// Without an explicit inverse the receive path passes values through
/// unchanged, which preserves the round-trip property only for transforms
/// that are idempotent on their own output. Supply the inverse with
/// [`TransformFn::with_inverse`] otherwise.
#[derive(Clone)]
pub struct TransformFn {
    name: &'static str,
    apply: MapFn,
    invert: Option<MapFn>,
}

impl TransformFn {
    /// Wraps a send-path closure; the receive path is the identity.
    #[must_use]
    pub fn new(
        name: &'static str,
        apply: impl Fn(Value) -> Result<Value, PortError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            apply: Arc::new(apply),
            invert: None,
        }
    }

    /// Wraps a send-path closure and its receive-path inverse.
    #[must_use]
    pub fn with_inverse(
        name: &'static str,
        apply: impl Fn(Value) -> Result<Value, PortError> + Send + Sync + 'static,
        invert: impl Fn(Value) -> Result<Value, PortError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            apply: Arc::new(apply),
            invert: Some(Arc::new(invert)),
        }
    }
}

impl fmt::Debug for TransformFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformFn({})", self.name)
    }
}

impl Transform for TransformFn {
    fn outbound(&self, value: Value, _kind: ValueKind) -> Result<Staged, PortError> {
        let out = (self.apply)(value)?;
        let kind = ValueKind::of(&out);
        Ok(Staged::One(out, kind))
    }

    fn inbound(&self, value: Value, kind: ValueKind) -> Result<(Value, ValueKind), PortError> {
        match &self.invert {
            Some(invert) => {
                let back = invert(value)?;
                let kind = ValueKind::of(&back);
                Ok((back, kind))
            }
            None => Ok((value, kind)),
        }
    }
}

pub(crate) fn element_passes(filters: &[Box<dyn Filter>], value: &Value) -> Result<bool, PortError> {
    for filter in filters {
        if !filter.accepts(value)? {
            return Ok(false);
        }
    }
    Ok(true)
}
