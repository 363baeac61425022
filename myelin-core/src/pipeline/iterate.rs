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

use serde_json::Value;
use tracing::trace;

use super::{element_passes, Filter, Staged, Transform};
use crate::message::{PortError, ValueKind};

/// Expands containers into their elements for piecewise delivery.
///
/// Arrays expand into their items; objects expand into `[key, value]`
/// pairs. The elements travel on a dedicated work port while the main port
/// carries a placeholder message announcing it, and the receiving side
/// rebuilds the container from the collected elements using the kind
/// recorded at expansion time.
///
/// Element filters run per element, on both paths, in the element's
/// expanded form. A filtered element is dropped from the container rather
/// than rejecting the whole message.
#[derive(Clone, Debug, Default)]
pub struct IterateTransform {
    filters: Vec<Box<dyn Filter>>,
}

impl IterateTransform {
    /// An expansion stage with no element filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an element filter, evaluated per expanded element.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    fn expand(&self, value: Value) -> Result<(Vec<Value>, ValueKind), PortError> {
        match value {
            Value::Array(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    if element_passes(&self.filters, &item)? {
                        parts.push(item);
                    }
                }
                Ok((parts, ValueKind::Array))
            }
            Value::Object(map) => {
                let mut parts = Vec::with_capacity(map.len());
                for (key, item) in map {
                    let pair = Value::Array(vec![Value::String(key), item]);
                    if element_passes(&self.filters, &pair)? {
                        parts.push(pair);
                    }
                }
                Ok((parts, ValueKind::Object))
            }
            other => Err(PortError::Protocol(format!(
                "iteration expects an array or object, got {}",
                ValueKind::of(&other)
            ))),
        }
    }
}

impl Transform for IterateTransform {
    fn outbound(&self, value: Value, _kind: ValueKind) -> Result<Staged, PortError> {
        let (parts, kind) = self.expand(value)?;
        trace!(parts = parts.len(), %kind, "expanded container");
        Ok(Staged::Many { parts, kind })
    }

    fn inbound(&self, value: Value, kind: ValueKind) -> Result<(Value, ValueKind), PortError> {
        let Value::Array(parts) = value else {
            return Err(PortError::Protocol(format!(
                "iteration rebuild expects collected parts, got {}",
                ValueKind::of(&value)
            )));
        };
        match kind {
            ValueKind::Object => {
                let mut map = serde_json::Map::with_capacity(parts.len());
                for part in parts {
                    if !element_passes(&self.filters, &part)? {
                        continue;
                    }
                    let Value::Array(pair) = part else {
                        return Err(PortError::Protocol(
                            "object rebuild expects [key, value] pairs".to_string(),
                        ));
                    };
                    let mut pair = pair.into_iter();
                    match (pair.next(), pair.next(), pair.next()) {
                        (Some(Value::String(key)), Some(item), None) => {
                            map.insert(key, item);
                        }
                        _ => {
                            return Err(PortError::Protocol(
                                "object rebuild expects [key, value] pairs".to_string(),
                            ))
                        }
                    }
                }
                Ok((Value::Object(map), ValueKind::Object))
            }
            _ => {
                let mut kept = Vec::with_capacity(parts.len());
                for part in parts {
                    if element_passes(&self.filters, &part)? {
                        kept.push(part);
                    }
                }
                Ok((Value::Array(kept), ValueKind::Array))
            }
        }
    }
}
