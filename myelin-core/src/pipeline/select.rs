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

use super::{Staged, Transform};
use crate::message::{PortError, ValueKind};

/// Projects objects down to a fixed set of fields.
///
/// Fields absent from a given object are simply omitted from the
/// projection. Projection discards data, so the inverse can only project
/// again; like [`CoerceTransform`](super::CoerceTransform) the stage is
/// idempotent and therefore its own inverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectTransform {
    fields: Vec<String>,
}

impl SelectTransform {
    /// Keeps only the named fields of every object that flows through.
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    fn project(&self, value: Value) -> Result<Value, PortError> {
        let Value::Object(map) = value else {
            return Err(PortError::Protocol(format!(
                "field selection expects an object, got {}",
                ValueKind::of(&value)
            )));
        };
        let mut projected = serde_json::Map::new();
        for field in &self.fields {
            if let Some(v) = map.get(field) {
                projected.insert(field.clone(), v.clone());
            }
        }
        Ok(Value::Object(projected))
    }
}

impl Transform for SelectTransform {
    fn outbound(&self, value: Value, _kind: ValueKind) -> Result<Staged, PortError> {
        Ok(Staged::One(self.project(value)?, ValueKind::Object))
    }

    fn inbound(&self, value: Value, _kind: ValueKind) -> Result<(Value, ValueKind), PortError> {
        Ok((self.project(value)?, ValueKind::Object))
    }
}
