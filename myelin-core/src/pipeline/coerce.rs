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

use derive_new::new;
use serde_json::Value;

use super::{Staged, Transform};
use crate::message::{PortError, ValueKind};

/// Coerces every value to a target kind on both paths.
///
/// Applying the same conversion in both directions makes the stage its own
/// inverse: a value that survived the send path is already in the target
/// kind, so the receive path leaves it untouched.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoerceTransform {
    target: ValueKind,
}

impl CoerceTransform {
    fn convert(&self, value: Value) -> Result<(Value, ValueKind), PortError> {
        let out = self.target.coerce(value)?;
        let kind = match self.target {
            ValueKind::Any => ValueKind::of(&out),
            declared => declared,
        };
        Ok((out, kind))
    }
}

impl Transform for CoerceTransform {
    fn outbound(&self, value: Value, _kind: ValueKind) -> Result<Staged, PortError> {
        let (out, kind) = self.convert(value)?;
        Ok(Staged::One(out, kind))
    }

    fn inbound(&self, value: Value, _kind: ValueKind) -> Result<(Value, ValueKind), PortError> {
        self.convert(value)
    }
}
