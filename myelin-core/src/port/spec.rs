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

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::{PortError, ValueKind};
use crate::pipeline::{Filter, Pipeline, Transform};

/// Direction of flow through a port. Ports are strictly one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The port sends values to a peer.
    Send,
    /// The port receives values from a peer.
    Recv,
}

impl Direction {
    /// The tag used in errors and log output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to open a port.
///
/// A spec is a plain value until [`Port::open`](crate::port::Port::open)
/// consumes a copy of it; mutating the original afterwards has no effect
/// on the running port. An existing address means attach, no address means
/// allocate a fresh one and expose it through the open port.
#[derive(Debug, Clone)]
pub struct PortSpec {
    name: String,
    transport: String,
    address: Option<String>,
    direction: Direction,
    kind: ValueKind,
    allow_threading: bool,
    allow_multiple_comms: Option<bool>,
    filters: Vec<Box<dyn Filter>>,
    transforms: Vec<Box<dyn Transform>>,
}

impl PortSpec {
    /// A spec for the in-process transport with no pipeline and no flags.
    #[must_use]
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            transport: crate::transport::MEM.to_string(),
            address: None,
            direction,
            kind: ValueKind::Any,
            allow_threading: false,
            allow_multiple_comms: None,
            filters: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Selects a transport by registry tag.
    #[must_use]
    pub fn with_transport(mut self, tag: impl Into<String>) -> Self {
        self.transport = tag.into();
        self
    }

    /// Attaches to an existing address instead of allocating one.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Declares the payload kind the port starts with.
    #[must_use]
    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    /// Permits handing the port to [`AsyncPort`](crate::port::AsyncPort).
    #[must_use]
    pub fn with_threading(mut self) -> Self {
        self.allow_threading = true;
        self
    }

    /// Explicitly permits or forbids a second port on the same address in
    /// this process. Unset, it follows `allow_threading`.
    #[must_use]
    pub fn with_multiple_comms(mut self, allowed: bool) -> Self {
        self.allow_multiple_comms = Some(allowed);
        self
    }

    /// Appends a filter stage. Stages run in the order they were added.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Appends a transform stage. Stages run in the order they were added.
    #[must_use]
    pub fn with_transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    /// The endpoint name stamped into message headers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registry tag of the transport to open.
    #[must_use]
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The address to attach to, if any.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Which way values flow.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// The declared payload kind.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Whether the port may move into a background task.
    #[must_use]
    pub const fn allow_threading(&self) -> bool {
        self.allow_threading
    }

    /// Whether several ports may share one address in this process.
    ///
    /// When not set explicitly this follows `allow_threading`: a spec that
    /// opts into background use usually means its address to be shared.
    #[must_use]
    pub fn multiple_comms(&self) -> bool {
        self.allow_multiple_comms.unwrap_or(self.allow_threading)
    }

    pub(crate) fn address_owned(&self) -> Option<String> {
        self.address.clone()
    }

    pub(crate) fn build_pipeline(&self) -> Pipeline {
        Pipeline::new(self.filters.clone(), self.transforms.clone())
    }

    /// Rejects misconfigurations before any transport is touched.
    pub(crate) fn validate(&self) -> Result<(), PortError> {
        if self.name.trim().is_empty() {
            return Err(PortError::Config(
                "Port name must not be empty".to_string(),
            ));
        }
        if self.transport.trim().is_empty() {
            return Err(PortError::Config(
                "Transport tag must not be empty".to_string(),
            ));
        }
        if let Some(address) = &self.address {
            if address.trim().is_empty() {
                return Err(PortError::Config(
                    "Address must name something or be absent".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = PortSpec::new("model_a", Direction::Send);
        assert_eq!(spec.name(), "model_a");
        assert_eq!(spec.transport(), "mem");
        assert_eq!(spec.address(), None);
        assert_eq!(spec.kind(), ValueKind::Any);
        assert!(!spec.allow_threading());
        assert!(!spec.multiple_comms());
    }

    #[test]
    fn test_multiple_comms_follows_threading_when_unset() {
        let spec = PortSpec::new("m", Direction::Send).with_threading();
        assert!(spec.multiple_comms());

        let spec = PortSpec::new("m", Direction::Send)
            .with_threading()
            .with_multiple_comms(false);
        assert!(spec.allow_threading());
        assert!(!spec.multiple_comms());

        let spec = PortSpec::new("m", Direction::Send).with_multiple_comms(true);
        assert!(!spec.allow_threading());
        assert!(spec.multiple_comms());
    }

    #[test]
    fn test_validation_rejects_empty_fields() {
        assert!(matches!(
            PortSpec::new("", Direction::Send).validate(),
            Err(PortError::Config(_))
        ));
        assert!(matches!(
            PortSpec::new("m", Direction::Send).with_transport("").validate(),
            Err(PortError::Config(_))
        ));
        assert!(matches!(
            PortSpec::new("m", Direction::Send).with_address("  ").validate(),
            Err(PortError::Config(_))
        ));
        assert!(PortSpec::new("m", Direction::Recv).validate().is_ok());
    }

    #[test]
    fn test_spec_is_cloneable_with_stages() {
        let spec = PortSpec::new("m", Direction::Send)
            .with_filter(crate::pipeline::FilterFn::new("always", |_| true))
            .with_transform(crate::pipeline::CoerceTransform::new(ValueKind::String));
        let copy = spec.clone();
        assert!(!copy.build_pipeline().is_empty());
    }
}
