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

use dashmap::DashMap;
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use std::sync::Arc;
use tracing::debug;

use super::spec::{Direction, PortSpec};
use crate::message::PortError;
use crate::transport::{self, Transport};

/// Builds an open channel from a spec. Registered per transport tag.
pub type TransportCtor =
    Arc<dyn Fn(PortSpec) -> BoxFuture<'static, Result<Transport, PortError>> + Send + Sync>;

/// Maps transport tags to constructors and tracks which addresses already
/// have a port attached in this process.
///
/// The process-wide instance from [`registry`] comes seeded with the four
/// built-in tags. Registering an existing tag overwrites it; the last
/// registration wins.
pub struct TransportRegistry {
    ctors: DashMap<String, TransportCtor>,
    attached: DashMap<String, usize>,
}

impl TransportRegistry {
    fn with_builtins() -> Self {
        let registry = Self {
            ctors: DashMap::new(),
            attached: DashMap::new(),
        };
        registry.register(transport::MEM, mem_ctor());
        registry.register(transport::IPC, ipc_ctor());
        registry.register(transport::TCP, tcp_ctor());
        registry.register(transport::BROKER, broker_ctor());
        registry
    }

    /// Registers a constructor under a tag, replacing any previous one.
    pub fn register(&self, tag: impl Into<String>, ctor: TransportCtor) {
        let tag = tag.into();
        debug!(%tag, "registered transport");
        self.ctors.insert(tag, ctor);
    }

    /// Registers `tag` as another name for an existing transport.
    pub fn alias(&self, tag: impl Into<String>, existing: &str) -> Result<(), PortError> {
        let ctor = self
            .ctors
            .get(existing)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                PortError::Config(format!("Unknown transport tag '{existing}'"))
            })?;
        self.register(tag, ctor);
        Ok(())
    }

    /// Whether a tag is known.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.ctors.contains_key(tag)
    }

    /// Opens a channel for the spec's transport tag.
    pub async fn create(&self, spec: PortSpec) -> Result<Transport, PortError> {
        let ctor = self
            .ctors
            .get(spec.transport())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                PortError::Config(format!("Unknown transport tag '{}'", spec.transport()))
            })?;
        ctor(spec).await
    }

    /// Claims an address for a newly opened port.
    ///
    /// A second claim on the same address fails unless the spec allows
    /// sharing; this is the same-process guard, cross-process collisions
    /// surface from the OS instead.
    pub(crate) fn acquire(
        &self,
        tag: &str,
        address: &str,
        allow_multiple: bool,
    ) -> Result<(), PortError> {
        let mut entry = self.attached.entry(attach_key(tag, address)).or_insert(0);
        if *entry > 0 && !allow_multiple {
            return Err(PortError::Config(format!(
                "Address '{address}' already has a port attached; set allow_multiple_comms to share it"
            )));
        }
        *entry += 1;
        Ok(())
    }

    /// Drops a claim made by [`acquire`](Self::acquire).
    pub(crate) fn release(&self, tag: &str, address: &str) {
        let key = attach_key(tag, address);
        if let Some(mut entry) = self.attached.get_mut(&key) {
            *entry = entry.saturating_sub(1);
            let empty = *entry == 0;
            drop(entry);
            if empty {
                self.attached.remove_if(&key, |_, count| *count == 0);
            }
        }
    }
}

fn attach_key(tag: &str, address: &str) -> String {
    format!("{tag}:{address}")
}

fn mem_ctor() -> TransportCtor {
    Arc::new(|spec: PortSpec| {
        Box::pin(async move { Ok(Transport::Mem(transport::MemChannel::open(spec.address_owned()))) })
    })
}

fn ipc_ctor() -> TransportCtor {
    Arc::new(|spec: PortSpec| {
        Box::pin(async move {
            Ok(Transport::Ipc(
                transport::IpcChannel::open(spec.address_owned()).await?,
            ))
        })
    })
}

fn tcp_ctor() -> TransportCtor {
    Arc::new(|spec: PortSpec| {
        Box::pin(async move {
            Ok(Transport::Tcp(
                transport::TcpChannel::open(spec.address_owned()).await?,
            ))
        })
    })
}

fn broker_ctor() -> TransportCtor {
    Arc::new(|spec: PortSpec| {
        Box::pin(async move {
            let role = match spec.direction() {
                Direction::Send => transport::BrokerRole::Producer,
                Direction::Recv => transport::BrokerRole::Consumer,
            };
            let channel =
                transport::BrokerChannel::open(spec.address_owned(), role, spec.name()).await?;
            Ok(Transport::Broker(channel))
        })
    })
}

lazy_static! {
    static ref REGISTRY: TransportRegistry = TransportRegistry::with_builtins();
}

/// The process-wide transport registry.
#[must_use]
pub fn registry() -> &'static TransportRegistry {
    &REGISTRY
}
