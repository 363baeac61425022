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

#![forbid(unsafe_code)]
// #![warn(missing_docs)]
//! Myelin Core Library
//!
//! This library provides the machinery behind the `myelin` messaging layer:
//! the message model, the closed transport set, the staged pipeline, ports
//! and their specs, and the drivers built on top of them. Applications
//! normally depend on the `myelin` facade crate instead of this one.

/// Shared infrastructure, currently the process-wide configuration.
pub(crate) mod common;

pub(crate) mod driver;
pub(crate) mod message;
pub(crate) mod pipeline;
pub(crate) mod port;
/// The seam traits caller code is written against.
pub(crate) mod traits;
pub(crate) mod transport;

/// Prelude module for convenient imports.
///
/// Re-exports the whole public surface: specs and ports, the message
/// model, pipeline stages, transports and their registry, the drivers,
/// and the `async_trait` crate the `Endpoint` seam is written with.
pub mod prelude {
    pub use acton_ern::*;
    pub use async_trait;

    pub use crate::common::{MyelinConfig, CONFIG};
    pub use crate::driver::{Relay, RelayStats, RpcClient, RpcHandler, RpcServer, RpcStats};
    pub use crate::message::{Envelope, Header, PortError, SendReceipt, Status, ValueKind};
    pub use crate::pipeline::{
        CoerceTransform, Filter, FilterFn, IterateTransform, SelectTransform, Staged, Transform,
        TransformFn,
    };
    pub use crate::port::{
        registry, AsyncPort, Direction, Port, PortSpec, TransportCtor, TransportRegistry,
    };
    pub use crate::traits::Endpoint;
    pub use crate::transport::{
        BrokerChannel, BrokerDaemon, BrokerStats, IpcChannel, MemChannel, TcpChannel, Transport,
        BROKER, IPC, MEM, TCP,
    };
}
