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
#![forbid(missing_docs)] // Keep this to enforce coverage

//! # Myelin
//!
//! This crate provides a transport-agnostic messaging layer for coupling
//! independently running model processes, built on top of Tokio. Values
//! move through directed ports whose wire transport is chosen by
//! configuration rather than by code, so the same caller logic runs over
//! an in-process queue, a Unix socket, TCP pub/sub, or a broker daemon.
//!
//! ## Key Concepts
//!
//! - **Specs (`PortSpec`)**: Declarative descriptions of an endpoint: its
//!   name, direction, transport tag, optional address, declared payload
//!   kind, pipeline stages, and threading flags.
//! - **Ports (`Port`)**: Directed endpoints opened from a spec. Sending
//!   runs prepare and dispatch; receiving runs ingest and finalize. The
//!   stages are public so drivers can reuse one half without paying for
//!   the other.
//! - **Transports**: A closed set of wire carriers behind one capability
//!   surface, selected through the `TransportRegistry` by tag.
//! - **Pipelines**: Ordered filter and transform chains fixed at open
//!   time. Transforms carry inverses, so a symmetric pair of specs
//!   round-trips values unchanged.
//! - **Envelopes (`Envelope`)**: The message model: a routing `Header`,
//!   an optional payload value, and a one-way `Status`.
//! - **AsyncPort**: A background-task wrapper that makes sends fire-and-
//!   forget and receives buffered.
//! - **Drivers**: `Relay` couples a receive port to a send port for the
//!   life of a connection; `RpcClient` and `RpcServer` build a
//!   request/response exchange out of reply addresses.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use myelin::prelude::*;
//! use serde_json::json;
//!
//! let mut tx = Port::open(PortSpec::new("readings", Direction::Send)).await?;
//! let mut rx = Port::open(
//!     PortSpec::new("sink", Direction::Recv).with_address(tx.address()),
//! )
//! .await?;
//!
//! tx.send(json!({ "celsius": 21.5 })).await?;
//! let envelope = rx.recv(None).await?;
//! ```

/// A prelude module for conveniently importing the most commonly used items.
///
/// This module re-exports the whole public surface of `myelin-core` along
/// with the `myelin-macro` attribute macro, simplifying the import process
/// for users.
///
/// # Re-exports
///
/// ## Macros (from `myelin-macro`)
/// *   [`myelin_macro::myelin_payload`]: Attribute macro for defining payload types.
///
/// ## External Crates
/// *   [`acton_ern::*`](https://docs.rs/acton-ern): All items from the `acton-ern` crate for unique resource naming.
/// *   [`async_trait`](https://docs.rs/async-trait): The macro crate the `Endpoint` trait is written with.
///
/// ## Core Types
/// *   [`myelin_core::prelude::PortSpec`]: Declarative description of an endpoint.
/// *   [`myelin_core::prelude::Direction`]: Which way a port moves values.
/// *   [`myelin_core::prelude::Port`]: A directed endpoint with staged send and receive.
/// *   [`myelin_core::prelude::AsyncPort`]: Background-task wrapper around a port.
/// *   [`myelin_core::prelude::Envelope`]: A value travelling through a port.
/// *   [`myelin_core::prelude::Header`]: Routing metadata carried by every message.
/// *   [`myelin_core::prelude::Status`]: One-way delivery state of an envelope.
/// *   [`myelin_core::prelude::SendReceipt`]: Outcome of a send.
/// *   [`myelin_core::prelude::PortError`]: Everything that can go wrong on a port.
/// *   [`myelin_core::prelude::ValueKind`]: Declared payload kinds and their coercions.
/// *   [`myelin_core::prelude::Filter`]: Boolean stage deciding whether a value moves.
/// *   [`myelin_core::prelude::Transform`]: Invertible stage reshaping values in flight.
/// *   [`myelin_core::prelude::Endpoint`]: Object-safe seam over ports and wrappers.
/// *   [`myelin_core::prelude::Relay`]: Driver coupling a receive port to a send port.
/// *   [`myelin_core::prelude::RpcClient`]: Calling side of a request/response exchange.
/// *   [`myelin_core::prelude::RpcServer`]: Answering side of a request/response exchange.
/// *   [`myelin_core::prelude::BrokerDaemon`]: Standalone queue daemon the broker transport talks to.
/// *   [`myelin_core::prelude::TransportRegistry`]: Tag-to-constructor table behind `Port::open`.
pub mod prelude {
    pub use myelin_macro::*;

    pub use myelin_core::prelude::*;
}
