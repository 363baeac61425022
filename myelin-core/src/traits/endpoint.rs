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

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;

use crate::message::{Envelope, PortError, SendReceipt};
use crate::port::{AsyncPort, Port};

/// The model-facing endpoint contract.
///
/// [`Port`] and [`AsyncPort`] both implement it, so caller code written
/// against `Endpoint` takes either without caring whether a background
/// task sits in between. Direction rules still apply: calling the wrong
/// half is the same `Config` error the concrete types give.
#[async_trait]
pub trait Endpoint: Debug + Send {
    /// Sends one value through the outbound pipeline.
    async fn send(&mut self, value: Value) -> Result<SendReceipt, PortError>;

    /// Marks the end of this endpoint's stream.
    async fn send_eof(&mut self) -> Result<SendReceipt, PortError>;

    /// Receives one finalized envelope under the timeout contract.
    async fn recv(&mut self, timeout: Option<Duration>) -> Result<Envelope, PortError>;

    /// Tears the endpoint down. Idempotent.
    async fn close(&mut self) -> Result<(), PortError>;

    /// `true` until [`close`](Endpoint::close) runs.
    fn is_open(&self) -> bool;

    /// Approximate count of undelivered inbound or queued outbound messages.
    fn n_pending(&self) -> usize;

    /// The concrete transport address of this endpoint.
    fn address(&self) -> &str;
}

#[async_trait]
impl Endpoint for Port {
    async fn send(&mut self, value: Value) -> Result<SendReceipt, PortError> {
        Port::send(self, value).await
    }

    async fn send_eof(&mut self) -> Result<SendReceipt, PortError> {
        Port::send_eof(self).await
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<Envelope, PortError> {
        Port::recv(self, timeout).await
    }

    async fn close(&mut self) -> Result<(), PortError> {
        Port::close(self).await
    }

    fn is_open(&self) -> bool {
        Port::is_open(self)
    }

    fn n_pending(&self) -> usize {
        Port::n_pending(self)
    }

    fn address(&self) -> &str {
        Port::address(self)
    }
}

#[async_trait]
impl Endpoint for AsyncPort {
    async fn send(&mut self, value: Value) -> Result<SendReceipt, PortError> {
        AsyncPort::send(self, value).await
    }

    async fn send_eof(&mut self) -> Result<SendReceipt, PortError> {
        AsyncPort::send_eof(self).await
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<Envelope, PortError> {
        AsyncPort::recv(self, timeout).await
    }

    async fn close(&mut self) -> Result<(), PortError> {
        AsyncPort::close(self).await
    }

    fn is_open(&self) -> bool {
        AsyncPort::is_open(self)
    }

    fn n_pending(&self) -> usize {
        AsyncPort::n_pending(self)
    }

    fn address(&self) -> &str {
        AsyncPort::address(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;
    use crate::port::{Direction, PortSpec};
    use serde_json::json;

    async fn pump(endpoint: &mut dyn Endpoint, values: Vec<Value>) -> Result<(), PortError> {
        for value in values {
            endpoint.send(value).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_either_endpoint_drops_into_generic_code() {
        let plain = Port::open(PortSpec::new("seam_plain", Direction::Send))
            .await
            .unwrap();
        let address = plain.address().to_string();
        let mut rx = Port::open(
            PortSpec::new("seam_rx", Direction::Recv).with_address(address),
        )
        .await
        .unwrap();

        let mut endpoint: Box<dyn Endpoint> = Box::new(plain);
        pump(endpoint.as_mut(), vec![json!(1), json!(2)]).await.unwrap();
        endpoint.close().await.unwrap();

        let wrapped = Port::open(
            PortSpec::new("seam_async", Direction::Send)
                .with_address(rx.address())
                .with_threading()
                .with_multiple_comms(true),
        )
        .await
        .unwrap();
        let mut wrapped: Box<dyn Endpoint> = Box::new(AsyncPort::wrap(wrapped).unwrap());
        pump(wrapped.as_mut(), vec![json!(3)]).await.unwrap();
        wrapped.send_eof().await.unwrap();

        let mut values = Vec::new();
        loop {
            let envelope = rx.recv(Some(Duration::from_secs(2))).await.unwrap();
            if envelope.status() == Status::Eof {
                break;
            }
            values.push(envelope.into_value().unwrap());
        }
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);

        wrapped.close().await.unwrap();
        rx.close().await.unwrap();
    }
}
