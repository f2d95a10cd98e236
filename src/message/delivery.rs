use std::fmt;

use async_trait::async_trait;

use super::persistent::{DeliveryMode, Headers};
use crate::utils::error::TransportError;

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(&mut self) -> Result<(), TransportError>;
}

/// A delivery as received from the broker.
///
/// The consume loop acknowledges the delivery before handing it to the sink;
/// sinks receive it by value and must not expect it to outlive the call in
/// any broker-linked way.
pub struct BrokerMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub headers: Headers,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledge>>,
}

impl BrokerMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            delivery_mode: DeliveryMode::Unspecified,
            headers: Headers::new(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acknowledge>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledges the delivery. Calling this again after a successful ack,
    /// or on a message without an ack handle, does nothing.
    pub async fn ack(&mut self) -> Result<(), TransportError> {
        match self.acker.take() {
            Some(mut acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub fn is_pending_ack(&self) -> bool {
        self.acker.is_some()
    }
}

impl fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerMessage")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("content_type", &self.content_type)
            .field("delivery_mode", &self.delivery_mode)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("pending_ack", &self.acker.is_some())
            .finish()
    }
}
