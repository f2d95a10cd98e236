//! Session state machine
//!
//! A `Session` owns at most one [`Link`] and tracks where it is in its
//! lifecycle:
//!
//! ```text
//! Closed -> Connecting -> Open -> Closing -> Closed
//!                \-> Failed        \-> Failed -> Closed
//! ```
//!
//! `open` makes exactly one attempt; retrying is up to the owner. `close`
//! can be called from any state, any number of times, and always leaves the
//! session `Closed` with its resources released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Connector, DeliveryStream, ExchangeKind, Link, QueueOptions, TlsConfig};
use crate::message::PersistentMessage;
use crate::utils::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Closing,
    Failed,
}

pub struct Session {
    connector: Arc<dyn Connector>,
    uri: String,
    tls: TlsConfig,
    connect_timeout: Duration,
    state: SessionState,
    link: Option<Box<dyn Link>>,
    failure: Option<oneshot::Receiver<TransportError>>,
}

impl Session {
    pub fn new(
        connector: Arc<dyn Connector>,
        uri: impl Into<String>,
        tls: TlsConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            uri: uri.into(),
            tls,
            connect_timeout,
            state: SessionState::Closed,
            link: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Connects once. On failure the session is `Failed` and the error is
    /// returned as is; an attempt that exceeds the connect timeout fails with
    /// [`TransportError::Timeout`].
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.state == SessionState::Open {
            return Ok(());
        }
        // drop whatever a previous attempt left behind
        self.close().await;

        self.state = SessionState::Connecting;
        let attempt = self.connector.connect(&self.uri, &self.tls);
        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(connected)) => {
                self.link = Some(connected.link);
                self.failure = Some(connected.failure);
                self.state = SessionState::Open;
                debug!("session open");
                Ok(())
            }
            Ok(Err(err)) => {
                self.state = SessionState::Failed;
                Err(err)
            }
            Err(_) => {
                self.state = SessionState::Failed;
                Err(TransportError::Timeout(self.connect_timeout))
            }
        }
    }

    /// Hands out the one-shot failure notice of the current connection.
    /// Returns `None` if the session is not open or the notice was already
    /// taken.
    pub fn take_failure_notice(&mut self) -> Option<oneshot::Receiver<TransportError>> {
        if self.state != SessionState::Open {
            return None;
        }
        self.failure.take()
    }

    /// Records that the connection went away underneath the session.
    pub fn mark_failed(&mut self) {
        if self.state == SessionState::Open {
            self.state = SessionState::Failed;
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>, TransportError> {
        match (self.state, self.link.as_mut()) {
            (SessionState::Open, Some(link)) => Ok(link),
            _ => Err(TransportError::NotOpen),
        }
    }

    pub async fn declare_tap_queue(
        &mut self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<String, TransportError> {
        self.link()?.declare_tap_queue(exchange, binding_key).await
    }

    pub async fn consume(&mut self, queue: &str) -> Result<DeliveryStream, TransportError> {
        self.link()?.consume(queue).await
    }

    pub async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &PersistentMessage,
    ) -> Result<(), TransportError> {
        self.link()?.publish(exchange, routing_key, message).await
    }

    pub async fn declare_queue(
        &mut self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), TransportError> {
        self.link()?.declare_queue(queue, options).await
    }

    pub async fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError> {
        self.link()?.delete_queue(queue).await
    }

    pub async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        self.link()?.bind_queue(queue, exchange, binding_key).await
    }

    pub async fn declare_exchange(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        self.link()?.declare_exchange(exchange, kind, durable).await
    }

    /// Releases the link, if any. Errors while closing an already broken
    /// connection are logged and otherwise ignored.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            let was_open = self.state == SessionState::Open;
            self.state = SessionState::Closing;
            match link.close().await {
                Ok(()) => debug!("session closed"),
                Err(err) if was_open => warn!(error = %err, "error while closing session"),
                Err(err) => debug!(error = %err, "closing failed session"),
            }
        }
        self.failure = None;
        self.state = SessionState::Closed;
    }
}
