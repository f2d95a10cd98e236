//! Capabilities the loops are parameterised with.
//!
//! A [`MessageSink`] receives what the consume loop reads, a
//! [`MessageSource`] supplies what the produce loop publishes. Both are
//! implemented for plain closures so callers rarely need a type of their own.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{BrokerMessage, PersistentMessage};
use crate::utils::error::BoxError;

/// Receives every delivery of a consume loop, in broker order.
///
/// Returning an error stops the loop for good; it is never retried.
#[async_trait]
pub trait MessageSink: Send {
    async fn on_message(&mut self, message: BrokerMessage) -> Result<(), BoxError>;
}

#[async_trait]
impl<F> MessageSink for F
where
    F: FnMut(BrokerMessage) -> Result<(), BoxError> + Send,
{
    async fn on_message(&mut self, message: BrokerMessage) -> Result<(), BoxError> {
        self(message)
    }
}

/// Forwards deliveries into a bounded channel. Fails once the receiver is
/// gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<BrokerMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BrokerMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn on_message(&mut self, message: BrokerMessage) -> Result<(), BoxError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| "message channel closed".into())
    }
}

/// Supplies the messages a produce loop publishes.
///
/// `Ok(None)` signals the end of input. An error stops the loop.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> Result<Option<PersistentMessage>, BoxError>;
}

#[async_trait]
impl<F> MessageSource for F
where
    F: FnMut() -> Result<Option<PersistentMessage>, BoxError> + Send,
{
    async fn next_message(&mut self) -> Result<Option<PersistentMessage>, BoxError> {
        self()
    }
}

/// Publishes everything an iterator yields.
#[derive(Debug)]
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = PersistentMessage> + Send,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

#[async_trait]
impl<I> MessageSource for IterSource<I>
where
    I: Iterator<Item = PersistentMessage> + Send,
{
    async fn next_message(&mut self) -> Result<Option<PersistentMessage>, BoxError> {
        Ok(self.iter.next())
    }
}

/// Publishes what arrives on a channel until every sender is dropped.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<PersistentMessage>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<PersistentMessage>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<PersistentMessage>, BoxError> {
        Ok(self.rx.recv().await)
    }
}
