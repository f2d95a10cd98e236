//! In-memory broker
//!
//! `MemoryBroker` implements [`Connector`] without any network. It models the
//! parts of AMQP the engine relies on: the default exchange, declared
//! exchanges with direct/fanout/topic routing, queues that buffer until a
//! consumer attaches, exclusive queues that disappear with their connection,
//! and acknowledgments.
//!
//! It also lets tests inject failures: hosts can be taken offline so that
//! connection attempts are refused, and live connections can be severed,
//! which fires their failure notice and ends their consumers.
//!
//! URIs have the form `memory://<host>[/...]`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    Connected, Connector, DeliveryStream, ExchangeKind, Link, QueueOptions, TlsConfig,
    tap_queue_name,
};
use crate::message::{Acknowledge, BrokerMessage, PersistentMessage};
use crate::utils::error::TransportError;

/// A message as published to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: PersistentMessage,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_link: u64,
    connection_attempts: usize,
    links: HashMap<u64, LinkEntry>,
    offline: HashSet<String>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    published: Vec<Published>,
    acked: usize,
}

struct LinkEntry {
    host: String,
    failure: Option<oneshot::Sender<TransportError>>,
}

#[derive(Default)]
struct Queue {
    backlog: VecDeque<Published>,
    consumer: Option<(u64, mpsc::UnboundedSender<Published>)>,
    owner: Option<u64>,
}

struct Binding {
    exchange: String,
    key: String,
    queue: String,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.lock().exchanges.insert(name.to_string(), kind);
    }

    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    /// Publishes without going through a connection.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: PersistentMessage,
    ) -> Result<(), TransportError> {
        self.lock().route(exchange, routing_key, message)
    }

    /// Refuses (or accepts again) connections to `host`.
    pub fn set_offline(&self, host: &str, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(host.to_string());
        } else {
            state.offline.remove(host);
        }
    }

    /// Drops every live connection to `host` as if the network failed.
    /// Returns the number of connections severed.
    pub fn sever(&self, host: &str) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .links
            .iter()
            .filter(|(_, entry)| entry.host == host)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sender) = state.links.get_mut(id).and_then(|entry| entry.failure.take()) {
                let _ = sender.send(TransportError::Closed(format!(
                    "connection to {host} reset"
                )));
            }
            state.detach(*id);
        }
        ids.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().links.len()
    }

    pub fn connection_attempts(&self) -> usize {
        self.lock().connection_attempts
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, name: &str) -> bool {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    pub fn bindings(&self, exchange: &str) -> usize {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .count()
    }
}

impl State {
    fn check_link(&self, id: u64) -> Result<(), TransportError> {
        if self.links.contains_key(&id) {
            Ok(())
        } else {
            Err(TransportError::Closed("connection is closed".into()))
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: PersistentMessage,
    ) -> Result<(), TransportError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let kind = *self.exchanges.get(exchange).ok_or_else(|| {
                TransportError::Channel(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.key, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };

        let published = Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        };
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.deliver(published.clone());
            }
        }
        self.published.push(published);
        Ok(())
    }

    /// Removes a connection and everything that lives and dies with it.
    fn detach(&mut self, id: u64) {
        if self.links.remove(&id).is_none() {
            return;
        }
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !owned.contains(&b.queue));
        for queue in self.queues.values_mut() {
            if matches!(queue.consumer, Some((link, _)) if link == id) {
                queue.consumer = None;
            }
        }
        debug!(link = id, auto_deleted = owned.len(), "memory connection detached");
    }
}

impl Queue {
    fn deliver(&mut self, published: Published) {
        if let Some((_, consumer)) = &self.consumer {
            match consumer.send(published) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.consumer = None;
                    self.backlog.push_back(returned);
                    return;
                }
            }
        }
        self.backlog.push_back(published);
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| go(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && go(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && go(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    go(&pattern, &key)
}

fn parse_host(uri: &str) -> Result<String, TransportError> {
    let rest = uri
        .strip_prefix("memory://")
        .ok_or_else(|| TransportError::InvalidUri(uri.to_string()))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(TransportError::InvalidUri(uri.to_string()));
    }
    Ok(host.to_string())
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str, _tls: &TlsConfig) -> Result<Connected, TransportError> {
        let host = parse_host(uri)?;
        let mut state = self.lock();
        state.connection_attempts += 1;
        if state.offline.contains(&host) {
            return Err(TransportError::Connect(format!("{host}: connection refused")));
        }

        let id = state.next_link;
        state.next_link += 1;
        let (tx, rx) = oneshot::channel();
        state.links.insert(
            id,
            LinkEntry {
                host,
                failure: Some(tx),
            },
        );

        Ok(Connected {
            link: Box::new(MemoryLink {
                id,
                broker: self.clone(),
            }),
            failure: rx,
        })
    }
}

struct MemoryLink {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl Link for MemoryLink {
    async fn declare_tap_queue(
        &mut self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<String, TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.id)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let name = tap_queue_name(exchange);
        state.queues.insert(
            name.clone(),
            Queue {
                owner: Some(self.id),
                ..Queue::default()
            },
        );
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            key: binding_key.to_string(),
            queue: name.clone(),
        });
        Ok(name)
    }

    async fn consume(&mut self, queue: &str) -> Result<DeliveryStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            state.check_link(self.id)?;
            let entry = state.queues.get_mut(queue).ok_or_else(|| {
                TransportError::Channel(format!("NOT_FOUND - no queue '{queue}'"))
            })?;
            if matches!(entry.owner, Some(owner) if owner != self.id) {
                return Err(TransportError::Channel(format!(
                    "RESOURCE_LOCKED - queue '{queue}' is exclusive"
                )));
            }
            if matches!(&entry.consumer, Some((_, existing)) if !existing.is_closed()) {
                return Err(TransportError::Channel(format!(
                    "ACCESS_REFUSED - queue '{queue}' already has a consumer"
                )));
            }
            while let Some(waiting) = entry.backlog.pop_front() {
                let _ = tx.send(waiting);
            }
            entry.consumer = Some((self.id, tx));
        }

        let broker = self.broker.clone();
        let link = self.id;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|published| (published, rx))
        })
        .map(move |published| {
            let acker = MemoryAcker {
                broker: broker.clone(),
                link,
            };
            Ok(into_delivery(published, Box::new(acker)))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &PersistentMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.id)?;
        state.route(exchange, routing_key, message.clone())
    }

    async fn declare_queue(
        &mut self,
        queue: &str,
        _options: QueueOptions,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.id)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.id)?;
        state.queues.remove(queue);
        state.bindings.retain(|b| b.queue != queue);
        Ok(())
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            key: binding_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn declare_exchange(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.id)?;
        match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(TransportError::Channel(format!(
                "PRECONDITION_FAILED - exchange '{exchange}' is of type {}",
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.broker.lock().detach(self.id);
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.lock().detach(self.id);
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    link: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_link(self.link)?;
        state.acked += 1;
        Ok(())
    }
}

fn into_delivery(published: Published, acker: Box<dyn Acknowledge>) -> BrokerMessage {
    let Published {
        exchange,
        routing_key,
        message,
    } = published;
    let content_type = match message.content_type() {
        "" => None,
        ct => Some(ct.to_string()),
    };
    let delivery_mode = message.delivery_mode();
    let headers = message.headers().clone();

    let mut delivery = BrokerMessage::new(exchange, routing_key, message.into_body());
    delivery.content_type = content_type;
    delivery.delivery_mode = delivery_mode;
    delivery.headers = headers;
    delivery.with_acker(acker)
}
