//! lapin-backed connector
//!
//! Translates between lapin's types and ours: `FieldTable`s become
//! [`Headers`], deliveries become [`BrokerMessage`]s carrying their lapin
//! acker, and lapin's connection error callback feeds the session's one-shot
//! failure notice.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{
    AMQPValue, ByteArray, DecimalValue, FieldArray, FieldTable, LongString, ShortString,
};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::{
    Connected, Connector, DeliveryStream, ExchangeKind, Link, QueueOptions, TlsConfig,
    redact_uri, tap_queue_name,
};
use crate::message::{
    Acknowledge, BrokerMessage, DeliveryMode, HeaderValue, Headers, PersistentMessage,
};
use crate::utils::error::TransportError;

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str, tls: &TlsConfig) -> Result<Connected, TransportError> {
        let connection =
            Connection::connect_with_config(uri, ConnectionProperties::default(), owned_tls(tls))
                .await
                .map_err(|err| TransportError::Connect(format!("{}: {err}", redact_uri(uri))))?;

        let (tx, rx) = oneshot::channel();
        let notifier = Mutex::new(Some(tx));
        connection.on_error(move |err| {
            let sender = notifier.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(TransportError::Closed(err.to_string()));
            }
        });

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(TransportError::Channel(err.to_string()));
            }
        };

        Ok(Connected {
            link: Box::new(AmqpLink {
                connection,
                channel,
            }),
            failure: rx,
        })
    }
}

fn owned_tls(tls: &TlsConfig) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: tls.identity.as_ref().map(|identity| OwnedIdentity {
            der: identity.der.clone(),
            password: identity.password.clone(),
        }),
        cert_chain: tls.cert_chain.clone(),
    }
}

fn channel_error(err: lapin::Error) -> TransportError {
    TransportError::Channel(err.to_string())
}

struct AmqpLink {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Link for AmqpLink {
    async fn declare_tap_queue(
        &mut self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<String, TransportError> {
        let name = tap_queue_name(exchange);
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(&name, options, FieldTable::default())
            .await
            .map_err(channel_error)?;
        self.channel
            .queue_bind(
                &name,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        debug!(queue = %name, exchange, binding_key, "tap queue bound");
        Ok(name)
    }

    async fn consume(&mut self, queue: &str) -> Result<DeliveryStream, TransportError> {
        let tag = format!("rabtap-{}", Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(into_broker_message)
                .map_err(|err| TransportError::Closed(err.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &PersistentMessage,
    ) -> Result<(), TransportError> {
        let mut properties =
            BasicProperties::default().with_headers(table_from_headers(message.headers()));
        if !message.content_type().is_empty() {
            properties = properties.with_content_type(ShortString::from(message.content_type()));
        }
        if message.delivery_mode() != DeliveryMode::Unspecified {
            properties = properties.with_delivery_mode(message.delivery_mode().as_u8());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.body(),
                properties,
            )
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn declare_queue(
        &mut self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_exchange(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                exchange,
                lapin::ExchangeKind::Custom(kind.as_str().to_string()),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
            debug!(error = %err, "channel close failed");
        }
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| TransportError::Closed(err.to_string()))
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&mut self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(channel_error)
    }
}

fn into_broker_message(delivery: Delivery) -> BrokerMessage {
    let properties = &delivery.properties;
    let content_type = properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string());
    let delivery_mode = properties
        .delivery_mode()
        .as_ref()
        .map(|mode| DeliveryMode::from_wire(*mode))
        .unwrap_or_default();
    let headers = properties
        .headers()
        .as_ref()
        .map(headers_from_table)
        .unwrap_or_default();
    let exchange = delivery.exchange.as_str().to_string();
    let routing_key = delivery.routing_key.as_str().to_string();
    let redelivered = delivery.redelivered;

    let mut message = BrokerMessage::new(exchange, routing_key, delivery.data)
        .with_acker(Box::new(AmqpAcker(delivery.acker)));
    message.content_type = content_type;
    message.delivery_mode = delivery_mode;
    message.headers = headers;
    message.redelivered = redelivered;
    message
}

pub(crate) fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), header_from_amqp(value)))
        .collect()
}

fn header_from_amqp(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::DecimalValue(d) => HeaderValue::Decimal {
            scale: d.scale,
            value: d.value,
        },
        AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => HeaderValue::String(text.to_string()),
            Err(_) => HeaderValue::Bytes(s.as_bytes().to_vec()),
        },
        AMQPValue::FieldArray(values) => {
            HeaderValue::Array(values.as_slice().iter().map(header_from_amqp).collect())
        }
        AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
        AMQPValue::FieldTable(table) => HeaderValue::Table(headers_from_table(table)),
        AMQPValue::ByteArray(bytes) => HeaderValue::Bytes(bytes.as_slice().to_vec()),
        AMQPValue::Void => HeaderValue::Void,
    }
}

pub(crate) fn table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), header_to_amqp(value));
    }
    table
}

fn header_to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Bytes(bytes) => AMQPValue::ByteArray(ByteArray::from(bytes.clone())),
        HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
        HeaderValue::Table(nested) => AMQPValue::FieldTable(table_from_headers(nested)),
        HeaderValue::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(header_to_amqp).collect::<Vec<_>>(),
        )),
        HeaderValue::Decimal { scale, value } => AMQPValue::DecimalValue(DecimalValue {
            scale: *scale,
            value: *value,
        }),
        HeaderValue::Void => AMQPValue::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_survive_a_trip_through_field_tables() {
        let mut nested = Headers::new();
        nested.insert("inner".into(), HeaderValue::Bool(true));

        let mut headers = Headers::new();
        headers.insert("s".into(), HeaderValue::from("text"));
        headers.insert("i".into(), HeaderValue::Int(-7));
        headers.insert("f".into(), HeaderValue::Float(0.5));
        headers.insert("b".into(), HeaderValue::Bytes(vec![1, 2, 3]));
        headers.insert("t".into(), HeaderValue::Timestamp(1_500_000_000));
        headers.insert("n".into(), HeaderValue::Table(nested));
        headers.insert(
            "a".into(),
            HeaderValue::Array(vec![HeaderValue::Int(1), HeaderValue::Void]),
        );
        headers.insert("d".into(), HeaderValue::Decimal { scale: 1, value: 5 });

        let table = table_from_headers(&headers);
        assert_eq!(headers_from_table(&table), headers);
    }

    #[test]
    fn narrow_broker_types_are_widened() {
        let mut table = FieldTable::default();
        table.insert("short".into(), AMQPValue::ShortInt(-3));
        table.insert("uint".into(), AMQPValue::LongUInt(7));
        table.insert("float".into(), AMQPValue::Float(1.5));
        table.insert("name".into(), AMQPValue::ShortString("x".into()));

        let headers = headers_from_table(&table);
        assert_eq!(headers["short"], HeaderValue::Int(-3));
        assert_eq!(headers["uint"], HeaderValue::Int(7));
        assert_eq!(headers["float"], HeaderValue::Float(1.5));
        assert_eq!(headers["name"], HeaderValue::from("x"));
    }

    #[test]
    fn tls_config_is_passed_through() {
        let tls = TlsConfig {
            cert_chain: Some("-----BEGIN CERTIFICATE-----".into()),
            identity: None,
        };
        let owned = owned_tls(&tls);
        assert_eq!(owned.cert_chain, tls.cert_chain);
        assert!(owned.identity.is_none());
    }
}
