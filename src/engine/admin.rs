//! Queue and exchange lifecycle commands. Each one opens a session,
//! performs a single operation and closes the session again. A refused
//! operation is reported as [`Error::Declare`].

use tracing::info;

use crate::transport::{ExchangeKind, QueueOptions, Session, TlsConfig, Transport, redact_uri};
use crate::utils::error::{Error, Result};

async fn open(transport: &Transport, uri: &str, tls: &TlsConfig) -> Result<Session> {
    let mut session = transport.session(uri, tls);
    if let Err(err) = session.open().await {
        session.close().await;
        return Err(Error::Setup(err));
    }
    Ok(session)
}

pub async fn create_queue(
    transport: &Transport,
    uri: &str,
    tls: &TlsConfig,
    queue: &str,
    options: QueueOptions,
) -> Result<()> {
    let mut session = open(transport, uri, tls).await?;
    let result = session.declare_queue(queue, options).await;
    session.close().await;
    result.map_err(Error::Declare)?;
    info!(broker = %redact_uri(uri), queue, durable = options.durable, "queue created");
    Ok(())
}

pub async fn remove_queue(
    transport: &Transport,
    uri: &str,
    tls: &TlsConfig,
    queue: &str,
) -> Result<()> {
    let mut session = open(transport, uri, tls).await?;
    let result = session.delete_queue(queue).await;
    session.close().await;
    result.map_err(Error::Declare)?;
    info!(broker = %redact_uri(uri), queue, "queue removed");
    Ok(())
}

pub async fn bind_queue(
    transport: &Transport,
    uri: &str,
    tls: &TlsConfig,
    queue: &str,
    exchange: &str,
    binding_key: &str,
) -> Result<()> {
    let mut session = open(transport, uri, tls).await?;
    let result = session.bind_queue(queue, exchange, binding_key).await;
    session.close().await;
    result.map_err(Error::Declare)?;
    info!(broker = %redact_uri(uri), queue, exchange, binding_key, "queue bound");
    Ok(())
}

pub async fn create_exchange(
    transport: &Transport,
    uri: &str,
    tls: &TlsConfig,
    exchange: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<()> {
    let mut session = open(transport, uri, tls).await?;
    let result = session.declare_exchange(exchange, kind, durable).await;
    session.close().await;
    result.map_err(Error::Declare)?;
    info!(broker = %redact_uri(uri), exchange, kind = kind.as_str(), "exchange created");
    Ok(())
}
