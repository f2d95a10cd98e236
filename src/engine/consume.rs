//! Consume loop
//!
//! One invocation opens one session, reads until something ends it and
//! closes the session again. It never reconnects; wrap it in
//! [`supervise`](super::supervise) for that.

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::context::Context;
use super::sink::MessageSink;
use super::source::{SourceSpec, Target};
use super::Outcome;
use crate::transport::{Session, Transport};
use crate::utils::error::{Error, Result, TransportError};

/// Reads `spec` and hands every delivery to `sink`, acknowledging it first.
///
/// Terminates with exactly one of:
/// - `Ok(Outcome::Cancelled(_))` when `ctx` is cancelled or expires,
/// - `Err(Error::Setup(_))` when the session cannot be opened,
/// - `Err(Error::Declare(_))` when declaring, binding or consuming is refused,
/// - `Err(Error::Transport(_))` when the connection breaks mid-stream,
/// - `Err(Error::Sink(_))` when the sink rejects a message.
///
/// The session is closed on every one of these paths.
pub async fn subscribe<S>(
    transport: &Transport,
    spec: &SourceSpec,
    ctx: &Context,
    sink: &mut S,
) -> Result<Outcome>
where
    S: MessageSink + ?Sized,
{
    let mut session = transport.session(spec.uri(), spec.tls());
    let result = consume(&mut session, spec, ctx, sink).await;
    session.close().await;
    match &result {
        Ok(outcome) => debug!(source = %spec, ?outcome, "consume loop stopped"),
        Err(err) => warn!(source = %spec, error = %err, "consume loop failed"),
    }
    result
}

async fn consume<S>(
    session: &mut Session,
    spec: &SourceSpec,
    ctx: &Context,
    sink: &mut S,
) -> Result<Outcome>
where
    S: MessageSink + ?Sized,
{
    tokio::select! {
        biased;
        reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
        opened = session.open() => opened.map_err(Error::Setup)?,
    }
    let mut failure = session
        .take_failure_notice()
        .ok_or(Error::Setup(TransportError::NotOpen))?;

    let queue = match spec.target() {
        Target::Queue(queue) => queue.clone(),
        Target::Tap {
            exchange,
            binding_key,
        } => tokio::select! {
            biased;
            reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
            declared = session.declare_tap_queue(exchange, binding_key) => {
                let queue = declared.map_err(Error::Declare)?;
                debug!(source = %spec, queue = %queue, "tap queue declared");
                queue
            }
        },
    };

    let mut deliveries = tokio::select! {
        biased;
        reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
        started = session.consume(&queue) => started.map_err(Error::Declare)?,
    };
    info!(source = %spec, queue = %queue, "consuming");

    loop {
        let next = tokio::select! {
            biased;
            reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
            notice = &mut failure => {
                session.mark_failed();
                let err = notice
                    .unwrap_or_else(|_| TransportError::Closed("connection dropped".into()));
                return Err(Error::Transport(err));
            }
            next = deliveries.next() => next,
        };

        let mut message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                session.mark_failed();
                return Err(Error::Transport(err));
            }
            None => {
                session.mark_failed();
                return Err(Error::Transport(TransportError::Closed(
                    "consumer cancelled by broker".into(),
                )));
            }
        };

        tokio::select! {
            biased;
            reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
            acked = message.ack() => acked.map_err(Error::Transport)?,
        }
        tokio::select! {
            biased;
            reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
            delivered = sink.on_message(message) => delivered.map_err(Error::Sink)?,
        }
    }
}
