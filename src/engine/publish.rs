use tracing::{debug, info, warn};

use super::context::Context;
use super::sink::MessageSource;
use super::source::PublishTarget;
use super::Outcome;
use crate::transport::{Session, Transport};
use crate::utils::error::{Error, Result, TransportError};

/// Publishes what `source` yields to `target`, in order, over one session.
///
/// Ends with `Ok(Outcome::Completed)` once the source is exhausted,
/// `Ok(Outcome::Cancelled(_))` on cancellation, `Err(Error::Source(_))` if the
/// source fails, `Err(Error::Setup(_))` if the session cannot be opened and
/// `Err(Error::Transport(_))` if a publish fails. Publishing is not retried.
pub async fn publish<S>(
    transport: &Transport,
    target: &PublishTarget,
    ctx: &Context,
    source: &mut S,
) -> Result<Outcome>
where
    S: MessageSource + ?Sized,
{
    let mut session = transport.session(target.uri(), target.tls());
    let result = produce(&mut session, target, ctx, source).await;
    session.close().await;
    if let Err(err) = &result {
        warn!(exchange = %target.exchange(), routing_key = %target.routing_key(), error = %err, "publish failed");
    }
    result
}

async fn produce<S>(
    session: &mut Session,
    target: &PublishTarget,
    ctx: &Context,
    source: &mut S,
) -> Result<Outcome>
where
    S: MessageSource + ?Sized,
{
    tokio::select! {
        biased;
        reason = ctx.cancelled() => return Ok(Outcome::Cancelled(reason)),
        opened = session.open() => opened.map_err(Error::Setup)?,
    }
    let mut failure = session
        .take_failure_notice()
        .ok_or(Error::Setup(TransportError::NotOpen))?;

    let mut published = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            reason = ctx.cancelled() => {
                debug!(published, "publish cancelled");
                return Ok(Outcome::Cancelled(reason));
            }
            notice = &mut failure => {
                session.mark_failed();
                let err = notice
                    .unwrap_or_else(|_| TransportError::Closed("connection dropped".into()));
                return Err(Error::Transport(err));
            }
            next = source.next_message() => next.map_err(Error::Source)?,
        };

        let Some(message) = next else {
            info!(published, exchange = %target.exchange(), "source exhausted");
            return Ok(Outcome::Completed);
        };

        tokio::select! {
            biased;
            reason = ctx.cancelled() => {
                debug!(published, "publish cancelled");
                return Ok(Outcome::Cancelled(reason));
            }
            sent = session.publish(target.exchange(), target.routing_key(), &message) => {
                sent.map_err(Error::Transport)?;
            }
        }
        published += 1;
    }
}
