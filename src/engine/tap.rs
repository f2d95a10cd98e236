//! Multiplexed tap
//!
//! Runs one supervised consume loop per source, each as its own task, and
//! funnels everything they receive into a single channel. Sources fail and
//! reconnect independently of each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::consume::subscribe;
use super::context::Context;
use super::sink::MessageSink;
use super::source::SourceSpec;
use super::supervisor::{RetryPolicy, supervise};
use super::Outcome;
use crate::message::{BrokerMessage, PersistentMessage};
use crate::transport::Transport;
use crate::utils::error::{BoxError, Result};

/// A delivery together with where and when it was received.
#[derive(Debug)]
pub struct TaggedMessage {
    pub source: Arc<SourceSpec>,
    pub received_at: DateTime<Utc>,
    pub message: BrokerMessage,
}

impl TaggedMessage {
    /// The replayable part of the delivery.
    pub fn persistent(&self) -> PersistentMessage {
        PersistentMessage::capture(&self.message)
    }
}

/// How one source of a tap ended.
#[derive(Debug)]
pub struct SourceReport {
    pub source: Arc<SourceSpec>,
    pub result: Result<Outcome>,
}

#[derive(Clone)]
struct TaggingSink {
    source: Arc<SourceSpec>,
    out: mpsc::Sender<TaggedMessage>,
}

#[async_trait]
impl MessageSink for TaggingSink {
    async fn on_message(&mut self, message: BrokerMessage) -> std::result::Result<(), BoxError> {
        let tagged = TaggedMessage {
            source: self.source.clone(),
            received_at: Utc::now(),
            message,
        };
        self.out
            .send(tagged)
            .await
            .map_err(|_| "tap output closed".into())
    }
}

/// Taps every source in `specs` until `ctx` is cancelled.
///
/// Each source gets a child of `ctx` and its own backoff state. The call
/// returns once every per-source task has finished, which normally means
/// `ctx` was cancelled; a source can also end on its own when its output
/// is dropped or its retries run out. Each task's end is reported in the
/// returned list.
pub async fn tap(
    transport: Transport,
    specs: Vec<SourceSpec>,
    ctx: Context,
    policy: RetryPolicy,
    out: mpsc::Sender<TaggedMessage>,
) -> Vec<SourceReport> {
    let mut tasks = JoinSet::new();
    for spec in specs {
        let spec = Arc::new(spec);
        let transport = transport.clone();
        let ctx = ctx.child();
        let policy = policy.clone();
        let sink = TaggingSink {
            source: spec.clone(),
            out: out.clone(),
        };
        tasks.spawn(async move {
            let label = spec.id();
            let (transport_ref, spec_ref, ctx_ref) = (&transport, &*spec, &ctx);
            let result = supervise(&ctx, &policy, &label, move || {
                let mut sink = sink.clone();
                async move { subscribe(transport_ref, spec_ref, ctx_ref, &mut sink).await }
            })
            .await;
            SourceReport {
                source: spec,
                result,
            }
        });
    }
    drop(out);
    info!(sources = tasks.len(), "tap started");

    let mut reports = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                match &report.result {
                    Ok(outcome) => info!(source = %report.source, ?outcome, "tap source stopped"),
                    Err(err) => warn!(source = %report.source, error = %err, "tap source failed"),
                }
                reports.push(report);
            }
            Err(err) => error!(error = %err, "tap task aborted"),
        }
    }
    reports
}
