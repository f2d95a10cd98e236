//! Message transport engine: the consume loop, the produce loop, the
//! retry supervisor and the multiplexed tap built from them.
//!
//! Every loop owns its session exclusively, observes its [`Context`] at each
//! point where it waits, and closes its session on the way out.

pub mod admin;
pub mod consume;
pub mod context;
pub mod publish;
pub mod sink;
pub mod source;
pub mod supervisor;
pub mod tap;

pub use admin::{bind_queue, create_exchange, create_queue, remove_queue};
pub use consume::subscribe;
pub use context::{CancelReason, Context};
pub use publish::publish;
pub use sink::{ChannelSink, ChannelSource, IterSource, MessageSink, MessageSource};
pub use source::{DEFAULT_BINDING_KEY, PublishTarget, SourceSpec, Target};
pub use supervisor::{Backoff, RetryPolicy, supervise};
pub use tap::{SourceReport, TaggedMessage, tap};

/// How a loop ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The source ran out of messages.
    Completed,
    Cancelled(CancelReason),
}

impl Outcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled(_))
    }
}

#[cfg(test)]
mod tests;
