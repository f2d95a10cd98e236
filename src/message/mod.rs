//! The `message` module holds the two representations of a message that
//! `rabtap` deals with, and the codec that bridges them.
//!
//! - [`BrokerMessage`] is a live delivery: it carries routing information and
//!   an acknowledgment handle and only lives for one sink invocation.
//! - [`PersistentMessage`] is the session-independent form: body, content
//!   type, delivery mode and headers. It is what gets saved to files and
//!   replayed through the publisher.
//!
//! The [`codec`] submodule defines the binary record format used for
//! capture and replay.

pub mod codec;
pub mod delivery;
pub mod persistent;

pub use codec::{RecordReader, decode_record, encode_record, write_frame};
pub use delivery::{Acknowledge, BrokerMessage};
pub use persistent::{DeliveryMode, HeaderValue, Headers, PersistentMessage};
