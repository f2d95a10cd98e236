//! # rabtap
//!
//! `rabtap` taps, subscribes to and publishes AMQP traffic. This library is
//! its message transport engine: reconnect-resilient consume and produce
//! loops over a broker session, and a persistent message format that lets
//! captured traffic be saved and replayed later.
//!
//! ## Core Modules
//!
//! - `message`: broker deliveries, the transport independent
//!   `PersistentMessage` and its binary record codec.
//! - `transport`: the connector seam to the AMQP client (lapin in production,
//!   an in-memory broker in tests) and the connection session state machine.
//! - `engine`: cancellation contexts, the consume and produce loops, the
//!   retry supervisor, the multiplexed tap and queue/exchange commands.
//! - `persistence`: capture files and a sled backed capture store.
//! - `config`: loading settings from files and the environment.
//! - `utils`: shared utilities such as error types and logging.

pub mod config;
pub mod engine;
pub mod message;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use utils::error::{Error, Result};
