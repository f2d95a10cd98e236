use std::fmt;

use crate::transport::{TlsConfig, redact_uri};

/// Binding key used for taps that do not name one.
pub const DEFAULT_BINDING_KEY: &str = "#";

/// What a consume loop reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// An existing queue, consumed directly.
    Queue(String),
    /// A temporary queue bound to `exchange`, removed with the session.
    Tap {
        exchange: String,
        binding_key: String,
    },
}

/// One subscribe or tap target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    uri: String,
    target: Target,
    tls: TlsConfig,
}

impl SourceSpec {
    /// Subscribes to `queue` on the broker at `uri`.
    pub fn queue(uri: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            target: Target::Queue(queue.into()),
            tls: TlsConfig::default(),
        }
    }

    /// Taps `exchange`. Without a binding key everything is observed.
    pub fn tap(uri: impl Into<String>, exchange: impl Into<String>, binding_key: Option<&str>) -> Self {
        Self {
            uri: uri.into(),
            target: Target::Tap {
                exchange: exchange.into(),
                binding_key: binding_key.unwrap_or(DEFAULT_BINDING_KEY).to_string(),
            },
            tls: TlsConfig::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    /// Printable identity, safe to log: the password is masked.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uri = redact_uri(&self.uri);
        match &self.target {
            Target::Queue(queue) => write!(f, "{uri} queue={queue}"),
            Target::Tap {
                exchange,
                binding_key,
            } => write!(f, "{uri} exchange={exchange} key={binding_key}"),
        }
    }
}

/// Where a produce loop publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    uri: String,
    exchange: String,
    routing_key: String,
    tls: TlsConfig,
}

impl PublishTarget {
    /// An empty `exchange` selects the default exchange, which routes by
    /// queue name.
    pub fn new(
        uri: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            tls: TlsConfig::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }
}
