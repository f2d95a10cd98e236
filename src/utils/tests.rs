use super::error::{CodecError, Error, TransportError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn parse_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    assert_eq!(logging::parse_level("Trace"), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
}

#[test]
fn only_setup_and_transport_errors_are_retryable() {
    assert!(Error::Setup(TransportError::Connect("refused".into())).is_retryable());
    assert!(Error::Transport(TransportError::Closed("reset".into())).is_retryable());
    assert!(!Error::Sink("broken pipe".into()).is_retryable());
    assert!(!Error::Source("eof".into()).is_retryable());
    assert!(!Error::Codec(CodecError::UnknownTag(b'?')).is_retryable());
}

#[test]
fn declare_errors_are_setup_errors_after_open() {
    let connect = Error::Setup(TransportError::Connect("refused".into()));
    let declare = Error::Declare(TransportError::Channel("NOT_FOUND".into()));
    let dropped = Error::Transport(TransportError::Closed("reset".into()));

    assert!(declare.is_retryable());
    assert!(connect.is_setup() && declare.is_setup());
    assert!(!dropped.is_setup());

    assert!(!connect.session_opened());
    assert!(declare.session_opened());
    assert!(dropped.session_opened());
}

#[test]
fn error_messages_name_the_failure() {
    let err = Error::Setup(TransportError::InvalidUri("invalid uri".into()));
    assert_eq!(err.to_string(), "setup failed: invalid broker uri: invalid uri");

    let err = CodecError::Truncated {
        needed: 4,
        remaining: 1,
    };
    assert_eq!(
        err.to_string(),
        "record truncated: needed 4 more bytes, 1 left"
    );
}
