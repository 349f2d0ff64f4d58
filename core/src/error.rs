//! Error types for the request engine.
//!
//! # Design
//! Two layers of failure exist. `ValidationError` is returned synchronously
//! while a descriptor is being built and never reaches a transport.
//! `ErrorKind` classifies failures of a running exchange; those are captured
//! inside the operation and delivered through the final `ended` event, with
//! the `Display` text standing in for the response body.

use thiserror::Error;

/// Failure of a running exchange, as reported in the final event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, serde::Serialize)]
pub enum ErrorKind {
    /// The URL could not be parsed or names an unsupported scheme.
    #[error("Invalid URL")]
    InvalidUrl,

    /// Name resolution or the connection itself failed.
    #[error("Connection failure")]
    ConnectionFailure,

    #[error("Timed out")]
    TimedOut,

    /// The request was cancelled or aborted before it completed.
    #[error("Connection aborted")]
    Aborted,

    #[error("Certificate required")]
    CertificateRequired,

    #[error("Login failure")]
    LoginFailure,

    /// A local resource (file, thread, buffer) could not be acquired.
    #[error("Internal error")]
    Internal,

    /// Unclassified transport failure.
    #[error("Unknown error")]
    Unknown,
}

/// Errors raised while building a `RequestDescriptor`.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unsupported charset '{0}'")]
    UnsupportedCharset(String),

    /// A body was supplied but no Content-Type could be determined.
    #[error("a request body requires a Content-Type header")]
    MissingContentType,

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("cannot resolve '{filename}': {source}")]
    Resolve {
        filename: String,
        #[source]
        source: ResolveError,
    },
}

/// Errors raised by a `ResourceResolver`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown base directory '{0}'")]
    UnknownBase(String),

    #[error("filename is empty")]
    EmptyFilename,

    #[error("no resource resolver configured")]
    NoResolver,
}

/// Errors raised by the `transcode` module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscodeError {
    #[error("unsupported charset '{0}'")]
    UnsupportedCharset(String),

    /// The input is not valid under the source charset.
    #[error("input is not valid {0}")]
    Malformed(&'static str),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_messages_are_user_facing() {
        assert_eq!(ErrorKind::TimedOut.to_string(), "Timed out");
        assert_eq!(ErrorKind::InvalidUrl.to_string(), "Invalid URL");
        assert_eq!(ErrorKind::Aborted.to_string(), "Connection aborted");
        assert_eq!(ErrorKind::ConnectionFailure.to_string(), "Connection failure");
        assert_eq!(ErrorKind::Unknown.to_string(), "Unknown error");
    }

    #[test]
    fn resolve_error_is_wrapped_with_filename() {
        let err = ValidationError::Resolve {
            filename: "out.bin".to_string(),
            source: ResolveError::UnknownBase("caches".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "cannot resolve 'out.bin': unknown base directory 'caches'"
        );
    }
}
