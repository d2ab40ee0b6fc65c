use thiserror::Error;

/// Canonical error taxonomy for the proxy core (spec §7).
///
/// Every fallible path in the engine — parser, sender, connection, pool,
/// dispatcher — reduces to one of these codes before it reaches the edge.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[error("connection reset by backend")]
    ConnReset,
    #[error("connection aborted by backend")]
    ConnAborted,
    #[error("connection refused by backend")]
    ConnRefused,
    #[error("request body stream failed")]
    BodyStream,
    #[error("backend did not respond within the configured timeout")]
    TimedOut,
    #[error("backend closed the connection mid-response")]
    RecipientAborted,
    #[error("invalid content-length in backend response")]
    InvalidContentLength,
    #[error("invalid chunk size in backend response")]
    InvalidChunkSize,
    #[error("pipeline queue is full")]
    PipelineOverflow,
    #[error("connection pool exhausted for this backend")]
    MaxConnections,
    #[error("a response with unknown length arrived after pipelining was locked")]
    StreamUntilCloseNotSupported,
}

impl ErrorCode {
    /// Fatal parser errors: the owning Connection must be torn down.
    pub fn is_parser_fatal(self) -> bool {
        matches!(self, ErrorCode::InvalidContentLength | ErrorCode::InvalidChunkSize)
    }

    /// Default HTTP status returned to the edge client (spec §7 table).
    pub fn status_code(self) -> u16 {
        match self {
            ErrorCode::ConnReset | ErrorCode::ConnAborted | ErrorCode::ConnRefused | ErrorCode::BodyStream => 503,
            ErrorCode::TimedOut => 504,
            ErrorCode::RecipientAborted => 502,
            ErrorCode::InvalidContentLength | ErrorCode::InvalidChunkSize => 502,
            ErrorCode::PipelineOverflow | ErrorCode::MaxConnections => 503,
            ErrorCode::StreamUntilCloseNotSupported => 502,
        }
    }

    pub fn status_message(self) -> &'static str {
        match self.status_code() {
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Internal Server Error",
        }
    }
}

/// Top-level error type threaded through the engine.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("{code}")]
    Code {
        code: ErrorCode,
        #[source]
        source: Option<std::sync::Arc<std::io::Error>>,
    },
    #[error("pipeline error: {0}")]
    Pipeline(ErrorCode),
}

impl ProxyError {
    pub fn new(code: ErrorCode) -> Self {
        ProxyError::Code { code, source: None }
    }

    pub fn from_io(code: ErrorCode, err: std::io::Error) -> Self {
        ProxyError::Code { code, source: Some(std::sync::Arc::new(err)) }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProxyError::Code { code, .. } => *code,
            ProxyError::Pipeline(code) => *code,
        }
    }

    /// Plain-text diagnostic body the Proxy synthesizes for a client-facing
    /// error response (spec §6: "plain text with a short diagnostic
    /// including the error code").
    pub fn to_body(&self) -> Vec<u8> {
        format!("{:?}: {}", self.code(), self).into_bytes()
    }
}

impl std::fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::ConnReset => "CONN_RESET",
            ErrorCode::ConnAborted => "CONN_ABORTED",
            ErrorCode::ConnRefused => "CONN_REFUSED",
            ErrorCode::BodyStream => "BODY_STREAM",
            ErrorCode::TimedOut => "TIMED_OUT",
            ErrorCode::RecipientAborted => "RECIPIENT_ABORTED",
            ErrorCode::InvalidContentLength => "INVALID_CONTENT_LENGTH",
            ErrorCode::InvalidChunkSize => "INVALID_CHUNK_SIZE",
            ErrorCode::PipelineOverflow => "PIPELINE_OVERFLOW",
            ErrorCode::MaxConnections => "MAX_CONNECTIONS",
            ErrorCode::StreamUntilCloseNotSupported => "STREAM_UNTIL_CLOSE_NOT_SUPPORTED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(ErrorCode::ConnReset.status_code(), 503);
        assert_eq!(ErrorCode::ConnAborted.status_code(), 503);
        assert_eq!(ErrorCode::ConnRefused.status_code(), 503);
        assert_eq!(ErrorCode::BodyStream.status_code(), 503);
        assert_eq!(ErrorCode::TimedOut.status_code(), 504);
        assert_eq!(ErrorCode::RecipientAborted.status_code(), 502);
        assert_eq!(ErrorCode::InvalidContentLength.status_code(), 502);
        assert_eq!(ErrorCode::InvalidChunkSize.status_code(), 502);
        assert_eq!(ErrorCode::PipelineOverflow.status_code(), 503);
        assert_eq!(ErrorCode::MaxConnections.status_code(), 503);
        assert_eq!(ErrorCode::StreamUntilCloseNotSupported.status_code(), 502);
    }

    #[test]
    fn parser_fatal_classification() {
        assert!(ErrorCode::InvalidContentLength.is_parser_fatal());
        assert!(ErrorCode::InvalidChunkSize.is_parser_fatal());
        assert!(!ErrorCode::TimedOut.is_parser_fatal());
        assert!(!ErrorCode::ConnReset.is_parser_fatal());
    }

    #[test]
    fn body_contains_error_code_name() {
        let err = ProxyError::new(ErrorCode::MaxConnections);
        let body = String::from_utf8(err.to_body()).unwrap();
        assert!(body.contains("MAX_CONNECTIONS"));
    }
}
