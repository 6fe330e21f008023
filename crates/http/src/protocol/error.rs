use http::StatusCode;
use std::io;
use thiserror::Error;

/// Top-level error of one connection's exchange.
///
/// Every variant is fatal to the exchange it was raised in. Whether the peer still
/// receives a synthesized error response depends on whether a response head
/// has already been written.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("too many handler redirects, the limit is {max}")]
    RedirectOverflow { max: usize },

    #[error("contract violation: {reason}")]
    ContractViolation { reason: String },

    #[error("transport error: {source}")]
    Transport { source: io::Error },
}

impl HttpError {
    pub fn redirect_overflow(max: usize) -> Self {
        Self::RedirectOverflow { max }
    }

    pub fn contract_violation<S: ToString>(str: S) -> Self {
        Self::ContractViolation { reason: str.to_string() }
    }

    pub fn transport<E: Into<io::Error>>(e: E) -> Self {
        Self::Transport { source: e.into() }
    }

    /// The status code of the best-effort response sent for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            HttpError::RequestError { source } => source.status_code(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk: {reason}")]
    InvalidChunk { reason: String },

    #[error("chunk size line too large, max {max_size} bytes")]
    TooLargeChunkLine { max_size: usize },

    #[error("chunk trailers too large, max {max_size} bytes")]
    TooLargeTrailers { max_size: usize },

    #[error("invalid multipart body: {reason}")]
    InvalidMultipart { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_chunk<S: ToString>(str: S) -> Self {
        Self::InvalidChunk { reason: str.to_string() }
    }

    pub fn too_large_chunk_line(max_size: usize) -> Self {
        Self::TooLargeChunkLine { max_size }
    }

    pub fn too_large_trailers(max_size: usize) -> Self {
        Self::TooLargeTrailers { max_size }
    }

    pub fn invalid_multipart<S: ToString>(str: S) -> Self {
        Self::InvalidMultipart { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Maps the error to the status code of the response the peer receives.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ParseError::TooLargeHeader { .. } | ParseError::TooManyHeaders { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_status() {
        assert_eq!(ParseError::too_large_header(5000, 4096).status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::too_many_headers(64).status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::invalid_chunk("bad size").status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn http_error_status() {
        let e: HttpError = ParseError::InvalidMethod.into();
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(HttpError::redirect_overflow(5).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(HttpError::contract_violation("no body").to_string(), "contract violation: no body");
    }
}
