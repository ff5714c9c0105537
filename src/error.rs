use thiserror::Error;

/// "Timestamp for this request is outside of the recvWindow"
pub const TIMESTAMP_OUTSIDE_RECV_WINDOW: i64 = -1021;

/// "No need to change position side" (position mode already as requested)
pub const NO_NEED_TO_CHANGE_POSITION_MODE: i64 = -4059;

/// Errors from talking to the exchange
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("exchange rejected request ({code}): {msg}")]
    Api { code: i64, msg: String },

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no successful attempt")]
    NoSuccessfulAttempt,
}

/// How a failure should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested state change is already in effect; never retry
    NoOp,
    /// Request timestamp rejected; resync the clock and retry
    ClockSkew,
    /// Network, rate limit, server side or unclassified; retry up to the bound
    Transient,
    /// Payload could not be used; skip this symbol this cycle
    DataQuality,
}

impl ExchangeError {
    /// Exchange error code, if the exchange returned one
    pub fn code(&self) -> Option<i64> {
        match self {
            ExchangeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Api { code, .. } if *code == NO_NEED_TO_CHANGE_POSITION_MODE => {
                ErrorKind::NoOp
            }
            ExchangeError::Api { code, .. } if *code == TIMESTAMP_OUTSIDE_RECV_WINDOW => {
                ErrorKind::ClockSkew
            }
            ExchangeError::Json(_) | ExchangeError::Malformed(_) => ErrorKind::DataQuality,
            _ => ErrorKind::Transient,
        }
    }
}
