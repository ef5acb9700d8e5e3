//! Error types for chatgrep

use thiserror::Error;

/// A malformed archive line.
///
/// Parse errors are reported per line; they never abort a bucket on their own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("parser error: empty input")]
    EmptyInput,

    #[error("parser error: unable to find a space after tags, looks like input was trimmed")]
    UnterminatedTags,

    #[error("parser error: invalid tag key value pair: {0:?}")]
    InvalidTag(String),

    #[error("parser error: unable to find a space after the prefix, looks like input was trimmed")]
    UnterminatedPrefix,

    #[error("parser error: missing command")]
    MissingCommand,

    #[error("parser error: unable to parse time (@tmi-sent-ts): {0:?}")]
    InvalidSentTimestamp(String),

    #[error("parser error: unable to parse time (@time): {0:?}")]
    InvalidTime(String),
}

/// Core error type for chatgrep operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("log archive responded with {status} for {url}: {detail:?}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
        detail: String,
    },

    #[error("failed to fetch {target} at {bucket}: {source}")]
    Fetch {
        target: String,
        bucket: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid log listing entry: {0}")]
    InvalidLogEntry(String),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error with the bucket and target it happened on.
    pub fn in_bucket(self, target: impl Into<String>, bucket: impl Into<String>) -> Self {
        Error::Fetch {
            target: target.into(),
            bucket: bucket.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error came from the network side (transport or status).
    pub fn is_network(&self) -> bool {
        match self {
            Error::Http(_) | Error::Status { .. } | Error::Io(_) => true,
            Error::Fetch { source, .. } => source.is_network(),
            _ => false,
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
