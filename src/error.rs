//! error taxonomy for the ingestion -> store -> detect -> dispatch pipeline.
//!
//! none of these terminate the process. each variant documents how the
//! pipeline reacts to it.

use crate::domain::SensorId;

/// malformed sensor payload. the message is dropped and ingestion continues.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload on '{topic}' is not utf-8")]
    NotUtf8 { topic: String },

    #[error("payload '{payload}' on '{topic}' is not a number")]
    NotANumber { topic: String, payload: String },

    #[error("payload on '{topic}' is not finite ({value})")]
    NotFinite { topic: String, value: f64 },
}

/// broker unreachable. retried with a fixed backoff, forever.
#[derive(Debug, thiserror::Error)]
#[error("broker {host}:{port} unreachable: {reason}")]
pub struct ConnectError {
    pub host: String,
    pub port: u16,
    pub reason: String,
}

/// outdoor reference lookup failed. replaced by the fallback constant.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceFetchError {
    #[error("reference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("reference response missing current temperature")]
    Malformed,
}

/// persistence failure on append. fatal to that write only.
#[derive(Debug, thiserror::Error)]
#[error("failed to persist {sensor} reading: {source}")]
pub struct WriteError {
    pub sensor: SensorId,
    #[source]
    pub source: rusqlite::Error,
}

/// read-side store failure (open, query, row decode).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage: could not create data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage: timestamp {0} out of range")]
    BadTimestamp(i64),
}

/// one recipient could not be reached. isolated from other recipients.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery to {recipient} failed: {source}")]
    Http {
        recipient: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("delivery to {recipient} rejected with status {status}")]
    Rejected { recipient: String, status: u16 },

    #[error("could not read chart {path}: {source}")]
    Attachment {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("delivery to {recipient} failed: {reason}")]
    Other { recipient: String, reason: String },
}

/// config file could not be read, parsed or validated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// why one inbound message did not become a stored reading
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Write(#[from] WriteError),
}
