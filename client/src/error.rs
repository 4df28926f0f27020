use std::{error::Error, fmt, io};

use common::DatasetId;

#[derive(Clone, Debug)]
pub enum UploadError {
    /// The API rejected the token (HTTP 401). Never retried.
    AuthenticationFailed { url: String },
    /// Every attempt failed; carries what the last attempt saw.
    TransportExhausted {
        url: String,
        attempts: u32,
        last_status: Option<u16>,
        message: String,
    },
    /// The existing dataset could not be looked up.
    InvalidDatasetId { dataset_id: DatasetId, reason: String },
    /// A collection resolved to zero uploadable assets.
    NoApplicableFiles(String),
    PresignRequestFailed(Box<UploadError>),
    StorageUploadFailed(Box<UploadError>),
    RegistrationFailed(Box<UploadError>),
    /// A transfer that could not even be sent (bad request, connection reset, ...).
    Connection(String),
    JsonDecode(String),
    BadResponse(String),
    Io(String),
}

impl UploadError {
    /// HTTP status behind this error, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailed { .. } => Some(401),
            Self::TransportExhausted { last_status, .. } => *last_status,
            Self::PresignRequestFailed(inner)
            | Self::StorageUploadFailed(inner)
            | Self::RegistrationFailed(inner) => inner.status(),
            _ => None,
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationFailed { url } => {
                write!(f, "authentication failed for {url}; check the token")
            }
            Self::TransportExhausted {
                url,
                attempts,
                last_status: Some(status),
                message,
            } => write!(
                f,
                "{url} failed after {attempts} attempts, last status {status}: {message}"
            ),
            Self::TransportExhausted {
                url,
                attempts,
                last_status: None,
                message,
            } => write!(f, "{url} failed after {attempts} attempts: {message}"),
            Self::InvalidDatasetId { dataset_id, reason } => {
                write!(f, "dataset id {dataset_id} invalid: {reason}")
            }
            Self::NoApplicableFiles(s) => write!(f, "no applicable asset file in collection {s}"),
            Self::PresignRequestFailed(e) => write!(f, "presigned url request failed: {e}"),
            Self::StorageUploadFailed(e) => write!(f, "storage upload failed: {e}"),
            Self::RegistrationFailed(e) => write!(f, "image registration failed: {e}"),
            Self::Connection(s) => write!(f, "connection error: {s}"),
            Self::JsonDecode(s) => write!(f, "json decode error: {s}"),
            Self::BadResponse(s) => write!(f, "bad response: {s}"),
            Self::Io(s) => write!(f, "i/o error: {s}"),
        }
    }
}

impl Error for UploadError {}

impl From<reqwest::Error> for UploadError {
    fn from(value: reqwest::Error) -> Self {
        Self::Connection(format!("{}", value))
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(value: serde_json::Error) -> Self {
        Self::JsonDecode(value.to_string())
    }
}

impl From<io::Error> for UploadError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<url::ParseError> for UploadError {
    fn from(value: url::ParseError) -> Self {
        Self::BadResponse(format!("invalid url: {value}"))
    }
}
