use serde_json::Value;
use shared::domain::KeyserverId;
use thiserror::Error;

use crate::endpoints::Endpoint;

#[derive(Debug, Error)]
pub enum CallError {
    /// The keyserver answered with an `error` field. Display is the bare code.
    #[error("{code}")]
    Server { code: String, payload: Option<Value> },
    #[error("call to {endpoint} timed out")]
    FetchTimeout { endpoint: Endpoint },
    #[error("socket_offline")]
    SocketOffline,
    #[error("socket_timeout")]
    SocketTimeout,
    #[error("socket call failed: {0}")]
    Socket(String),
    #[error("cancelled")]
    Cancelled,
    #[error("failed to parse response from {endpoint}: {source}")]
    Parse {
        endpoint: Endpoint,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("upload aborted")]
    UploadAborted,
    #[error("no session state for keyserver {0}")]
    UnknownKeyserver(KeyserverId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    pub fn server(code: impl Into<String>, payload: Option<Value>) -> Self {
        Self::Server {
            code: code.into(),
            payload,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Server { code, .. } => code.clone(),
            other => other.to_string(),
        }
    }

    pub fn has_message(&self, expected: &str) -> bool {
        self.message() == expected
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
