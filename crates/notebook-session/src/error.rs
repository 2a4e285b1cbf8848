use runt_trust::TrustError;
use runtimed::client::ClientError;
use runtimed::notebook_sync_client::NotebookSyncError;
use runtimed::protocol::NotebookResponse;

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to daemon")]
    NotConnected,

    #[error("Daemon connection: {0}")]
    Sync(#[from] NotebookSyncError),

    #[error("Blob channel: {0}")]
    Blob(#[from] ClientError),

    #[error("Daemon returned error: {0}")]
    Daemon(String),

    #[error("Unexpected response to {request}: {response:?}")]
    UnexpectedResponse {
        request: &'static str,
        response: Box<NotebookResponse>,
    },

    #[error("Trust: {0}")]
    Trust(#[from] TrustError),
}

impl SessionError {
    /// Map a response that doesn't match what `request` expects.
    pub fn unexpected(request: &'static str, response: NotebookResponse) -> Self {
        match response {
            NotebookResponse::Error { error } => SessionError::Daemon(error),
            other => SessionError::UnexpectedResponse {
                request,
                response: Box::new(other),
            },
        }
    }
}

/// Why an output reference could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Blob port unavailable: {0}")]
    Port(#[source] SessionError),

    #[error("Fetch {hash} failed: {message}")]
    Fetch { hash: String, message: String },

    #[error("Invalid manifest {hash}: {source}")]
    Manifest {
        hash: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_unwraps_daemon_error() {
        let err = SessionError::unexpected(
            "execute_cell",
            NotebookResponse::Error {
                error: "no such cell".into(),
            },
        );
        assert!(matches!(err, SessionError::Daemon(ref e) if e == "no such cell"));

        let err = SessionError::unexpected("execute_cell", NotebookResponse::Ok {});
        assert!(err.to_string().contains("execute_cell"));
    }
}
