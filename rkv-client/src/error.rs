//! # Client Errors
//!
//! Purpose: One error type for every failure the connection core surfaces, plus
//! the aggregate report a batch raises after exhausting its retries.
//!
//! ## Design Principles
//! 1. **Categories Drive Retries**: Callers and the retry loops match on variants
//!    (`TableNotFound`, `DoNotRetry`) instead of parsing messages.
//! 2. **Opaque Transports**: Collaborator failures arrive as `anyhow::Error`; the
//!    classification helpers walk the cause chain rather than trusting the top.
//! 3. **Shared Causes**: A batch result can point at the same cause from several
//!    places, so per-action causes are `Arc`ed.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rkv_common::{RemoteError, RowOperation, ServerName, TableName};
use thiserror::Error;

/// Result type for the connection core.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the connection core.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The partition for a row could not be resolved within the retry budget.
    #[error("cannot locate {table} row {}: {message}", String::from_utf8_lossy(.row))]
    NotFound {
        table: TableName,
        row: Bytes,
        message: String,
    },

    /// The metadata table has no partition for this table.
    #[error("table {0} not found")]
    TableNotFound(TableName),

    /// The only matching partition cannot serve requests.
    #[error("region {region} is offline: {reason}")]
    RegionOffline { region: String, reason: String },

    /// The destination server is known to be dead.
    #[error("server {0} is stopped")]
    ServerStopped(ServerName),

    /// The coordinator could not be reached within the retry budget.
    #[error("coordinator unavailable: {message}")]
    CoordinatorUnavailable {
        message: String,
        #[source]
        source: Option<Box<ClientError>>,
    },

    /// The request is permanently invalid. Servers report it per action; see
    /// `From<RemoteError>`.
    #[error("do not retry: {0}")]
    DoNotRetry(String),

    /// A server rejected an individual action with a retryable error.
    #[error(transparent)]
    Remote(RemoteError),

    /// A batch finished with permanently failed actions.
    #[error("{0}")]
    RetriesExhausted(Box<BatchFailure>),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection is closed")]
    Closed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A metadata row could not be interpreted.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// A batch worker was cancelled or panicked.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The coordinator session expired.
    #[error("coordinator session expired")]
    SessionExpired,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Failure reported by a transport or discovery collaborator.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

impl From<anyhow::Error> for ClientError {
    /// Recovers typed errors a collaborator passed through `anyhow`.
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<ClientError>() {
            Ok(client) => return client,
            Err(err) => err,
        };
        match err.downcast::<RemoteError>() {
            Ok(remote) => remote.into(),
            Err(err) => ClientError::Transport(err),
        }
    }
}

impl From<RemoteError> for ClientError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::DoNotRetry { message } => ClientError::DoNotRetry(message),
            other => ClientError::Remote(other),
        }
    }
}

impl ClientError {
    pub(crate) fn not_found(table: &TableName, row: &[u8], message: impl Into<String>) -> Self {
        ClientError::NotFound {
            table: table.clone(),
            row: Bytes::copy_from_slice(row),
            message: message.into(),
        }
    }

    pub(crate) fn coordinator_unavailable(message: impl Into<String>, source: Option<Self>) -> Self {
        ClientError::CoordinatorUnavailable {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// Returns true when the error is a refused, reset or dropped connection,
    /// looking through wrapped transport errors.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ClientError::Io(err) => is_connection_kind(err.kind()),
            ClientError::Transport(err) => err.chain().any(|cause| {
                cause
                    .downcast_ref::<io::Error>()
                    .map(|io| is_connection_kind(io.kind()))
                    .unwrap_or(false)
            }),
            ClientError::CoordinatorUnavailable {
                source: Some(inner),
                ..
            } => inner.is_connection_failure(),
            _ => false,
        }
    }

    /// Returns true when retrying cannot change the outcome.
    pub fn is_do_not_retry(&self) -> bool {
        match self {
            ClientError::DoNotRetry(_)
            | ClientError::TableNotFound(_)
            | ClientError::InvalidArgument(_) => true,
            ClientError::Remote(remote) => remote.is_do_not_retry(),
            _ => false,
        }
    }
}

fn is_connection_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Final state of one action in a batch.
#[derive(Debug, Clone)]
pub enum ActionResult {
    /// The action succeeded; reads carry the value found, if any.
    Success(Option<Bytes>),
    /// The action failed permanently.
    Failure(Arc<ClientError>),
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success(_))
    }

    pub fn value(&self) -> Option<&Bytes> {
        match self {
            ActionResult::Success(value) => value.as_ref(),
            ActionResult::Failure(_) => None,
        }
    }
}

/// An action that failed permanently, with where it was last sent.
#[derive(Debug, Clone)]
pub struct FailedAction {
    pub index: usize,
    pub operation: RowOperation,
    /// Server the last attempt targeted; `None` if it never resolved.
    pub destination: Option<ServerName>,
    pub cause: Arc<ClientError>,
}

/// Aggregate report of a batch with permanently failed actions.
///
/// `results` holds an entry for every action of the batch, in submission order.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub failures: Vec<FailedAction>,
    pub results: Vec<ActionResult>,
}

impl BatchFailure {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Distinct `host:port` endpoints that caused failures.
    pub fn failed_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self
            .failures
            .iter()
            .filter_map(|f| f.destination.as_ref().map(ServerName::host_port))
            .collect();
        servers.sort();
        servers.dedup();
        servers
    }

    /// Returns true when some failure looks like a cluster problem rather than a
    /// bad request.
    pub fn may_have_cluster_issues(&self) -> bool {
        self.failures.iter().any(|f| !f.cause.is_do_not_retry())
    }

    fn cause_summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.cause.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed {} action(s): ", self.failures.len())?;
        for (cause, count) in self.cause_summary() {
            write!(f, "{}: {} time(s), ", cause, count)?;
        }
        write!(f, "servers with issues: {}", self.failed_servers().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_found_through_wrappers() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let wrapped = anyhow::Error::new(refused).context("calling is_running");
        assert!(ClientError::Transport(wrapped).is_connection_failure());

        let other = anyhow::anyhow!("undeclared failure");
        assert!(!ClientError::Transport(other).is_connection_failure());

        let reset = ClientError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        let outer = ClientError::coordinator_unavailable("gave up", Some(reset));
        assert!(outer.is_connection_failure());
    }

    #[test]
    fn typed_errors_survive_anyhow() {
        let err: ClientError = anyhow::Error::new(ClientError::SessionExpired).into();
        assert!(matches!(err, ClientError::SessionExpired));

        let err: ClientError = anyhow::Error::new(RemoteError::Failed {
            message: "x".into(),
        })
        .into();
        assert!(matches!(err, ClientError::Remote(RemoteError::Failed { .. })));

        let err: ClientError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[test]
    fn remote_do_not_retry_maps_to_its_own_variant() {
        let err: ClientError = RemoteError::DoNotRetry {
            message: "row too large".into(),
        }
        .into();
        assert!(matches!(err, ClientError::DoNotRetry(ref m) if m == "row too large"));
        assert!(err.is_do_not_retry());

        let err: ClientError = anyhow::Error::new(RemoteError::DoNotRetry {
            message: "bad".into(),
        })
        .into();
        assert!(matches!(err, ClientError::DoNotRetry(_)));
    }

    #[test]
    fn do_not_retry_classification() {
        assert!(ClientError::DoNotRetry("x".into()).is_do_not_retry());
        assert!(ClientError::TableNotFound(TableName::from("t")).is_do_not_retry());
        assert!(ClientError::Remote(RemoteError::DoNotRetry {
            message: "bad".into()
        })
        .is_do_not_retry());
        assert!(!ClientError::Remote(RemoteError::Failed {
            message: "busy".into()
        })
        .is_do_not_retry());
        assert!(!ClientError::Closed.is_do_not_retry());
    }

    #[test]
    fn batch_failure_summarizes_causes_and_servers() {
        let cause = Arc::new(ClientError::Timeout(Duration::from_secs(1)));
        let failure = |index, host: &str| FailedAction {
            index,
            operation: RowOperation::get("r"),
            destination: Some(ServerName::new(host, 1, 1)),
            cause: cause.clone(),
        };
        let batch = BatchFailure {
            failures: vec![failure(0, "b"), failure(1, "a"), failure(2, "b")],
            results: vec![ActionResult::Failure(cause.clone()); 3],
        };

        assert_eq!(batch.failed_servers(), vec!["a:1".to_string(), "b:1".to_string()]);
        assert!(batch.may_have_cluster_issues());
        let text = batch.to_string();
        assert!(text.starts_with("failed 3 action(s)"));
        assert!(text.contains("3 time(s)"));
    }
}
