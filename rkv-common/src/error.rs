//! # Remote Errors
//!
//! Errors a partition server reports for an individual action inside a batched
//! request. Whole-request failures never appear here; they surface from the
//! transport instead.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ServerName;

/// Per-action error returned by a partition server.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    /// The partition now lives on `server`, opened there at `seq_num`.
    #[error("region moved to {server} (seq {seq_num})")]
    RegionMoved { server: ServerName, seq_num: u64 },

    /// The partition is being opened on this server; try again shortly.
    #[error("region {} is opening", String::from_utf8_lossy(.region))]
    RegionOpening { region: Bytes },

    /// This server does not host the partition.
    #[error("region {} is not served here", String::from_utf8_lossy(.region))]
    NotServingRegion { region: Bytes },

    /// The action is permanently invalid and must not be retried.
    #[error("do not retry: {message}")]
    DoNotRetry { message: String },

    /// Any other server-side failure.
    #[error("remote failure: {message}")]
    Failed { message: String },
}

impl RemoteError {
    #[inline]
    pub fn is_do_not_retry(&self) -> bool {
        matches!(self, RemoteError::DoNotRetry { .. })
    }

    /// Returns the redirect target carried by a `RegionMoved` error.
    pub fn moved_to(&self) -> Option<(&ServerName, u64)> {
        match self {
            RemoteError::RegionMoved { server, seq_num } => Some((server, *seq_num)),
            _ => None,
        }
    }

    #[inline]
    pub fn is_region_opening(&self) -> bool {
        matches!(self, RemoteError::RegionOpening { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let moved = RemoteError::RegionMoved {
            server: ServerName::new("rs2", 16020, 9),
            seq_num: 12,
        };
        assert_eq!(moved.moved_to().map(|(s, seq)| (s.port, seq)), Some((16020, 12)));
        assert!(!moved.is_do_not_retry());

        let fatal = RemoteError::DoNotRetry {
            message: "bad row".into(),
        };
        assert!(fatal.is_do_not_retry());
        assert!(fatal.moved_to().is_none());

        let opening = RemoteError::RegionOpening {
            region: Bytes::from_static(b"t,,1"),
        };
        assert!(opening.is_region_opening());
        assert_eq!(opening.to_string(), "region t,,1 is opening");
    }
}
