//! # Request and Response Payloads
//!
//! Purpose: Describe what the client sends to a partition server and what comes
//! back, independent of how a transport encodes it.
//!
//! ## Design Principles
//! 1. **Positional Results**: Every action carries its original batch index so
//!    results can be written back regardless of regrouping during retries.
//! 2. **Per-Action Outcomes**: A multi response reports success or a
//!    `RemoteError` for each action; a whole-request failure is a transport error.
//! 3. **Serde Everywhere**: Payloads derive `Serialize`/`Deserialize` so any
//!    codec can carry them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::types::{PartitionDescriptor, ServerName, TableName};

/// A single row-keyed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOperation {
    Get { row: Bytes },
    Put { row: Bytes, value: Bytes },
    Delete { row: Bytes },
}

impl RowOperation {
    pub fn get(row: impl Into<Bytes>) -> Self {
        RowOperation::Get { row: row.into() }
    }

    pub fn put(row: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        RowOperation::Put {
            row: row.into(),
            value: value.into(),
        }
    }

    pub fn delete(row: impl Into<Bytes>) -> Self {
        RowOperation::Delete { row: row.into() }
    }

    /// Returns the row key this operation targets.
    #[inline]
    pub fn row(&self) -> &Bytes {
        match self {
            RowOperation::Get { row } => row,
            RowOperation::Put { row, .. } => row,
            RowOperation::Delete { row } => row,
        }
    }
}

/// An operation tagged with its position in the caller's batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedAction {
    pub index: usize,
    pub operation: RowOperation,
}

/// Actions addressed to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionActions {
    pub region_name: Bytes,
    pub actions: Vec<IndexedAction>,
}

/// One batched request for a single destination server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRequest {
    pub table: TableName,
    pub regions: Vec<RegionActions>,
}

impl MultiRequest {
    pub fn new(table: TableName) -> Self {
        MultiRequest {
            table,
            regions: Vec::new(),
        }
    }

    /// Appends an action to the group for `region_name`, creating it if needed.
    pub fn add(&mut self, region_name: Bytes, action: IndexedAction) {
        match self.regions.iter_mut().find(|r| r.region_name == region_name) {
            Some(group) => group.actions.push(action),
            None => self.regions.push(RegionActions {
                region_name,
                actions: vec![action],
            }),
        }
    }

    /// Total number of actions across all partitions.
    pub fn action_count(&self) -> usize {
        self.regions.iter().map(|r| r.actions.len()).sum()
    }
}

/// Outcome of one action: the value read (if any) or the server's error.
pub type ActionOutcome = Result<Option<Bytes>, RemoteError>;

/// Results for the actions sent to one partition, keyed by batch index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionResult {
    pub region_name: Bytes,
    pub results: Vec<(usize, ActionOutcome)>,
}

/// Server reply to a `MultiRequest`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiResponse {
    pub regions: Vec<RegionResult>,
}

impl MultiResponse {
    /// Records the outcome of the action at `index` under `region_name`.
    pub fn push(&mut self, region_name: Bytes, index: usize, outcome: ActionOutcome) {
        match self.regions.iter_mut().find(|r| r.region_name == region_name) {
            Some(group) => group.results.push((index, outcome)),
            None => self.regions.push(RegionResult {
                region_name,
                results: vec![(index, outcome)],
            }),
        }
    }

    /// Iterates over every `(region, index, outcome)` triple.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, usize, &ActionOutcome)> {
        self.regions.iter().flat_map(|region| {
            region
                .results
                .iter()
                .map(move |(idx, outcome)| (&region.region_name, *idx, outcome))
        })
    }
}

/// A row of the metadata table as returned by a floor lookup or scan.
///
/// Either column may be missing: a partition being assigned has no server yet,
/// and a corrupt row may lack its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRow {
    pub descriptor: Option<PartitionDescriptor>,
    pub server: Option<ServerName>,
    pub seq_num: u64,
}

impl MetaRow {
    pub fn new(descriptor: PartitionDescriptor, server: Option<ServerName>, seq_num: u64) -> Self {
        MetaRow {
            descriptor: Some(descriptor),
            server,
            seq_num,
        }
    }
}
