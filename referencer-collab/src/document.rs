//! Port over the mergeable (CRDT) document a room owns.
//!
//! The room coordinator never looks inside the document. It needs four
//! operations: read the state vector, diff against a peer's state vector,
//! apply an update, and take a full snapshot for persistence. Merge
//! semantics (commutative, idempotent application) are the library's job.
//!
//! [`YrsDocument`] is the production adapter over `yrs`, whose v1 update
//! encoding is byte-compatible with Yjs clients.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::Reader;

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}

/// Operations a room requires from its shared document.
pub trait MergeableDocument: Send + 'static {
    /// Encoded summary of everything this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Minimal update a peer at `remote_state_vector` is missing.
    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError>;

    /// Merge an update. Applying the same bytes twice is a no-op.
    fn apply_update(&mut self, update: &[u8]) -> Result<(), DocumentError>;

    /// Full state as a single update, suitable for durable storage.
    fn snapshot(&self) -> Vec<u8>;
}

/// `yrs::Doc` adapter.
#[derive(Default)]
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a document from a stored snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let mut document = Self::new();
        document.apply_update(snapshot)?;
        Ok(document)
    }

    /// Underlying `yrs` document, for reading content in tests and tools.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl MergeableDocument for YrsDocument {
    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        check_client_count(remote_state_vector)?;
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::InvalidStateVector(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Rejected(e.to_string()))
    }

    fn snapshot(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

/// `yrs` preallocates one map slot per client announced in the header, so
/// the count must fit the payload before it reaches the decoder. Each entry
/// is a client id and a clock, at least one byte each.
fn check_client_count(state_vector: &[u8]) -> Result<(), DocumentError> {
    let mut reader = Reader::new(state_vector);
    let clients = reader
        .read_var()
        .map_err(|e| DocumentError::InvalidStateVector(e.to_string()))?;
    let room_for = (reader.remaining() / 2) as u64;
    if clients > room_for {
        return Err(DocumentError::InvalidStateVector(format!(
            "{clients} clients announced in {} bytes",
            state_vector.len()
        )));
    }
    Ok(())
}
