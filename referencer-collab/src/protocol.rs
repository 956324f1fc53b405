//! Binary wire protocol shared with Yjs (`y-protocols`) clients.
//!
//! Wire format (lib0 variable-length integers):
//! ```text
//! Sync:           ┌──────────┬──────────┬──────────┬──────────┐
//!                 │ kind = 0 │ step     │ len      │ payload  │
//!                 │ varint   │ varint   │ varint   │ len bytes│
//!                 └──────────┴──────────┴──────────┴──────────┘
//! Awareness:      ┌──────────┬──────────┬──────────┐
//!                 │ kind = 1 │ len      │ payload  │
//!                 └──────────┴──────────┴──────────┘
//! QueryAwareness: ┌──────────┐
//!                 │ kind = 3 │
//!                 └──────────┘
//! ```
//!
//! Sync steps: `0` = SyncStep1 (state vector), `1` = SyncStep2 (diff),
//! `2` = Update (incremental change).
//!
//! Varints are unsigned LEB128: seven value bits per byte, least significant
//! group first, high bit set on every byte except the last.
//!
//! An awareness payload is itself a list of client states:
//! ```text
//! ┌──────────┬───────────┬──────────┬────────────────────┐
//! │ count    │ client id │ clock    │ state (JSON) ...   │
//! │ varint   │ varint    │ varint   │ varint len + utf-8 │
//! └──────────┴───────────┴──────────┴────────────────────┘
//! ```
//! The room relays these opaquely but reads the client ids, so it can
//! announce the removal of a departed session's clients.

use std::collections::BTreeMap;

use thiserror::Error;

/// JSON state announcing that an awareness client is gone.
const REMOVED_STATE: &[u8] = b"null";

/// Message kind tags (first varint of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Document synchronization (carries a [`SyncStep`])
    Sync = 0,
    /// Ephemeral presence payload
    Awareness = 1,
    /// Request for every presence state the server knows about
    QueryAwareness = 3,
}

impl MessageKind {
    fn from_tag(tag: u64) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            3 => Ok(Self::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// Sub-type of a [`MessageKind::Sync`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncStep {
    /// Sender announces its state vector and asks for what it is missing
    Step1 = 0,
    /// Reply to a Step1: the updates the requester is missing
    Step2 = 1,
    /// Incremental document change
    Update = 2,
}

impl SyncStep {
    fn from_tag(tag: u64) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Self::Step1),
            1 => Ok(Self::Step2),
            2 => Ok(Self::Update),
            other => Err(ProtocolError::UnknownSyncStep(other)),
        }
    }

    /// Whether applying this step changes the shared document.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Step1)
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncStep, Vec<u8>),
    Awareness(Vec<u8>),
    QueryAwareness,
}

impl Message {
    /// SyncStep1 carrying an encoded state vector.
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self::Sync(SyncStep::Step1, state_vector)
    }

    /// SyncStep2 carrying the diff a peer is missing.
    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Self::Sync(SyncStep::Step2, diff)
    }

    /// Incremental update.
    pub fn update(update: Vec<u8>) -> Self {
        Self::Sync(SyncStep::Update, update)
    }

    /// Presence payload, opaque to the server.
    pub fn awareness(payload: Vec<u8>) -> Self {
        Self::Awareness(payload)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sync(..) => MessageKind::Sync,
            Self::Awareness(_) => MessageKind::Awareness,
            Self::QueryAwareness => MessageKind::QueryAwareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        write_var(&mut out, self.kind() as u64);
        match self {
            Self::Sync(step, payload) => {
                write_var(&mut out, *step as u64);
                write_var_bytes(&mut out, payload);
            }
            Self::Awareness(payload) => write_var_bytes(&mut out, payload),
            Self::QueryAwareness => {}
        }
        out
    }

    /// Deserialize from the binary wire format.
    ///
    /// Bytes after a complete message are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut reader = Reader::new(bytes);
        match MessageKind::from_tag(reader.read_var()?)? {
            MessageKind::Sync => {
                let step = SyncStep::from_tag(reader.read_var()?)?;
                let payload = reader.read_var_bytes()?;
                Ok(Self::Sync(step, payload.to_vec()))
            }
            MessageKind::Awareness => Ok(Self::Awareness(reader.read_var_bytes()?.to_vec())),
            MessageKind::QueryAwareness => Ok(Self::QueryAwareness),
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Self::Sync(_, payload) | Self::Awareness(payload) => payload.len() + 12,
            Self::QueryAwareness => 1,
        }
    }
}

/// Protocol errors. Always recoverable: the offending frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("frame truncated")]
    Truncated,
    #[error("varint exceeds 64 bits")]
    VarIntOverflow,
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u64),
    #[error("unknown sync step {0}")]
    UnknownSyncStep(u64),
}

/// Append an unsigned LEB128 varint.
pub fn write_var(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Append a length-prefixed byte string.
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_var(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Client ids and clocks announced by an awareness payload.
pub fn awareness_clients(payload: &[u8]) -> Result<BTreeMap<u64, u64>, ProtocolError> {
    let mut reader = Reader::new(payload);
    let count = reader.read_var()?;
    let mut clients = BTreeMap::new();
    for _ in 0..count {
        let client = reader.read_var()?;
        let clock = reader.read_var()?;
        reader.read_var_bytes()?;
        clients.insert(client, clock);
    }
    Ok(clients)
}

/// Awareness payload marking every client in `clients` as removed.
pub fn awareness_removal(clients: &BTreeMap<u64, u64>) -> Vec<u8> {
    let mut out = Vec::new();
    write_var(&mut out, clients.len() as u64);
    for (&client, &clock) in clients {
        write_var(&mut out, client);
        write_var(&mut out, clock.saturating_add(1));
        write_var_bytes(&mut out, REMOVED_STATE);
    }
    out
}

/// Cursor over an inbound frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub(crate) fn read_var(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(ProtocolError::Truncated)?;
            self.pos += 1;
            let group = u64::from(byte & 0x7F);
            if shift >= 64 || (shift == 63 && group > 1) {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= group << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = usize::try_from(self.read_var()?).map_err(|_| ProtocolError::Truncated)?;
        let end = self.pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }
}
