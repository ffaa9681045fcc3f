//! WAL record types and serialization.

use crate::codec::{compute_crc32, decode_body, encode_body};
use crate::error::{TabletError, TabletResult};
use crate::row::RowOp;
use crate::types::{DmsId, MrsId, RowSetId, Timestamp};
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"TWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// One applied write batch.
    Batch = 1,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Batch),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The store a logged operation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpTarget {
    /// A mutable store generation.
    Mrs(MrsId),
    /// The DMS generation of a disk row set.
    Drs {
        /// Row set id.
        rowset: RowSetId,
        /// DMS generation.
        dms: DmsId,
    },
    /// The operation succeeded without changing anything.
    NoEffect,
}

/// A successful operation and where it landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOp {
    /// The operation as submitted.
    pub op: RowOp,
    /// The store it changed.
    pub target: OpTarget,
}

/// One write batch as logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalBatch {
    /// The batch timestamp.
    pub ts: Timestamp,
    /// Successful operations in application order.
    pub ops: Vec<LoggedOp>,
}

impl WalBatch {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        WalRecordType::Batch
    }

    /// Serializes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload cannot be encoded or exceeds
    /// 4 GiB.
    pub fn encode(&self) -> TabletResult<Vec<u8>> {
        let payload = encode_body(self)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| TabletError::codec("WAL record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Deserializes a payload of the given type.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload is malformed.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> TabletResult<Self> {
        match record_type {
            WalRecordType::Batch => decode_body(payload),
        }
    }
}
