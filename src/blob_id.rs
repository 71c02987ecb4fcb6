//! Object identifiers.
//!
//! A [`BlobId`] is the 12-byte identifier both stores key objects by:
//! a 4-byte big-endian creation timestamp (Unix seconds), a 5-byte
//! per-process random value and a 3-byte big-endian counter. Byte order,
//! numeric order and the order of the canonical 24-character lowercase hex
//! string all coincide, which is what lets the filesystem mirror sort by
//! filename and still agree with the grid's ordered queries.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Raw identifier length in bytes.
pub const BLOB_ID_LEN: usize = 12;

/// Length of the canonical hex representation.
pub const BLOB_ID_HEX_LEN: usize = BLOB_ID_LEN * 2;

const COUNTER_MASK: u32 = 0x00FF_FFFF;

static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId([u8; BLOB_ID_LEN]);

impl BlobId {
    /// Generate a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Generate a fresh identifier stamped with `created`.
    ///
    /// Identifiers generated by one process for the same second are strictly
    /// increasing until the 24-bit counter wraps.
    pub fn generate_at(created: DateTime<Utc>) -> Self {
        let unique = PROCESS_UNIQUE.get_or_init(|| {
            let mut bytes = [0u8; 5];
            rand::thread_rng().fill(&mut bytes);
            bytes
        });
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        let secs = created.timestamp().clamp(0, u32::MAX as i64) as u32;
        Self::from_parts(secs, *unique, counter)
    }

    /// Assemble an identifier from its three components.
    pub fn from_parts(timestamp_secs: u32, unique: [u8; 5], counter: u32) -> Self {
        let mut bytes = [0u8; BLOB_ID_LEN];
        bytes[..4].copy_from_slice(&timestamp_secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&unique);
        bytes[9..].copy_from_slice(&(counter & COUNTER_MASK).to_be_bytes()[1..]);
        Self(bytes)
    }

    /// The smallest identifier that can carry the given timestamp.
    pub fn from_timestamp(timestamp_secs: u32) -> Self {
        Self::from_parts(timestamp_secs, [0; 5], 0)
    }

    /// Parse the canonical hex form. Upper-case hex digits are accepted;
    /// anything else fails with [`SyncError::InvalidIdentifier`].
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        if s.len() != BLOB_ID_HEX_LEN {
            return Err(SyncError::InvalidIdentifier(s.to_string()));
        }
        let mut bytes = [0u8; BLOB_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| SyncError::InvalidIdentifier(s.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; BLOB_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Creation time embedded in the identifier.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp_secs() as i64, 0)
            .single()
            .unwrap_or_default()
    }

    /// Whether the object was created within `window` of `now`.
    ///
    /// The window is inclusive: an identifier exactly `window` old is still
    /// recent. Recent objects may still be mid-write at the grid and are
    /// never counted, iterated or transferred.
    pub fn is_recent(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let age_ms = now.timestamp_millis() - (self.timestamp_secs() as i64) * 1000;
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        age_ms <= window_ms
    }

    /// The two shard directory names: characters 0..2 and 2..4 of the hex form.
    pub fn shard_path(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..4].to_string())
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl FromStr for BlobId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlobId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.to_hex()
    }
}
