// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! 64-bit entity keys
//!
//! Every persisted entity is identified by a [`Key`] minted by the key
//! generator.  The bit layout is
//!
//! ```text
//! [sign:1][reserved:4][data_center:6][worker:7][sequence:46]
//! ```
//!
//! so keys minted by distinct `(data_center, worker)` pairs can never collide
//! and every key fits in a SQL `BIGINT` without touching the sign bit.

use crate::api::external::Error;
use crate::api::external::ResourceType;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Number of bits holding the per-triple sequence value.
pub const SEQUENCE_BITS: u32 = 46;
/// Number of bits holding the worker id.
pub const WORKER_BITS: u32 = 7;
/// Number of bits holding the data center id.
pub const DATA_CENTER_BITS: u32 = 6;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;
const DATA_CENTER_MASK: u64 = (1 << DATA_CENTER_BITS) - 1;

/// Largest sequence value that can be packed into a key.
pub const MAX_SEQUENCE: u64 = SEQUENCE_MASK;

/// A 64-bit entity key
///
/// The wire form is the unsigned decimal rendering, with no prefix.  The zero
/// key is reserved to mean "unset".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Key(u64);

impl Key {
    /// The reserved "unset" key.
    pub const UNSET: Key = Key(0);

    pub const fn new(value: u64) -> Key {
        Key(value)
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the key in the form stored in `BIGINT` columns.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    /// Builds a key from its `BIGINT` column value.
    pub fn from_i64(value: i64) -> Key {
        Key(value as u64)
    }

    /// The origin (data center and worker) that minted this key.
    pub fn origin(&self) -> KeyOrigin {
        KeyOrigin {
            data_center: ((self.0 >> (SEQUENCE_BITS + WORKER_BITS))
                & DATA_CENTER_MASK) as u8,
            worker: ((self.0 >> SEQUENCE_BITS) & WORKER_MASK) as u8,
        }
    }

    /// The sequence value this key was minted from.
    pub fn sequence(&self) -> u64 {
        self.0 & SEQUENCE_MASK
    }

    /// Parses a key from its wire form, reporting a malformed string as a
    /// missing object of type `type_name`.
    pub fn parse_for(type_name: ResourceType, s: &str) -> Result<Key, Error> {
        s.parse::<Key>()
            .map_err(|_| Error::not_found_by_name(type_name, s))
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Key(value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for Key {
    type Error = KeyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a key string is not an unsigned decimal number
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed key {0:?}")]
pub struct KeyParseError(String);

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // u64::from_str accepts a leading '+' and leading zeros, neither of
        // which is part of the wire form.
        if s.is_empty()
            || !s.bytes().all(|b| b.is_ascii_digit())
            || (s.len() > 1 && s.starts_with('0'))
        {
            return Err(KeyParseError(s.to_owned()));
        }
        s.parse::<u64>().map(Key).map_err(|_| KeyParseError(s.to_owned()))
    }
}

/// Error returned when a data center or worker id does not fit in a key
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyOriginError {
    #[error("data center id {0} does not fit in {DATA_CENTER_BITS} bits")]
    DataCenter(u32),
    #[error("worker id {0} does not fit in {WORKER_BITS} bits")]
    Worker(u32),
}

/// The `(data_center, worker)` pair that mints a family of keys
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KeyOrigin {
    data_center: u8,
    worker: u8,
}

impl KeyOrigin {
    pub fn new(data_center: u32, worker: u32) -> Result<Self, KeyOriginError> {
        if u64::from(data_center) > DATA_CENTER_MASK {
            return Err(KeyOriginError::DataCenter(data_center));
        }
        if u64::from(worker) > WORKER_MASK {
            return Err(KeyOriginError::Worker(worker));
        }
        Ok(KeyOrigin { data_center: data_center as u8, worker: worker as u8 })
    }

    pub fn data_center(&self) -> u8 {
        self.data_center
    }

    pub fn worker(&self) -> u8 {
        self.worker
    }

    /// Packs `sequence` into a key minted by this origin.
    ///
    /// Sequence values wider than [`SEQUENCE_BITS`] are truncated; the key
    /// generator never hands out such values.
    pub fn pack(&self, sequence: u64) -> Key {
        Key((u64::from(self.data_center) << (SEQUENCE_BITS + WORKER_BITS))
            | (u64::from(self.worker) << SEQUENCE_BITS)
            | (sequence & SEQUENCE_MASK))
    }
}

/// Kinds of entities that are keyed through the key generator
///
/// Each kind has its own sequence per origin.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum KeyKind {
    User,
    Team,
    Collection,
    Device,
    Output,
    Firmware,
    Message,
}

impl KeyKind {
    pub const ALL: [KeyKind; 7] = [
        KeyKind::User,
        KeyKind::Team,
        KeyKind::Collection,
        KeyKind::Device,
        KeyKind::Output,
        KeyKind::Firmware,
        KeyKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::User => "user",
            KeyKind::Team => "team",
            KeyKind::Collection => "collection",
            KeyKind::Device => "device",
            KeyKind::Output => "output",
            KeyKind::Firmware => "firmware",
            KeyKind::Message => "message",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the sequence row backing keys of `kind` minted by `origin`.
pub fn sequence_name(kind: &str, origin: &KeyOrigin) -> String {
    format!("{}/{}/{}", kind, origin.data_center, origin.worker)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_pack_unpack() {
        let origin = KeyOrigin::new(63, 127).unwrap();
        let key = origin.pack(MAX_SEQUENCE);
        assert_eq!(key.origin(), origin);
        assert_eq!(key.sequence(), MAX_SEQUENCE);
        // The sign bit and the reserved bits stay clear.
        assert!(key.as_i64() > 0);
        assert_eq!(key.as_u64() >> 59, 0);

        let a = KeyOrigin::new(1, 1).unwrap().pack(1);
        let b = KeyOrigin::new(2, 1).unwrap().pack(1);
        let c = KeyOrigin::new(1, 2).unwrap().pack(1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_origin_bounds() {
        assert_matches!(
            KeyOrigin::new(64, 0),
            Err(KeyOriginError::DataCenter(64))
        );
        assert_matches!(KeyOrigin::new(0, 128), Err(KeyOriginError::Worker(128)));
        assert!(KeyOrigin::new(0, 0).is_ok());
    }

    #[test]
    fn test_wire_form() {
        let key = KeyOrigin::new(3, 9).unwrap().pack(42);
        let s = key.to_string();
        assert_eq!(s.parse::<Key>().unwrap(), key);
        assert_eq!(
            serde_json::to_string(&key).unwrap(),
            format!("\"{}\"", s)
        );

        for bad in
            ["", "+1", "-1", "0x10", "1 ", "007", "00", "18446744073709551616"]
        {
            assert!(bad.parse::<Key>().is_err(), "{bad:?} parsed");
        }
        assert_eq!("0".parse::<Key>().unwrap(), Key::UNSET);
        assert_matches!(
            Key::parse_for(ResourceType::Device, "nope"),
            Err(Error::ObjectNotFound { type_name: ResourceType::Device, .. })
        );
        assert!(Key::UNSET.is_unset());
        assert!(!key.is_unset());
    }

    #[test]
    fn test_sequence_name() {
        let origin = KeyOrigin::new(2, 1).unwrap();
        assert_eq!(sequence_name(KeyKind::Device.as_str(), &origin), "device/2/1");
    }
}
