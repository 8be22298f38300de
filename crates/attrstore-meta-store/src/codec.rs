//! Merge codec for both attribute overlays.
//!
//! Pure functions that turn (stored value, requested value) into the value to
//! persist. Nothing here touches shared state, so the stores can compute a
//! merge, submit the result and only then publish it.
//!
//! Flat update grammar:
//! - `%+N` / `%-N`: add a signed delta to the stored integer
//! - `%1X`: replace the first field of `field1#field2`
//! - `%2Y`: replace the second field
//! - anything else: overwrite

use attrstore_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Separator between the two fields of a composite flat value
pub const FIELD_SEPARATOR: char = '#';

/// Why a merge could not be computed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("field update requires an existing value")]
    MissingValue,
    #[error("invalid delta: {0:?}")]
    InvalidDelta(String),
    #[error("integer overflow applying delta {delta} to {old}")]
    Overflow { old: i64, delta: i64 },
    #[error("invalid size counters: {0:?}")]
    InvalidCounters(String),
}

// ---- Flat store ----

/// A parsed flat-store update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatUpdate<'a> {
    Delta(i64),
    Field1(&'a str),
    Field2(&'a str),
    Overwrite(&'a str),
}

impl<'a> FlatUpdate<'a> {
    pub fn parse(req: &'a str) -> std::result::Result<Self, MergeError> {
        if req.starts_with("%+") || req.starts_with("%-") {
            // Keep the sign: "+5" and "-3" both parse as i64
            let signed = &req[1..];
            return signed
                .parse::<i64>()
                .map(Self::Delta)
                .map_err(|_| MergeError::InvalidDelta(req.to_string()));
        }
        if let Some(field) = req.strip_prefix("%1") {
            return Ok(Self::Field1(field));
        }
        if let Some(field) = req.strip_prefix("%2") {
            return Ok(Self::Field2(field));
        }
        Ok(Self::Overwrite(req))
    }

    /// Whether the update needs the key to exist already
    #[must_use]
    pub const fn requires_existing(&self) -> bool {
        matches!(self, Self::Field1(_) | Self::Field2(_))
    }

    /// Compute the value to persist given the currently stored one.
    pub fn apply(&self, old: Option<&str>) -> std::result::Result<String, MergeError> {
        match *self {
            Self::Delta(delta) => {
                let old = old.map_or(0, parse_int_lenient);
                old.checked_add(delta)
                    .map(|v| v.to_string())
                    .ok_or(MergeError::Overflow { old, delta })
            }
            Self::Field1(field1) => {
                let (_, field2) = split_fields(old.ok_or(MergeError::MissingValue)?);
                Ok(format!("{field1}{FIELD_SEPARATOR}{field2}"))
            }
            Self::Field2(field2) => {
                let (field1, _) = split_fields(old.ok_or(MergeError::MissingValue)?);
                Ok(format!("{field1}{FIELD_SEPARATOR}{field2}"))
            }
            Self::Overwrite(value) => Ok(value.to_string()),
        }
    }
}

/// Compute the flat-store value for `req` against `old`.
pub fn merge_flat_value(old: Option<&str>, req: &str) -> std::result::Result<String, MergeError> {
    FlatUpdate::parse(req)?.apply(old)
}

/// Split `field1#field2` on the first separator. A value without separator
/// is all field1.
fn split_fields(value: &str) -> (&str, &str) {
    value.split_once(FIELD_SEPARATOR).unwrap_or((value, ""))
}

fn parse_int_lenient(value: &str) -> i64 {
    value.parse::<i64>().unwrap_or_else(|_| {
        warn!("Malformed integer value {:?}, treating as 0", value);
        0
    })
}

// ---- Size-accounting counters ----

/// Running `files,dirs,bytes` delta used for recursive directory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeCounters {
    pub files: i64,
    pub dirs: i64,
    pub bytes: i64,
}

impl SizeCounters {
    #[must_use]
    pub const fn new(files: i64, dirs: i64, bytes: i64) -> Self {
        Self { files, dirs, bytes }
    }

    /// Decode a stored triple; absent, empty or malformed values are zero.
    #[must_use]
    pub fn decode_lenient(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Self::default();
        };
        match std::str::from_utf8(raw) {
            Ok(text) => text.parse::<Self>().unwrap_or_else(|e| {
                warn!("Malformed size counters {:?} ({}), treating as 0,0,0", text, e);
                Self::default()
            }),
            Err(e) => {
                warn!("Size counters are not UTF-8 ({}), treating as 0,0,0", e);
                Self::default()
            }
        }
    }

    /// Component-wise sum, clamped at the `i64` bounds
    #[must_use]
    pub const fn merge(self, delta: Self) -> Self {
        Self {
            files: self.files.saturating_add(delta.files),
            dirs: self.dirs.saturating_add(delta.dirs),
            bytes: self.bytes.saturating_add(delta.bytes),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl FromStr for SizeCounters {
    type Err = MergeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || MergeError::InvalidCounters(s.to_string());
        let mut parts = s.split(',');
        let mut next = || -> std::result::Result<i64, MergeError> {
            parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())
        };
        let counters = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(counters)
    }
}

impl fmt::Display for SizeCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.files, self.dirs, self.bytes)
    }
}

// ---- Parent-link map ----

/// Per-inode hardlink bookkeeping: parent inode -> link count.
///
/// Stored as a JSON object with decimal-string keys, e.g. `{"12":2}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentLinks(BTreeMap<u64, i64>);

impl ParentLinks {
    /// Decode the stored map; absent, empty or malformed values are empty.
    #[must_use]
    pub fn decode_lenient(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Self::default();
        };
        serde_json::from_slice(raw).unwrap_or_else(|e| {
            warn!("Malformed parent link map ({}), treating as empty", e);
            Self::default()
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Add one link from `parent`. Counts saturate at `i64::MAX`.
    pub fn increment(&mut self, parent: u64) {
        let count = self.0.entry(parent).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Drop one link from `parent`. Returns false when there was none.
    pub fn decrement(&mut self, parent: u64) -> bool {
        let Some(count) = self.0.get_mut(&parent) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count <= 0 {
            self.0.remove(&parent);
        }
        true
    }

    #[must_use]
    pub fn count(&self, parent: u64) -> i64 {
        self.0.get(&parent).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, i64)> + '_ {
        self.0.iter().map(|(p, c)| (*p, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_updates() {
        assert_eq!(merge_flat_value(Some("10"), "%+5").unwrap(), "15");
        assert_eq!(merge_flat_value(Some("10"), "%-3").unwrap(), "7");
        assert_eq!(merge_flat_value(None, "%+4").unwrap(), "4");
        assert_eq!(merge_flat_value(None, "%-4").unwrap(), "-4");
        assert_eq!(merge_flat_value(Some("2"), "%-5").unwrap(), "-3");
    }

    #[test]
    fn test_delta_on_malformed_old_value() {
        assert_eq!(merge_flat_value(Some("abc"), "%+2").unwrap(), "2");
        assert_eq!(merge_flat_value(Some(""), "%-1").unwrap(), "-1");
    }

    #[test]
    fn test_invalid_delta() {
        assert!(matches!(
            merge_flat_value(Some("1"), "%+x"),
            Err(MergeError::InvalidDelta(_))
        ));
        assert!(matches!(
            merge_flat_value(Some("1"), "%+"),
            Err(MergeError::InvalidDelta(_))
        ));
        assert!(matches!(
            merge_flat_value(Some(i64::MAX.to_string().as_str()), "%+1"),
            Err(MergeError::Overflow { .. })
        ));
    }

    #[test]
    fn test_field_updates() {
        assert_eq!(merge_flat_value(Some("a#b"), "%1x").unwrap(), "x#b");
        assert_eq!(merge_flat_value(Some("a#b"), "%2y").unwrap(), "a#y");
        // Only the first separator splits
        assert_eq!(merge_flat_value(Some("a#b#c"), "%1x").unwrap(), "x#b#c");
        assert_eq!(merge_flat_value(Some("a#b#c"), "%2y").unwrap(), "a#y");
        // No separator: the old value is all field1
        assert_eq!(merge_flat_value(Some("plain"), "%1x").unwrap(), "x#");
        assert_eq!(merge_flat_value(Some("plain"), "%2y").unwrap(), "plain#y");
    }

    #[test]
    fn test_field_updates_require_existing() {
        assert_eq!(merge_flat_value(None, "%1x"), Err(MergeError::MissingValue));
        assert_eq!(merge_flat_value(None, "%2y"), Err(MergeError::MissingValue));
        assert!(FlatUpdate::parse("%1x").unwrap().requires_existing());
        assert!(!FlatUpdate::parse("%+1").unwrap().requires_existing());
    }

    #[test]
    fn test_overwrite() {
        assert_eq!(merge_flat_value(Some("old"), "new").unwrap(), "new");
        assert_eq!(merge_flat_value(None, "%3z").unwrap(), "%3z");
        assert_eq!(merge_flat_value(None, "").unwrap(), "");
    }

    #[test]
    fn test_size_counters_merge() {
        let stored = SizeCounters::decode_lenient(None)
            .merge(SizeCounters::new(1, 0, 100))
            .merge(SizeCounters::new(2, 1, 50));
        assert_eq!(stored, SizeCounters::new(3, 1, 150));
        assert_eq!(stored.encode(), b"3,1,150");
    }

    #[test]
    fn test_size_counters_merge_clamps() {
        let stored = SizeCounters::new(i64::MAX, i64::MIN, 5);
        let merged = stored.merge(SizeCounters::new(1, -1, -10));
        assert_eq!(merged, SizeCounters::new(i64::MAX, i64::MIN, -5));
    }

    #[test]
    fn test_size_counters_parse() {
        assert_eq!(
            "4,-1,2048".parse::<SizeCounters>().unwrap(),
            SizeCounters::new(4, -1, 2048)
        );
        assert!("1,2".parse::<SizeCounters>().is_err());
        assert!("1,2,3,4".parse::<SizeCounters>().is_err());
        assert!("1,x,3".parse::<SizeCounters>().is_err());
    }

    #[test]
    fn test_size_counters_lenient_decode() {
        assert_eq!(
            SizeCounters::decode_lenient(Some(b"garbage".as_slice())),
            SizeCounters::default()
        );
        assert_eq!(SizeCounters::decode_lenient(Some(b"".as_slice())), SizeCounters::default());
        assert_eq!(
            SizeCounters::decode_lenient(Some([0xff, 0xfe].as_slice())),
            SizeCounters::default()
        );
        assert_eq!(
            SizeCounters::decode_lenient(Some(b"1,2,3".as_slice())),
            SizeCounters::new(1, 2, 3)
        );
    }

    #[test]
    fn test_parent_links() {
        let mut links = ParentLinks::default();
        links.increment(7);
        links.increment(7);
        links.increment(9);
        assert!(links.decrement(7));
        assert_eq!(links.count(7), 1);

        assert!(links.decrement(7));
        assert_eq!(links.count(7), 0);
        assert_eq!(links.len(), 1);
        assert!(!links.decrement(7));
    }

    #[test]
    fn test_parent_links_extreme_counts() {
        let mut links: ParentLinks =
            serde_json::from_str(&format!("{{\"1\":{},\"2\":{}}}", i64::MAX, i64::MIN)).unwrap();
        links.increment(1);
        assert_eq!(links.count(1), i64::MAX);
        assert!(links.decrement(2));
        assert_eq!(links.count(2), 0);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_parent_links_encoding() {
        let mut links = ParentLinks::default();
        links.increment(12);
        links.increment(12);
        links.increment(3);
        let encoded = links.encode().unwrap();
        assert_eq!(encoded, br#"{"3":1,"12":2}"#.to_vec());
        assert_eq!(ParentLinks::decode_lenient(Some(encoded.as_slice())), links);
    }

    #[test]
    fn test_parent_links_lenient_decode() {
        assert!(ParentLinks::decode_lenient(None).is_empty());
        assert!(ParentLinks::decode_lenient(Some(b"".as_slice())).is_empty());
        assert!(ParentLinks::decode_lenient(Some(b"{not json".as_slice())).is_empty());
    }
}
