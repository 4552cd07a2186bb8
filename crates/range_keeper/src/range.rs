//! Chunk range arithmetic and the versioned chunk-ownership descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

/// Shard key field names, in index order.
///
/// A shard key is served by any index whose key pattern it prefixes; the
/// deletion path uses this to resolve the index that backs orphan scans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern(Vec<String>);

impl KeyPattern {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        assert!(!fields.is_empty(), "key pattern must name at least one field");
        Self(fields)
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// True when `self`'s fields are a leading prefix of `other`'s.
    pub fn is_prefix_of(&self, other: &KeyPattern) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.join(", "))
    }
}

/// Totally ordered chunk placement version assigned by the routing authority.
///
/// Major increments on chunk moves between shards, minor on splits within a
/// shard. Comparison is lexicographic on `(major, minor)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    /// Placeholder version for chunks whose placement version is irrelevant,
    /// e.g. entries in the receiving-chunks map.
    pub const IGNORED: ChunkVersion = ChunkVersion { major: 0, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}

/// Half-open key interval `[min, max)` in shard-key order.
///
/// Keys are order-preserving encodings of the shard key, so bytewise
/// comparison of the encoded form matches the shard key's comparator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    min: Vec<u8>,
    max: Vec<u8>,
}

impl ChunkRange {
    pub fn new(min: impl Into<Vec<u8>>, max: impl Into<Vec<u8>>) -> Self {
        let (min, max) = (min.into(), max.into());
        assert!(min < max, "chunk range min must sort below max");
        Self { min, max }
    }

    pub fn min(&self) -> &[u8] {
        &self.min
    }

    pub fn max(&self) -> &[u8] {
        &self.max
    }

    /// Two half-open intervals intersect.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.min.as_slice() <= key && key < self.max.as_slice()
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.min.escape_ascii(),
            self.max.escape_ascii()
        )
    }
}

/// One owned chunk within a snapshot, keyed in the owner map by its min key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub max: Vec<u8>,
    pub version: ChunkVersion,
}

/// Versioned, immutable description of the chunks this node owns, supplied
/// by the remote routing authority. Snapshots are only ever replaced, never
/// mutated; readers hold them through scoped metadata handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipSnapshot {
    version: ChunkVersion,
    shard_key: KeyPattern,
    chunks: BTreeMap<Vec<u8>, ChunkInfo>,
}

impl OwnershipSnapshot {
    pub fn new(
        version: ChunkVersion,
        shard_key: KeyPattern,
        chunks: impl IntoIterator<Item = (ChunkRange, ChunkVersion)>,
    ) -> Self {
        let chunks = chunks
            .into_iter()
            .map(|(range, version)| {
                let ChunkRange { min, max } = range;
                (min, ChunkInfo { max, version })
            })
            .collect();
        Self {
            version,
            shard_key,
            chunks,
        }
    }

    /// Convenience constructor when per-chunk versions don't matter.
    pub fn from_ranges(
        version: ChunkVersion,
        shard_key: KeyPattern,
        ranges: impl IntoIterator<Item = ChunkRange>,
    ) -> Self {
        Self::new(
            version,
            shard_key,
            ranges.into_iter().map(|r| (r, ChunkVersion::IGNORED)),
        )
    }

    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    pub fn shard_key(&self) -> &KeyPattern {
        &self.shard_key
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Does `range` intersect any chunk owned in this snapshot?
    ///
    /// Owned chunks are disjoint and sorted, so only the chunk with the
    /// greatest min below `range.max` can intersect.
    pub fn range_overlaps_chunk(&self, range: &ChunkRange) -> bool {
        let below_max = (Bound::Unbounded, Bound::Excluded(range.max()));
        match self.chunks.range::<[u8], _>(below_max).next_back() {
            Some((_, info)) => info.max.as_slice() > range.min(),
            None => false,
        }
    }

    pub fn chunk_ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        self.chunks.iter().map(|(min, info)| ChunkRange {
            min: min.clone(),
            max: info.max.clone(),
        })
    }
}

impl fmt::Display for OwnershipSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {}, {} chunk(s)",
            self.version,
            self.chunks.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: &str, max: &str) -> ChunkRange {
        ChunkRange::new(min.as_bytes().to_vec(), max.as_bytes().to_vec())
    }

    #[test]
    fn half_open_overlap() {
        assert!(range("a", "f").overlaps(&range("e", "k")));
        assert!(range("e", "k").overlaps(&range("a", "f")));
        assert!(range("a", "k").overlaps(&range("c", "d")));
        // Touching endpoints do not intersect.
        assert!(!range("a", "f").overlaps(&range("f", "k")));
        assert!(!range("f", "k").overlaps(&range("a", "f")));
    }

    #[test]
    fn bound_accessors_resolve_on_owned_ranges() {
        // min/max must stay the inherent accessors; an ordering trait in
        // scope would shadow them on a by-value receiver.
        let owned = range("a", "b");
        assert_eq!(owned.min(), b"a");
        assert_eq!(owned.max(), b"b");
    }

    #[test]
    fn contains_is_inclusive_min_exclusive_max() {
        let r = range("b", "d");
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"c"));
        assert!(!r.contains_key(b"d"));
        assert!(!r.contains_key(b"a"));
    }

    #[test]
    #[should_panic(expected = "min must sort below max")]
    fn empty_range_is_rejected() {
        let _ = range("m", "m");
    }

    #[test]
    fn key_pattern_prefix() {
        let shard_key = KeyPattern::new(["user_id"]);
        let index = KeyPattern::new(["user_id", "created_at"]);
        assert!(shard_key.is_prefix_of(&index));
        assert!(shard_key.is_prefix_of(&shard_key));
        assert!(!index.is_prefix_of(&shard_key));
        assert!(!KeyPattern::new(["other"]).is_prefix_of(&index));
    }

    #[test]
    fn snapshot_overlap_lookup() {
        let snap = OwnershipSnapshot::from_ranges(
            ChunkVersion::new(1, 0),
            KeyPattern::new(["k"]),
            [range("b", "d"), range("f", "h")],
        );
        assert!(snap.range_overlaps_chunk(&range("a", "c")));
        assert!(snap.range_overlaps_chunk(&range("c", "d")));
        assert!(snap.range_overlaps_chunk(&range("g", "z")));
        // Falls entirely in the gap between owned chunks.
        assert!(!snap.range_overlaps_chunk(&range("d", "f")));
        assert!(!snap.range_overlaps_chunk(&range("h", "z")));
        assert!(!snap.range_overlaps_chunk(&range("a", "b")));
    }

    #[test]
    fn version_ordering() {
        assert!(ChunkVersion::new(2, 0) > ChunkVersion::new(1, 9));
        assert!(ChunkVersion::new(1, 3) > ChunkVersion::new(1, 2));
        assert_eq!(ChunkVersion::new(1, 2), ChunkVersion::new(1, 2));
    }
}
