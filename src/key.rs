// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Partition keys, tokens and ring positions (§3 "Keys").
//!
//! A partitioner maps a partition key to an opaque, totally ordered `Token`.
//! A `DecoratedKey` pairs the two and orders lexicographically on
//! `(token, key)`. `RingPosition` extends decorated keys with two sentinels
//! per token so half-open partition ranges can be expressed without a
//! separate "infinity" type.

use std::cmp::Ordering;

use bytes::Bytes;

/// Monotonic identifier used purely for diagnostics/logging correlation --
/// never for ordering fragments or partitions (that's `position_in_partition`
/// and `DecoratedKey`'s `Ord` impl). Mirrors `common_types::SequenceNumber` as
/// consumed by `FileMeta::max_sequence` in the teacher's `sst::file`.
pub type SequenceNumber = u64;

/// Opaque, totally ordered output of a partitioner. Compared byte-wise; the
/// partitioner is the only thing that needs to know how tokens are derived.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(Bytes);

impl Token {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Token(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Smallest possible token, used as the lower sentinel of the whole ring.
    pub fn min_value() -> Self {
        Token(Bytes::new())
    }
}

/// Partition key paired with its token; orders lexicographically on
/// `(token, key)` per §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Bytes,
}

impl DecoratedKey {
    pub fn new(token: Token, key: impl Into<Bytes>) -> Self {
        DecoratedKey {
            token,
            key: key.into(),
        }
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// A decorated key extended with the two ring sentinels needed to express
/// half-open partition ranges: "before this token" and "after this token".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingPosition {
    /// Sentinel sorting just before every decorated key sharing `token`.
    BeforeToken(Token),
    Key(DecoratedKey),
    /// Sentinel sorting just after every decorated key sharing `token`.
    AfterToken(Token),
}

impl RingPosition {
    pub fn token(&self) -> &Token {
        match self {
            RingPosition::BeforeToken(t) | RingPosition::AfterToken(t) => t,
            RingPosition::Key(k) => &k.token,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            RingPosition::BeforeToken(_) => 0,
            RingPosition::Key(_) => 1,
            RingPosition::AfterToken(_) => 2,
        }
    }

    pub fn min() -> Self {
        RingPosition::BeforeToken(Token::min_value())
    }
}

impl PartialOrd for RingPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RingPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token().cmp(other.token()).then_with(|| {
            match (self, other) {
                (RingPosition::Key(a), RingPosition::Key(b)) => a.key.cmp(&b.key),
                _ => self.rank().cmp(&other.rank()),
            }
        })
    }
}

/// Half-open `[start, end)` range of ring positions, used both as a query's
/// partition range and as the unit a selector/combined reader fast-forwards
/// across.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: RingPosition,
    pub end: RingPosition,
}

impl PartitionRange {
    pub fn new(start: RingPosition, end: RingPosition) -> Self {
        PartitionRange { start, end }
    }

    /// `[start, +inf)`.
    pub fn from_start(start: RingPosition) -> Self {
        PartitionRange {
            start,
            end: RingPosition::AfterToken(Token::new(vec![0xffu8; 32])),
        }
    }

    pub fn full() -> Self {
        PartitionRange {
            start: RingPosition::min(),
            end: RingPosition::AfterToken(Token::new(vec![0xffu8; 32])),
        }
    }

    pub fn contains(&self, key: &DecoratedKey) -> bool {
        let pos = RingPosition::Key(key.clone());
        self.start <= pos && pos < self.end
    }

    /// Whether any position could fall in both `self` and `other` -- used by
    /// the selector to decide which pending readers still matter.
    pub fn intersects(&self, other: &PartitionRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(b: u8) -> Token {
        Token::new(vec![b])
    }

    fn dk(b: u8, key: &str) -> DecoratedKey {
        DecoratedKey::new(tok(b), Bytes::from(key.to_owned()))
    }

    #[test]
    fn decorated_key_orders_by_token_then_key() {
        assert!(dk(1, "zzz") < dk(2, "aaa"));
        assert!(dk(1, "aaa") < dk(1, "bbb"));
    }

    #[test]
    fn ring_position_sentinels_bracket_keys_of_same_token() {
        let before = RingPosition::BeforeToken(tok(5));
        let key = RingPosition::Key(dk(5, "x"));
        let after = RingPosition::AfterToken(tok(5));
        assert!(before < key);
        assert!(key < after);
    }

    #[test]
    fn partition_range_contains_respects_half_open_bound() {
        let range = PartitionRange::new(
            RingPosition::Key(dk(1, "a")),
            RingPosition::Key(dk(3, "a")),
        );
        assert!(range.contains(&dk(1, "a")));
        assert!(range.contains(&dk(2, "m")));
        assert!(!range.contains(&dk(3, "a")));
    }

    #[test]
    fn intersects_is_symmetric() {
        let a = PartitionRange::new(RingPosition::Key(dk(1, "a")), RingPosition::Key(dk(5, "a")));
        let b = PartitionRange::new(RingPosition::Key(dk(4, "a")), RingPosition::Key(dk(9, "a")));
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }
}
