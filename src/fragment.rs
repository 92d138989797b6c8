// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Fragment model (component A, §3, §4.A).
//!
//! A fragment is one atomic unit of a mutation stream: `partition_start`,
//! `static_row`, `clustering_row`, `range_tombstone` or `partition_end`.
//! Every fragment carries a [`PositionInPartition`]; the total order over
//! fragments is `position_in_partition` then [`kind tie-break`](Fragment::kind_rank),
//! exactly as specified in §4.A. Partition order itself
//! (`partition_order(decorated_key)`) lives one level up, at the granularity
//! of whole partitions, and is handled by [`crate::key::DecoratedKey`]'s
//! `Ord` impl plus the merge engine.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::{key::DecoratedKey, schema::Schema};

pub type Timestamp = i64;
pub type DeletionTime = i64;

/// `(timestamp, deletion_time)`. Shadows any write with a lower-or-equal
/// `write_timestamp` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub timestamp: Timestamp,
    pub deletion_time: DeletionTime,
}

impl Tombstone {
    pub const LIVE: Tombstone = Tombstone {
        timestamp: Timestamp::MIN,
        deletion_time: DeletionTime::MIN,
    };

    pub fn is_live(&self) -> bool {
        *self == Self::LIVE
    }

    /// Whether `self` shadows a write stamped at `write_timestamp`: a
    /// tombstone with timestamp >= the cell's wins over it (§3).
    pub fn covers(&self, write_timestamp: Timestamp) -> bool {
        self.timestamp >= write_timestamp
    }
}

impl PartialOrd for Tombstone {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lexicographic `(timestamp, deletion_time)`; two tombstones with equal
/// timestamp break ties by the greater `deletion_time` (§9 Open Question,
/// resolved here deterministically).
impl Ord for Tombstone {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.deletion_time.cmp(&other.deletion_time))
    }
}

/// Byte-comparable clustering key. Ordering among clustering keys is
/// schema-dependent (§3); use [`Schema::compare_clustering`] rather than
/// `Ord` to compare two of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusteringKey(pub Bytes);

impl ClusteringKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        ClusteringKey(bytes.into())
    }
}

/// Position of a fragment within its partition (§3). Clustering keys are
/// wrapped by `Before`/`At`/`After` sentinels so ranges and tombstone bounds
/// can point strictly between two rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionInPartition {
    BeforeAllClusteredRows,
    Before(ClusteringKey),
    At(ClusteringKey),
    After(ClusteringKey),
    AfterAllClusteredRows,
}

impl PositionInPartition {
    fn rank(&self) -> u8 {
        match self {
            PositionInPartition::BeforeAllClusteredRows => 0,
            PositionInPartition::Before(_) => 1,
            PositionInPartition::At(_) => 2,
            PositionInPartition::After(_) => 3,
            PositionInPartition::AfterAllClusteredRows => 4,
        }
    }

    fn clustering_key(&self) -> Option<&ClusteringKey> {
        match self {
            PositionInPartition::Before(k)
            | PositionInPartition::At(k)
            | PositionInPartition::After(k) => Some(k),
            _ => None,
        }
    }

    /// Schema-dependent total order (§3: "Comparators are schema-dependent").
    pub fn compare(&self, other: &Self, schema: &Schema) -> Ordering {
        match (self.clustering_key(), other.clustering_key()) {
            (Some(a), Some(b)) => schema
                .compare_clustering(&a.0, &b.0)
                .then_with(|| self.rank().cmp(&other.rank())),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// `(value, write_timestamp[, ttl, deletion_time])` (§3). `column_id`
/// identifies which column this cell belongs to within a row; cell-wise
/// reconciliation (§4.D) operates per `column_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column_id: u32,
    pub value: Bytes,
    pub write_timestamp: Timestamp,
    pub ttl_seconds: Option<u32>,
    pub deletion_time: Option<DeletionTime>,
}

impl Cell {
    pub fn live(column_id: u32, value: impl Into<Bytes>, write_timestamp: Timestamp) -> Self {
        Cell {
            column_id,
            value: value.into(),
            write_timestamp,
            ttl_seconds: None,
            deletion_time: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deletion_time.is_some()
    }
}

/// Picks the surviving cell of two versions of the same column: greater
/// `write_timestamp` wins; ties are broken by value bytes comparison (§3).
pub fn reconcile_cell(a: Cell, b: Cell) -> Cell {
    match a.write_timestamp.cmp(&b.write_timestamp) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal => {
            if a.value >= b.value {
                a
            } else {
                b
            }
        }
    }
}

/// Merges two cell vectors for the same row by `column_id`, keeping at most
/// one winning cell per column (§3, §4.D "cell-wise reconciliation").
pub fn reconcile_row(mut a: Vec<Cell>, b: Vec<Cell>) -> Vec<Cell> {
    for cell in b {
        if let Some(existing) = a.iter().position(|c| c.column_id == cell.column_id) {
            let winner = reconcile_cell(a.remove(existing), cell);
            a.push(winner);
        } else {
            a.push(cell);
        }
    }
    a.sort_by_key(|c| c.column_id);
    a
}

/// Half-open `[start, end)` range of positions within a single partition.
/// Used both by [`crate::slice::Slice`] and by the position fast-forward
/// contract (§4.B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRange {
    pub start: PositionInPartition,
    pub end: PositionInPartition,
}

impl PositionRange {
    pub fn new(start: PositionInPartition, end: PositionInPartition) -> Self {
        PositionRange { start, end }
    }

    pub fn all() -> Self {
        PositionRange {
            start: PositionInPartition::BeforeAllClusteredRows,
            end: PositionInPartition::AfterAllClusteredRows,
        }
    }

    pub fn contains(&self, position: &PositionInPartition, schema: &Schema) -> bool {
        self.start.compare(position, schema) != Ordering::Greater
            && position.compare(&self.end, schema) == Ordering::Less
    }
}

/// Tie-break among fragments sharing a position: `range_tombstone_start <
/// static_row < clustering_row < range_tombstone_end` (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KindTieBreak {
    RangeTombstoneStart,
    StaticRow,
    ClusteringRow,
    RangeTombstoneEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    PartitionStart {
        key: DecoratedKey,
        partition_tombstone: Tombstone,
    },
    StaticRow {
        cells: Vec<Cell>,
    },
    ClusteringRow {
        key: ClusteringKey,
        cells: Vec<Cell>,
    },
    RangeTombstone {
        start: PositionInPartition,
        end: PositionInPartition,
        tombstone: Tombstone,
    },
    PartitionEnd,
}

impl Fragment {
    /// The fragment's `position_in_partition` (§3: partition_start and
    /// partition_end carry sentinel positions).
    pub fn position(&self) -> PositionInPartition {
        match self {
            Fragment::PartitionStart { .. } | Fragment::StaticRow { .. } => {
                PositionInPartition::BeforeAllClusteredRows
            }
            Fragment::ClusteringRow { key, .. } => PositionInPartition::At(key.clone()),
            Fragment::RangeTombstone { start, .. } => start.clone(),
            Fragment::PartitionEnd => PositionInPartition::AfterAllClusteredRows,
        }
    }

    /// `None` for `partition_start`/`partition_end`, which aren't compared
    /// via the in-partition kind tie-break.
    pub fn kind_rank(&self) -> Option<KindTieBreak> {
        match self {
            Fragment::PartitionStart { .. } | Fragment::PartitionEnd => None,
            Fragment::StaticRow { .. } => Some(KindTieBreak::StaticRow),
            Fragment::ClusteringRow { .. } => Some(KindTieBreak::ClusteringRow),
            Fragment::RangeTombstone { .. } => Some(KindTieBreak::RangeTombstoneStart),
        }
    }

    /// Total order within a single partition: position then kind tie-break
    /// (§4.A).
    pub fn compare_in_partition(&self, other: &Self, schema: &Schema) -> Ordering {
        self.position()
            .compare(&other.position(), schema)
            .then_with(|| self.kind_rank().cmp(&other.kind_rank()))
    }

    pub fn is_partition_end(&self) -> bool {
        matches!(self, Fragment::PartitionEnd)
    }

    pub fn is_partition_start(&self) -> bool {
        matches!(self, Fragment::PartitionStart { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::byte_ordered("test")
    }

    #[test]
    fn tombstone_ties_broken_by_deletion_time() {
        let a = Tombstone { timestamp: 5, deletion_time: 1 };
        let b = Tombstone { timestamp: 5, deletion_time: 2 };
        assert!(b > a);
    }

    #[test]
    fn reconcile_cell_picks_greater_timestamp() {
        let a = Cell::live(0, "v1", 1);
        let b = Cell::live(0, "v2", 2);
        let winner = reconcile_cell(a, b);
        assert_eq!(winner.write_timestamp, 2);
        assert_eq!(&winner.value[..], b"v2");
    }

    #[test]
    fn reconcile_cell_ties_broken_by_value_bytes() {
        let a = Cell::live(0, "a", 1);
        let b = Cell::live(0, "b", 1);
        assert_eq!(&reconcile_cell(a, b).value[..], b"b");
    }

    #[test]
    fn kind_tiebreak_orders_tombstone_start_before_static_before_clustering_before_tombstone_end() {
        assert!(KindTieBreak::RangeTombstoneStart < KindTieBreak::StaticRow);
        assert!(KindTieBreak::StaticRow < KindTieBreak::ClusteringRow);
        assert!(KindTieBreak::ClusteringRow < KindTieBreak::RangeTombstoneEnd);
    }

    #[test]
    fn static_row_sorts_before_clustering_row_at_same_position() {
        let s = schema();
        let static_row = Fragment::StaticRow { cells: vec![] };
        let clustering = Fragment::ClusteringRow {
            key: ClusteringKey::new(Bytes::new()),
            cells: vec![],
        };
        // Both at BeforeAllClusteredRows-equivalent/At(empty); the static row's
        // sentinel position always sorts before any concrete clustering key.
        assert_eq!(
            static_row.position().compare(&clustering.position(), &s),
            Ordering::Less
        );
    }
}
