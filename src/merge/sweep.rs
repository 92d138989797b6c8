// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Range-tombstone sweep line used by the within-partition merge (§4.D).
//!
//! Individual sources hand the merge engine whole `range_tombstone(start,
//! end, tombstone)` fragments, but §4.A's total order treats each one as
//! contributing two events: its start bound (sorts just before a
//! `static_row`/`clustering_row` at the same position) and its end bound
//! (sorts after everything else at that position). [`TombstoneSweep`] tracks
//! the currently-open tombstones across every active reader and flushes a
//! single covering fragment whenever the active set changes, exactly the
//! "maintain an active tombstone set ordered by end position" description.

use std::cmp::Ordering;

use crate::{
    fragment::{Fragment, PositionInPartition, Tombstone},
    schema::Schema,
};

/// One tombstone interval still open at the current sweep position.
struct Open {
    end: PositionInPartition,
    tombstone: Tombstone,
}

/// Accumulates overlapping range-tombstone intervals within one partition
/// and emits the minimal set of non-overlapping, maximal-tombstone fragments
/// that cover them (§3, §4.D).
pub struct TombstoneSweep {
    open: Vec<Open>,
    last_flush: PositionInPartition,
}

impl TombstoneSweep {
    pub fn new() -> Self {
        TombstoneSweep {
            open: Vec::new(),
            last_flush: PositionInPartition::BeforeAllClusteredRows,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.open.is_empty()
    }

    /// The dominant tombstone covering the sweep's current position, if any
    /// interval is open (greatest by `(timestamp, deletion_time)`, §9).
    pub fn dominant(&self) -> Option<Tombstone> {
        self.open.iter().map(|o| o.tombstone).max()
    }

    /// The earliest end bound among open intervals, used to decide whether
    /// the next boundary event is a real fragment head or an implicit
    /// tombstone expiry.
    pub fn next_end(&self, schema: &Schema) -> Option<&PositionInPartition> {
        self.open
            .iter()
            .map(|o| &o.end)
            .min_by(|a, b| a.compare(b, schema))
    }

    /// Begins tracking a newly-opened interval (the start bound of a
    /// `range_tombstone` fragment popped from some reader).
    pub fn open(&mut self, end: PositionInPartition, tombstone: Tombstone) {
        self.open.push(Open { end, tombstone });
    }

    /// Re-synchronizes the sweep position after a `fast_forward_to(position_range)`
    /// call: coverage before `position` is no longer observable, so treat it
    /// as the new flush origin without emitting anything for it.
    pub fn resume_from(&mut self, position: PositionInPartition) {
        self.last_flush = position;
    }

    /// Emits the fragment covering `[last_flush, boundary)` under the
    /// dominant tombstone if the active set is non-empty and the interval is
    /// non-degenerate, drops intervals that end at or before `boundary`, and
    /// advances the sweep position to `boundary`.
    pub fn flush_to(&mut self, boundary: PositionInPartition, schema: &Schema) -> Option<Fragment> {
        let emitted = if self.is_active() && self.last_flush.compare(&boundary, schema) == Ordering::Less {
            Some(Fragment::RangeTombstone {
                start: self.last_flush.clone(),
                end: boundary.clone(),
                tombstone: self.dominant().expect("is_active just checked"),
            })
        } else {
            None
        };

        self.open.retain(|o| o.end.compare(&boundary, schema) == Ordering::Greater);
        self.last_flush = boundary;
        emitted
    }
}

impl Default for TombstoneSweep {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::fragment::ClusteringKey;

    fn schema() -> Schema {
        Schema::byte_ordered("t")
    }

    fn at(b: &[u8]) -> PositionInPartition {
        PositionInPartition::At(ClusteringKey::new(Bytes::copy_from_slice(b)))
    }

    fn ts(timestamp: i64) -> Tombstone {
        Tombstone { timestamp, deletion_time: timestamp }
    }

    #[test]
    fn single_interval_flushes_once_on_expiry() {
        let schema = schema();
        let mut sweep = TombstoneSweep::new();
        assert!(sweep.flush_to(at(b"a"), &schema).is_none());

        sweep.open(at(b"c"), ts(5));
        assert_eq!(sweep.next_end(&schema), Some(&at(b"c")));

        let emitted = sweep.flush_to(at(b"c"), &schema).unwrap();
        match emitted {
            Fragment::RangeTombstone { start, end, tombstone } => {
                assert_eq!(start, at(b"a"));
                assert_eq!(end, at(b"c"));
                assert_eq!(tombstone, ts(5));
            }
            other => panic!("expected range tombstone, got {other:?}"),
        }
        assert!(!sweep.is_active());
    }

    #[test]
    fn overlapping_intervals_flush_under_dominant_tombstone() {
        let schema = schema();
        let mut sweep = TombstoneSweep::new();
        sweep.open(at(b"e"), ts(1));
        // A second, later-starting interval overlaps and dominates.
        assert!(sweep.flush_to(at(b"c"), &schema).is_none());
        sweep.open(at(b"g"), ts(9));

        let emitted = sweep.flush_to(at(b"e"), &schema).unwrap();
        match emitted {
            Fragment::RangeTombstone { tombstone, .. } => assert_eq!(tombstone, ts(9)),
            other => panic!("expected range tombstone, got {other:?}"),
        }
        // The lower-priority interval expired at `e`; only the dominant one
        // remains active past that point.
        assert!(sweep.is_active());
        assert_eq!(sweep.dominant(), Some(ts(9)));
    }
}
