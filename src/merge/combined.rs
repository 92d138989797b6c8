// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Combined reader / merge engine (component D, §4.D).
//!
//! Fuses the K readers the [`ReaderSelector`] hands over into one
//! totally-ordered, conflict-resolved mutation stream. Partitions are always
//! merged whole: per partition, the engine joins the contributing readers'
//! partition tombstones, reconciles the static row, then runs the
//! within-partition loop over clustering rows and range tombstones tracked
//! by a [`TombstoneSweep`], exactly the shape described for
//! `Instance::read`'s `ChainIterator`/`MergeIterator` composition in the
//! teacher, generalized from record batches to mutation fragments.

use std::{cmp::Ordering, collections::VecDeque};

use async_trait::async_trait;
use snafu::ensure;
use tokio::time::Instant;

use crate::{
    error::{ProtocolMisuseSnafu, Result},
    fragment::{Cell, Fragment, KindTieBreak, PositionInPartition, PositionRange, Tombstone},
    key::{DecoratedKey, PartitionRange as KeyPartitionRange, Token},
    merge::sweep::TombstoneSweep,
    reader::{require_forwarding, Forwarding, MutationReader},
    schema::Schema,
    selector::ReaderSelector,
};

/// Tunables for a [`CombinedReader`], mirroring [`crate::reader::BufferBudget`]
/// but counted in merged output fragments rather than bytes, since the
/// engine's own buffer holds already-reconciled fragments rather than raw
/// source bytes.
#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub mr_forwarding: Forwarding,
    pub sm_forwarding: Forwarding,
    pub output_budget: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            mr_forwarding: Forwarding::No,
            sm_forwarding: Forwarding::No,
            output_budget: 256,
        }
    }
}

/// State carried between `fill_buffer` calls while a partition is only
/// partly merged: either paused mid-row-merge because `sm_forwarding` is
/// enabled and the caller has not yet called
/// `fast_forward_to_position_range`, or simply mid-merge because the output
/// budget ran out.
struct InPartition {
    members: Vec<usize>,
    sweep: TombstoneSweep,
    /// Members already exhausted (popped their own `partition_end`) and
    /// excluded from further consideration this partition.
    done: Vec<bool>,
    /// Upper bound on positions to merge before pausing; `AfterAllClusteredRows`
    /// unless a `fast_forward_to(position_range)` call narrowed it.
    range_end: PositionInPartition,
    awaiting_position_forward: bool,
    /// The joined partition tombstone (§3): shadows every row in the
    /// partition regardless of any range tombstone, so clustering-row
    /// occlusion must account for it as well as the sweep's coverage.
    partition_tombstone: Tombstone,
}

/// The merge engine itself (component D, §4.D). Generic over the reader
/// type the selector produces, the same way [`ReaderSelector`] is.
pub struct CombinedReader<R> {
    schema: Schema,
    mr_forwarding: Forwarding,
    sm_forwarding: Forwarding,
    output_budget: usize,
    selector: ReaderSelector<R>,
    active: Vec<R>,
    output: VecDeque<Fragment>,
    end_of_stream: bool,
    /// Last decorated key emitted as a `partition_start`; enforces the
    /// selector invariant from §4.C / §9 and re-seeds `create_new_readers`.
    last_emitted_key: Option<DecoratedKey>,
    current: Option<InPartition>,
}

impl<R: MutationReader> CombinedReader<R> {
    pub fn new(schema: Schema, config: MergeConfig, selector: ReaderSelector<R>) -> Self {
        CombinedReader {
            schema,
            mr_forwarding: config.mr_forwarding,
            sm_forwarding: config.sm_forwarding,
            output_budget: config.output_budget,
            selector,
            active: Vec::new(),
            output: VecDeque::new(),
            end_of_stream: false,
            last_emitted_key: None,
            current: None,
        }
    }

    /// Validates the handed-back reader isn't behind the merge cursor, fills
    /// its buffer, and adds it to the active set (§4.C / §9).
    async fn activate(&mut self, mut reader: R, first_key: &DecoratedKey, deadline: Instant) -> Result<()> {
        ensure!(
            ReaderSelector::<R>::validate_not_behind_cursor(first_key, self.last_emitted_key.as_ref()),
            ProtocolMisuseSnafu {
                detail: "selector produced a reader starting before the merge cursor",
            }
        );
        reader.fill_buffer(deadline).await?;
        self.active.push(reader);
        Ok(())
    }

    fn drop_exhausted_active(&mut self) {
        self.active.retain(|r| !(r.is_buffer_empty() && r.is_end_of_stream()));
    }

    async fn ensure_head(&mut self, idx: usize, deadline: Instant) -> Result<()> {
        while self.active[idx].is_buffer_empty() && !self.active[idx].is_end_of_stream() {
            self.active[idx].fill_buffer(deadline).await?;
        }
        Ok(())
    }

    /// Lowest partition-key token among active readers' buffered heads, or
    /// `None` if nothing is currently buffered anywhere.
    fn candidate_min_token(&self) -> Option<Token> {
        let mut best: Option<Token> = None;
        for r in &self.active {
            if r.is_buffer_empty() {
                continue;
            }
            if let Fragment::PartitionStart { key, .. } = r.peek_fragment() {
                if best.as_ref().map_or(true, |b| key.token < *b) {
                    best = Some(key.token.clone());
                }
            }
        }
        best
    }

    /// Pulls in every pending reader the selector can hand over against the
    /// next partition we are about to start, repeating until the selector
    /// has nothing left at or behind that point (§4.C).
    ///
    /// The cursor for this is the *candidate* next partition key, derived
    /// from the active readers' current heads -- never the last *emitted*
    /// key. Using the last emitted key instead (as `admit_ready` used to)
    /// misses two cases: a reader exactly co-minimal with an already-active
    /// head (never gets pulled in, so its rows are merged as a spurious
    /// second partition with the same key) and a reader whose first key
    /// sorts strictly between the last emitted key and the next active
    /// head's key (gets rejected later as behind the cursor once finally
    /// pulled in after that head is emitted).
    async fn admit_co_minimal(&mut self, deadline: Instant) -> Result<()> {
        loop {
            for i in 0..self.active.len() {
                self.ensure_head(i, deadline).await?;
            }
            self.drop_exhausted_active();

            let cursor = match self.candidate_min_token() {
                Some(t) => t,
                None => self.selector.position().token().clone(),
            };
            let newly_ready = self.selector.create_new_readers(Some(&cursor));
            if newly_ready.is_empty() {
                return Ok(());
            }
            for p in newly_ready {
                self.activate(p.reader, &p.first_key, deadline).await?;
            }
        }
    }

    /// Begins merging the next partition: finds the minimal partition key
    /// among active readers' heads, joins their partition tombstones, and
    /// reconciles the static row. Returns `false` if nothing is currently
    /// buffered (caller should stop this `fill_buffer` pass).
    async fn start_partition(&mut self, deadline: Instant) -> Result<bool> {
        self.admit_co_minimal(deadline).await?;

        let mut min_key: Option<DecoratedKey> = None;
        for r in &self.active {
            if r.is_buffer_empty() {
                continue;
            }
            if let Fragment::PartitionStart { key, .. } = r.peek_fragment() {
                if min_key.as_ref().map_or(true, |m| key < m) {
                    min_key = Some(key.clone());
                }
            }
        }
        let Some(min_key) = min_key else {
            return Ok(false);
        };

        let members: Vec<usize> = (0..self.active.len())
            .filter(|&i| {
                !self.active[i].is_buffer_empty()
                    && matches!(self.active[i].peek_fragment(), Fragment::PartitionStart { key, .. } if *key == min_key)
            })
            .collect();

        let mut tombstone = Tombstone::LIVE;
        for &i in &members {
            if let Fragment::PartitionStart { partition_tombstone, .. } = self.active[i].pop_fragment() {
                if partition_tombstone > tombstone {
                    tombstone = partition_tombstone;
                }
            } else {
                unreachable!("member selected by its buffered partition_start head");
            }
        }
        log::trace!("starting partition key:{min_key:?} from {} member reader(s)", members.len());
        self.output.push_back(Fragment::PartitionStart {
            key: min_key.clone(),
            partition_tombstone: tombstone,
        });
        self.last_emitted_key = Some(min_key);

        for &i in &members {
            self.ensure_head(i, deadline).await?;
        }
        let mut static_cells: Option<Vec<Cell>> = None;
        for &i in &members {
            if self.active[i].is_buffer_empty() {
                continue;
            }
            if matches!(self.active[i].peek_fragment(), Fragment::StaticRow { .. }) {
                let Fragment::StaticRow { cells } = self.active[i].pop_fragment() else {
                    unreachable!("just matched StaticRow");
                };
                static_cells = Some(match static_cells {
                    Some(existing) => crate::fragment::reconcile_row(existing, cells),
                    None => cells,
                });
            }
        }
        if let Some(cells) = static_cells {
            let surviving: Vec<Cell> = cells.into_iter().filter(|c| !tombstone.covers(c.write_timestamp)).collect();
            if !surviving.is_empty() {
                self.output.push_back(Fragment::StaticRow { cells: surviving });
            }
        }

        let done = vec![false; members.len()];
        self.current = Some(InPartition {
            members,
            sweep: TombstoneSweep::new(),
            done,
            range_end: PositionInPartition::AfterAllClusteredRows,
            awaiting_position_forward: self.sm_forwarding.is_enabled(),
            partition_tombstone: tombstone,
        });
        Ok(true)
    }

    /// Runs (or resumes) the within-partition merge loop until the partition
    /// ends, the output budget is reached, or `sm_forwarding` pauses it
    /// awaiting another `fast_forward_to(position_range)` call (§4.D).
    async fn drive_partition(&mut self, deadline: Instant) -> Result<()> {
        loop {
            if self.output.len() >= self.output_budget {
                return Ok(());
            }
            let Some(in_partition) = self.current.as_mut() else {
                return Ok(());
            };
            if in_partition.awaiting_position_forward {
                return Ok(());
            }

            let remaining: Vec<usize> = in_partition
                .members
                .iter()
                .enumerate()
                .filter(|(slot, _)| !in_partition.done[*slot])
                .map(|(_, &idx)| idx)
                .collect();

            for &idx in &remaining {
                self.ensure_head(idx, deadline).await?;
            }

            // Retrieve `current` again: `ensure_head` needed `&mut self`, not
            // `&mut in_partition`, so the borrow could not span the await.
            let in_partition = self.current.as_mut().expect("checked above");

            // Members that reached their own partition_end this partition
            // are retired from consideration (but their fragment is only
            // popped once, so we never peek past it into their next
            // partition).
            for (slot, &idx) in in_partition.members.iter().enumerate() {
                if in_partition.done[slot] || self.active[idx].is_buffer_empty() {
                    continue;
                }
                if self.active[idx].peek_fragment().is_partition_end() {
                    self.active[idx].pop_fragment();
                    in_partition.done[slot] = true;
                }
            }

            let schema = self.schema.clone();
            let best_real = Self::find_min_head(&self.active, in_partition, &schema);
            let sweep_end = in_partition.sweep.next_end(&schema).cloned();

            let boundary = match (&best_real, &sweep_end) {
                (None, None) => None,
                (None, Some(e)) => Some((e.clone(), true)),
                (Some((pos, _)), None) => Some((pos.clone(), false)),
                (Some((pos, _)), Some(e)) => {
                    if e.compare(pos, &schema) == Ordering::Less {
                        Some((e.clone(), true))
                    } else {
                        Some((pos.clone(), false))
                    }
                }
            };

            let Some((boundary, is_expiry)) = boundary else {
                // Partition fully drained and no coverage left open.
                self.output.push_back(Fragment::PartitionEnd);
                self.current = None;
                continue;
            };

            // `AfterAllClusteredRows` is the "no limit" sentinel (the
            // default, and what a `PositionRange::all()` forward sets it
            // to) -- only a genuinely narrower bound should pause the merge.
            let limited = in_partition.range_end != PositionInPartition::AfterAllClusteredRows;
            if limited && in_partition.range_end.compare(&boundary, &schema) != Ordering::Greater {
                if let Some(frag) = in_partition.sweep.flush_to(in_partition.range_end.clone(), &schema) {
                    self.output.push_back(frag);
                }
                in_partition.awaiting_position_forward = true;
                return Ok(());
            }

            if is_expiry {
                if let Some(frag) = in_partition.sweep.flush_to(boundary, &schema) {
                    self.output.push_back(frag);
                }
                continue;
            }

            if let Some(frag) = in_partition.sweep.flush_to(boundary.clone(), &schema) {
                self.output.push_back(frag);
            }
            // Either the range-tombstone coverage at this position or the
            // partition-wide tombstone can shadow a row; take the stronger.
            let covering = match in_partition.sweep.dominant() {
                Some(t) if t > in_partition.partition_tombstone => Some(t),
                _ if !in_partition.partition_tombstone.is_live() => Some(in_partition.partition_tombstone),
                _ => None,
            };

            let (_, kind) = best_real.expect("is_expiry was false");
            let group: Vec<usize> = in_partition
                .members
                .iter()
                .enumerate()
                .filter(|(slot, &idx)| {
                    !in_partition.done[*slot]
                        && !self.active[idx].is_buffer_empty()
                        && self.active[idx].peek_fragment().position().compare(&boundary, &schema) == Ordering::Equal
                        && self.active[idx].peek_fragment().kind_rank() == Some(kind)
                })
                .map(|(_, &idx)| idx)
                .collect();

            match kind {
                KindTieBreak::StaticRow => unreachable!("static rows are consumed in start_partition"),
                KindTieBreak::RangeTombstoneEnd => unreachable!("range_tombstone_end is a virtual sweep event only"),
                KindTieBreak::ClusteringRow => {
                    let mut cells: Option<Vec<Cell>> = None;
                    let mut key = None;
                    for &idx in &group {
                        let Fragment::ClusteringRow { key: k, cells: c } = self.active[idx].pop_fragment() else {
                            unreachable!("just matched ClusteringRow");
                        };
                        key = Some(k);
                        cells = Some(match cells {
                            Some(existing) => crate::fragment::reconcile_row(existing, c),
                            None => c,
                        });
                    }
                    let cells = cells.expect("group is non-empty");
                    let surviving: Vec<Cell> = cells
                        .into_iter()
                        .filter(|c| covering.map_or(true, |t| !t.covers(c.write_timestamp)))
                        .collect();
                    if !surviving.is_empty() {
                        self.output.push_back(Fragment::ClusteringRow {
                            key: key.expect("group is non-empty"),
                            cells: surviving,
                        });
                    }
                }
                KindTieBreak::RangeTombstoneStart => {
                    for &idx in &group {
                        let Fragment::RangeTombstone { end, tombstone, .. } = self.active[idx].pop_fragment() else {
                            unreachable!("just matched RangeTombstone");
                        };
                        in_partition.sweep.open(end, tombstone);
                    }
                }
            }
        }
    }

    /// The minimal `(position, kind)` among not-yet-done members' buffered
    /// heads, ignoring `partition_end`.
    fn find_min_head(
        active: &[R],
        in_partition: &InPartition,
        schema: &Schema,
    ) -> Option<(PositionInPartition, KindTieBreak)> {
        let mut best: Option<(PositionInPartition, KindTieBreak)> = None;
        for (slot, &idx) in in_partition.members.iter().enumerate() {
            if in_partition.done[slot] || active[idx].is_buffer_empty() {
                continue;
            }
            let head = active[idx].peek_fragment();
            if head.is_partition_end() {
                continue;
            }
            let pos = head.position();
            let kind = head.kind_rank().expect("non-start/end fragment always has a kind rank");
            let better = match &best {
                None => true,
                Some((bp, bk)) => {
                    let ord = pos.compare(bp, schema);
                    ord == Ordering::Less || (ord == Ordering::Equal && kind < *bk)
                }
            };
            if better {
                best = Some((pos, kind));
            }
        }
        best
    }
}

#[async_trait]
impl<R: MutationReader> MutationReader for CombinedReader<R> {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sm_forwarding(&self) -> Forwarding {
        self.sm_forwarding
    }

    fn mr_forwarding(&self) -> Forwarding {
        self.mr_forwarding
    }

    async fn fill_buffer(&mut self, deadline: Instant) -> Result<()> {
        while self.output.len() < self.output_budget {
            if self.current.is_none() {
                if !self.start_partition(deadline).await? {
                    break;
                }
            }
            self.drive_partition(deadline).await?;
            if self.current.as_ref().map_or(false, |p| p.awaiting_position_forward) {
                break;
            }
        }

        if self.current.is_none() && self.active.is_empty() && self.selector.is_empty() {
            self.end_of_stream = true;
        }
        Ok(())
    }

    fn pop_fragment(&mut self) -> Fragment {
        self.output.pop_front().expect("pop_fragment on empty buffer")
    }

    fn peek_fragment(&self) -> &Fragment {
        self.output.front().expect("peek_fragment on empty buffer")
    }

    fn is_buffer_empty(&self) -> bool {
        self.output.is_empty()
    }

    fn is_end_of_stream(&self) -> bool {
        self.end_of_stream && self.output.is_empty()
    }

    fn next_partition(&mut self) {
        while let Some(f) = self.output.pop_front() {
            if f.is_partition_end() {
                return;
            }
        }
        // The buffer ran out before a `partition_end`: either the output
        // budget was reached mid-merge or `sm_forwarding` paused it, and
        // `self.current` is the same partition whose (possibly lone)
        // `partition_start` was just drained above. Force every
        // not-yet-exhausted member straight past the rest of it.
        if let Some(in_partition) = self.current.take() {
            for (slot, &idx) in in_partition.members.iter().enumerate() {
                if !in_partition.done[slot] {
                    self.active[idx].next_partition();
                }
            }
        }
    }

    async fn fast_forward_to_partition_range(&mut self, range: KeyPartitionRange, deadline: Instant) -> Result<()> {
        require_forwarding(self.mr_forwarding, "fast_forward_to(partition_range)")?;
        log::debug!("combined reader fast_forward_to(partition_range) start:{:?}", range.start);
        self.output.clear();
        self.current = None;
        self.end_of_stream = false;
        // The forward jump resets the cursor; the next partition emitted
        // may legitimately start anywhere inside `range`, not just at or
        // after whatever key was last emitted before the jump.
        self.last_emitted_key = None;

        for r in &mut self.active {
            r.fast_forward_to_partition_range(range.clone(), deadline).await?;
        }
        for i in 0..self.active.len() {
            self.ensure_head(i, deadline).await?;
        }
        self.drop_exhausted_active();

        // Readers the selector newly hands over here have never been
        // repositioned, unlike the already-active ones above: their own
        // data may still hold partitions before `range.start` (§4.C).
        let activated = self.selector.fast_forward_to(&range);
        for mut p in activated {
            p.reader.fast_forward_to_partition_range(range.clone(), deadline).await?;
            self.activate(p.reader, &p.first_key, deadline).await?;
        }

        Ok(())
    }

    async fn fast_forward_to_position_range(&mut self, range: PositionRange, deadline: Instant) -> Result<()> {
        require_forwarding(self.sm_forwarding, "fast_forward_to(position_range)")?;
        log::trace!("combined reader fast_forward_to(position_range) start:{:?}", range.start);
        // Copy the member index list out first so the loop below only
        // borrows `self.active`, never holding a borrow of `self.current`
        // across an `.await`.
        let members = match &self.current {
            Some(p) => p.members.clone(),
            None => {
                return ProtocolMisuseSnafu {
                    detail: "fast_forward_to(position_range) called with no partition awaiting it",
                }
                .fail();
            }
        };
        for idx in members {
            if self.active[idx].sm_forwarding().is_enabled() {
                self.active[idx].fast_forward_to_position_range(range.clone(), deadline).await?;
            }
        }

        let in_partition = self.current.as_mut().expect("checked above");
        in_partition.sweep.resume_from(range.start.clone());
        in_partition.range_end = range.end;
        in_partition.awaiting_position_forward = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::{Duration, Instant};

    use super::*;
    use crate::{
        key::{RingPosition, Token},
        reader::{Mutation, VecReader},
        selector::PendingReader,
    };

    fn dk(b: u8) -> DecoratedKey {
        DecoratedKey::new(Token::new(vec![b]), Bytes::from(vec![b]))
    }

    fn ck(s: &[u8]) -> crate::fragment::ClusteringKey {
        crate::fragment::ClusteringKey::new(Bytes::copy_from_slice(s))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    /// Builds a [`CombinedReader`] over one [`VecReader`] per `Vec<Mutation>`
    /// group, seeded through a real [`ReaderSelector`] the same way a store
    /// would hand over its sstables/memtables (§4.C).
    fn combined(groups: Vec<Vec<Mutation>>) -> CombinedReader<VecReader> {
        let schema = Schema::byte_ordered("t");
        let pending = groups
            .into_iter()
            .map(|mutations| {
                let first = mutations.first().expect("non-empty group").key.clone();
                let last = mutations.last().expect("non-empty group").key.clone();
                PendingReader::new(
                    first,
                    RingPosition::Key(last),
                    VecReader::new(schema.clone(), mutations),
                )
            })
            .collect();
        CombinedReader::new(schema, MergeConfig::default(), ReaderSelector::new(pending))
    }

    async fn drain_all<R: MutationReader>(reader: &mut CombinedReader<R>) -> Vec<Fragment> {
        let mut out = Vec::new();
        loop {
            reader.fill_buffer(deadline()).await.unwrap();
            while !reader.is_buffer_empty() {
                out.push(reader.pop_fragment());
            }
            if reader.is_end_of_stream() {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn same_key_different_timestamps_reconciles_cells() {
        // S1: two sources contribute the same row; the newer write wins.
        let a = vec![Mutation::new(dk(1)).with_row(ck(b"a"), vec![Cell::live(0, "old", 1)])];
        let b = vec![Mutation::new(dk(1)).with_row(ck(b"a"), vec![Cell::live(0, "new", 2)])];
        let mut reader = combined(vec![a, b]);

        let fragments = drain_all(&mut reader).await;
        assert_eq!(fragments.len(), 3);
        assert!(fragments[0].is_partition_start());
        match &fragments[1] {
            Fragment::ClusteringRow { cells, .. } => {
                assert_eq!(cells.len(), 1);
                assert_eq!(&cells[0].value[..], b"new");
            }
            other => panic!("expected clustering row, got {other:?}"),
        }
        assert!(fragments[2].is_partition_end());
    }

    #[tokio::test]
    async fn disjoint_keys_merge_in_partition_order() {
        // S2: unrelated partitions from different sources interleave by key.
        let a = vec![Mutation::new(dk(5)).with_row(ck(b"a"), vec![Cell::live(0, "v5", 1)])];
        let b = vec![
            Mutation::new(dk(1)).with_row(ck(b"a"), vec![Cell::live(0, "v1", 1)]),
            Mutation::new(dk(9)).with_row(ck(b"a"), vec![Cell::live(0, "v9", 1)]),
        ];
        let mut reader = combined(vec![a, b]);

        let fragments = drain_all(&mut reader).await;
        let keys: Vec<DecoratedKey> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::PartitionStart { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![dk(1), dk(5), dk(9)]);
    }

    #[tokio::test]
    async fn interleaved_rows_within_one_partition_merge_by_position() {
        // S3: two sources contribute disjoint rows of the same partition;
        // output must be in clustering order with no duplication.
        let a = vec![Mutation::new(dk(1))
            .with_row(ck(b"a"), vec![Cell::live(0, "va", 1)])
            .with_row(ck(b"c"), vec![Cell::live(0, "vc", 1)])];
        let b = vec![Mutation::new(dk(1)).with_row(ck(b"b"), vec![Cell::live(0, "vb", 1)])];
        let mut reader = combined(vec![a, b]);

        let fragments = drain_all(&mut reader).await;
        let rows: Vec<&[u8]> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::ClusteringRow { key, .. } => Some(&key.0[..]),
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }

    #[tokio::test]
    async fn range_tombstone_occludes_covered_cells() {
        // S6: a range tombstone from one source should shadow an
        // older-or-equal-timestamp row contributed by another.
        let tombstone_range = PositionRange::all();
        let a = vec![Mutation::new(dk(1)).with_range_tombstone(tombstone_range, Tombstone { timestamp: 10, deletion_time: 10 })];
        let b = vec![Mutation::new(dk(1)).with_row(ck(b"a"), vec![Cell::live(0, "shadowed", 5)])];
        let mut reader = combined(vec![a, b]);

        let fragments = drain_all(&mut reader).await;
        assert!(
            !fragments.iter().any(|f| matches!(f, Fragment::ClusteringRow { .. })),
            "row with write_timestamp <= tombstone timestamp must be dropped, got {fragments:?}",
        );
        assert!(fragments.iter().any(|f| matches!(f, Fragment::RangeTombstone { .. })));
    }

    #[tokio::test]
    async fn range_tombstone_does_not_occlude_newer_cell() {
        let tombstone_range = PositionRange::all();
        let a = vec![Mutation::new(dk(1)).with_range_tombstone(tombstone_range, Tombstone { timestamp: 10, deletion_time: 10 })];
        let b = vec![Mutation::new(dk(1)).with_row(ck(b"a"), vec![Cell::live(0, "survives", 20)])];
        let mut reader = combined(vec![a, b]);

        let fragments = drain_all(&mut reader).await;
        let survived = fragments
            .iter()
            .any(|f| matches!(f, Fragment::ClusteringRow { cells, .. } if &cells[0].value[..] == b"survives"));
        assert!(survived, "cell with write_timestamp > tombstone timestamp must survive, got {fragments:?}");
    }

    #[tokio::test]
    async fn fast_forward_to_partition_range_skips_to_target_key() {
        // S4: fast-forwarding across a gap must land on the first partition
        // inside the new range and never re-emit anything before it.
        let a = vec![
            Mutation::new(dk(1)).with_row(ck(b"a"), vec![Cell::live(0, "v1", 1)]),
            Mutation::new(dk(9)).with_row(ck(b"a"), vec![Cell::live(0, "v9", 1)]),
        ];
        let schema = Schema::byte_ordered("t");
        // Left unfilled: the source is only materialized once the combined
        // reader activates it, same as any other selector-handed-over reader
        // (§4.C). Pre-filling here would let `fast_forward_to_partition_range`
        // clear already-buffered fragments it never re-derives from `pending`.
        let source = VecReader::new(schema.clone(), a).with_mr_forwarding();
        let pending = PendingReader::new(dk(1), RingPosition::Key(dk(9)), source);

        let mut reader = CombinedReader::new(
            schema,
            MergeConfig {
                mr_forwarding: Forwarding::Yes,
                ..MergeConfig::default()
            },
            ReaderSelector::new(vec![pending]),
        );

        reader
            .fast_forward_to_partition_range(
                KeyPartitionRange::new(RingPosition::Key(dk(5)), RingPosition::AfterToken(Token::new(vec![0xff; 32]))),
                deadline(),
            )
            .await
            .unwrap();

        let fragments = drain_all(&mut reader).await;
        let keys: Vec<DecoratedKey> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::PartitionStart { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![dk(9)]);
    }

    #[tokio::test]
    async fn sm_forwarding_pauses_mid_partition_until_fast_forward_to_position_range() {
        // P6: with sm_forwarding enabled, no clustering row may be emitted
        // until fast_forward_to(position_range) is called; afterward only
        // rows within the requested range appear.
        let schema = Schema::byte_ordered("t");
        let mutation = Mutation::new(dk(1))
            .with_row(ck(b"a"), vec![Cell::live(0, "va", 1)])
            .with_row(ck(b"b"), vec![Cell::live(0, "vb", 1)]);
        let source = VecReader::new(schema.clone(), vec![mutation]).with_sm_forwarding();
        let pending = PendingReader::new(dk(1), RingPosition::Key(dk(1)), source);

        let mut reader = CombinedReader::new(
            schema,
            MergeConfig {
                sm_forwarding: Forwarding::Yes,
                ..MergeConfig::default()
            },
            ReaderSelector::new(vec![pending]),
        );

        reader.fill_buffer(deadline()).await.unwrap();
        assert!(reader.pop_fragment().is_partition_start());
        assert!(
            reader.is_buffer_empty(),
            "clustering rows must stay withheld until fast_forward_to(position_range)"
        );
        assert!(!reader.is_end_of_stream());

        reader
            .fast_forward_to_position_range(PositionRange::all(), deadline())
            .await
            .unwrap();

        let fragments = drain_all(&mut reader).await;
        let rows: Vec<&[u8]> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::ClusteringRow { key, .. } => Some(&key.0[..]),
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[tokio::test]
    async fn next_partition_skips_mid_partition_current_when_budget_paused() {
        // A tiny output_budget strands the merge mid-partition: the buffer
        // holds only `partition_start` and `self.current` is still open.
        // `next_partition` must force that partition's member readers past
        // it rather than leaving them to leak their remaining rows into the
        // next `fill_buffer` pass.
        let a = vec![Mutation::new(dk(1))
            .with_row(ck(b"a"), vec![Cell::live(0, "va", 1)])
            .with_row(ck(b"b"), vec![Cell::live(0, "vb", 1)])];
        let b = vec![Mutation::new(dk(5)).with_row(ck(b"a"), vec![Cell::live(0, "v5", 1)])];
        let schema = Schema::byte_ordered("t");
        let pending = vec![
            PendingReader::new(dk(1), RingPosition::Key(dk(1)), VecReader::new(schema.clone(), a)),
            PendingReader::new(dk(5), RingPosition::Key(dk(5)), VecReader::new(schema.clone(), b)),
        ];
        let mut reader = CombinedReader::new(
            schema,
            MergeConfig {
                output_budget: 1,
                ..MergeConfig::default()
            },
            ReaderSelector::new(pending),
        );

        reader.fill_buffer(deadline()).await.unwrap();
        assert!(reader.pop_fragment().is_partition_start());
        assert!(reader.is_buffer_empty());

        reader.next_partition();

        let fragments = drain_all(&mut reader).await;
        let keys: Vec<DecoratedKey> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::PartitionStart { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![dk(5)], "dk(1) must be skipped entirely, not re-merged");

        let values: Vec<&[u8]> = fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::ClusteringRow { cells, .. } => Some(&cells[0].value[..]),
                _ => None,
            })
            .collect();
        assert_eq!(
            values,
            vec![b"v5".as_slice()],
            "rows from the skipped dk(1) partition must not surface, got {fragments:?}",
        );
    }
}
