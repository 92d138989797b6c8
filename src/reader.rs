// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Reader contract (component B, §4.B).
//!
//! Every fragment source -- sstable, memtable, the combined reader itself,
//! the filtering decorator, the restricted wrapper -- implements
//! [`MutationReader`]. `pop_fragment`/`is_buffer_empty`/`next_partition` are
//! non-suspending (§5); `fill_buffer` and the two `fast_forward_to` methods
//! are the only suspension points a reader itself introduces.

use std::collections::VecDeque;

use async_trait::async_trait;
use snafu::ensure;
use tokio::time::Instant;

use crate::{
    error::{ProtocolMisuseSnafu, Result},
    fragment::{Cell, ClusteringKey, Fragment, KindTieBreak, PositionInPartition, PositionRange, Tombstone},
    key::{DecoratedKey, PartitionRange},
    schema::Schema,
};

/// Creation-time capability flag (§4.B). `Yes` means the corresponding
/// `fast_forward_to` overload and its end-of-stream behaviour are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    No,
    Yes,
}

impl Forwarding {
    pub fn is_enabled(self) -> bool {
        matches!(self, Forwarding::Yes)
    }
}

/// Byte budget governing how much `fill_buffer` accumulates before
/// returning, mirroring `IterOptions`/`RECORD_BATCH_READ_BUF_SIZE`-style
/// tuning knobs in the teacher's `row_iter`/`instance::read` modules.
#[derive(Debug, Clone, Copy)]
pub struct BufferBudget {
    pub max_bytes: usize,
}

impl BufferBudget {
    pub const DEFAULT: BufferBudget = BufferBudget { max_bytes: 128 * 1024 };
}

impl Default for BufferBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The pull-based, bufferable, forward-only stream interface every fragment
/// source must honour (§4.B).
#[async_trait]
pub trait MutationReader: Send {
    fn schema(&self) -> &Schema;

    fn sm_forwarding(&self) -> Forwarding;

    fn mr_forwarding(&self) -> Forwarding;

    /// Advance production into the internal buffer until it is full, until
    /// end-of-stream, or until `deadline` elapses (in which case this fails
    /// with [`crate::Error::Timeout`]). Must not block an OS thread; may
    /// suspend arbitrarily (§4.B, §5).
    async fn fill_buffer(&mut self, deadline: Instant) -> Result<()>;

    /// Remove and return the next buffered fragment. Undefined (panics) if
    /// the buffer is empty -- callers must check [`Self::is_buffer_empty`]
    /// first, per §4.B.
    fn pop_fragment(&mut self) -> Fragment;

    /// Look at the next buffered fragment without removing it. Undefined
    /// (panics) if the buffer is empty. Lets the combined reader (§4.D)
    /// compare candidate heads across several active readers before
    /// deciding which one to actually consume.
    fn peek_fragment(&self) -> &Fragment;

    fn is_buffer_empty(&self) -> bool;

    fn is_end_of_stream(&self) -> bool;

    /// Fast local skip: drop buffered fragments up to and including the
    /// next `partition_end`. Non-suspending (§5); if the buffer runs out
    /// before reaching a `partition_end`, the implementation must also skip
    /// within the underlying source on the next `fill_buffer`.
    fn next_partition(&mut self);

    /// Reposition so the next partition produced is the first one within
    /// `range`. Only legal when `mr_forwarding() == Forwarding::Yes`; `range`
    /// must start at or after the reader's current cursor (§4.B).
    async fn fast_forward_to_partition_range(
        &mut self,
        range: PartitionRange,
        deadline: Instant,
    ) -> Result<()>;

    /// Within the current partition, reposition so the next clustering
    /// fragment has position >= `range.start`; the stream becomes
    /// end-of-stream once it reaches `range.end`. Only legal when
    /// `sm_forwarding() == Forwarding::Yes`; successive calls must be
    /// monotonically non-decreasing in `range.start` (§4.B).
    async fn fast_forward_to_position_range(
        &mut self,
        range: PositionRange,
        deadline: Instant,
    ) -> Result<()>;
}

/// Verifies the two forwarding preconditions that are cheap to check inline
/// at every `fast_forward_to` call site, producing `ProtocolMisuse` rather
/// than silently miscomputing (§7).
pub fn require_forwarding(flag: Forwarding, what: &str) -> Result<()> {
    ensure!(
        flag.is_enabled(),
        ProtocolMisuseSnafu {
            detail: format!("{what} called without forwarding enabled"),
        }
    );
    Ok(())
}

/// One partition's worth of fragments, used to build fixtures and to
/// express the "logical collection" view of a partition from §3.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub key: DecoratedKey,
    pub partition_tombstone: Tombstone,
    pub static_row: Vec<Cell>,
    pub clustered_rows: Vec<(ClusteringKey, Vec<Cell>)>,
    pub range_tombstones: Vec<(PositionRange, Tombstone)>,
}

impl Mutation {
    pub fn new(key: DecoratedKey) -> Self {
        Mutation {
            key,
            partition_tombstone: Tombstone::LIVE,
            static_row: Vec::new(),
            clustered_rows: Vec::new(),
            range_tombstones: Vec::new(),
        }
    }

    pub fn with_row(mut self, key: ClusteringKey, cells: Vec<Cell>) -> Self {
        self.clustered_rows.push((key, cells));
        self
    }

    pub fn with_range_tombstone(mut self, range: PositionRange, tombstone: Tombstone) -> Self {
        self.range_tombstones.push((range, tombstone));
        self
    }

    /// `partition_start, (static_row)?, interleaved(clustering_row |
    /// range_tombstone in position order), partition_end` (§3).
    pub fn to_fragments(&self, schema: &Schema) -> Vec<Fragment> {
        let mut out = Vec::with_capacity(self.clustered_rows.len() + self.range_tombstones.len() + 2);
        out.push(Fragment::PartitionStart {
            key: self.key.clone(),
            partition_tombstone: self.partition_tombstone,
        });
        if !self.static_row.is_empty() {
            out.push(Fragment::StaticRow {
                cells: self.static_row.clone(),
            });
        }

        let mut in_partition: Vec<Fragment> = self
            .clustered_rows
            .iter()
            .map(|(k, cells)| Fragment::ClusteringRow {
                key: k.clone(),
                cells: cells.clone(),
            })
            .chain(self.range_tombstones.iter().map(|(range, tombstone)| {
                Fragment::RangeTombstone {
                    start: range.start.clone(),
                    end: range.end.clone(),
                    tombstone: *tombstone,
                }
            }))
            .collect();
        in_partition.sort_by(|a, b| a.compare_in_partition(b, schema));
        out.extend(in_partition);

        out.push(Fragment::PartitionEnd);
        out
    }
}

/// Simple in-memory reader over a fixed set of mutations, used throughout
/// the test suite to stand in for sstable/memtable sources (mirroring the
/// teacher's `XxxMocker` fixtures, e.g. `SstMetaDataMocker`).
pub struct VecReader {
    schema: Schema,
    sm_forwarding: Forwarding,
    mr_forwarding: Forwarding,
    /// Remaining mutations not yet turned into buffered fragments.
    pending: VecDeque<Mutation>,
    buffer: VecDeque<Fragment>,
    end_of_stream: bool,
    /// When `sm_forwarding` is enabled, the partition currently open but not
    /// yet advanced past `before_all_clustered_rows`.
    held_partition: Option<Mutation>,
    budget: BufferBudget,
}

impl VecReader {
    pub fn new(schema: Schema, mutations: Vec<Mutation>) -> Self {
        VecReader {
            schema,
            sm_forwarding: Forwarding::No,
            mr_forwarding: Forwarding::No,
            pending: mutations.into(),
            buffer: VecDeque::new(),
            end_of_stream: false,
            held_partition: None,
            budget: BufferBudget::default(),
        }
    }

    pub fn with_sm_forwarding(mut self) -> Self {
        self.sm_forwarding = Forwarding::Yes;
        self
    }

    pub fn with_mr_forwarding(mut self) -> Self {
        self.mr_forwarding = Forwarding::Yes;
        self
    }

    fn fill_one_partition(&mut self) {
        let Some(mutation) = self.pending.pop_front() else {
            self.end_of_stream = true;
            return;
        };

        if self.sm_forwarding.is_enabled() {
            // Only emit partition_start (+ static row) up to
            // before_all_clustered_rows; clustering rows require an explicit
            // fast_forward_to(position_range) per §4.B.
            self.buffer.push_back(Fragment::PartitionStart {
                key: mutation.key.clone(),
                partition_tombstone: mutation.partition_tombstone,
            });
            if !mutation.static_row.is_empty() {
                self.buffer.push_back(Fragment::StaticRow {
                    cells: mutation.static_row.clone(),
                });
            }
            self.held_partition = Some(mutation);
        } else {
            self.buffer.extend(mutation.to_fragments(&self.schema));
        }
    }
}

#[async_trait]
impl MutationReader for VecReader {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sm_forwarding(&self) -> Forwarding {
        self.sm_forwarding
    }

    fn mr_forwarding(&self) -> Forwarding {
        self.mr_forwarding
    }

    async fn fill_buffer(&mut self, _deadline: Instant) -> Result<()> {
        while self.buffer.len() * 64 < self.budget.max_bytes {
            if self.held_partition.is_some() {
                // Waiting on a position fast-forward before more fragments
                // of the current partition can be produced.
                break;
            }
            let before = self.buffer.len();
            self.fill_one_partition();
            if self.buffer.len() == before {
                break;
            }
        }
        Ok(())
    }

    fn pop_fragment(&mut self) -> Fragment {
        self.buffer.pop_front().expect("pop_fragment on empty buffer")
    }

    fn peek_fragment(&self) -> &Fragment {
        self.buffer.front().expect("peek_fragment on empty buffer")
    }

    fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn is_end_of_stream(&self) -> bool {
        self.end_of_stream && self.buffer.is_empty() && self.held_partition.is_none()
    }

    fn next_partition(&mut self) {
        while let Some(f) = self.buffer.pop_front() {
            if f.is_partition_end() {
                return;
            }
        }
        // Buffer was consumed before reaching partition_end: the held
        // partition (if any) is what we were mid-way through; drop it.
        self.held_partition = None;
    }

    async fn fast_forward_to_partition_range(
        &mut self,
        range: PartitionRange,
        _deadline: Instant,
    ) -> Result<()> {
        require_forwarding(self.mr_forwarding, "fast_forward_to(partition_range)")?;
        self.buffer.clear();
        self.held_partition = None;
        self.pending.retain(|m| range.contains(&m.key));
        // Also drop anything whose key is entirely below range.start even if
        // it would've later been skipped by contains() -- retain above
        // already achieves this since contains() checks both bounds.
        self.end_of_stream = self.pending.is_empty();
        Ok(())
    }

    async fn fast_forward_to_position_range(
        &mut self,
        range: PositionRange,
        _deadline: Instant,
    ) -> Result<()> {
        require_forwarding(self.sm_forwarding, "fast_forward_to(position_range)")?;
        let Some(mutation) = self.held_partition.take() else {
            return Ok(());
        };

        let mut rows: Vec<Fragment> = mutation
            .clustered_rows
            .iter()
            .filter(|(k, _)| range.contains(&PositionInPartition::At(k.clone()), &self.schema))
            .map(|(k, cells)| Fragment::ClusteringRow {
                key: k.clone(),
                cells: cells.clone(),
            })
            .chain(mutation.range_tombstones.iter().filter_map(|(r, t)| {
                if range.contains(&r.start, &self.schema) {
                    Some(Fragment::RangeTombstone {
                        start: r.start.clone(),
                        end: r.end.clone(),
                        tombstone: *t,
                    })
                } else {
                    None
                }
            }))
            .collect();
        rows.sort_by(|a, b| a.compare_in_partition(b, &self.schema));

        // True once the partition's actual last row (not just the filtered
        // `rows` above) fits before `range.end` -- i.e. nothing beyond what
        // we just emitted remains for a later fast_forward to pick up.
        let reached_end = mutation
            .clustered_rows
            .last()
            .map(|(k, _)| {
                PositionInPartition::At(k.clone())
                    .compare(&range.end, &self.schema)
                    == std::cmp::Ordering::Less
            })
            .unwrap_or(true);

        self.buffer.extend(rows);
        if reached_end {
            self.buffer.push_back(Fragment::PartitionEnd);
        } else {
            // Still inside the partition range; remember it so the next
            // fast_forward can resume from here.
            self.held_partition = Some(mutation);
        }
        Ok(())
    }
}

pub fn is_range_tombstone_start(fragment: &Fragment) -> bool {
    matches!(fragment.kind_rank(), Some(KindTieBreak::RangeTombstoneStart))
}
