// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Lazy reader selector (component C, §4.C).
//!
//! Underlying stores only need to hand the selector a *description* of each
//! reader they could produce (its first key and the last ring position it
//! could possibly reach) plus the reader itself; the selector decides when
//! each one is actually needed by the merge cursor. This defers opening
//! sstables/memtables that the cursor has not reached yet, the same way
//! `Instance::partition_ssts_and_memtables` in the teacher only picks the
//! ssts overlapping a time range rather than opening the whole level.

use crate::{
    key::{DecoratedKey, PartitionRange, RingPosition, SequenceNumber, Token},
    reader::MutationReader,
};

/// A reader the selector knows about but has not yet handed to the merge
/// engine. `last_possible_position` upper-bounds the ring position this
/// reader could ever produce (e.g. an sstable's max key); it lets
/// [`ReaderSelector::fast_forward_to`] discard readers the cursor has moved
/// permanently past without opening them. `max_sequence` identifies the
/// reader for log correlation only, the same role `FileMeta::max_sequence`
/// plays in the teacher's `sst::file` -- it is never consulted for ordering.
pub struct PendingReader<R> {
    pub first_key: DecoratedKey,
    pub last_possible_position: RingPosition,
    pub max_sequence: SequenceNumber,
    pub reader: R,
}

impl<R> PendingReader<R> {
    pub fn new(first_key: DecoratedKey, last_possible_position: RingPosition, reader: R) -> Self {
        PendingReader {
            first_key,
            last_possible_position,
            max_sequence: 0,
            reader,
        }
    }

    pub fn with_max_sequence(mut self, max_sequence: SequenceNumber) -> Self {
        self.max_sequence = max_sequence;
        self
    }

    fn span(&self) -> PartitionRange {
        PartitionRange::new(
            RingPosition::Key(self.first_key.clone()),
            bump(&self.last_possible_position),
        )
    }
}

/// `last_possible_position` is inclusive (§4.C speaks of "last possible
/// position"); widen it by one rank so it can be compared against the
/// half-open ranges the rest of the engine uses.
fn bump(position: &RingPosition) -> RingPosition {
    match position {
        RingPosition::Key(k) => RingPosition::AfterToken(k.token.clone()),
        other => other.clone(),
    }
}

fn infinity() -> RingPosition {
    RingPosition::AfterToken(Token::new(vec![0xffu8; 32]))
}

/// Produces the set of readers overlapping a moving merge cursor, lazily:
/// a reader is only returned (and thus only needs to be opened/filled) once
/// the cursor is close enough that it might be needed (§4.C).
pub struct ReaderSelector<R> {
    /// Monotonically increasing: the lowest partition for which no reader
    /// has yet been handed to the merger.
    position: RingPosition,
    /// Sorted ascending by `first_key`.
    pending: Vec<PendingReader<R>>,
}

impl<R> ReaderSelector<R> {
    pub fn new(mut pending: Vec<PendingReader<R>>) -> Self {
        pending.sort_by(|a, b| a.first_key.cmp(&b.first_key));
        let mut selector = ReaderSelector {
            position: infinity(),
            pending,
        };
        selector.recompute_position();
        selector
    }

    pub fn position(&self) -> &RingPosition {
        &self.position
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn recompute_position(&mut self) {
        self.position = self
            .pending
            .first()
            .map(|p| RingPosition::Key(p.first_key.clone()))
            .unwrap_or_else(infinity);
    }

    /// Returns all pending readers whose first partition's token is <=
    /// `cursor_token`, or -- if `cursor_token` is `None` -- exactly one
    /// reader (the earliest), to seed the merge (§4.C).
    pub fn create_new_readers(&mut self, cursor_token: Option<&Token>) -> Vec<PendingReader<R>> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let drained = match cursor_token {
            Some(token) => {
                let split_at = self
                    .pending
                    .iter()
                    .position(|p| p.first_key.token > *token)
                    .unwrap_or(self.pending.len());
                self.pending.drain(..split_at).collect()
            }
            None => vec![self.pending.remove(0)],
        };

        self.recompute_position();
        log::debug!(
            "selector handed over {} reader(s), max_sequences:{:?}",
            drained.len(),
            drained.iter().map(|p| p.max_sequence).collect::<Vec<_>>()
        );
        drained
    }

    /// Discards all pending readers whose last possible position is
    /// strictly below `range.start`, then returns all pending readers that
    /// intersect `range` (§4.C).
    pub fn fast_forward_to(&mut self, range: &PartitionRange) -> Vec<PendingReader<R>> {
        let pending = std::mem::take(&mut self.pending);
        let (stale, live): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|p| bump(&p.last_possible_position) < range.start);
        drop(stale);

        let (matched, rest): (Vec<_>, Vec<_>) =
            live.into_iter().partition(|p| p.span().intersects(range));

        self.pending = rest;
        self.recompute_position();
        log::debug!("fast_forward_to(partition_range) activated {} reader(s)", matched.len());
        matched
    }
}

impl<R: MutationReader> ReaderSelector<R> {
    /// Validates the selector invariant from §4.C / §9: a reader handed to
    /// the merge engine must never start strictly before the last emitted
    /// decorated key, except when it is the very first reader seeded.
    pub fn validate_not_behind_cursor(
        reader_first_key: &DecoratedKey,
        last_emitted: Option<&DecoratedKey>,
    ) -> bool {
        match last_emitted {
            Some(last) => reader_first_key >= last,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{reader::VecReader, schema::Schema};

    fn dk(b: u8) -> DecoratedKey {
        DecoratedKey::new(Token::new(vec![b]), Bytes::from(vec![b]))
    }

    fn pending(b: u8) -> PendingReader<VecReader> {
        PendingReader::new(
            dk(b),
            RingPosition::Key(dk(b)),
            VecReader::new(Schema::byte_ordered("t"), vec![]),
        )
    }

    #[test]
    fn create_new_readers_without_cursor_returns_earliest_only() {
        let mut selector = ReaderSelector::new(vec![pending(5), pending(1), pending(3)]);
        let seeded = selector.create_new_readers(None);
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].first_key, dk(1));
        assert_eq!(selector.position(), &RingPosition::Key(dk(3)));
    }

    #[test]
    fn create_new_readers_with_cursor_returns_all_le_token() {
        let mut selector = ReaderSelector::new(vec![pending(1), pending(2), pending(5)]);
        let tok = Token::new(vec![2]);
        let popped = selector.create_new_readers(Some(&tok));
        assert_eq!(popped.len(), 2);
        assert!(!selector.is_empty());
    }

    #[test]
    fn position_advances_to_infinity_once_exhausted() {
        let mut selector = ReaderSelector::new(vec![pending(1)]);
        selector.create_new_readers(None);
        assert!(selector.is_empty());
        assert_eq!(selector.position(), &infinity());
    }

    #[test]
    fn fast_forward_discards_readers_strictly_before_range() {
        let mut selector = ReaderSelector::new(vec![pending(1), pending(5)]);
        let range = PartitionRange::new(RingPosition::Key(dk(4)), RingPosition::Key(dk(9)));
        let activated = selector.fast_forward_to(&range);
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].first_key, dk(5));
        assert!(selector.is_empty());
    }

    #[test]
    fn fast_forward_leaves_readers_beyond_range_pending() {
        let mut selector = ReaderSelector::new(vec![pending(1), pending(9)]);
        let range = PartitionRange::new(RingPosition::Key(dk(1)), RingPosition::Key(dk(2)));
        let activated = selector.fast_forward_to(&range);
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].first_key, dk(1));
        assert!(!selector.is_empty());
    }
}
