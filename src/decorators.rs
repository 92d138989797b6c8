// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Reader decorators (§4.E, §9): [`RestrictedReader`] wraps any reader with
//! lazy admission control, [`FilteringReader`] drops whole partitions by
//! predicate. Both forward every other contract method unchanged, the same
//! shape as the teacher's `DedupIterator`/`ChainIterator` wrapping a plain
//! `RecordBatchWithKeyIterator`.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    error::Result,
    fragment::{Fragment, PositionRange},
    key::{DecoratedKey, PartitionRange},
    reader::{Forwarding, MutationReader},
    schema::Schema,
    semaphore::{AdmissionSemaphore, Permit},
};

/// Wraps a reader factory: on first suspension point, acquires a [`Permit`]
/// (may suspend); subsequent calls do not re-acquire. A fast-forward issued
/// before any `fill_buffer` must still acquire (§4.E).
pub struct RestrictedReader<R> {
    inner: R,
    semaphore: AdmissionSemaphore,
    base_cost: i64,
    permit: Option<Permit>,
}

impl<R> RestrictedReader<R> {
    pub fn new(inner: R, semaphore: AdmissionSemaphore, base_cost: i64) -> Self {
        RestrictedReader {
            inner,
            semaphore,
            base_cost,
            permit: None,
        }
    }

    pub fn permit(&self) -> Option<&Permit> {
        self.permit.as_ref()
    }

    async fn ensure_permit(&mut self, deadline: Instant) -> Result<()> {
        if self.permit.is_none() {
            let permit = self.semaphore.wait_admission(self.base_cost, deadline).await?;
            log::debug!("restricted reader acquired permit, seq:{}", permit.sequence());
            self.permit = Some(permit);
        }
        Ok(())
    }
}

#[async_trait]
impl<R: MutationReader> MutationReader for RestrictedReader<R> {
    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn sm_forwarding(&self) -> Forwarding {
        self.inner.sm_forwarding()
    }

    fn mr_forwarding(&self) -> Forwarding {
        self.inner.mr_forwarding()
    }

    async fn fill_buffer(&mut self, deadline: Instant) -> Result<()> {
        self.ensure_permit(deadline).await?;
        self.inner.fill_buffer(deadline).await
    }

    fn pop_fragment(&mut self) -> Fragment {
        self.inner.pop_fragment()
    }

    fn peek_fragment(&self) -> &Fragment {
        self.inner.peek_fragment()
    }

    fn is_buffer_empty(&self) -> bool {
        self.inner.is_buffer_empty()
    }

    fn is_end_of_stream(&self) -> bool {
        self.inner.is_end_of_stream()
    }

    fn next_partition(&mut self) {
        self.inner.next_partition()
    }

    async fn fast_forward_to_partition_range(
        &mut self,
        range: PartitionRange,
        deadline: Instant,
    ) -> Result<()> {
        self.ensure_permit(deadline).await?;
        self.inner.fast_forward_to_partition_range(range, deadline).await
    }

    async fn fast_forward_to_position_range(
        &mut self,
        range: PositionRange,
        deadline: Instant,
    ) -> Result<()> {
        self.ensure_permit(deadline).await?;
        self.inner.fast_forward_to_position_range(range, deadline).await
    }
}

/// Drops whole partitions based on a caller-supplied predicate over
/// decorated keys; semantics equivalent to reading then filtering (§9).
pub struct FilteringReader<R, P> {
    inner: R,
    predicate: P,
    buffer: VecDeque<Fragment>,
    /// `true` while the partition currently being read from `inner` is to
    /// be dropped.
    dropping_current: bool,
}

impl<R, P> FilteringReader<R, P>
where
    P: Fn(&DecoratedKey) -> bool,
{
    pub fn new(inner: R, predicate: P) -> Self {
        FilteringReader {
            inner,
            predicate,
            buffer: VecDeque::new(),
            dropping_current: false,
        }
    }
}

#[async_trait]
impl<R, P> MutationReader for FilteringReader<R, P>
where
    R: MutationReader,
    P: Fn(&DecoratedKey) -> bool + Send,
{
    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn sm_forwarding(&self) -> Forwarding {
        self.inner.sm_forwarding()
    }

    fn mr_forwarding(&self) -> Forwarding {
        self.inner.mr_forwarding()
    }

    async fn fill_buffer(&mut self, deadline: Instant) -> Result<()> {
        self.inner.fill_buffer(deadline).await?;
        while !self.inner.is_buffer_empty() {
            let fragment = self.inner.pop_fragment();
            match &fragment {
                Fragment::PartitionStart { key, .. } => {
                    self.dropping_current = !(self.predicate)(key);
                    if !self.dropping_current {
                        self.buffer.push_back(fragment);
                    }
                }
                Fragment::PartitionEnd => {
                    if !self.dropping_current {
                        self.buffer.push_back(fragment);
                    }
                    self.dropping_current = false;
                }
                _ => {
                    if !self.dropping_current {
                        self.buffer.push_back(fragment);
                    }
                }
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
        self.buffer.is_empty() && self.inner.is_end_of_stream()
    }

    fn next_partition(&mut self) {
        while let Some(f) = self.buffer.pop_front() {
            if f.is_partition_end() {
                break;
            }
        }
        self.inner.next_partition();
    }

    async fn fast_forward_to_partition_range(
        &mut self,
        range: PartitionRange,
        deadline: Instant,
    ) -> Result<()> {
        self.buffer.clear();
        self.dropping_current = false;
        self.inner.fast_forward_to_partition_range(range, deadline).await
    }

    async fn fast_forward_to_position_range(
        &mut self,
        range: PositionRange,
        deadline: Instant,
    ) -> Result<()> {
        self.inner.fast_forward_to_position_range(range, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::{Duration, Instant};

    use super::*;
    use crate::{
        fragment::{Cell, ClusteringKey},
        key::Token,
        reader::{Mutation, VecReader},
        schema::Schema,
    };

    fn dk(b: u8) -> DecoratedKey {
        DecoratedKey::new(Token::new(vec![b]), Bytes::from(vec![b]))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn filtering_reader_drops_whole_partitions() {
        let schema = Schema::byte_ordered("t");
        let kept = Mutation::new(dk(1))
            .with_row(ClusteringKey::new(Bytes::from_static(b"a")), vec![Cell::live(0, "v", 1)]);
        let dropped = Mutation::new(dk(2))
            .with_row(ClusteringKey::new(Bytes::from_static(b"a")), vec![Cell::live(0, "v", 1)]);
        let source = VecReader::new(schema, vec![kept, dropped]);
        let mut reader = FilteringReader::new(source, |k: &DecoratedKey| k == &dk(1));

        reader.fill_buffer(deadline()).await.unwrap();
        let mut seen_keys = Vec::new();
        while !reader.is_buffer_empty() {
            if let Fragment::PartitionStart { key, .. } = reader.pop_fragment() {
                seen_keys.push(key);
            }
        }
        assert_eq!(seen_keys, vec![dk(1)]);
    }
}
