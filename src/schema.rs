// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Schema: column-type-aware comparators and the partitioner.
//!
//! Real schema parsing and the typed-datum system are out of scope (§1); a
//! reader only needs a clustering-key comparator and a partitioner, both of
//! which are schema-dependent per §3. `Schema` models exactly that boundary:
//! it is `Clone`-cheap (`Arc`-backed, like `common_types::schema::Schema` in
//! the teacher) and immutable for the lifetime of a reader (§4.B).

use std::{cmp::Ordering, fmt, sync::Arc};

use bytes::Bytes;

use crate::key::{DecoratedKey, Token};

type ClusteringComparator = dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync;
type Partitioner = dyn Fn(&[u8]) -> Token + Send + Sync;

struct Inner {
    name: String,
    clustering_comparator: Box<ClusteringComparator>,
    partitioner: Box<Partitioner>,
}

/// Immutable, cheaply cloned schema handle.
#[derive(Clone)]
pub struct Schema {
    inner: Arc<Inner>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("name", &self.inner.name).finish()
    }
}

impl Schema {
    /// Builds a schema from an explicit clustering comparator and
    /// partitioner; used when the caller's clustering key has non-byte-wise
    /// ordering (e.g. reversed columns, numeric columns).
    pub fn new<C, P>(name: impl Into<String>, clustering_comparator: C, partitioner: P) -> Self
    where
        C: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
        P: Fn(&[u8]) -> Token + Send + Sync + 'static,
    {
        Schema {
            inner: Arc::new(Inner {
                name: name.into(),
                clustering_comparator: Box::new(clustering_comparator),
                partitioner: Box::new(partitioner),
            }),
        }
    }

    /// Schema with plain byte-lexical clustering order and a byte-identity
    /// partitioner (tokens equal keys). Good enough for unit tests and for
    /// sources whose partitioner already produced the token out-of-band.
    pub fn byte_ordered(name: impl Into<String>) -> Self {
        Schema::new(name, |a, b| a.cmp(b), |k| Token::new(Bytes::copy_from_slice(k)))
    }

    pub fn compare_clustering(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.inner.clustering_comparator)(a, b)
    }

    pub fn token_of(&self, key: &[u8]) -> Token {
        (self.inner.partitioner)(key)
    }

    pub fn decorate(&self, key: impl Into<Bytes>) -> DecoratedKey {
        let key = key.into();
        let token = self.token_of(&key);
        DecoratedKey { token, key }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ordered_decorates_with_identity_token() {
        let schema = Schema::byte_ordered("test");
        let dk = schema.decorate(Bytes::from_static(b"row1"));
        assert_eq!(dk.token.as_bytes(), b"row1");
        assert_eq!(&dk.key[..], b"row1");
    }

    #[test]
    fn custom_comparator_can_reverse_order() {
        let schema = Schema::new("rev", |a, b| b.cmp(a), |k| Token::new(Bytes::copy_from_slice(k)));
        assert_eq!(schema.compare_clustering(b"a", b"b"), Ordering::Greater);
    }
}
