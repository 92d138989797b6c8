// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Merging mutation-reader subsystem.
//!
//! Fuses K ordered streams of partitioned, clustered, timestamped row
//! fragments ("mutation readers") into a single totally-ordered stream with
//! conflict resolution, range-tombstone semantics, lazy reader selection,
//! forward-only fast-forwarding, and admission-controlled resource usage.
//!
//! Module layout mirrors the component split of the design: [`key`] and
//! [`fragment`] are the data model (component A), [`reader`] is the pull
//! contract every source obeys (component B), [`selector`] lazily produces
//! readers for the merge cursor (component C), [`merge`] is the combined
//! reader / merge engine (component D), and [`semaphore`] is the admission
//! controller and resource tracker (component E).

pub mod decorators;
pub mod error;
pub mod fragment;
pub mod key;
pub mod merge;
pub mod reader;
pub mod schema;
pub mod selector;
pub mod semaphore;
pub mod slice;
pub mod tracked;

pub use error::{Error, Result};
