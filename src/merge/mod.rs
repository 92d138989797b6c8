// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Combined reader / merge engine (component D, §4.D).

mod combined;
mod sweep;

pub use combined::{CombinedReader, MergeConfig};
