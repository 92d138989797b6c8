// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Slice: the clustering-row ranges and column selector a reader is asked
//! to honour (§6.2). Sources may elide fragments outside the slice; the
//! merge engine itself does not re-filter, so correctness of "elided" data
//! rests with the source, matching the contract boundary in §6.

use crate::fragment::PositionRange;

/// Clustering-row ranges plus a column selector restricting what a reader
/// must emit. `columns = None` means "all columns".
#[derive(Debug, Clone)]
pub struct Slice {
    pub ranges: Vec<PositionRange>,
    pub columns: Option<Vec<u32>>,
}

impl Slice {
    pub fn all() -> Self {
        Slice {
            ranges: vec![PositionRange::all()],
            columns: None,
        }
    }

    pub fn with_columns(columns: Vec<u32>) -> Self {
        let mut slice = Slice::all();
        slice.columns = Some(columns);
        slice
    }

    pub fn wants_column(&self, column_id: u32) -> bool {
        match &self.columns {
            None => true,
            Some(cols) => cols.contains(&column_id),
        }
    }
}
