//! # Range Batching
//!
//! Slices a relation into ascending, contiguous `[min, max]` windows of at
//! most `batch_size` matching rows.
//!
//! Every page is its own short read against the [`BatchSource`]; no
//! transaction is held across the scan. Ranges are coarse scan bounds, so a
//! worker re-applies the relation's predicate when it executes one.

pub mod range_batcher;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BatchRange, ColumnKind, OrderedKey, Relation};

pub use range_batcher::{BatchStrategy, RangeBatcher};

/// One page of the scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPage {
    pub range: BatchRange,
    /// Matching rows (or distinct values) the page covered
    pub rows: i64,
}

/// Ordered range queries over a relational store
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Type class of `table.column`, or `None` when the column does not exist
    async fn column_kind(&self, table_name: &str, column_name: &str) -> Result<Option<ColumnKind>>;

    /// Next `batch_size` matching rows with `column > after`, ordered by `column`
    async fn next_range(
        &self,
        relation: &Relation,
        column_name: &str,
        after: Option<&OrderedKey>,
        batch_size: i64,
    ) -> Result<Option<BatchPage>>;

    /// Next `batch_size` distinct values of `column` greater than `after`
    async fn next_distinct_range(
        &self,
        relation: &Relation,
        column_name: &str,
        after: Option<&OrderedKey>,
        batch_size: i64,
    ) -> Result<Option<BatchPage>>;
}
