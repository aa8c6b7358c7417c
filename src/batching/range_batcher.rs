use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::BatchSource;
use crate::error::{MigrationError, Result};
use crate::models::{BatchRange, ColumnKind, OrderedKey, Relation};

/// How page boundaries are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStrategy {
    /// Keyset pagination over the batching column
    #[default]
    Keyset,
    /// Distinct values of a low-cardinality column, walked through its index
    LooseIndexScan,
}

struct ScanState {
    source: Arc<dyn BatchSource>,
    relation: Relation,
    column_name: String,
    batch_size: i64,
    strategy: BatchStrategy,
    cursor: Option<OrderedKey>,
    exhausted: bool,
}

/// Produces lazy, restartable sequences of [`BatchRange`]s
#[derive(Clone)]
pub struct RangeBatcher {
    source: Arc<dyn BatchSource>,
}

impl std::fmt::Debug for RangeBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeBatcher").finish_non_exhaustive()
    }
}

impl RangeBatcher {
    pub fn new(source: Arc<dyn BatchSource>) -> Self {
        Self { source }
    }

    /// The batching column must exist and be an integer or string column
    pub async fn validate_batch_column(&self, table_name: &str, column_name: &str) -> Result<ColumnKind> {
        match self.source.column_kind(table_name, column_name).await? {
            None => Err(MigrationError::MissingBatchColumn {
                table: table_name.to_string(),
                column: column_name.to_string(),
            }),
            Some(kind) if !kind.is_batchable() => Err(MigrationError::InvalidBatchColumn {
                table: table_name.to_string(),
                column: column_name.to_string(),
                data_type: kind.type_name().to_string(),
            }),
            Some(kind) => Ok(kind),
        }
    }

    /// Keyset batches over `column_name`
    pub async fn batches(
        &self,
        relation: &Relation,
        column_name: &str,
        batch_size: i64,
    ) -> Result<BoxStream<'static, Result<BatchRange>>> {
        self.batches_with_strategy(relation, column_name, batch_size, BatchStrategy::Keyset)
            .await
    }

    /// Batches of `batch_size` distinct values of `column_name`
    pub async fn distinct_batches(
        &self,
        relation: &Relation,
        column_name: &str,
        batch_size: i64,
    ) -> Result<BoxStream<'static, Result<BatchRange>>> {
        self.batches_with_strategy(relation, column_name, batch_size, BatchStrategy::LooseIndexScan)
            .await
    }

    /// Validate the column, then return the stream. Each call re-scans from the start.
    #[instrument(skip(self, relation), fields(table = %relation.table_name))]
    pub async fn batches_with_strategy(
        &self,
        relation: &Relation,
        column_name: &str,
        batch_size: i64,
        strategy: BatchStrategy,
    ) -> Result<BoxStream<'static, Result<BatchRange>>> {
        if batch_size <= 0 {
            return Err(MigrationError::InvalidArgument(format!(
                "batch_size must be positive, got {batch_size}"
            )));
        }
        self.validate_batch_column(&relation.table_name, column_name).await?;

        let state = ScanState {
            source: Arc::clone(&self.source),
            relation: relation.clone(),
            column_name: column_name.to_string(),
            batch_size,
            strategy,
            cursor: None,
            exhausted: false,
        };

        Ok(stream::try_unfold(state, next_page).boxed())
    }
}

async fn next_page(mut state: ScanState) -> Result<Option<(BatchRange, ScanState)>> {
    if state.exhausted {
        return Ok(None);
    }

    let after = state.cursor.as_ref();
    let page = match state.strategy {
        BatchStrategy::Keyset => {
            state
                .source
                .next_range(&state.relation, &state.column_name, after, state.batch_size)
                .await?
        }
        BatchStrategy::LooseIndexScan => {
            state
                .source
                .next_distinct_range(&state.relation, &state.column_name, after, state.batch_size)
                .await?
        }
    };

    let Some(page) = page else {
        return Ok(None);
    };

    debug!(range = %page.range, rows = page.rows, "📏 Batch range");
    // A short page means the scan reached the end.
    state.exhausted = page.rows < state.batch_size;
    state.cursor = Some(page.range.upper_bound.clone());
    Ok(Some((page.range, state)))
}
