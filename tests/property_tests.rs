//! Property tests for range coverage and delay arithmetic

use futures::TryStreamExt;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use batched_migrations::batching::RangeBatcher;
use batched_migrations::database::InMemoryStore;
use batched_migrations::models::{BatchRange, ColumnKind, OrderedKey, Relation};
use batched_migrations::orchestration::delay_for;

fn scan(ids: &BTreeSet<i64>, batch_size: i64, distinct: bool) -> Vec<BatchRange> {
    let store = InMemoryStore::new();
    store.create_table("events", &[("id", ColumnKind::Integer)]);
    store.insert_ids("events", "id", ids.iter().copied()).unwrap();
    let batcher = RangeBatcher::new(Arc::new(store));
    let relation = Relation::table("events");

    tokio_test::block_on(async {
        let stream = if distinct {
            batcher.distinct_batches(&relation, "id", batch_size).await.unwrap()
        } else {
            batcher.batches(&relation, "id", batch_size).await.unwrap()
        };
        stream.try_collect().await.unwrap()
    })
}

proptest! {
    /// Property: ranges ascend, never overlap and cover every row
    #[test]
    fn ranges_cover_every_row_in_order(
        ids in prop::collection::btree_set(-10_000i64..10_000, 0..300),
        batch_size in 1i64..64,
        distinct in any::<bool>(),
    ) {
        let ranges = scan(&ids, batch_size, distinct);

        for range in &ranges {
            prop_assert!(range.lower_bound <= range.upper_bound);
        }
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].upper_bound < pair[1].lower_bound, "{} overlaps {}", pair[0], pair[1]);
        }
        for id in &ids {
            let key = OrderedKey::Int(*id);
            prop_assert!(ranges.iter().any(|range| range.contains(&key)), "{} not covered", id);
        }

        let expected = (ids.len() as i64 + batch_size - 1) / batch_size;
        prop_assert_eq!(ranges.len() as i64, expected);
    }

    /// Property: delays are zero-based and strictly increasing for a positive interval
    #[test]
    fn delays_are_zero_based_multiples(
        interval_secs in 1u64..10_000,
        initial_secs in 0u64..1_000,
        jobs in 1usize..200,
    ) {
        let interval = Duration::from_secs(interval_secs);
        let initial = Duration::from_secs(initial_secs);
        let delays: Vec<Duration> = (0..jobs).map(|i| delay_for(initial, interval, i)).collect();

        prop_assert_eq!(delays[0], initial);
        for (i, pair) in delays.windows(2).enumerate() {
            prop_assert!(pair[0] < pair[1]);
            prop_assert_eq!(pair[1] - pair[0], interval, "gap after job {}", i);
        }
        prop_assert_eq!(*delays.last().unwrap(), initial + interval * (jobs as u32 - 1));
    }
}
