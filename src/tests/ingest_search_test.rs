//! Ingest -> index -> search, end to end, against a freshly wired harness
//! instead of any single component's unit tests.

use super::common::{record, Harness};

#[tokio::test]
async fn ingested_records_are_searchable_newest_first() {
    let harness = Harness::new();
    harness
        .index
        .index(vec![
            record("app", "alpha ERROR", 1625097600000),
            record("app", "beta INFO", 1625097660000),
            record("app", "alpha WARN", 1625097720000),
        ])
        .await
        .unwrap();

    let results = harness
        .search
        .search(Some("alpha"), false, Some("custom"), Some(1625097600000), Some(1625097800000), 1625097800000)
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].message, "alpha WARN");
    assert_eq!(results[1].message, "alpha ERROR");
}

#[tokio::test]
async fn second_search_for_same_window_is_served_from_cache() {
    let harness = Harness::new();
    harness.index.index(vec![record("app", "one match", 1000)]).await.unwrap();

    assert_eq!(harness.cache.stats().misses, 0);
    let first = harness
        .search
        .search(Some("match"), false, Some("custom"), Some(0), Some(2000), 5000)
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(harness.cache.stats().misses, 1);

    let second = harness
        .search
        .search(Some("match"), false, Some("custom"), Some(0), Some(2000), 5000)
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(harness.cache.stats().hits, 1);
}
