//! Search Service: the public surface over the Index Engine,
//! wrapping every read with the Search Cache and the Redactor.

mod export;

use std::sync::Arc;

use axum::response::sse::Event;
use chrono::{SecondsFormat, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::SearchCache;
use crate::error::{GrepWiseError, GrepWiseResult};
use crate::index::IndexEngine;
use crate::record::LogRecord;
use crate::redactor::Redactor;

pub use export::{export_csv, export_json};

pub const DEFAULT_SYNC_RANGE_MS: i64 = 24 * 3_600_000;
pub const DEFAULT_STREAM_RANGE_MS: i64 = 30 * 24 * 3_600_000;
pub const HIST_SNAPSHOT_INTERVAL: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

/// Resolves the `{1h,3h,12h,24h,custom}` range parameter into a concrete
/// `[start, end)` window. `range = None` applies `default_ms`.
pub fn resolve_range(
    range: Option<&str>,
    start: Option<i64>,
    end: Option<i64>,
    now: i64,
    default_ms: i64,
) -> GrepWiseResult<TimeWindow> {
    let duration_ms = match range {
        None => default_ms,
        Some("1h") => 3_600_000,
        Some("3h") => 3 * 3_600_000,
        Some("12h") => 12 * 3_600_000,
        Some("24h") => 24 * 3_600_000,
        Some("custom") => {
            let (s, e) = match (start, end) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    return Err(GrepWiseError::invalid_input(
                        "custom range requires startTime and endTime",
                    ))
                },
            };
            if s >= e {
                return Err(GrepWiseError::invalid_input("startTime must be before endTime"));
            }
            return Ok(TimeWindow { start: s, end: e });
        },
        Some(other) => {
            return Err(GrepWiseError::invalid_input(format!("unknown range `{other}`")))
        },
    };
    Ok(TimeWindow { start: now - duration_ms, end: now })
}

#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<LogRecord>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub struct SearchService {
    index: Arc<IndexEngine>,
    cache: Arc<SearchCache>,
    redactor: Arc<Redactor>,
}

impl SearchService {
    pub fn new(index: Arc<IndexEngine>, cache: Arc<SearchCache>, redactor: Arc<Redactor>) -> Self {
        Self { index, cache, redactor }
    }

    /// Runs a search, transparently consulting (and populating) the cache,
    /// and redacting every record before returning it.
    fn search_redacted(
        &self,
        query: Option<&str>,
        is_regex: bool,
        window: TimeWindow,
        now: i64,
    ) -> GrepWiseResult<Vec<LogRecord>> {
        let key = SearchCache::key(query, is_regex, window.start, window.end);
        if let Some(cached) = self.cache.get(&key, now) {
            return Ok(self.redactor.redact_all(cached));
        }
        let records = self.index.search(query, is_regex, window.start, window.end)?;
        self.cache.put(key, records.clone(), window.start, window.end, now);
        Ok(self.redactor.redact_all(records))
    }

    pub fn search(
        &self,
        query: Option<&str>,
        is_regex: bool,
        range: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
        now: i64,
    ) -> GrepWiseResult<Vec<LogRecord>> {
        let window = resolve_range(range, start, end, now, DEFAULT_SYNC_RANGE_MS)?;
        self.search_redacted(query, is_regex, window, now)
    }

    pub fn search_page(
        &self,
        query: Option<&str>,
        is_regex: bool,
        range: Option<&str>,
        start: Option<i64>,
        end: Option<i64>,
        page: usize,
        page_size: usize,
        now: i64,
    ) -> GrepWiseResult<Page> {
        if page < 1 {
            return Err(GrepWiseError::invalid_input("page must be >= 1"));
        }
        if !(1..=10_000).contains(&page_size) {
            return Err(GrepWiseError::invalid_input("pageSize must be in [1, 10000]"));
        }
        let window = resolve_range(range, start, end, now, DEFAULT_SYNC_RANGE_MS)?;
        let all = self.search_redacted(query, is_regex, window, now)?;
        let total = all.len();
        let offset = (page - 1) * page_size;
        let items = all.into_iter().skip(offset).take(page_size).collect();
        Ok(Page { items, total, page, page_size })
    }

    pub fn find_by_id(&self, id: &str, reveal: bool) -> Option<LogRecord> {
        let record = self.index.find_by_id(id)?;
        Some(if reveal { record } else { self.redactor.redact(&record) })
    }

    /// `slots` equal contiguous buckets across `[start, end)`, as used by
    /// `/logs/time-aggregation`.
    pub fn time_aggregation(
        &self,
        query: Option<&str>,
        is_regex: bool,
        start: i64,
        end: i64,
        slots: usize,
        now: i64,
    ) -> GrepWiseResult<Vec<(i64, u64)>> {
        if !(1..=1024).contains(&slots) {
            return Err(GrepWiseError::invalid_input("slots must be in [1, 1024]"));
        }
        if start >= end {
            return Err(GrepWiseError::invalid_input("start must be before end"));
        }
        let records = self.search_redacted(query, is_regex, TimeWindow { start, end }, now)?;
        let bucket_width = ((end - start) as f64 / slots as f64).ceil() as i64;
        let mut counts = vec![0u64; slots];
        for record in &records {
            let idx = bucket_index(record.effective_time(), start, bucket_width, slots);
            counts[idx] += 1;
        }
        Ok((0..slots).map(|i| (start + i as i64 * bucket_width, counts[i])).collect())
    }

    /// Fixed-width `interval`-ms buckets across `[start, end)`, as used by
    /// `/logs/histogram`, timestamped with ISO-8601 UTC bucket starts.
    pub fn histogram(
        &self,
        query: Option<&str>,
        is_regex: bool,
        start: i64,
        end: i64,
        interval_ms: i64,
        now: i64,
    ) -> GrepWiseResult<Vec<(String, u64)>> {
        if interval_ms <= 0 {
            return Err(GrepWiseError::invalid_input("interval must be positive"));
        }
        if start >= end {
            return Err(GrepWiseError::invalid_input("start must be before end"));
        }
        let records = self.search_redacted(query, is_regex, TimeWindow { start, end }, now)?;
        let bucket_count = ((end - start) as f64 / interval_ms as f64).ceil() as usize;
        let mut counts = vec![0u64; bucket_count.max(1)];
        for record in &records {
            let idx = bucket_index(record.effective_time(), start, interval_ms, bucket_count.max(1));
            counts[idx] += 1;
        }
        Ok((0..counts.len())
            .map(|i| (iso8601(start + i as i64 * interval_ms), counts[i]))
            .collect())
    }

    /// Streams progressive paginated results over SSE: `init`, one `page`,
    /// then `done`.
    pub fn stream_search(
        self: Arc<Self>,
        query: Option<String>,
        is_regex: bool,
        page_size: usize,
        now: i64,
    ) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let window =
                TimeWindow { start: now - DEFAULT_STREAM_RANGE_MS, end: now };
            let result = self.search_redacted(query.as_deref(), is_regex, window, now);
            match result {
                Ok(records) => {
                    let total = records.len();
                    let bucket_count = total.div_ceil(page_size.max(1));
                    let _ = tx
                        .send(sse_json(
                            "init",
                            serde_json::json!({ "start": window.start, "end": window.end, "bucketCount": bucket_count }),
                        ))
                        .await;
                    let page: Vec<&LogRecord> = records.iter().take(page_size).collect();
                    let _ = tx.send(sse_json("page", serde_json::json!(page))).await;
                    let _ = tx.send(sse_json("done", serde_json::json!({ "total": total }))).await;
                },
                Err(err) => {
                    let _ = tx.send(sse_json("error", err.to_body())).await;
                },
            }
        });
        ReceiverStream::new(rx)
    }

    /// Streams a live-updating histogram over SSE: `init` with zeroed
    /// buckets, an incremental `hist` snapshot every 200 records, a final
    /// `hist`, then `done`.
    pub fn stream_timetable(
        self: Arc<Self>,
        query: Option<String>,
        is_regex: bool,
        interval_ms: i64,
        now: i64,
    ) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let start = now - DEFAULT_STREAM_RANGE_MS;
            let end = now;
            let bucket_count = (((end - start) as f64 / interval_ms as f64).ceil() as usize).max(1);
            let bucket_starts: Vec<i64> = (0..bucket_count).map(|i| start + i as i64 * interval_ms).collect();

            let _ = tx
                .send(sse_json(
                    "init",
                    serde_json::json!({
                        "buckets": bucket_starts.iter().map(|t| iso8601(*t)).collect::<Vec<_>>(),
                        "counts": vec![0u64; bucket_count],
                    }),
                ))
                .await;

            let result = self.search_redacted(query.as_deref(), is_regex, TimeWindow { start, end }, now);
            let records = match result {
                Ok(records) => records,
                Err(err) => {
                    let _ = tx.send(sse_json("error", err.to_body())).await;
                    return;
                },
            };

            let mut counts = vec![0u64; bucket_count];
            for (processed, record) in records.iter().enumerate() {
                let idx = bucket_index(record.effective_time(), start, interval_ms, bucket_count);
                counts[idx] += 1;
                if (processed + 1) % HIST_SNAPSHOT_INTERVAL == 0 {
                    let _ = tx.send(hist_event(&bucket_starts, &counts)).await;
                }
            }
            let _ = tx.send(hist_event(&bucket_starts, &counts)).await;
            let _ = tx.send(sse_json("done", serde_json::json!({ "total": records.len() }))).await;
        });
        ReceiverStream::new(rx)
    }
}

fn hist_event(bucket_starts: &[i64], counts: &[u64]) -> Event {
    sse_json(
        "hist",
        serde_json::json!({
            "buckets": bucket_starts.iter().map(|t| iso8601(*t)).collect::<Vec<_>>(),
            "counts": counts,
        }),
    )
}

fn sse_json(event: &str, payload: serde_json::Value) -> Event {
    Event::default().event(event).data(payload.to_string())
}

fn bucket_index(effective_time: i64, start: i64, width: i64, bucket_count: usize) -> usize {
    let idx = (effective_time - start) / width.max(1);
    idx.clamp(0, bucket_count as i64 - 1) as usize
}

fn iso8601(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Derives a streaming-histogram interval that yields roughly 30 buckets
/// across `[start, end)` streaming default. Daily buckets
/// once the range is 25 days or wider.
pub fn derive_streaming_interval_ms(range_ms: i64) -> i64 {
    const DAY_MS: i64 = 24 * 3_600_000;
    if range_ms >= 25 * DAY_MS {
        DAY_MS
    } else {
        (range_ms / 30).max(60_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::record::LogRecordBuilder;
    use crate::redactor::RedactionConfigFile;

    fn service(dir: &std::path::Path) -> SearchService {
        let index = Arc::new(IndexEngine::open(dir.to_path_buf()).unwrap());
        let cache = Arc::new(SearchCache::new(CacheConfig::default()));
        let redactor = Arc::new(Redactor::new(Default::default()).unwrap());
        SearchService::new(index, cache, redactor)
    }

    #[tokio::test]
    async fn search_page_validates_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(svc.search_page(None, false, None, None, None, 0, 10, 1000).is_err());
        assert!(svc.search_page(None, false, None, None, None, 1, 20_000, 1000).is_err());
    }

    #[tokio::test]
    async fn custom_range_requires_start_and_end() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let err = svc.search(None, false, Some("custom"), None, None, 1000).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn histogram_buckets_three_minutes_of_one_per_minute() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        let base = 1625097600000;
        index
            .index(vec![
                LogRecordBuilder::new("s", "a").record_time(Some(base)).build(base, i64::MAX),
                LogRecordBuilder::new("s", "b").record_time(Some(base + 60_000)).build(base, i64::MAX),
                LogRecordBuilder::new("s", "c").record_time(Some(base + 120_000)).build(base, i64::MAX),
            ])
            .await
            .unwrap();
        let cache = Arc::new(SearchCache::new(CacheConfig::default()));
        let redactor = Arc::new(Redactor::new(Default::default()).unwrap());
        let svc = SearchService::new(Arc::new(index), cache, redactor);

        let buckets =
            svc.histogram(None, false, base, base + 180_000, 60_000, base + 200_000).unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets.iter().map(|(_, c)| *c).collect::<Vec<_>>(), vec![1, 1, 1]);
    }

    #[test]
    fn streaming_interval_uses_daily_buckets_past_25_days() {
        let range_ms = 30 * 24 * 3_600_000;
        assert_eq!(derive_streaming_interval_ms(range_ms), 24 * 3_600_000);
    }

    /// A repeated search that hits the cache must still redact every time,
    /// not just on the first (index-backed) call.
    #[tokio::test]
    async fn cache_hit_results_are_still_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        index
            .index(vec![LogRecordBuilder::new("s", "password=hunter2")
                .message("password=hunter2")
                .record_time(Some(1000))
                .build(1000, i64::MAX)])
            .await
            .unwrap();

        let cache = Arc::new(SearchCache::new(CacheConfig::default()));
        let redactor = Arc::new(
            Redactor::new(RedactionConfigFile {
                keys: vec![],
                patterns: vec![r"password=\w+".to_string()],
            })
            .unwrap(),
        );
        let svc = SearchService::new(Arc::new(index), cache, redactor);

        let first =
            svc.search(None, false, Some("custom"), Some(0), Some(2000), 5000).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].message.contains(crate::redactor::MASK));

        // Second call is a cache hit; it must come back redacted too.
        let second =
            svc.search(None, false, Some("custom"), Some(0), Some(2000), 5000).unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0].message.contains(crate::redactor::MASK));
        assert!(!second[0].message.contains("hunter2"));
    }
}
