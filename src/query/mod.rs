//! SPL-like pipelined query language.
//!
//! `pipeline := stage ('|' stage)*`. The first stage, if it isn't one of the
//! named keywords, is treated as an implicit `search <expr>`. Once a `stats`
//! stage runs the working set switches from `LOG_ENTRIES` to `STATISTICS`
//! and stays tagged that way for any stages downstream.

mod eval;
mod lexer;
mod stats;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{GrepWiseError, GrepWiseResult};
use crate::index::IndexEngine;
use crate::record::LogRecord;

pub use eval::{BoolExpr, CompareOp, FieldSource, FieldValue, SetField, ValueExpr};
pub use stats::AggKind;

#[derive(Debug, Clone)]
pub enum Stage {
    Search { expr: String },
    Where { expr: BoolExpr },
    Eval { name: String, expr: ValueExpr },
    Stats { agg: AggKind, field: Option<String>, by: Vec<String> },
    Sort { field: String, desc: bool },
    Head(usize),
    Tail(usize),
}

pub type Row = BTreeMap<String, FieldValue>;

/// Running total of `query.row.errors`: rows skipped by `where`/`eval`
/// evaluation failures across every pipeline executed in this process.
static ROW_ERRORS_TOTAL: AtomicU64 = AtomicU64::new(0);

pub fn row_errors_total() -> u64 {
    ROW_ERRORS_TOTAL.load(Ordering::Relaxed)
}

/// The tagged output of a pipeline: either the raw records a `search` stage
/// produced, or the tuple rows a `stats` stage aggregated them into.
#[derive(Debug, Clone)]
pub enum QueryResult {
    LogEntries(Vec<LogRecord>),
    Statistics { columns: Vec<String>, rows: Vec<Row> },
}

/// Parses pipeline text into an ordered list of stages. Splits on `|`
/// outside double quotes; a parse failure reports the byte offset of the
/// offending stage
pub fn parse(text: &str) -> GrepWiseResult<Vec<Stage>> {
    let segments = lexer::split_pipeline(text);
    if segments.is_empty() {
        return Err(GrepWiseError::invalid_input("empty query"));
    }

    let mut stages = Vec::with_capacity(segments.len());
    for (idx, (offset, segment)) in segments.into_iter().enumerate() {
        let trimmed = segment.trim();
        let stage = if idx == 0 && !lexer::starts_with_keyword(trimmed) {
            Stage::Search { expr: trimmed.to_string() }
        } else {
            parse_stage(trimmed, offset)?
        };
        stages.push(stage);
    }
    Ok(stages)
}

fn parse_stage(text: &str, offset: usize) -> GrepWiseResult<Stage> {
    let err = |msg: String| {
        GrepWiseError::invalid_input(format!("invalid query at byte {offset}: {msg}"))
    };

    let (keyword, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let rest = rest.trim();
    match keyword {
        "search" => Ok(Stage::Search { expr: rest.to_string() }),
        "where" => Ok(Stage::Where { expr: eval::parse_bool_expr(rest).map_err(err)? }),
        "eval" => {
            let (name, expr_text) =
                rest.split_once('=').ok_or_else(|| err("eval requires name = expr".to_string()))?;
            let expr = eval::parse_value_expr(expr_text.trim()).map_err(err)?;
            Ok(Stage::Eval { name: name.trim().to_string(), expr })
        },
        "stats" => stats::parse_stats_stage(rest).map_err(err),
        "sort" => {
            let mut parts = rest.split_whitespace();
            let field = parts.next().ok_or_else(|| err("sort requires a field".to_string()))?;
            let desc = matches!(parts.next(), Some("desc"));
            Ok(Stage::Sort { field: field.to_string(), desc })
        },
        "head" => {
            let n: usize = rest
                .trim()
                .parse()
                .map_err(|_| err("head requires a positive integer".to_string()))?;
            Ok(Stage::Head(n))
        },
        "tail" => {
            let n: usize = rest
                .trim()
                .parse()
                .map_err(|_| err("tail requires a positive integer".to_string()))?;
            Ok(Stage::Tail(n))
        },
        other => Err(err(format!("unknown stage `{other}`"))),
    }
}

enum Working {
    Records(Vec<LogRecord>),
    Rows(Vec<Row>),
}

/// Executes a parsed pipeline against the Index Engine. The leading `search`
/// stage (implicit or explicit) always runs first and supplies the initial
/// record set; everything after composes on top of it.
pub fn execute(
    index: &IndexEngine,
    stages: &[Stage],
    start_time: i64,
    end_time: i64,
) -> GrepWiseResult<QueryResult> {
    let mut row_errors: u64 = 0;
    let mut working = match stages.first() {
        Some(Stage::Search { expr }) => {
            let (query, is_regex) = split_regex_prefix(expr);
            Working::Records(index.search(query, is_regex, start_time, end_time)?)
        },
        _ => Working::Records(index.search(None, false, start_time, end_time)?),
    };

    let remaining = if matches!(stages.first(), Some(Stage::Search { .. })) {
        &stages[1..]
    } else {
        stages
    };

    for stage in remaining {
        working = apply_stage(working, stage, &mut row_errors)?;
    }

    if row_errors > 0 {
        let total = ROW_ERRORS_TOTAL.fetch_add(row_errors, Ordering::Relaxed) + row_errors;
        tracing::debug!(row_errors, total, "query evaluation skipped rows due to per-row errors");
    }

    Ok(match working {
        Working::Records(records) => QueryResult::LogEntries(records),
        Working::Rows(rows) => {
            let columns = rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
            QueryResult::Statistics { columns, rows }
        },
    })
}

/// `regex:<pattern>` switches the implicit/explicit search stage to regex
/// mode, matching the Alarm Engine's convention.
fn split_regex_prefix(expr: &str) -> (Option<&str>, bool) {
    match expr.strip_prefix("regex:") {
        Some(pattern) => (Some(pattern), true),
        None => (if expr.is_empty() { None } else { Some(expr) }, false),
    }
}

fn apply_stage(working: Working, stage: &Stage, row_errors: &mut u64) -> GrepWiseResult<Working> {
    Ok(match (working, stage) {
        (Working::Records(records), Stage::Search { expr }) => {
            let (query, is_regex) = split_regex_prefix(expr);
            let needle_lower = query.map(str::to_lowercase);
            Working::Records(
                records
                    .into_iter()
                    .filter(|r| match (&needle_lower, is_regex) {
                        (None, _) => true,
                        (Some(q), false) if q == "*" => true,
                        (Some(q), false) => {
                            r.message.to_lowercase().contains(q.as_str())
                                || r.raw_content.to_lowercase().contains(q.as_str())
                        },
                        (Some(q), true) => regex::Regex::new(q)
                            .map(|re| re.is_match(&r.message) || re.is_match(&r.raw_content))
                            .unwrap_or(false),
                    })
                    .collect(),
            )
        },
        (Working::Records(records), Stage::Where { expr }) => {
            Working::Records(eval::filter(records, expr, row_errors))
        },
        (Working::Rows(rows), Stage::Where { expr }) => {
            Working::Rows(eval::filter(rows, expr, row_errors))
        },
        (Working::Records(records), Stage::Eval { name, expr }) => {
            Working::Records(eval::eval_into(records, name, expr, row_errors))
        },
        (Working::Rows(rows), Stage::Eval { name, expr }) => {
            Working::Rows(eval::eval_into(rows, name, expr, row_errors))
        },
        (Working::Records(records), Stage::Stats { agg, field, by }) => {
            Working::Rows(stats::aggregate(&records, *agg, field.as_deref(), by))
        },
        (Working::Rows(rows), Stage::Stats { agg, field, by }) => {
            Working::Rows(stats::aggregate(&rows, *agg, field.as_deref(), by))
        },
        (Working::Records(mut records), Stage::Sort { field, desc }) => {
            eval::sort_by_field(&mut records, field, *desc);
            Working::Records(records)
        },
        (Working::Rows(mut rows), Stage::Sort { field, desc }) => {
            eval::sort_by_field(&mut rows, field, *desc);
            Working::Rows(rows)
        },
        (Working::Records(records), Stage::Head(n)) => {
            Working::Records(records.into_iter().take(*n).collect())
        },
        (Working::Rows(rows), Stage::Head(n)) => Working::Rows(rows.into_iter().take(*n).collect()),
        (Working::Records(records), Stage::Tail(n)) => {
            let start = records.len().saturating_sub(*n);
            Working::Records(records[start..].to_vec())
        },
        (Working::Rows(rows), Stage::Tail(n)) => {
            let start = rows.len().saturating_sub(*n);
            Working::Rows(rows[start..].to_vec())
        },
        // A `search` stage after `stats` has nothing left to full-text
        // search over; rows pass through unchanged.
        (rows @ Working::Rows(_), Stage::Search { .. }) => rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    fn rec(level: &str, source: &str, message: &str, t: i64) -> LogRecord {
        LogRecordBuilder::new(source, message)
            .level(level)
            .message(message)
            .record_time(Some(t))
            .build(t, i64::MAX)
    }

    #[tokio::test]
    async fn implicit_search_stats_by_level_produces_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        index
            .index(vec![
                rec("ERROR", "app", "boom", 100),
                rec("ERROR", "app", "boom again", 200),
                rec("INFO", "app", "fine", 300),
            ])
            .await
            .unwrap();

        let stages = parse("* | stats count() by level").unwrap();
        let result = execute(&index, &stages, 0, i64::MAX).unwrap();
        match result {
            QueryResult::Statistics { columns, rows } => {
                assert!(columns.contains(&"level".to_string()));
                assert!(columns.contains(&"count".to_string()));
                assert_eq!(rows.len(), 2);
            },
            QueryResult::LogEntries(_) => panic!("expected statistics"),
        }
    }

    #[tokio::test]
    async fn where_and_sort_and_head_compose() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        index
            .index(vec![
                rec("ERROR", "app", "boom", 100),
                rec("WARN", "app", "careful", 200),
                rec("ERROR", "app", "boom loud", 300),
            ])
            .await
            .unwrap();

        let stages = parse("* | where level = \"ERROR\" | sort recordTime desc | head 1").unwrap();
        let result = execute(&index, &stages, 0, i64::MAX).unwrap();
        match result {
            QueryResult::LogEntries(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].message, "boom loud");
            },
            QueryResult::Statistics { .. } => panic!("expected log entries"),
        }
    }

    #[test]
    fn parse_rejects_unknown_stage() {
        let err = parse("search * | bogus stage").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn where_on_missing_field_counts_row_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexEngine::open(dir.path().to_path_buf()).unwrap();
        index.index(vec![rec("INFO", "app", "fine", 100)]).await.unwrap();

        let before = row_errors_total();
        let stages = parse("* | where nosuchfield = \"x\"").unwrap();
        let result = execute(&index, &stages, 0, i64::MAX).unwrap();
        match result {
            QueryResult::LogEntries(records) => assert!(records.is_empty()),
            QueryResult::Statistics { .. } => panic!("expected log entries"),
        }
        assert_eq!(row_errors_total(), before + 1);
    }
}
