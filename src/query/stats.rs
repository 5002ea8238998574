//! `stats <agg>(field?) [by <field>,...]` aggregation stage.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::eval::{FieldSource, FieldValue};
use super::{Row, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    DistinctCount,
}

impl AggKind {
    fn column_name(self, field: Option<&str>) -> String {
        match self {
            AggKind::Count => "count".to_string(),
            AggKind::Sum => format!("sum_{}", field.unwrap_or("")),
            AggKind::Avg => format!("avg_{}", field.unwrap_or("")),
            AggKind::Min => format!("min_{}", field.unwrap_or("")),
            AggKind::Max => format!("max_{}", field.unwrap_or("")),
            AggKind::DistinctCount => format!("distinct_count_{}", field.unwrap_or("")),
        }
    }
}

static STATS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(count|sum|avg|min|max|distinct_count)\(\s*([^)]*)\s*\)$").unwrap());

pub fn parse_stats_stage(text: &str) -> Result<Stage, String> {
    let (agg_part, by_part) = match text.split_once(" by ") {
        Some((a, b)) => (a.trim(), Some(b.trim())),
        None => (text.trim(), None),
    };

    let captures = STATS_PATTERN
        .captures(agg_part)
        .ok_or_else(|| format!("invalid stats aggregation `{agg_part}`"))?;
    let agg = match &captures[1] {
        "count" => AggKind::Count,
        "sum" => AggKind::Sum,
        "avg" => AggKind::Avg,
        "min" => AggKind::Min,
        "max" => AggKind::Max,
        "distinct_count" => AggKind::DistinctCount,
        other => return Err(format!("unknown aggregation `{other}`")),
    };
    let field_text = captures[2].trim();
    let field = if field_text.is_empty() { None } else { Some(field_text.to_string()) };
    if agg != AggKind::Count && field.is_none() {
        return Err(format!("{:?} requires a field argument", agg));
    }

    let by = by_part
        .map(|b| b.split(',').map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect())
        .unwrap_or_default();

    Ok(Stage::Stats { agg, field, by })
}

/// Groups `items` by `by` fields (stringified) and computes one aggregate
/// column. Rows with no `by` fields collapse to a single overall row.
pub fn aggregate<T: FieldSource>(
    items: &[T],
    agg: AggKind,
    field: Option<&str>,
    by: &[String],
) -> Vec<Row> {
    let mut groups: HashMap<Vec<String>, Vec<&T>> = HashMap::new();
    for item in items {
        let key: Vec<String> = by
            .iter()
            .map(|f| item.field(f).map(|v| display(&v)).unwrap_or_default())
            .collect();
        groups.entry(key).or_default().push(item);
    }

    let column = agg.column_name(field);
    let mut rows: Vec<Row> = groups
        .into_iter()
        .map(|(key, members)| {
            let mut row = Row::new();
            for (by_field, value) in by.iter().zip(key.iter()) {
                row.insert(by_field.clone(), FieldValue::Str(value.clone()));
            }
            row.insert(column.clone(), compute(agg, field, &members));
            row
        })
        .collect();

    rows.sort_by(|a, b| {
        let a_key: Vec<String> = by.iter().map(|f| display_opt(a.get(f))).collect();
        let b_key: Vec<String> = by.iter().map(|f| display_opt(b.get(f))).collect();
        a_key.cmp(&b_key)
    });
    rows
}

fn display(v: &FieldValue) -> String {
    match v {
        FieldValue::Str(s) => s.clone(),
        FieldValue::Num(n) => n.to_string(),
        FieldValue::Null => String::new(),
    }
}

fn display_opt(v: Option<&FieldValue>) -> String {
    v.map(display).unwrap_or_default()
}

fn compute<T: FieldSource>(agg: AggKind, field: Option<&str>, members: &[&T]) -> FieldValue {
    match agg {
        AggKind::Count => FieldValue::Num(members.len() as f64),
        AggKind::DistinctCount => {
            let set: std::collections::HashSet<String> = members
                .iter()
                .filter_map(|m| field.and_then(|f| m.field(f)).map(|v| display(&v)))
                .collect();
            FieldValue::Num(set.len() as f64)
        },
        AggKind::Sum | AggKind::Avg | AggKind::Min | AggKind::Max => {
            let values: Vec<f64> = members
                .iter()
                .filter_map(|m| field.and_then(|f| m.field(f)).and_then(|v| v.as_f64()))
                .collect();
            if values.is_empty() {
                return FieldValue::Null;
            }
            match agg {
                AggKind::Sum => FieldValue::Num(values.iter().sum()),
                AggKind::Avg => FieldValue::Num(values.iter().sum::<f64>() / values.len() as f64),
                AggKind::Min => FieldValue::Num(values.iter().cloned().fold(f64::MAX, f64::min)),
                AggKind::Max => FieldValue::Num(values.iter().cloned().fold(f64::MIN, f64::max)),
                _ => unreachable!(),
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    #[test]
    fn parses_count_with_by() {
        let stage = parse_stats_stage("count() by level, source").unwrap();
        match stage {
            Stage::Stats { agg, field, by } => {
                assert_eq!(agg, AggKind::Count);
                assert_eq!(field, None);
                assert_eq!(by, vec!["level".to_string(), "source".to_string()]);
            },
            _ => panic!("expected stats stage"),
        }
    }

    #[test]
    fn sum_without_field_is_rejected() {
        assert!(parse_stats_stage("sum() by source").is_err());
    }

    #[test]
    fn aggregates_count_by_level() {
        let records = vec![
            LogRecordBuilder::new("s", "a").level("ERROR").build(1, i64::MAX),
            LogRecordBuilder::new("s", "b").level("ERROR").build(2, i64::MAX),
            LogRecordBuilder::new("s", "c").level("INFO").build(3, i64::MAX),
        ];
        let rows = aggregate(&records, AggKind::Count, None, &["level".to_string()]);
        assert_eq!(rows.len(), 2);
        let error_row = rows.iter().find(|r| r.get("level") == Some(&FieldValue::Str("ERROR".to_string()))).unwrap();
        assert_eq!(error_row.get("count"), Some(&FieldValue::Num(2.0)));
    }
}
