//! Field resolution and expression evaluation for `where`/`eval`/`sort`
//! stages.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::record::LogRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Num(f64),
    Null,
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            FieldValue::Str(s) => s.parse().ok(),
            FieldValue::Null => None,
        }
    }

    fn to_display_string(&self) -> String {
        match self {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            },
            FieldValue::Null => String::new(),
        }
    }

    fn cmp_total(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Num(a), FieldValue::Num(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Null, _) => Ordering::Less,
            (_, FieldValue::Null) => Ordering::Greater,
            _ => self.to_display_string().cmp(&other.to_display_string()),
        }
    }
}

/// A value usable in a `stats` group-by column or as a `Row`/record field.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<FieldValue>;
}

pub trait SetField {
    fn set_field(&mut self, name: &str, value: FieldValue);
}

impl FieldSource for LogRecord {
    fn field(&self, name: &str) -> Option<FieldValue> {
        Some(match name {
            "id" => FieldValue::Str(self.id.clone()),
            "ingestTime" => FieldValue::Num(self.ingest_time as f64),
            "recordTime" => return self.record_time.map(|t| FieldValue::Num(t as f64)),
            "effectiveTime" => FieldValue::Num(self.effective_time() as f64),
            "level" => FieldValue::Str(self.level.clone()),
            "source" => FieldValue::Str(self.source.clone()),
            "message" => FieldValue::Str(self.message.clone()),
            "rawContent" => FieldValue::Str(self.raw_content.clone()),
            other => return self.metadata.get(other).cloned().map(FieldValue::Str),
        })
    }
}

impl SetField for LogRecord {
    fn set_field(&mut self, name: &str, value: FieldValue) {
        self.metadata.insert(name.to_string(), value.to_display_string());
    }
}

impl FieldSource for BTreeMap<String, FieldValue> {
    fn field(&self, name: &str) -> Option<FieldValue> {
        self.get(name).cloned()
    }
}

impl SetField for BTreeMap<String, FieldValue> {
    fn set_field(&mut self, name: &str, value: FieldValue) {
        self.insert(name.to_string(), value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    Matches,
}

#[derive(Debug, Clone)]
pub struct BoolExpr {
    field: String,
    op: CompareOp,
    literal: FieldValue,
}

#[derive(Debug, Clone)]
pub enum ValueExpr {
    Literal(FieldValue),
    Field(String),
    Len(Box<ValueExpr>),
    Lower(Box<ValueExpr>),
    Upper(Box<ValueExpr>),
    Add(Box<ValueExpr>, Box<ValueExpr>),
    Sub(Box<ValueExpr>, Box<ValueExpr>),
    Mul(Box<ValueExpr>, Box<ValueExpr>),
    Div(Box<ValueExpr>, Box<ValueExpr>),
}

static OP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\S+)\s*(!=|>=|<=|=|>|<|contains|matches)\s*(.+)$"#).unwrap()
});

pub fn parse_bool_expr(text: &str) -> Result<BoolExpr, String> {
    let captures = OP_PATTERN
        .captures(text.trim())
        .ok_or_else(|| format!("unrecognized where expression `{text}`"))?;
    let field = captures[1].to_string();
    let op = match &captures[2] {
        "=" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        ">" => CompareOp::Gt,
        "<" => CompareOp::Lt,
        ">=" => CompareOp::Ge,
        "<=" => CompareOp::Le,
        "contains" => CompareOp::Contains,
        "matches" => CompareOp::Matches,
        other => return Err(format!("unknown operator `{other}`")),
    };
    let literal = parse_literal(captures[3].trim());
    Ok(BoolExpr { field, op, literal })
}

fn parse_literal(text: &str) -> FieldValue {
    if let Some(unquoted) = text.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        FieldValue::Str(unquoted.to_string())
    } else if let Ok(n) = text.parse::<f64>() {
        FieldValue::Num(n)
    } else {
        FieldValue::Str(text.to_string())
    }
}

pub fn filter<T: FieldSource>(items: Vec<T>, expr: &BoolExpr, row_errors: &mut u64) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| match evaluate_compare(item, expr) {
            Some(matched) => matched,
            None => {
                *row_errors += 1;
                false
            },
        })
        .collect()
}

fn evaluate_compare<T: FieldSource>(item: &T, expr: &BoolExpr) -> Option<bool> {
    let actual = item.field(&expr.field)?;
    Some(match expr.op {
        CompareOp::Eq => actual.cmp_total(&expr.literal) == Ordering::Equal,
        CompareOp::Ne => actual.cmp_total(&expr.literal) != Ordering::Equal,
        CompareOp::Gt => actual.cmp_total(&expr.literal) == Ordering::Greater,
        CompareOp::Lt => actual.cmp_total(&expr.literal) == Ordering::Less,
        CompareOp::Ge => actual.cmp_total(&expr.literal) != Ordering::Less,
        CompareOp::Le => actual.cmp_total(&expr.literal) != Ordering::Greater,
        CompareOp::Contains => {
            actual.to_display_string().to_lowercase().contains(&expr.literal.to_display_string().to_lowercase())
        },
        CompareOp::Matches => {
            let pattern = expr.literal.to_display_string();
            let re = Regex::new(&pattern).ok()?;
            re.is_match(&actual.to_display_string())
        },
    })
}

pub fn eval_into<T: FieldSource + SetField>(
    mut items: Vec<T>,
    name: &str,
    expr: &ValueExpr,
    row_errors: &mut u64,
) -> Vec<T> {
    for item in items.iter_mut() {
        match evaluate_value(item, expr) {
            Some(value) => item.set_field(name, value),
            None => *row_errors += 1,
        }
    }
    items
}

fn evaluate_value<T: FieldSource>(item: &T, expr: &ValueExpr) -> Option<FieldValue> {
    Some(match expr {
        ValueExpr::Literal(v) => v.clone(),
        ValueExpr::Field(name) => item.field(name).unwrap_or(FieldValue::Null),
        ValueExpr::Len(inner) => {
            FieldValue::Num(evaluate_value(item, inner)?.to_display_string().len() as f64)
        },
        ValueExpr::Lower(inner) => {
            FieldValue::Str(evaluate_value(item, inner)?.to_display_string().to_lowercase())
        },
        ValueExpr::Upper(inner) => {
            FieldValue::Str(evaluate_value(item, inner)?.to_display_string().to_uppercase())
        },
        ValueExpr::Add(a, b) => arithmetic_or_concat(item, a, b, |x, y| x + y)?,
        ValueExpr::Sub(a, b) => FieldValue::Num(numeric(item, a)? - numeric(item, b)?),
        ValueExpr::Mul(a, b) => FieldValue::Num(numeric(item, a)? * numeric(item, b)?),
        ValueExpr::Div(a, b) => {
            let divisor = numeric(item, b)?;
            if divisor == 0.0 {
                return None;
            }
            FieldValue::Num(numeric(item, a)? / divisor)
        },
    })
}

fn numeric<T: FieldSource>(item: &T, expr: &ValueExpr) -> Option<f64> {
    evaluate_value(item, expr)?.as_f64()
}

fn arithmetic_or_concat<T: FieldSource>(
    item: &T,
    a: &ValueExpr,
    b: &ValueExpr,
    op: impl Fn(f64, f64) -> f64,
) -> Option<FieldValue> {
    let left = evaluate_value(item, a)?;
    let right = evaluate_value(item, b)?;
    match (left.as_f64(), &right) {
        (Some(l), _) if matches!(right, FieldValue::Num(_)) => {
            Some(FieldValue::Num(op(l, right.as_f64().unwrap())))
        },
        _ => Some(FieldValue::Str(format!(
            "{}{}",
            left.to_display_string(),
            right.to_display_string()
        ))),
    }
}

/// Recursive-descent parser for `eval` expressions: `+ -` bind loosest,
/// then `* /`, then function calls/literals/field refs.
pub fn parse_value_expr(text: &str) -> Result<ValueExpr, String> {
    let tokens = tokenize_expr(text)?;
    let mut pos = 0;
    let expr = parse_additive(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected trailing tokens in expression `{text}`"));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize_expr(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            },
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            },
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            },
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            },
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            },
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            },
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != '"' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(format!("unterminated string literal in `{text}`"));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            },
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let slice: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(
                    slice.parse().map_err(|_| format!("invalid number `{slice}`"))?,
                ));
            },
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            },
            other => return Err(format!("unexpected character `{other}` in expression")),
        }
    }
    Ok(tokens)
}

fn parse_additive(tokens: &[Token], pos: &mut usize) -> Result<ValueExpr, String> {
    let mut left = parse_multiplicative(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Plus) => {
                *pos += 1;
                let right = parse_multiplicative(tokens, pos)?;
                left = ValueExpr::Add(Box::new(left), Box::new(right));
            },
            Some(Token::Minus) => {
                *pos += 1;
                let right = parse_multiplicative(tokens, pos)?;
                left = ValueExpr::Sub(Box::new(left), Box::new(right));
            },
            _ => break,
        }
    }
    Ok(left)
}

fn parse_multiplicative(tokens: &[Token], pos: &mut usize) -> Result<ValueExpr, String> {
    let mut left = parse_atom(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Star) => {
                *pos += 1;
                let right = parse_atom(tokens, pos)?;
                left = ValueExpr::Mul(Box::new(left), Box::new(right));
            },
            Some(Token::Slash) => {
                *pos += 1;
                let right = parse_atom(tokens, pos)?;
                left = ValueExpr::Div(Box::new(left), Box::new(right));
            },
            _ => break,
        }
    }
    Ok(left)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<ValueExpr, String> {
    match tokens.get(*pos).cloned() {
        Some(Token::Number(n)) => {
            *pos += 1;
            Ok(ValueExpr::Literal(FieldValue::Num(n)))
        },
        Some(Token::Str(s)) => {
            *pos += 1;
            Ok(ValueExpr::Literal(FieldValue::Str(s)))
        },
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_additive(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => *pos += 1,
                _ => return Err("expected closing `)`".to_string()),
            }
            Ok(inner)
        },
        Some(Token::Ident(name)) => {
            *pos += 1;
            if matches!(tokens.get(*pos), Some(Token::LParen)) {
                *pos += 1;
                let inner = parse_additive(tokens, pos)?;
                match tokens.get(*pos) {
                    Some(Token::RParen) => *pos += 1,
                    _ => return Err("expected closing `)`".to_string()),
                }
                match name.as_str() {
                    "len" => Ok(ValueExpr::Len(Box::new(inner))),
                    "lower" => Ok(ValueExpr::Lower(Box::new(inner))),
                    "upper" => Ok(ValueExpr::Upper(Box::new(inner))),
                    other => Err(format!("unknown function `{other}`")),
                }
            } else {
                Ok(ValueExpr::Field(name))
            }
        },
        other => Err(format!("unexpected token {other:?} in expression")),
    }
}

pub fn sort_by_field<T: FieldSource>(items: &mut [T], field: &str, desc: bool) {
    items.sort_by(|a, b| {
        let ordering = a
            .field(field)
            .unwrap_or(FieldValue::Null)
            .cmp_total(&b.field(field).unwrap_or(FieldValue::Null));
        if desc { ordering.reverse() } else { ordering }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    #[test]
    fn parses_and_evaluates_where_expr() {
        let expr = parse_bool_expr(r#"level = "ERROR""#).unwrap();
        let record =
            LogRecordBuilder::new("s", "boom").level("ERROR").build(1, i64::MAX);
        let mut errors = 0;
        let kept = filter(vec![record], &expr, &mut errors);
        assert_eq!(kept.len(), 1);
        assert_eq!(errors, 0);
    }

    #[test]
    fn parses_and_evaluates_eval_len() {
        let expr = parse_value_expr("len(message)").unwrap();
        let record = LogRecordBuilder::new("s", "hello").message("hello").build(1, i64::MAX);
        let mut errors = 0;
        let result = eval_into(vec![record], "msg_len", &expr, &mut errors);
        assert_eq!(result[0].metadata.get("msg_len").unwrap(), "5");
        assert_eq!(errors, 0);
    }

    #[test]
    fn sort_desc_orders_numeric_field() {
        let mut records = vec![
            LogRecordBuilder::new("s", "a").record_time(Some(1)).build(1, i64::MAX),
            LogRecordBuilder::new("s", "b").record_time(Some(3)).build(1, i64::MAX),
            LogRecordBuilder::new("s", "c").record_time(Some(2)).build(1, i64::MAX),
        ];
        sort_by_field(&mut records, "recordTime", true);
        let times: Vec<i64> = records.iter().map(|r| r.record_time.unwrap()).collect();
        assert_eq!(times, vec![3, 2, 1]);
    }
}
