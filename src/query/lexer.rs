//! Splits raw SPL-like pipeline text into stage segments.

const KEYWORDS: &[&str] = &["search", "where", "eval", "stats", "sort", "head", "tail"];

/// Splits on `|` outside double-quoted spans, pairing each segment with the
/// byte offset of its first character for error reporting.
pub fn split_pipeline(text: &str) -> Vec<(usize, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut segment_start = 0;
    let mut in_quotes = false;

    for (idx, ch) in text.char_indices() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            },
            '|' if !in_quotes => {
                segments.push((segment_start, std::mem::take(&mut current)));
                segment_start = idx + 1;
            },
            _ => current.push(ch),
        }
    }
    segments.push((segment_start, current));

    segments.into_iter().filter(|(_, s)| !s.trim().is_empty()).collect()
}

pub fn starts_with_keyword(segment: &str) -> bool {
    let first_word = segment.split_whitespace().next().unwrap_or("");
    KEYWORDS.contains(&first_word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_pipe_outside_quotes() {
        let segments = split_pipeline(r#"search "a|b" | stats count()"#);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].1.trim(), r#"search "a|b""#);
        assert_eq!(segments[1].1.trim(), "stats count()");
    }

    #[test]
    fn detects_leading_keyword() {
        assert!(starts_with_keyword("where level = \"ERROR\""));
        assert!(!starts_with_keyword("connection refused"));
    }
}
