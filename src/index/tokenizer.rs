//! Simple token extraction for the inverted index.

/// Lowercases and splits on non-alphanumeric boundaries. Good enough for a
/// full-text index over log lines; not a linguistic tokenizer.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_lowercases() {
        assert_eq!(tokenize("Alpha-ERROR_42!"), vec!["alpha", "error_42"]);
    }
}
