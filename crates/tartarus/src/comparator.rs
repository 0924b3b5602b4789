//! Output comparison.
//!
//! Both sides are normalised line by line: each line is trimmed, internal
//! whitespace runs collapse to a single space, and blank lines are dropped.
//! The normalised line lists must then be identical, line count included.

/// Normalise program output into comparable lines.
pub fn normalize(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

/// Compare actual output against the expected answer.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    let actual = normalize(actual);
    let expected = normalize(expected);
    actual == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_blank_lines_ignored() {
        for (actual, expected) in [("3", "3"), ("1\n2", "1\n2\n"), ("x", "y"), ("", "")] {
            assert_eq!(
                outputs_match(actual, expected),
                outputs_match(&format!("{}\n\n", actual), expected)
            );
        }
    }

    #[test]
    fn test_internal_whitespace_collapsed() {
        assert!(outputs_match("a   b", "a b"));
        assert!(outputs_match("  a\tb  \r\n", "a b"));
        assert!(outputs_match("1 2\r\n3\r\n", "1 2\n3"));
    }

    #[test]
    fn test_line_count_mismatch_fails() {
        assert!(!outputs_match("a\nb", "a\nb\nc"));
        assert!(!outputs_match("a b", "a\nb"));
    }

    #[test]
    fn test_content_is_strict() {
        assert!(!outputs_match("3", "4"));
        assert!(!outputs_match("ab", "a b"));
        assert!(!outputs_match("A", "a"));
    }

    #[test]
    fn test_blank_lines_between_content_dropped() {
        assert!(outputs_match("1\n\n\n2", "1\n2"));
        assert_eq!(normalize("  \n x  y \n\n"), vec!["x y".to_string()]);
    }
}
