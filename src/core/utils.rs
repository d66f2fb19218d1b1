use std::time::Duration;

/// Compare program output with a reference output.
///
/// Runs of spaces count as one space, trailing whitespace on each line and
/// trailing empty lines are ignored.
pub fn compare_output(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s
            .lines()
            .map(|line| {
                line.split(' ')
                    .filter(|word| !word.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim_end()
                    .to_string()
            })
            .collect();
        while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}

/// Milliseconds of a duration, saturating at `u64::MAX`
pub fn as_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_output_exact_match() {
        assert!(compare_output("hello\nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_whitespace() {
        assert!(compare_output("hello  \nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_newlines() {
        assert!(compare_output("hello\nworld\n\n\n", "hello\nworld\n"));
        assert!(compare_output("4", "4\n"));
    }

    #[test]
    fn test_compare_output_space_runs() {
        assert!(compare_output("1  2 3\n", "1 2 3\n"));
        assert!(compare_output("4\r\n", "4\n"));
    }

    #[test]
    fn test_compare_output_different() {
        assert!(!compare_output("hello\nworld\n", "hello\nearth\n"));
        assert!(!compare_output("5\n", "4\n"));
        assert!(!compare_output("12\n", "1 2\n"));
    }

    #[test]
    fn test_as_millis() {
        assert_eq!(as_millis(Duration::from_millis(1500)), 1500);
    }
}
