// ABOUTME: Prefix-containment duplicate check for extracted entries
// ABOUTME: Normalizes case, punctuation and whitespace before comparing

/// Default number of leading characters compared
pub const DEFAULT_DEDUP_PREFIX: usize = 40;

pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when any existing text contains the first `prefix_len` normalized
/// characters of `candidate`
pub fn is_duplicate<'a, I>(candidate: &str, existing: I, prefix_len: usize) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let normalized = normalize(candidate);
    if normalized.is_empty() {
        return true;
    }
    let prefix: String = normalized.chars().take(prefix_len.max(1)).collect();
    existing
        .into_iter()
        .any(|text| normalize(text).contains(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Use Redis?", &["use redis?"], true)]
    #[case("use redis for sessions", &["We could use   redis for sessions, right"], true)]
    #[case("use postgres?", &["use redis?"], false)]
    #[case("anything", &[], false)]
    #[case("!!!", &[], true)]
    fn test_is_duplicate(#[case] candidate: &str, #[case] existing: &[&str], #[case] expected: bool) {
        assert_eq!(
            is_duplicate(candidate, existing.iter().copied(), DEFAULT_DEDUP_PREFIX),
            expected
        );
    }

    #[test]
    fn test_only_prefix_is_compared() {
        let existing = ["should we migrate the billing tables"];
        assert!(is_duplicate(
            "should we migrate the billing tables tonight or tomorrow",
            existing.iter().copied(),
            20
        ));
    }
}
