//! Small helpers shared across the Recall crates.

/// Shortens `s` for log lines and error replies.
///
/// Text longer than `max_chars` characters keeps its first `max_chars`
/// characters, loses any trailing whitespace, and gets a `...` suffix.
/// Shorter text comes back unchanged.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", s[..cut].trim_end()),
        None => s.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_error_body_is_kept() {
        assert_eq!(truncate_with_ellipsis("rate limited", 200), "rate limited");
        assert_eq!(truncate_with_ellipsis("", 3), "");
    }

    #[test]
    fn long_error_body_is_cut_at_char_boundary() {
        assert_eq!(truncate_with_ellipsis("upstream timeout", 9), "upstream...");
        assert_eq!(truncate_with_ellipsis("ключ недействителен", 4), "ключ...");
    }
}
