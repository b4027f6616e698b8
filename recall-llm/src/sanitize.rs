//! Scrubbing of provider error bodies before they reach logs or clients.

use recall_common::util::truncate_with_ellipsis;

const MAX_API_ERROR_CHARS: usize = 200;
const REDACTED: &str = "[REDACTED]";
const SECRET_PREFIXES: [&str; 3] = ["sk-", "xoxb-", "xoxp-"];

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn secret_end(input: &str, from: usize) -> usize {
    input[from..]
        .char_indices()
        .find(|(_, c)| !is_secret_char(*c))
        .map_or(input.len(), |(i, _)| from + i)
}

/// Replace API-key-like tokens with `[REDACTED]`.
pub fn scrub_secret_patterns(input: &str) -> String {
    let mut scrubbed = input.to_string();

    for prefix in SECRET_PREFIXES {
        let mut search_from = 0;
        while let Some(rel) = scrubbed[search_from..].find(prefix) {
            let start = search_from + rel;
            let body_start = start + prefix.len();
            let end = secret_end(&scrubbed, body_start);

            if end == body_start {
                search_from = body_start;
                continue;
            }

            scrubbed.replace_range(start..end, REDACTED);
            search_from = start + REDACTED.len();
        }
    }

    scrubbed
}

/// Scrub secrets and cap the length of an upstream error body.
pub fn sanitize_api_error(input: &str) -> String {
    truncate_with_ellipsis(&scrub_secret_patterns(input), MAX_API_ERROR_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_openai_keys() {
        let out = scrub_secret_patterns("Incorrect API key provided: sk-proj-abc123_XYZ. Check it.");
        assert_eq!(out, "Incorrect API key provided: [REDACTED]. Check it.");
    }

    #[test]
    fn bare_prefix_is_left_alone() {
        assert_eq!(scrub_secret_patterns("prefix sk- only"), "prefix sk- only");
    }

    #[test]
    fn scrubs_multiple_tokens() {
        let out = scrub_secret_patterns("a xoxb-1 b xoxp-2 c sk-3");
        assert_eq!(out, "a [REDACTED] b [REDACTED] c [REDACTED]");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(500);
        let out = sanitize_api_error(&body);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), MAX_API_ERROR_CHARS + 3);
    }

    #[test]
    fn short_bodies_pass_through() {
        assert_eq!(sanitize_api_error("bad request"), "bad request");
    }
}
