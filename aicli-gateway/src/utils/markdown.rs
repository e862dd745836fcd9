//! Markdown stripping for push notification payloads
//!
//! Notification centers render plain text, so assistant output is flattened
//! before it leaves the gateway: code fences collapse to a marker, inline
//! markup unwraps to its text, structural prefixes are dropped.
//! `strip_markdown` is idempotent.

use once_cell::sync::Lazy;
use regex::Regex;

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\(([^)]*)\)").unwrap());
static BOLD_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*\*([^*]+)\*\*\*").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]*)`").unwrap());
static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(?:-\s+|\d+\.\s+)").unwrap());
static BLOCKQUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^>\s?").unwrap());

/// Flatten Markdown to plain notification text.
pub fn strip_markdown(text: &str) -> String {
    let text = FENCED_CODE.replace_all(text, "[code block]");
    let text = IMAGE.replace_all(&text, "[image: $1]");
    let text = LINK.replace_all(&text, "$1");
    let text = BOLD_ITALIC.replace_all(&text, "$1");
    let text = BOLD.replace_all(&text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = HEADER.replace_all(&text, "");
    let text = LIST_MARKER.replace_all(&text, "");
    let text = BLOCKQUOTE.replace_all(&text, "");
    text.into_owned()
}

/// Strip Markdown, then truncate at the last word boundary within `max`
/// characters, appending `…` when anything was cut. `None` yields an
/// empty string.
pub fn truncate(text: Option<&str>, max: usize) -> String {
    let Some(text) = text else {
        return String::new();
    };
    let stripped = strip_markdown(text);
    if stripped.chars().count() <= max {
        return stripped;
    }

    let cut: String = stripped.chars().take(max).collect();
    let boundary = cut
        .rfind(char::is_whitespace)
        .filter(|&i| i > 0)
        .unwrap_or(cut.len());
    let mut truncated = cut[..boundary].trim_end().to_string();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_code_blocks() {
        let input = "Before\n```rust\nfn main() {}\n```\nAfter";
        assert_eq!(strip_markdown(input), "Before\n[code block]\nAfter");
    }

    #[test]
    fn test_inline_code_unwraps() {
        assert_eq!(strip_markdown("run `cargo test` now"), "run cargo test now");
    }

    #[test]
    fn test_headers() {
        assert_eq!(strip_markdown("# Title\n## Sub\ntext"), "Title\nSub\ntext");
    }

    #[test]
    fn test_emphasis() {
        assert_eq!(strip_markdown("***x*** **bold** and *italic*"), "x bold and italic");
    }

    #[test]
    fn test_links_and_images() {
        assert_eq!(
            strip_markdown("see [docs](https://example.com)"),
            "see docs"
        );
        assert_eq!(
            strip_markdown("![diagram](img.png)"),
            "[image: diagram]"
        );
    }

    #[test]
    fn test_list_markers_and_blockquotes() {
        let input = "- first\n2. second\n> quoted";
        assert_eq!(strip_markdown(input), "first\nsecond\nquoted");
    }

    #[test]
    fn test_strip_is_idempotent() {
        let inputs = [
            "# H\n**b** *i* `c` [l](u) ![a](s)\n- item\n> q\n```\ncode\n```",
            "plain text stays plain",
            "1. numbered item with [link](x)",
        ];
        for input in inputs {
            let once = strip_markdown(input);
            assert_eq!(strip_markdown(&once), once, "not idempotent for: {input}");
        }
    }

    #[test]
    fn test_truncate_none_is_empty() {
        assert_eq!(truncate(None, 10), "");
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate(Some("short"), 10), "short");
    }

    #[test]
    fn test_truncate_cuts_at_word_boundary() {
        let out = truncate(Some("the quick brown fox jumps"), 14);
        assert_eq!(out, "the quick…");
    }

    #[test]
    fn test_truncate_strips_markdown_first() {
        let out = truncate(Some("**bold** text"), 20);
        assert_eq!(out, "bold text");
    }

    #[test]
    fn test_truncate_unbroken_word_hard_cuts() {
        let out = truncate(Some("aaaaaaaaaaaaaaaaaaaa"), 5);
        assert_eq!(out, "aaaaa…");
    }
}
