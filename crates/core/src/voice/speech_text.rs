//! Cleans assistant replies up before they are spoken.

use regex::Regex;
use std::sync::LazyLock;

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Removes markup tags and `**` emphasis markers and collapses whitespace.
pub fn sanitize_for_speech(text: &str) -> String {
    let without_tags = TAGS.replace_all(text, " ");
    let without_emphasis = without_tags.replace("**", "");
    WHITESPACE
        .replace_all(&without_emphasis, " ")
        .trim()
        .to_string()
}
