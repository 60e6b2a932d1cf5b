//! Pure text-formatting functions: markdown stripping, byte-budget
//! truncation, and sentence-aware chunking. No state, no I/O.

use std::sync::LazyLock;

use regex::Regex;

pub const MORE_TAG: &str = " [!more]";

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("static regex"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("static regex"));
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").expect("static regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("static regex"));
static HEADERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").expect("static regex"));
static LINKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("static regex"));
static UNORDERED_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[-*+]\s+").expect("static regex"));
static ORDERED_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+\.\s+").expect("static regex"));
static BLOCKQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^>\s?").expect("static regex"));
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[-*_]{3,}\s*$").expect("static regex"));
static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static MULTI_NEWLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").expect("static regex"));
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?](?:\s|$)").expect("static regex"));
static CLAUSE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?;:\u{2014}\u{2026}](?:\s|$)").expect("static regex"));

/// Removes fenced code blocks, bold/italic/inline-code markers,
/// headings, links (keeping link text), blockquote markers,
/// horizontal rules, and list bullets. Whitespace is left untouched;
/// use [`collapse_whitespace`] afterward.
pub fn strip_markdown(text: &str) -> String {
    let text = CODE_BLOCK.replace_all(text, "");
    let text = BOLD.replace_all(&text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = HEADERS.replace_all(&text, "");
    let text = LINKS.replace_all(&text, "$1");
    let text = BLOCKQUOTE.replace_all(&text, "");
    let text = HORIZONTAL_RULE.replace_all(&text, "");
    let text = UNORDERED_LIST.replace_all(&text, "");
    let text = ORDERED_LIST.replace_all(&text, "");
    text.into_owned()
}

/// Collapses runs of two or more newlines to a single space, runs of
/// spaces/tabs to a single space, and trims the result.
pub fn collapse_whitespace(text: &str) -> String {
    let text = MULTI_NEWLINE.replace_all(text, " ");
    let text = MULTI_SPACE.replace_all(&text, " ");
    text.trim().to_string()
}

/// `strip_markdown` followed by `collapse_whitespace`.
pub fn clean_text(text: &str) -> String {
    collapse_whitespace(&strip_markdown(text))
}

/// UTF-8 byte length.
pub fn byte_len(text: &str) -> usize {
    text.len()
}

/// Truncates `text` to at most `max_bytes` bytes, preferring (in
/// order) the last sentence boundary, then the last clause boundary,
/// then the last word boundary, else a hard byte cut. The result is
/// trimmed.
pub fn truncate_at_sentence(text: &str, max_bytes: usize) -> String {
    if byte_len(text) <= max_bytes {
        return text.trim().to_string();
    }
    let truncated = safe_byte_slice(text, max_bytes);

    if let Some(best) = last_match_end(&truncated, &SENTENCE_END) {
        if best > 0 {
            return truncated[..best].trim().to_string();
        }
    }
    if let Some(best) = last_match_end(&truncated, &CLAUSE_END) {
        if best > 0 {
            return truncated[..best].trim().to_string();
        }
    }
    if let Some(idx) = truncated.rfind(' ') {
        if idx > 0 {
            return truncated[..idx].trim().to_string();
        }
    }
    truncated.trim().to_string()
}

/// Returns the byte offset one past the punctuation character of the
/// last regex match (i.e. including the punctuation, excluding the
/// trailing whitespace the pattern also consumed), or `None`.
fn last_match_end(text: &str, pattern: &Regex) -> Option<usize> {
    pattern.find_iter(text).last().map(|m| {
        // The match is `[punct](\s|$)`; we want to keep the punctuation
        // but not the trailing whitespace character it consumed.
        let matched = m.as_str();
        if matched.ends_with(char::is_whitespace) {
            m.start() + matched.len() - 1
        } else {
            m.end()
        }
    })
}

/// Decodes up to `max_bytes` bytes of `text` as UTF-8, dropping any
/// trailing partial multi-byte sequence.
fn safe_byte_slice(text: &str, max_bytes: usize) -> String {
    let bytes = text.as_bytes();
    let mut end = max_bytes.min(bytes.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Repeatedly truncates `text` into chunks of at most `max_bytes`
/// bytes, forcing progress even on pathological input (e.g. a single
/// token longer than the budget).
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<String> {
    if byte_len(text) <= max_bytes {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text.to_string();

    while !remaining.is_empty() {
        if byte_len(&remaining) <= max_bytes {
            chunks.push(remaining.clone());
            break;
        }
        let mut chunk = truncate_at_sentence(&remaining, max_bytes);
        if chunk.is_empty() {
            chunk = safe_byte_slice(&remaining, max_bytes).trim().to_string();
        }
        let consumed = chunk.len().max(1);
        chunks.push(chunk);
        remaining = remaining
            .get(consumed.min(remaining.len())..)
            .unwrap_or_default()
            .trim()
            .to_string();
    }
    chunks
}

/// Runs `clean_text`, substitutes a fallback for empty results, adds
/// a provenance prefix if given, and splits into `[!more]`-chunked
/// messages when the cleaned text exceeds `max_bytes`.
///
/// Returns `(first_message, all_chunks, was_truncated)`.
pub fn format_response(
    text: &str,
    max_bytes: usize,
    provenance: Option<&str>,
) -> (String, Vec<String>, bool) {
    let mut cleaned = clean_text(text);
    if cleaned.is_empty() {
        cleaned = "I couldn't generate a response. Try again.".to_string();
    }
    if let Some(name) = provenance {
        cleaned = format!("[via {name}] {cleaned}");
    }

    if byte_len(&cleaned) <= max_bytes {
        return (cleaned.clone(), vec![cleaned], false);
    }

    let more_tag_bytes = MORE_TAG.len();
    let budget = max_bytes.saturating_sub(more_tag_bytes);
    let mut chunks = chunk_text(&cleaned, max_bytes);

    if byte_len(&chunks[0]) > budget {
        let first = truncate_at_sentence(&chunks[0], budget);
        let leftover = cleaned
            .get(first.len().min(cleaned.len())..)
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut rebuilt = vec![first];
        if !leftover.is_empty() {
            rebuilt.extend(chunk_text(&leftover, max_bytes));
        }
        chunks = rebuilt;
    }

    let first_msg = format!("{}{}", chunks[0], MORE_TAG);
    (first_msg, chunks, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bold_and_headings() {
        let out = clean_text("# Title\n\n**bold** and _plain_ text");
        assert!(!out.contains('#'));
        assert!(!out.contains("**"));
        assert!(out.contains("bold"));
    }

    #[test]
    fn strips_links_keeping_text() {
        let out = clean_text("See [the docs](https://example.com) for more.");
        assert!(out.contains("the docs"));
        assert!(!out.contains("https://"));
    }

    #[test]
    fn byte_budget_is_respected() {
        let text = "First sentence. Second sentence. Third sentence. Fourth sentence.";
        let chunks = chunk_text(text, 40);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(byte_len(c) <= 40, "chunk {c:?} exceeds budget");
        }
    }

    #[test]
    fn chunks_end_on_sentence_boundaries_when_possible() {
        let text = "First sentence. Second sentence. Third sentence. Fourth sentence.";
        let chunks = chunk_text(text, 40);
        for c in &chunks[..chunks.len() - 1] {
            assert!(
                c.ends_with('.') || c.ends_with('!') || c.ends_with('?'),
                "chunk {c:?} did not end on a sentence boundary"
            );
        }
    }

    #[test]
    fn format_response_empty_gets_fallback() {
        let (first, all, more) = format_response("   ", 230, None);
        assert_eq!(first, "I couldn't generate a response. Try again.");
        assert_eq!(all.len(), 1);
        assert!(!more);
    }

    #[test]
    fn format_response_adds_provenance_prefix() {
        let (first, _, _) = format_response("hello there", 230, Some("MARINA"));
        assert!(first.starts_with("[via MARINA] "));
    }

    #[test]
    fn format_response_appends_more_tag_only_to_first_chunk() {
        let long = "Sentence one is here. Sentence two is here. Sentence three is here. Sentence four is here. Sentence five is here.";
        let (first, all, more) = format_response(long, 40, None);
        assert!(more);
        assert!(first.ends_with(MORE_TAG));
        assert!(byte_len(&first) <= 40 + MORE_TAG.len());
        for c in &all {
            assert!(!c.ends_with(MORE_TAG));
        }
    }

    #[test]
    fn pathological_single_long_token_forces_progress() {
        let text = "a".repeat(500);
        let chunks = chunk_text(&text, 50);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| byte_len(c) <= 50));
    }
}
