//! Section-aware document chunker (`spec.md` §4.5.2).

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_CHUNK_OVERLAP: usize = 128;

/// Splits `text` into chunks of roughly `chunk_size` characters,
/// preferring section boundaries over a blind character window.
/// Strategies are attempted in order; the first to produce more than
/// one chunk wins:
///
/// 1. Split on `### ` sub-headings (each section keeps its heading; a
///    `## ` parent heading seen along the way is prepended to every
///    subsequent `### ` section until a new `## ` appears).
/// 2. Split on `## ` headings (each section keeps its heading).
/// 3. Split on blank-line paragraph boundaries.
/// 4. Character window with overlap (fallback only).
///
/// For strategies 1-3 the document preamble (everything before the
/// first heading) is prepended to every chunk. Oversized chunks are
/// re-split by strategy 4; small adjacent chunks are merged back
/// together when the merge still fits.
pub fn chunk_document(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }

    let preamble = extract_preamble(text);

    let mut chunks = split_by_level(text, 3);
    if chunks.len() <= 1 {
        chunks = split_by_level(text, 2);
    }
    if chunks.len() <= 1 {
        chunks = split_by_paragraph(text);
    }
    if chunks.len() <= 1 {
        return split_by_chars(text, chunk_size, overlap);
    }

    let with_preamble: Vec<String> = chunks
        .into_iter()
        .map(|section| {
            if preamble.is_empty() {
                section
            } else {
                format!("{preamble}\n\n{section}")
            }
        })
        .collect();

    let resplit = resplit_oversized(with_preamble, chunk_size, overlap);
    merge_small_chunks(resplit, chunk_size)
}

fn heading_prefix(level: usize) -> String {
    "#".repeat(level) + " "
}

fn is_heading(line: &str, level: usize) -> bool {
    line.starts_with(&heading_prefix(level))
}

/// Text before the first `## ` or `### ` heading line. Empty when the
/// document has no headings at all — there is nothing to carry
/// forward into paragraph- or char-window-split chunks in that case.
fn extract_preamble(text: &str) -> String {
    let mut preamble_lines = Vec::new();
    let mut found_heading = false;
    for line in text.lines() {
        if is_heading(line, 2) || is_heading(line, 3) {
            found_heading = true;
            break;
        }
        preamble_lines.push(line);
    }
    if !found_heading {
        return String::new();
    }
    preamble_lines.join("\n").trim().to_string()
}

/// Splits on headings of `level` (2 or 3). For level 3, a `## `
/// heading encountered along the way is remembered as the current
/// parent and prepended to every subsequent `### ` section until a
/// new `## ` is seen. `## ` headings themselves never become their
/// own section under level 3; under level 2 they do.
fn split_by_level(text: &str, level: usize) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    let mut parent: Option<String> = None;

    let flush = |current: &mut Option<Vec<&str>>, parent: &Option<String>, sections: &mut Vec<String>| {
        if let Some(lines) = current.take() {
            let body = lines.join("\n");
            let section = match (level, parent) {
                (3, Some(p)) => format!("{p}\n{body}"),
                _ => body,
            };
            sections.push(section);
        }
    };

    for line in text.lines() {
        if level == 3 && is_heading(line, 2) && !is_heading(line, 3) {
            flush(&mut current, &parent, &mut sections);
            parent = Some(line.to_string());
            continue;
        }
        if is_heading(line, level) {
            flush(&mut current, &parent, &mut sections);
            current = Some(vec![line]);
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    flush(&mut current, &parent, &mut sections);
    sections
}

/// Splits on blank-line boundaries; each block is one or more
/// consecutive non-empty lines.
fn split_by_paragraph(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(current.join("\n"));
                current = Vec::new();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current.join("\n"));
    }
    blocks
}

/// Sliding character window with overlap. Pure fallback strategy.
fn split_by_chars(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect::<String>());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn resplit_oversized(chunks: Vec<String>, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut out = Vec::new();
    for chunk in chunks {
        if chunk.chars().count() > chunk_size {
            out.extend(split_by_chars(&chunk, chunk_size, overlap));
        } else {
            out.push(chunk);
        }
    }
    out
}

fn merge_small_chunks(chunks: Vec<String>, chunk_size: usize) -> Vec<String> {
    let small_threshold = chunk_size / 5;
    let mut merged: Vec<String> = Vec::new();
    for chunk in chunks {
        if let Some(last) = merged.last() {
            if last.chars().count() < small_threshold || chunk.chars().count() < small_threshold {
                let candidate = format!("{last}\n\n{chunk}");
                if candidate.chars().count() <= chunk_size {
                    let idx = merged.len() - 1;
                    merged[idx] = candidate;
                    continue;
                }
            }
        }
        merged.push(chunk);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_document("short text", DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
        assert_eq!(chunks, vec!["short text".to_string()]);
    }

    #[test]
    fn splits_on_subheadings_with_parent_carried_forward() {
        let text = format!(
            "Intro line.\n\n## Parent Section\n\n### Sub One\n{}\n\n### Sub Two\n{}",
            "a".repeat(50),
            "b".repeat(50)
        );
        let chunks = chunk_document(&text, 200, 20);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.contains("Intro line."));
            assert!(c.contains("## Parent Section"));
        }
        assert!(chunks[0].contains("### Sub One"));
        assert!(chunks[1].contains("### Sub Two"));
    }

    #[test]
    fn falls_back_to_paragraphs_without_headings() {
        let text = format!("{}\n\n{}\n\n{}", "x".repeat(40), "y".repeat(40), "z".repeat(40));
        let chunks = chunk_document(&text, 60, 10);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn oversized_sections_are_resplit() {
        let text = format!("## Big Section\n{}", "q".repeat(500));
        let chunks = chunk_document(&text, 100, 10);
        assert!(chunks.iter().all(|c| c.chars().count() <= 120));
    }

    #[test]
    fn char_window_fallback_overlaps() {
        let text = "word ".repeat(100);
        let chunks = split_by_chars(&text, 50, 10);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
    }
}
