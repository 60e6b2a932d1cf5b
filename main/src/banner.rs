//! Startup banner (`SPEC_FULL.md` §2, grounded on
//! `original_source/delfi.py::print_banner`): a pure formatting
//! function over [`BannerInfo`] so it is testable without a live mesh
//! connection.

/// Everything the startup banner needs to render.
#[derive(Clone, Debug)]
pub struct BannerInfo {
    pub node_name: String,
    pub model: String,
    pub doc_count: usize,
    pub rag_available: bool,
    pub llm_available: bool,
    pub protocol_name: String,
    pub peer_names: Vec<String>,
}

/// Renders the box-drawing startup banner. Width is the longest
/// content line plus padding; every line is left-padded to that width
/// so the right border lines up.
pub fn render_banner(info: &BannerInfo) -> String {
    let check = |ok: bool| if ok { "\u{2713}" } else { "\u{2717}" };
    let peers = if info.peer_names.is_empty() {
        "none".to_string()
    } else {
        info.peer_names.join(", ")
    };

    let lines = vec![
        format!("Del-Fi oracle \u{2014} {}", info.node_name),
        format!("model:  {}", info.model),
        format!("docs:   {}", info.doc_count),
        format!("RAG {}  LLM {}", check(info.rag_available), check(info.llm_available)),
        format!("radio:  {}", info.protocol_name),
        format!("peers:  {peers}"),
    ];

    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    let top = format!("\u{250c}{}\u{2510}", "\u{2500}".repeat(width + 2));
    let bottom = format!("\u{2514}{}\u{2518}", "\u{2500}".repeat(width + 2));

    let mut out = String::new();
    out.push_str(&top);
    out.push('\n');
    for line in &lines {
        let pad = width - line.chars().count();
        out.push_str(&format!("\u{2502} {line}{} \u{2502}\n", " ".repeat(pad)));
    }
    out.push_str(&bottom);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BannerInfo {
        BannerInfo {
            node_name: "OUTPOST".to_string(),
            model: "llama3".to_string(),
            doc_count: 42,
            rag_available: true,
            llm_available: true,
            protocol_name: "simulator".to_string(),
            peer_names: vec!["MARINA".to_string()],
        }
    }

    #[test]
    fn banner_includes_node_name_and_doc_count() {
        let banner = render_banner(&sample());
        assert!(banner.contains("OUTPOST"));
        assert!(banner.contains("42"));
        assert!(banner.contains("MARINA"));
    }

    #[test]
    fn banner_lines_are_uniform_width() {
        let banner = render_banner(&sample());
        let widths: Vec<usize> = banner.lines().map(|l| l.chars().count()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn no_peers_renders_none() {
        let mut info = sample();
        info.peer_names.clear();
        let banner = render_banner(&info);
        assert!(banner.contains("none"));
    }
}
