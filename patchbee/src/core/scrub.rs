//! Per-extension comment scrubbing for accumulated source text.
//!
//! Multi-line comments are removed first, then lines whose trimmed form starts
//! with a single-line marker. An unterminated multi-line comment stops
//! scrubbing for that delimiter pair and leaves the rest of the file as-is.

/// Single-line comment markers for a lowercase extension (without the dot).
pub fn line_markers(ext: &str) -> &'static [&'static str] {
    match ext {
        "py" | "sh" | "rb" | "pl" => &["#"],
        "js" | "ts" | "java" | "c" | "cpp" | "h" | "hpp" | "go" | "rs" | "swift" | "kt" => {
            &["//"]
        }
        "php" => &["//", "#"],
        "lua" | "sql" => &["--"],
        _ => &[],
    }
}

/// Multi-line comment delimiter pairs for a lowercase extension (without the dot).
pub fn block_delimiters(ext: &str) -> &'static [(&'static str, &'static str)] {
    match ext {
        "c" | "cpp" | "h" | "hpp" | "java" | "js" | "ts" | "go" | "cs" | "swift" | "php"
        | "rs" | "sql" => &[("/*", "*/")],
        "py" => &[("\"\"\"", "\"\"\""), ("'''", "'''")],
        _ => &[],
    }
}

/// Remove comments from `content` according to the tables for `ext`.
///
/// Unknown extensions are returned unchanged.
pub fn scrub_comments(content: &str, ext: &str) -> String {
    let ext = ext.to_ascii_lowercase();
    let mut text = content.to_string();
    for (start, end) in block_delimiters(&ext) {
        text = remove_blocks(&text, start, end);
    }

    let markers = line_markers(&ext);
    if markers.is_empty() {
        return text;
    }
    text.split('\n')
        .filter(|line| {
            let trimmed = line.trim();
            !markers.iter().any(|marker| trimmed.starts_with(marker))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn remove_blocks(text: &str, start: &str, end: &str) -> String {
    let mut text = text.to_string();
    while let Some(start_idx) = text.find(start) {
        let search_from = start_idx + start.len();
        let Some(rel_end) = text[search_from..].find(end) else {
            break;
        };
        let end_idx = search_from + rel_end + end.len();
        text.replace_range(start_idx..end_idx, "");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_python_line_comments() {
        assert_eq!(scrub_comments("# comment\nx=1", "py"), "x=1");
    }

    #[test]
    fn keeps_indented_code_and_drops_indented_comments() {
        let src = "fn main() {\n    // note\n    let x = 1;\n}";
        assert_eq!(scrub_comments(src, "rs"), "fn main() {\n    let x = 1;\n}");
    }

    #[test]
    fn removes_block_comments_including_delimiters() {
        let src = "int a; /* one */ int b; /* two\nlines */ int c;";
        assert_eq!(scrub_comments(src, "c"), "int a;  int b;  int c;");
    }

    #[test]
    fn removes_python_docstrings() {
        let src = "def f():\n    \"\"\"doc\"\"\"\n    return 1";
        assert_eq!(scrub_comments(src, "py"), "def f():\n    \n    return 1");
    }

    #[test]
    fn unterminated_block_is_left_in_place() {
        let src = "a /* closed */ b /* open\nc";
        assert_eq!(scrub_comments(src, "js"), "a  b /* open\nc");
    }

    #[test]
    fn unknown_extension_is_unchanged() {
        let src = "# heading\n/* not a comment */";
        assert_eq!(scrub_comments(src, "md"), src);
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        assert_eq!(scrub_comments("# c\ny=2", "PY"), "y=2");
    }
}
