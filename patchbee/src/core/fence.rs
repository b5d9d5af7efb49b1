//! Markdown fence removal for model output.
//!
//! Only the outermost wrapper is removed, using prefix/suffix slicing. Interior
//! text is never rewritten, so embedded source containing backticks survives.

const FENCE: &str = "```";

/// Strip one leading fence line (optionally tagged, e.g. ```` ```json ````) and
/// the matching trailing fence.
///
/// Returns the trimmed input unchanged when it does not start with a fence.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(after_marker) = trimmed.strip_prefix(FENCE) else {
        return trimmed;
    };

    let (tag, body) = match after_marker.split_once('\n') {
        Some((tag, body)) => (tag, body),
        None => (after_marker, ""),
    };
    if !is_language_tag(tag.trim()) {
        // Something like "```foo bar```" on one line is content, not a fence.
        return trimmed;
    }

    let body = body.trim_end();
    let body = body.strip_suffix(FENCE).unwrap_or(body);
    body.trim()
}

fn is_language_tag(tag: &str) -> bool {
    tag.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}
