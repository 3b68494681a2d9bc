//! UTF-8–safe string helpers.

/// Truncate a string to at most `max_bytes` bytes at a char boundary.
#[inline]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Derive a session title from the first non-empty line of a task.
///
/// Long lines are cut at a char boundary and suffixed with `...`.
pub fn title_from_text(text: &str, max_bytes: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Untitled task");
    if line.len() <= max_bytes {
        return line.to_owned();
    }
    let body = truncate_str(line, max_bytes.saturating_sub(3)).trim_end();
    format!("{body}...")
}
