use std::borrow::Cow;

/// Returns true for characters that must never reach stored feed metadata.
///
/// Tab, newline and carriage return are kept; whitespace collapsing is the
/// caller's concern.
fn is_stripped(c: char) -> bool {
    (c.is_control() && c != '\t' && c != '\n' && c != '\r') || c == '\u{feff}'
}

/// SEC-001: Strip control characters (including ESC and DEL) from text.
///
/// Feed titles and descriptions are attacker-controlled; control bytes in
/// them break JSON consumers and can smuggle escape sequences into logs.
///
/// Returns `Cow::Borrowed` when the input is already clean (common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|&c| !is_stripped(c)).collect())
}

/// Strips control characters, collapses whitespace runs into single spaces
/// and trims the result.
///
/// Used for every title that is persisted: feed titles, item titles and
/// folder names.
pub fn clean_text(s: &str) -> String {
    let stripped = strip_control_chars(s);
    let mut out = String::with_capacity(stripped.len());
    for word in stripped.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
