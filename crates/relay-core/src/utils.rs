/// Strip a trigger prefix (and the whitespace after it).
///
/// Returns `None` when the text does not start with the prefix.
pub fn strip_trigger_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.trim_start().strip_prefix(prefix)?;
    Some(rest.trim_start())
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
