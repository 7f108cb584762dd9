//! Response shaping: provider payload → plain text → transport-sized chunks.

/// Sent when the provider payload has no usable completion text.
pub const FALLBACK_RESPONSE: &str = "Sorry, I didn't get a usable response from the model.";

/// `choices[0].message.content`, if present and a string.
pub fn completion_text(payload: &serde_json::Value) -> Option<&str> {
    payload
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Extract the first completion's text, turn literal `\n` sequences into real
/// line breaks and trim. Never fails.
pub fn format_response(payload: &serde_json::Value) -> String {
    let Some(text) = completion_text(payload) else {
        return FALLBACK_RESPONSE.to_string();
    };

    let normalized = text.replace("\\n", "\n");
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return FALLBACK_RESPONSE.to_string();
    }
    trimmed.to_string()
}

/// Prefix a reply with an optional speaker header (e.g. `Claude:`).
pub fn with_header(header: Option<&str>, text: &str) -> String {
    match header.map(str::trim) {
        Some(h) if !h.is_empty() => format!("{h}\n\n{text}"),
        _ => text.to_string(),
    }
}

/// Split into contiguous pieces of at most `max_len` characters, in order.
///
/// Empty input yields no pieces. Splits on char boundaries only.
pub fn chunk(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == max_len {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
