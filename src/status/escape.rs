//! Percent escaping used in status line arguments
//!
//! gpg escapes `%`, CR, LF and other control octets as `%XX` so that every
//! event stays on one line. Everything else, including spaces and non-ASCII
//! text, is sent verbatim.

/// Escape a value the way gpg does on the status channel
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '%' || c.is_ascii_control() {
            escaped.push_str(&format!("%{:02X}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Decode `%XX` escapes in a status value
///
/// Malformed sequences (`%` not followed by two hex digits) are kept as-is,
/// and invalid UTF-8 in the decoded octets is replaced rather than rejected.
pub fn unescape_value(value: &str) -> String {
    if !value.contains('%') {
        return value.to_string();
    }
    String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned()
}
