/// Strip a log chunk down to printable ASCII, newlines and tabs.
///
/// Malformed UTF-8 sequences are dropped. Applying it twice gives the same
/// text as applying it once.
pub fn sanitize(bytes: &[u8]) -> String {
    sanitize_str(&String::from_utf8_lossy(bytes))
}

pub fn sanitize_str(text: &str) -> String {
    text.chars()
        .filter(|c| matches!(c, ' '..='~' | '\n' | '\t'))
        .collect()
}
