//! Logging helpers for device payloads and prescription lines.
//! Device firmware and prescription exports both produce raw text that can carry
//! line breaks and control bytes; these helpers keep every log record on one line.

/// Longest preview kept for a single logged payload.
pub const MAX_PREVIEW: usize = 200;

/// Escape a payload for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\` (prescription fields are backslash-delimited, so this keeps them readable)
///
/// Payloads longer than [`MAX_PREVIEW`] characters are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render a raw HTTP body for logs, tolerating non-UTF-8 bytes.
pub fn body_preview(bytes: &[u8]) -> String {
    escape_log(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_prescription_delimiters_and_newlines() {
        let s = "A01\\Syrup\r\n";
        assert_eq!(escape_log(s), "A01\\\\Syrup\\r\\n");
    }

    #[test]
    fn truncates_long_bodies() {
        let long = "x".repeat(MAX_PREVIEW + 50);
        let esc = escape_log(&long);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
    }

    #[test]
    fn lossy_body_preview() {
        let bytes = [b'o', b'k', 0xFF, 0x01];
        assert_eq!(body_preview(&bytes), "ok\u{FFFD}\\x01");
    }
}
