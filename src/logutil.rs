//! Logging helpers for untrusted mesh text and model output.
//! Keeps every log record on a single line and bounds how much of a message is echoed.

/// Characters echoed by [`escape_log`] before cutting with an ellipsis.
const MAX_ESCAPED_CHARS: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\\xNN`
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_ESCAPED_CHARS) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_ESCAPED_CHARS {
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

/// Escaped preview limited to `max_bytes` of the original text.
/// Never cuts inside a multi-byte character; appends `...` when shortened.
pub fn preview(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}
