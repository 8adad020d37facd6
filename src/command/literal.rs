//! Quoted string literals in the host's command syntax.

use std::fmt::Write;

use crate::error::{HostError, Result};

/// Quote `value`, escaping it the way C-family string literals do.
///
/// Control characters without a short escape are written as `\uXXXX`
/// (or `\UXXXXXXXX` outside the basic plane).
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\u{7}' => out.push_str("\\a"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{b}' => out.push_str("\\v"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() || is_format(c) => {
                let code = c as u32;
                // Writing into a String cannot fail.
                let _ = if code > 0xFFFF {
                    write!(out, "\\U{code:08X}")
                } else {
                    write!(out, "\\u{code:04X}")
                };
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Invisible characters that would make a command hard to read back.
fn is_format(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{2028}'..='\u{202E}' | '\u{FEFF}')
}

/// Read one quoted literal from the start of `input`.
///
/// Returns the unescaped value and the rest of the input after the closing quote.
pub fn unquote(input: &str) -> Result<(String, &str)> {
    let Some(body) = input.strip_prefix('"') else {
        return Err(malformed("expected '\"'", input));
    };

    let mut value = String::new();
    let mut chars = body.char_indices();
    while let Some((index, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &body[index + 1..])),
            '\\' => {
                let Some((_, escape)) = chars.next() else {
                    break;
                };
                let decoded = match escape {
                    '0' => '\0',
                    'a' => '\u{7}',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'v' => '\u{b}',
                    '\'' | '"' | '\\' => escape,
                    'u' => hex_char(&mut chars, 4, input)?,
                    'U' => hex_char(&mut chars, 8, input)?,
                    other => {
                        return Err(malformed(&format!("unknown escape '\\{other}'"), input))
                    }
                };
                value.push(decoded);
            }
            c => value.push(c),
        }
    }

    Err(malformed("unterminated string literal", input))
}

fn hex_char(chars: &mut std::str::CharIndices<'_>, digits: usize, input: &str) -> Result<char> {
    let mut code = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|(_, c)| c.to_digit(16))
            .ok_or_else(|| malformed("invalid unicode escape", input))?;
        code = code * 16 + digit;
    }
    char::from_u32(code).ok_or_else(|| malformed("invalid unicode scalar", input))
}

fn malformed(reason: &str, input: &str) -> HostError {
    let excerpt: String = input.chars().take(40).collect();
    HostError::Protocol(format!("malformed command literal ({reason}): {excerpt}"))
}
