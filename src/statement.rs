//! Statement counting for declared result counts.
//!
//! A simple query produces one result per non-empty statement, so the count
//! of statements in the SQL text is the number of results its task declares.

/// Lexer state while scanning SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    SingleQuote,
    /// `E'...'` string, where backslash escapes the next character
    EscapeString,
    DoubleQuote,
    LineComment,
    /// Nesting depth of `/* */` comments
    BlockComment(usize),
    DollarQuote,
}

/// Count the non-empty statements in `sql`.
///
/// Semicolons inside string literals, quoted identifiers, dollar-quoted
/// strings and comments do not separate statements. A statement made only
/// of whitespace and comments does not count.
pub fn count_statements(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut state = Scan::Code;
    let mut dollar_tag: &[u8] = &[];
    let mut has_content = false;
    let mut count = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            Scan::Code => match b {
                b';' => {
                    if has_content {
                        count += 1;
                    }
                    has_content = false;
                }
                b'\'' => {
                    state = if is_escape_prefix(bytes, i) {
                        Scan::EscapeString
                    } else {
                        Scan::SingleQuote
                    };
                    has_content = true;
                }
                b'"' => {
                    state = Scan::DoubleQuote;
                    has_content = true;
                }
                b'-' if next == Some(b'-') => {
                    state = Scan::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = Scan::BlockComment(1);
                    i += 1;
                }
                b'$' => {
                    has_content = true;
                    if let Some(tag) = dollar_tag_at(bytes, i) {
                        dollar_tag = tag;
                        state = Scan::DollarQuote;
                        i += tag.len() - 1;
                    }
                }
                b if b.is_ascii_whitespace() => {}
                _ => has_content = true,
            },
            Scan::SingleQuote => {
                if b == b'\'' {
                    // '' is an escaped quote
                    if next == Some(b'\'') {
                        i += 1;
                    } else {
                        state = Scan::Code;
                    }
                }
            }
            Scan::EscapeString => match b {
                b'\\' => i += 1,
                b'\'' if next == Some(b'\'') => i += 1,
                b'\'' => state = Scan::Code,
                _ => {}
            },
            Scan::DoubleQuote => {
                if b == b'"' {
                    if next == Some(b'"') {
                        i += 1;
                    } else {
                        state = Scan::Code;
                    }
                }
            }
            Scan::LineComment => {
                if b == b'\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment(depth) => {
                if b == b'*' && next == Some(b'/') {
                    state = if depth == 1 {
                        Scan::Code
                    } else {
                        Scan::BlockComment(depth - 1)
                    };
                    i += 1;
                } else if b == b'/' && next == Some(b'*') {
                    state = Scan::BlockComment(depth + 1);
                    i += 1;
                }
            }
            Scan::DollarQuote => {
                if bytes[i..].starts_with(dollar_tag) {
                    state = Scan::Code;
                    i += dollar_tag.len() - 1;
                }
            }
        }
        i += 1;
    }

    if has_content {
        count += 1;
    }
    count
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Whether the quote at `quote` opens an `E'...'` string.
fn is_escape_prefix(bytes: &[u8], quote: usize) -> bool {
    let Some(prefix) = quote.checked_sub(1) else {
        return false;
    };
    if !matches!(bytes[prefix], b'E' | b'e') {
        return false;
    }
    prefix == 0 || !is_ident_byte(bytes[prefix - 1])
}

/// The dollar-quote opening tag (`$$` or `$name$`) starting at `start`, if any.
///
/// `$1` placeholders and identifiers containing `$` are not tags.
fn dollar_tag_at(bytes: &[u8], start: usize) -> Option<&[u8]> {
    if start > 0 {
        let prev = bytes[start - 1];
        if is_ident_byte(prev) {
            return None;
        }
    }
    let rest = bytes.get(start + 1..)?;
    let end = rest
        .iter()
        .position(|&b| !(b.is_ascii_alphanumeric() || b == b'_'))?;
    if rest[end] != b'$' || rest.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    Some(&bytes[start..start + end + 2])
}
