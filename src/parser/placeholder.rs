//! Parameter marker escaping
//!
//! A prepared query keeps its `?` markers until EXECUTE supplies values.
//! Routing analysis runs on a copy where each bare marker is quoted as
//! `'?'`, so the parser sees an ordinary string literal in its place.

/// Marker or string literal found while scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    /// Bare `?` at this byte offset
    Marker(usize),
    /// Single-quoted literal covering `start..end`
    Literal(usize, usize),
}

const ESCAPED_MARKER: &str = "'?'";

/// Quote every bare `?` marker
///
/// Markers inside string literals, quoted identifiers and comments are left
/// alone, so escaping an already escaped query changes nothing.
pub fn escape_placeholders(sql: &str) -> String {
    let spans = scan(sql);
    let markers = spans.iter().filter(|s| matches!(s, Span::Marker(_))).count();
    if markers == 0 {
        return sql.to_string();
    }

    let mut result = String::with_capacity(sql.len() + markers * 2);
    let mut last = 0;
    for span in spans {
        if let Span::Marker(pos) = span {
            result.push_str(&sql[last..pos]);
            result.push_str(ESCAPED_MARKER);
            last = pos + 1;
        }
    }
    result.push_str(&sql[last..]);
    result
}

/// Turn every `'?'` literal back into a bare marker
///
/// Inverse of `escape_placeholders` for queries that had no `'?'` literal
/// of their own.
pub fn unescape_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut last = 0;
    for span in scan(sql) {
        if let Span::Literal(start, end) = span {
            if &sql[start..end] == ESCAPED_MARKER {
                result.push_str(&sql[last..start]);
                result.push('?');
                last = end;
            }
        }
    }
    result.push_str(&sql[last..]);
    result
}

/// Byte offsets of the bare `?` markers, in parameter order
pub fn placeholder_positions(sql: &str) -> Vec<usize> {
    scan(sql)
        .into_iter()
        .filter_map(|s| match s {
            Span::Marker(pos) => Some(pos),
            Span::Literal(..) => None,
        })
        .collect()
}

fn scan(sql: &str) -> Vec<Span> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'?' => {
                spans.push(Span::Marker(i));
                i += 1;
            }
            b'\'' => {
                let end = skip_quoted(bytes, i, b'\'');
                spans.push(Span::Literal(i, end));
                i = end;
            }
            q @ (b'"' | b'`') => i = skip_quoted(bytes, i, q),
            b'#' => i = skip_line(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).map_or(true, |c| c.is_ascii_whitespace()) =>
            {
                i = skip_line(bytes, i)
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            _ => i += 1,
        }
    }
    spans
}

/// End (exclusive) of the quoted run starting at `start`
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        if c == quote {
            // doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}
