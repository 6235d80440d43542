//! A deliberately weak JSON probe.
//!
//! Scans a top-level JSON object for a single string field without building
//! a parse tree. It tolerates whitespace around `:` and around the key, and
//! understands `\"` and `\\` escapes inside the value. It does not attempt
//! full JSON conformance (nested objects, numbers, unicode escapes) — the
//! broker only ever needs to read `"type"` and `"feed"` off the wire, and
//! addons that need more parse the payload themselves with `serde_json`.
//!
//! No allocation proportional to payload size happens unless the value
//! contains an escape sequence, in which case the unescaped copy is
//! necessarily new.

use std::borrow::Cow;

/// Find `"field": "value"` (in either order of whitespace) at the top level
/// of `json` and return the unescaped value, or `None` if the field is
/// absent or not a string.
pub fn get_string_field<'a>(json: &'a [u8], field: &str) -> Option<Cow<'a, str>> {
    let key_start = find_key(json, field)?;
    let mut i = key_start;

    i = skip_ws(json, i);
    if json.get(i) != Some(&b':') {
        return None;
    }
    i += 1;
    i = skip_ws(json, i);

    if json.get(i) != Some(&b'"') {
        return None;
    }
    i += 1;

    let value_start = i;
    let mut needs_unescape = false;
    loop {
        match json.get(i)? {
            b'"' => break,
            b'\\' => {
                needs_unescape = true;
                i += 2;
            }
            _ => i += 1,
        }
    }
    let raw = &json[value_start..i];

    if needs_unescape {
        Some(Cow::Owned(unescape(raw)))
    } else {
        Some(Cow::Borrowed(std::str::from_utf8(raw).ok()?))
    }
}

/// Convenience wrapper for the one field every message carries.
pub fn get_type(json: &[u8]) -> Option<Cow<'_, str>> {
    get_string_field(json, "type")
}

fn unescape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() {
            match raw[i + 1] {
                b'"' => out.push('"'),
                b'\\' => out.push('\\'),
                b'n' => out.push('\n'),
                b't' => out.push('\t'),
                b'r' => out.push('\r'),
                other => out.push(other as char),
            }
            i += 2;
        } else {
            // Fall back byte-at-a-time; non-ASCII input is rare on this
            // path and a lossy char is preferable to panicking.
            out.push(raw[i] as char);
            i += 1;
        }
    }
    out
}

/// Locate the start of the `"key"` token at the top level of `json`,
/// returning the index just past the closing quote (where `:` is expected).
///
/// This is a flat scan, not a recursive descent: it tracks nesting depth so
/// it never matches a key inside a nested object or array, but it does not
/// validate that `json` is otherwise well-formed.
fn find_key(json: &[u8], key: &str) -> Option<usize> {
    let key_bytes = key.as_bytes();
    let mut i = 0;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;

    while i < json.len() {
        let c = json[i];
        if in_string {
            if escape {
                escape = false;
            } else if c == b'\\' {
                escape = true;
            } else if c == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            b'"' => {
                if depth == 1 && matches_key_at(json, i, key_bytes) {
                    let after = i + key_bytes.len() + 2;
                    // A depth-1 token matching `key` could be this object's
                    // value for some other field, not the key we want (field
                    // order is unspecified). Only accept it as a match if a
                    // `:` (the key/value separator) follows; otherwise treat
                    // it as an ordinary string token and keep scanning.
                    if json.get(skip_ws(json, after)) == Some(&b':') {
                        return Some(after);
                    }
                }
                in_string = true;
                i += 1;
            }
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn matches_key_at(json: &[u8], quote_pos: usize, key: &[u8]) -> bool {
    let start = quote_pos + 1;
    let end = start + key.len();
    json.get(start..end) == Some(key) && json.get(end) == Some(&b'"')
}

fn skip_ws(json: &[u8], mut i: usize) -> usize {
    while matches!(json.get(i), Some(b' ' | b'\t' | b'\n' | b'\r')) {
        i += 1;
    }
    i
}
